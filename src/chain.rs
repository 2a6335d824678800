//! Block-chaining engine
//!
//! The body is processed one 64-byte block at a time. Before each block the
//! session's 128-bit counter is incremented and the cipher re-keyed, so no two
//! body blocks of a file share a tweak. A short final block is padded with a
//! single marker byte holding `64 - r - 1` (r = bytes present) followed by
//! zeros.
//!
//! On decryption the plaintext length from the header decides how many bytes
//! of each block are written. The padding marker is still checked and any
//! disagreement is reported through [`BodyOutcome::padding_consistent`].

use std::io::{self, Read, Write};

use tracing::{debug, trace, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{ErrorCategory, ErrorKind, FishboxError, Result};
use crate::integrity::RunningDigest;
use crate::session::{BLOCK_LEN, CipherSession};

/// Fills `buf` from `reader`, tolerating short reads. Returns the bytes read,
/// which is less than `buf.len()` only at end of stream.
pub fn read_block<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(FishboxError::io("failed to read input", e)),
        }
    }
    Ok(filled)
}

/// Marker byte written right after the last plaintext byte of a short block.
pub fn padding_marker(present: usize) -> u8 {
    debug_assert!(present < BLOCK_LEN);
    (BLOCK_LEN - present - 1) as u8
}

fn padding_matches(block: &[u8], present: usize) -> bool {
    block[present] == padding_marker(present) && block[present + 1..].iter().all(|&b| b == 0)
}

fn length_mismatch(expected: u64, actual: u64) -> FishboxError {
    FishboxError::with_kind(
        ErrorCategory::User,
        ErrorKind::LengthMismatch,
        format!(
            "input changed while encrypting: header records {} bytes, read {}",
            expected, actual
        ),
    )
}

/// Encrypts `reader` into `writer`, feeding the plaintext into `digest`.
///
/// `expected_len` is the length already committed to the header; reading a
/// different number of bytes is an error. Returns the number of body blocks
/// written.
pub fn encrypt_body<R: Read, W: Write>(
    session: &mut CipherSession,
    reader: &mut R,
    writer: &mut W,
    digest: &mut RunningDigest,
    expected_len: u64,
) -> Result<u64> {
    let mut block = Zeroizing::new([0u8; BLOCK_LEN]);
    let mut total: u64 = 0;
    let mut blocks: u64 = 0;

    loop {
        let read = read_block(reader, &mut block[..])?;
        if read == 0 {
            break;
        }
        total += read as u64;
        if total > expected_len {
            return Err(length_mismatch(expected_len, total));
        }

        let tweak = session.advance()?;
        digest.absorb(&block[..read]);
        if read < BLOCK_LEN {
            block[read] = padding_marker(read);
        }
        session.encrypt_block(&mut block);
        writer
            .write_all(&block[..])
            .map_err(|e| FishboxError::io("failed to write ciphertext block", e))?;
        blocks += 1;
        trace!(?tweak, bytes = read, "encrypted block");

        // A short block must start from zeros so the padding is well defined.
        block.zeroize();
        if read < BLOCK_LEN {
            break;
        }
    }

    if total != expected_len {
        return Err(length_mismatch(expected_len, total));
    }
    debug!(blocks, bytes = total, "encrypted body");
    Ok(blocks)
}

/// What the decryption loop observed besides the plaintext itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyOutcome {
    pub blocks: u64,
    /// False if a final short block's padding disagreed with the recorded length.
    pub padding_consistent: bool,
    /// True if the ciphertext ended before the recorded length was produced.
    pub truncated: bool,
}

/// Decrypts `length` plaintext bytes from `reader` into `writer`.
pub fn decrypt_body<R: Read, W: Write>(
    session: &mut CipherSession,
    reader: &mut R,
    writer: &mut W,
    digest: &mut RunningDigest,
    length: u64,
) -> Result<BodyOutcome> {
    let mut block = Zeroizing::new([0u8; BLOCK_LEN]);
    let mut remaining = length;
    let mut outcome = BodyOutcome {
        blocks: 0,
        padding_consistent: true,
        truncated: false,
    };

    while remaining > 0 {
        let read = read_block(reader, &mut block[..])?;
        if read < BLOCK_LEN {
            warn!(remaining, "ciphertext ended before the recorded plaintext length");
            outcome.truncated = true;
            break;
        }

        let tweak = session.advance()?;
        session.decrypt_block(&mut block);

        let take = remaining.min(BLOCK_LEN as u64) as usize;
        if take < BLOCK_LEN && !padding_matches(&block[..], take) {
            warn!(bytes = take, "final block padding disagrees with recorded length");
            outcome.padding_consistent = false;
        }

        digest.absorb(&block[..take]);
        writer
            .write_all(&block[..take])
            .map_err(|e| FishboxError::io("failed to write plaintext block", e))?;
        remaining -= take as u64;
        outcome.blocks += 1;
        trace!(?tweak, bytes = take, "decrypted block");

        block.zeroize();
    }

    debug!(blocks = outcome.blocks, bytes = length - remaining, "decrypted body");
    Ok(outcome)
}
