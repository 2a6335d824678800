//! Stream-level encryption and decryption
//!
//! Artifact layout, in 64-byte blocks:
//!
//! - block 0: header (nonce + plaintext length), tweak 0
//! - block 1: master secret commitment, nonce tweak
//! - blocks 2..n-1: body, nonce tweak + 1, + 2, ...
//! - block n: Skein-512 tag over the plaintext, next tweak after the body
//!
//! Stages run strictly in that order. Decryption stops before writing a single
//! byte if the commitment block does not match the derived master secret.

use std::io::{Read, Write};

use tracing::debug;
use zeroize::Zeroizing;

use crate::chain::{self, read_block};
use crate::config::Config;
use crate::error::{ErrorCategory, ErrorKind, FishboxError, Result};
use crate::header::{self, Header, Nonce, NonceSeed};
use crate::integrity::{self, RunningDigest, Verdict};
use crate::kdf;
use crate::passphrase::ensure_nonempty;
use crate::session::{BLOCK_LEN, CipherSession, Tweak};

/// Encrypt `length` bytes from `reader` into `writer`.
///
/// `length` must be the exact number of bytes `reader` will produce; it is
/// recorded in the header before the body is read.
pub fn encrypt_stream<R: Read, W: Write>(
    config: &Config,
    passphrase: &[u8],
    seed: &NonceSeed,
    length: u64,
    reader: &mut R,
    writer: &mut W,
) -> Result<()> {
    ensure_nonempty(passphrase)?;
    let secret = kdf::derive_master_secret(passphrase, &config.kdf)?;
    let header = Header::derive(passphrase, seed, length);
    let mut session = CipherSession::new(&secret, Tweak::ZERO);

    let sealed_header = header::seal_header(&mut session, &header);
    write_block(writer, &sealed_header, "header")?;
    let commitment = header::seal_commitment(&mut session, &secret, &header.nonce);
    write_block(writer, &commitment, "commitment")?;
    debug!(length, "wrote header and commitment");

    let mut digest = RunningDigest::new();
    chain::encrypt_body(&mut session, reader, writer, &mut digest, length)?;
    integrity::append_tag(&mut session, digest, writer)?;
    writer
        .flush()
        .map_err(|e| FishboxError::io("failed to flush output", e))?;
    Ok(())
}

/// A parsed artifact prelude whose passphrase commitment has been verified.
///
/// Holds the keyed session and the recovered nonce; the master secret itself
/// is already gone.
#[derive(Debug)]
pub struct Decryptor {
    session: CipherSession,
    nonce: Nonce,
}

/// Read the header and commitment blocks and check the passphrase.
///
/// Nothing but these two blocks is consumed from `reader`, so a caller can
/// defer creating any output until this has succeeded.
pub fn open_artifact<R: Read>(
    config: &Config,
    passphrase: &[u8],
    reader: &mut R,
) -> Result<Decryptor> {
    ensure_nonempty(passphrase)?;

    let mut sealed_header = Zeroizing::new([0u8; BLOCK_LEN]);
    let mut sealed_commitment = Zeroizing::new([0u8; BLOCK_LEN]);
    if read_block(reader, &mut sealed_header[..])? < BLOCK_LEN {
        return Err(truncated("header"));
    }
    if read_block(reader, &mut sealed_commitment[..])? < BLOCK_LEN {
        return Err(truncated("passphrase commitment"));
    }

    let secret = kdf::derive_master_secret(passphrase, &config.kdf)?;
    let mut session = CipherSession::new(&secret, Tweak::ZERO);
    let nonce = header::open_header(&mut session, &sealed_header);
    header::verify_commitment(&mut session, &secret, &nonce, &sealed_commitment)?;
    debug!(length = nonce.length, "passphrase accepted");

    Ok(Decryptor { session, nonce })
}

impl Decryptor {
    /// Plaintext length recorded in the header.
    pub fn plaintext_len(&self) -> u64 {
        self.nonce.length
    }

    /// Decrypt the body into `writer` and check the tag.
    ///
    /// Plaintext is written as it is recovered; the returned verdict only
    /// speaks for it once the whole stream has been consumed. Callers that
    /// must not expose unauthenticated plaintext should write into a buffer
    /// or temporary file and discard it unless the verdict is
    /// [`Verdict::Authenticated`].
    pub fn decrypt_into<R: Read, W: Write>(mut self, reader: &mut R, writer: &mut W) -> Result<Verdict> {
        let mut digest = RunningDigest::new();
        let body = chain::decrypt_body(
            &mut self.session,
            reader,
            writer,
            &mut digest,
            self.nonce.length,
        )?;
        writer
            .flush()
            .map_err(|e| FishboxError::io("failed to flush output", e))?;

        if body.truncated {
            return Ok(Verdict::Unauthenticated);
        }
        let verdict = integrity::check_tag(&mut self.session, digest, reader)?;
        if verdict == Verdict::Authenticated && !body.padding_consistent {
            return Ok(Verdict::AuthenticationFailure);
        }
        Ok(verdict)
    }
}

/// Decrypt an artifact from `reader`, writing plaintext to `writer`.
///
/// Fails with [`ErrorKind::InvalidPassphrase`] before writing anything if the
/// commitment block does not match.
pub fn decrypt_stream<R: Read, W: Write>(
    config: &Config,
    passphrase: &[u8],
    reader: &mut R,
    writer: &mut W,
) -> Result<Verdict> {
    open_artifact(config, passphrase, reader)?.decrypt_into(reader, writer)
}

fn write_block<W: Write>(writer: &mut W, block: &[u8], what: &str) -> Result<()> {
    writer
        .write_all(block)
        .map_err(|e| FishboxError::io(format!("failed to write {} block", what), e))
}

fn truncated(what: &str) -> FishboxError {
    FishboxError::with_kind(
        ErrorCategory::User,
        ErrorKind::TruncatedInput,
        format!("input likely truncated while reading {}", what),
    )
}
