//! Header block and passphrase commitment
//!
//! Block 0 of an artifact is the header, encrypted under the zero tweak:
//!
//! | words | content                                   |
//! |-------|-------------------------------------------|
//! | 0-1   | starting tweak (nonce)                    |
//! | 2     | unused (nonce digest bytes)               |
//! | 3     | plaintext length, little-endian           |
//! | 4-7   | remaining nonce digest bytes              |
//!
//! Block 1 is the master secret encrypted under itself with the nonce tweak.
//! It lets a decryptor reject a wrong passphrase before touching the body.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::RngCore;
use rand::rngs::OsRng;
use skein::{Digest, Skein512, consts::U64};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::{ErrorCategory, ErrorKind, FishboxError, Result};
use crate::kdf::MasterSecret;
use crate::session::{BLOCK_LEN, Block, CipherSession, Tweak, block_to_words, words_to_block};

/// Number of OS random bytes mixed into the nonce
pub const RANDOM_LEN: usize = 100;

const LENGTH_WORD: usize = 3;

/// Inputs hashed into the per-file nonce besides the passphrase.
#[derive(Clone)]
pub struct NonceSeed {
    pub filename: Vec<u8>,
    pub timestamp: Duration,
    pub random: Option<[u8; RANDOM_LEN]>,
}

impl NonceSeed {
    /// Captures the current wall-clock time and, if asked, fresh OS randomness.
    pub fn now(filename: impl Into<Vec<u8>>, with_os_random: bool) -> Self {
        // A clock before 1970 only weakens the timestamp input; the random
        // bytes still separate runs.
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let random = with_os_random.then(|| {
            let mut bytes = [0u8; RANDOM_LEN];
            OsRng.fill_bytes(&mut bytes);
            bytes
        });
        Self {
            filename: filename.into(),
            timestamp,
            random,
        }
    }
}

/// The plaintext side of the header block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nonce {
    /// Starting value of the block counter.
    pub tweak: Tweak,
    /// Plaintext length in bytes.
    pub length: u64,
}

/// A nonce together with the full header block it was laid out in.
pub struct Header {
    pub nonce: Nonce,
    block: Zeroizing<Block>,
}

impl Header {
    /// Hashes passphrase and seed into a header block carrying `length`.
    pub fn derive(passphrase: &[u8], seed: &NonceSeed, length: u64) -> Self {
        let mut hasher = Skein512::<U64>::new();
        hasher.update(passphrase);
        hasher.update(&seed.filename);
        hasher.update(seed.timestamp.as_secs().to_le_bytes());
        hasher.update(u64::from(seed.timestamp.subsec_nanos()).to_le_bytes());
        if let Some(random) = &seed.random {
            hasher.update(random);
        }

        let mut block = Zeroizing::new([0u8; BLOCK_LEN]);
        block.copy_from_slice(&hasher.finalize());

        let mut words = block_to_words(&block);
        words[LENGTH_WORD] = length;
        words_to_block(&words, &mut block);

        Self {
            nonce: Nonce {
                tweak: Tweak::from_words([words[0], words[1]]),
                length,
            },
            block,
        }
    }

    pub fn block(&self) -> &Block {
        &self.block
    }
}

fn parse_nonce(block: &Block) -> Nonce {
    let words = block_to_words(block);
    Nonce {
        tweak: Tweak::from_words([words[0], words[1]]),
        length: words[LENGTH_WORD],
    }
}

/// Encrypts the header under the zero tweak. Leaves the session at tweak zero.
pub fn seal_header(session: &mut CipherSession, header: &Header) -> Block {
    session.set_tweak(Tweak::ZERO);
    let mut out = *header.block();
    session.encrypt_block(&mut out);
    out
}

/// Decrypts block 0 and recovers the nonce.
pub fn open_header(session: &mut CipherSession, sealed: &Block) -> Nonce {
    session.set_tweak(Tweak::ZERO);
    let mut block = Zeroizing::new(*sealed);
    session.decrypt_block(&mut block);
    parse_nonce(&block)
}

/// Encrypts the master secret under the nonce tweak. Leaves the session there.
pub fn seal_commitment(session: &mut CipherSession, secret: &MasterSecret, nonce: &Nonce) -> Block {
    session.set_tweak(nonce.tweak);
    let mut out = *secret.as_bytes();
    session.encrypt_block(&mut out);
    out
}

/// Checks block 1 against the locally derived master secret.
pub fn verify_commitment(
    session: &mut CipherSession,
    secret: &MasterSecret,
    nonce: &Nonce,
    sealed: &Block,
) -> Result<()> {
    session.set_tweak(nonce.tweak);
    let mut block = Zeroizing::new(*sealed);
    session.decrypt_block(&mut block);
    if bool::from(block[..].ct_eq(&secret.as_bytes()[..])) {
        Ok(())
    } else {
        Err(FishboxError::with_kind(
            ErrorCategory::User,
            ErrorKind::InvalidPassphrase,
            "Invalid passphrase entered",
        ))
    }
}
