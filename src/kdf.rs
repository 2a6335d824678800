//! Passphrase → 512-bit master secret
//!
//! Two strategies are supported. Both are deterministic and both end in a
//! Skein-512 digest, so the master secret is always exactly one block long.
//!
//! - [`KeyDerivation::IteratedHash`]: hash the passphrase, then re-hash the
//!   digest `rounds` more times.
//! - [`KeyDerivation::Argon2`]: Argon2id over the passphrase with a fixed
//!   salt, followed by a single Skein-512 pass over its 64-byte output.
//!
//! Neither the strategy nor its cost parameters are recorded in the
//! artifact. Decrypting with different parameters looks exactly like a wrong
//! passphrase.

use std::fmt;
use std::time::Instant;

use argon2::{Algorithm, Argon2, Params, Version};
use skein::{Digest, Skein512, consts::U64};
use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

use crate::error::{ErrorCategory, ErrorKind, FishboxError, Result};
use crate::session::{BLOCK_LEN, BLOCK_WORDS, Block, block_to_words};

/// Length of the master secret in bytes
pub const SECRET_LEN: usize = BLOCK_LEN;

/// Length of the Argon2 salt in bytes
const SALT_LEN: usize = 16;

/// Fixed Argon2 salt. Nonce uniqueness comes from the header, not the salt.
const SALT: [u8; SALT_LEN] = [0x3c; SALT_LEN];

/// Default re-hash count for the iterated strategy
pub const DEFAULT_HASH_ROUNDS: u32 = 0x7ffff;

/// Default Argon2 time cost (passes)
pub const DEFAULT_ARGON2_TIME: u32 = 150;

/// Default Argon2 memory cost in KiB
pub const DEFAULT_ARGON2_MEMORY_KIB: u32 = 50_000;

/// Default Argon2 lanes
pub const DEFAULT_ARGON2_LANES: u32 = 4;

type Skein = Skein512<U64>;

/// How the master secret is derived from the passphrase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDerivation {
    IteratedHash {
        rounds: u32,
    },
    Argon2 {
        time_cost: u32,
        memory_kib: u32,
        parallelism: u32,
    },
}

impl KeyDerivation {
    pub fn iterated() -> Self {
        KeyDerivation::IteratedHash {
            rounds: DEFAULT_HASH_ROUNDS,
        }
    }

    pub fn argon2() -> Self {
        KeyDerivation::Argon2 {
            time_cost: DEFAULT_ARGON2_TIME,
            memory_kib: DEFAULT_ARGON2_MEMORY_KIB,
            parallelism: DEFAULT_ARGON2_LANES,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            KeyDerivation::IteratedHash { .. } => "iterated-skein",
            KeyDerivation::Argon2 { .. } => "argon2id",
        }
    }
}

impl Default for KeyDerivation {
    fn default() -> Self {
        Self::argon2()
    }
}

/// The 512-bit secret used both as the cipher key and as the commitment payload.
///
/// Zeroized on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct MasterSecret {
    bytes: Zeroizing<Block>,
}

impl MasterSecret {
    pub fn from_bytes(bytes: Block) -> Self {
        Self {
            bytes: Zeroizing::new(bytes),
        }
    }

    pub fn as_bytes(&self) -> &Block {
        &self.bytes
    }

    /// The key as Threefish consumes it: eight little-endian words.
    pub fn key_words(&self) -> [u64; BLOCK_WORDS] {
        block_to_words(&self.bytes)
    }
}

impl fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterSecret")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Derive the master secret for `passphrase` using `kdf`.
pub fn derive_master_secret(passphrase: &[u8], kdf: &KeyDerivation) -> Result<MasterSecret> {
    let started = Instant::now();
    let secret = match *kdf {
        KeyDerivation::IteratedHash { rounds } => iterated_hash(passphrase, rounds),
        KeyDerivation::Argon2 {
            time_cost,
            memory_kib,
            parallelism,
        } => argon2_then_hash(passphrase, time_cost, memory_kib, parallelism)?,
    };
    debug!(
        strategy = kdf.name(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "derived master secret"
    );
    Ok(secret)
}

fn iterated_hash(passphrase: &[u8], rounds: u32) -> MasterSecret {
    let mut digest = Zeroizing::new([0u8; SECRET_LEN]);
    skein_into(passphrase, &mut digest);
    for _ in 0..rounds {
        let mut next = [0u8; SECRET_LEN];
        skein_into(&*digest, &mut next);
        digest.copy_from_slice(&next);
        next.zeroize();
    }
    MasterSecret { bytes: digest }
}

fn argon2_then_hash(
    passphrase: &[u8],
    time_cost: u32,
    memory_kib: u32,
    parallelism: u32,
) -> Result<MasterSecret> {
    let params = Params::new(memory_kib, time_cost, parallelism, Some(SECRET_LEN)).map_err(|e| {
        FishboxError::with_kind(
            ErrorCategory::User,
            ErrorKind::KdfFailure,
            format!("invalid Argon2id parameters: {}", e),
        )
    })?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut hardened = Zeroizing::new([0u8; SECRET_LEN]);
    argon2
        .hash_password_into(passphrase, &SALT, &mut *hardened)
        .map_err(|e| {
            FishboxError::with_kind(
                ErrorCategory::Internal,
                ErrorKind::KdfFailure,
                format!("Argon2id key derivation failed: {}", e),
            )
        })?;

    let mut digest = Zeroizing::new([0u8; SECRET_LEN]);
    skein_into(&*hardened, &mut digest);
    Ok(MasterSecret { bytes: digest })
}

fn skein_into(data: &[u8], out: &mut Block) {
    let mut hasher = Skein::new();
    hasher.update(data);
    out.copy_from_slice(&hasher.finalize());
}
