//! Run configuration
//!
//! The only configuration surface is the command line; the binary maps its
//! flags onto [`Config`]. Library callers construct it directly.

use crate::kdf::KeyDerivation;

/// What to do with decrypted output before the tag has been checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputPolicy {
    /// Stream into a temporary file and only move it into place once the
    /// authentication tag verifies.
    #[default]
    VerifyBeforeCommit,
    /// Write plaintext straight to the destination and report the verdict
    /// afterwards. The output exists even if authentication fails.
    CommitUnverified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub kdf: KeyDerivation,
    /// Mix 100 bytes of OS randomness into each nonce.
    pub nonce_randomness: bool,
    pub output_policy: OutputPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kdf: KeyDerivation::default(),
            nonce_randomness: true,
            output_policy: OutputPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_hardened_and_fail_closed() {
        let config = Config::default();
        assert_eq!(config.kdf, KeyDerivation::argon2());
        assert!(config.nonce_randomness);
        assert_eq!(config.output_policy, OutputPolicy::VerifyBeforeCommit);
    }
}
