//! fishbox - passphrase-based file encryption with Threefish-512
//!
//! Files are encrypted block by block under a tweak that counts up from a
//! per-file nonce, prefixed by an encrypted header and a passphrase
//! commitment, and followed by an encrypted Skein-512 tag over the plaintext.

#![forbid(unsafe_code)]

pub mod chain;
pub mod config;
pub mod error;
pub mod file_ops;
pub mod filecrypt;
pub mod header;
pub mod integrity;
pub mod kdf;
pub mod passphrase;
pub mod session;
