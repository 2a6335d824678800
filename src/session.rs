//! Threefish-512 cipher session and the 128-bit tweak counter
//!
//! A [`CipherSession`] owns the key words and the currently keyed cipher.
//! Every body block is processed under a fresh tweak obtained from
//! [`CipherSession::advance`], so the session is passed by `&mut` through the
//! whole chaining loop.

use std::cmp::Ordering;
use std::fmt;

use threefish::Threefish512;
use zeroize::Zeroizing;

use crate::error::{ErrorCategory, ErrorKind, FishboxError, Result};
use crate::kdf::MasterSecret;

/// Cipher block length in bytes.
pub const BLOCK_LEN: usize = 64;

/// Number of 64-bit words in a block (and in the key).
pub const BLOCK_WORDS: usize = BLOCK_LEN / 8;

/// One Threefish-512 block.
pub type Block = [u8; BLOCK_LEN];

/// Reads a block as eight little-endian words.
pub(crate) fn block_to_words(block: &Block) -> [u64; BLOCK_WORDS] {
    let mut words = [0u64; BLOCK_WORDS];
    for (word, chunk) in words.iter_mut().zip(block.chunks_exact(8)) {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(chunk);
        *word = u64::from_le_bytes(bytes);
    }
    words
}

/// Writes eight words back into `block`, least significant byte first.
pub(crate) fn words_to_block(words: &[u64; BLOCK_WORDS], block: &mut Block) {
    for (chunk, word) in block.chunks_exact_mut(8).zip(words.iter()) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
}

/// 128-bit tweak used as a block counter: word 0 is the low half.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Tweak {
    low: u64,
    high: u64,
}

impl Tweak {
    pub const ZERO: Tweak = Tweak { low: 0, high: 0 };

    pub fn from_words(words: [u64; 2]) -> Self {
        Self {
            low: words[0],
            high: words[1],
        }
    }

    pub fn words(&self) -> [u64; 2] {
        [self.low, self.high]
    }

    /// Adds one, carrying from the low word into the high word.
    ///
    /// The counter is left untouched if it is already at 2^128 - 1.
    pub fn increment(&mut self) -> Result<()> {
        let (low, carry) = self.low.overflowing_add(1);
        if carry {
            self.high = self.high.checked_add(1).ok_or_else(|| {
                FishboxError::with_kind(
                    ErrorCategory::Internal,
                    ErrorKind::CounterExhausted,
                    "block counter exhausted; refusing to reuse a tweak",
                )
            })?;
        }
        self.low = low;
        Ok(())
    }
}

impl Ord for Tweak {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.high, self.low).cmp(&(other.high, other.low))
    }
}

impl PartialOrd for Tweak {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Tweak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tweak({:016x}{:016x})", self.high, self.low)
    }
}

/// Key material plus the cipher keyed with the current tweak.
pub struct CipherSession {
    key: Zeroizing<[u64; BLOCK_WORDS]>,
    tweak: Tweak,
    cipher: Threefish512,
}

impl CipherSession {
    pub fn new(secret: &MasterSecret, tweak: Tweak) -> Self {
        let key = Zeroizing::new(secret.key_words());
        let cipher = Threefish512::new_with_tweak_u64(&key, &tweak.words());
        Self { key, tweak, cipher }
    }

    pub fn tweak(&self) -> Tweak {
        self.tweak
    }

    /// Re-keys the cipher with the unchanged key and a new tweak.
    pub fn set_tweak(&mut self, tweak: Tweak) {
        self.tweak = tweak;
        self.cipher = Threefish512::new_with_tweak_u64(&self.key, &tweak.words());
    }

    /// Increments the counter and re-keys; returns the tweak now in use.
    pub fn advance(&mut self) -> Result<Tweak> {
        let mut next = self.tweak;
        next.increment()?;
        self.set_tweak(next);
        Ok(next)
    }

    pub fn encrypt_block(&self, block: &mut Block) {
        let mut words = Zeroizing::new(block_to_words(block));
        self.cipher.encrypt_block_u64(&mut words);
        words_to_block(&words, block);
    }

    pub fn decrypt_block(&self, block: &mut Block) {
        let mut words = Zeroizing::new(block_to_words(block));
        self.cipher.decrypt_block_u64(&mut words);
        words_to_block(&words, block);
    }
}

impl fmt::Debug for CipherSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherSession")
            .field("key", &"[REDACTED]")
            .field("tweak", &self.tweak)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(fill: u8) -> MasterSecret {
        MasterSecret::from_bytes([fill; BLOCK_LEN])
    }

    #[test]
    fn test_increment_low_word() {
        let mut tweak = Tweak::from_words([41, 7]);
        tweak.increment().unwrap();
        assert_eq!(tweak.words(), [42, 7]);
    }

    #[test]
    fn test_increment_carries_into_high_word() {
        let mut tweak = Tweak::from_words([u64::MAX, 7]);
        tweak.increment().unwrap();
        assert_eq!(tweak.words(), [0, 8]);
    }

    #[test]
    fn test_increment_refuses_wraparound() {
        let mut tweak = Tweak::from_words([u64::MAX, u64::MAX]);
        let err = tweak.increment().expect_err("expected counter exhaustion");
        assert_eq!(err.kind, Some(ErrorKind::CounterExhausted));
        assert_eq!(tweak.words(), [u64::MAX, u64::MAX]);
    }

    #[test]
    fn test_ordering_is_numeric() {
        let low = Tweak::from_words([u64::MAX, 0]);
        let high = Tweak::from_words([0, 1]);
        assert!(low < high);
        assert!(Tweak::ZERO < low);
    }

    #[test]
    fn test_word_conversion_is_little_endian() {
        let mut block = [0u8; BLOCK_LEN];
        block[0] = 0x01;
        block[8] = 0x02;
        block[15] = 0x80;
        let words = block_to_words(&block);
        assert_eq!(words[0], 1);
        assert_eq!(words[1], 0x8000_0000_0000_0002);

        let mut back = [0u8; BLOCK_LEN];
        words_to_block(&words, &mut back);
        assert_eq!(back, block);
    }

    #[test]
    fn test_encrypt_then_decrypt_restores_block() {
        let session = CipherSession::new(&secret(0x11), Tweak::from_words([5, 9]));
        let original: Block = std::array::from_fn(|i| i as u8);
        let mut block = original;

        session.encrypt_block(&mut block);
        assert_ne!(block, original);
        session.decrypt_block(&mut block);
        assert_eq!(block, original);
    }

    #[test]
    fn test_tweak_changes_ciphertext() {
        let mut session = CipherSession::new(&secret(0x22), Tweak::ZERO);
        let mut first = [0u8; BLOCK_LEN];
        session.encrypt_block(&mut first);

        session.advance().unwrap();
        let mut second = [0u8; BLOCK_LEN];
        session.encrypt_block(&mut second);

        assert_ne!(first, second);
    }

    #[test]
    fn test_set_tweak_reproduces_earlier_keying() {
        let mut session = CipherSession::new(&secret(0x33), Tweak::from_words([100, 0]));
        let mut a = [7u8; BLOCK_LEN];
        session.encrypt_block(&mut a);

        session.advance().unwrap();
        session.advance().unwrap();
        assert_eq!(session.tweak().words(), [102, 0]);

        session.set_tweak(Tweak::from_words([100, 0]));
        let mut b = [7u8; BLOCK_LEN];
        session.encrypt_block(&mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_debug_redacts_key() {
        let session = CipherSession::new(&secret(0x44), Tweak::ZERO);
        let rendered = format!("{:?}", session);
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("44"));
    }
}
