//! Running Skein-512 digest over the plaintext and the trailing tag block

use std::fmt;
use std::io::{Read, Write};

use skein::{Digest, Skein512, consts::U64};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::chain::read_block;
use crate::error::{FishboxError, Result};
use crate::session::{BLOCK_LEN, Block, CipherSession};

/// Hash state fed with every plaintext byte, in stream order.
pub struct RunningDigest {
    hasher: Skein512<U64>,
}

impl RunningDigest {
    pub fn new() -> Self {
        Self {
            hasher: Skein512::<U64>::new(),
        }
    }

    pub fn absorb(&mut self, plaintext: &[u8]) {
        self.hasher.update(plaintext);
    }

    pub fn finalize(self) -> Zeroizing<Block> {
        let mut tag = Zeroizing::new([0u8; BLOCK_LEN]);
        tag.copy_from_slice(&self.hasher.finalize());
        tag
    }
}

impl Default for RunningDigest {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of checking the authentication tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The tag decrypted to the digest of the recovered plaintext.
    Authenticated,
    /// A tag was present but did not match.
    AuthenticationFailure,
    /// The artifact ended before a complete tag block.
    Unauthenticated,
}

impl Verdict {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Verdict::Authenticated)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Verdict::Authenticated => "Authenticated",
            Verdict::AuthenticationFailure => "Authentication Failure",
            Verdict::Unauthenticated => "Unauthenticated",
        })
    }
}

/// Advances the counter once more and writes the encrypted tag.
pub fn append_tag<W: Write>(
    session: &mut CipherSession,
    digest: RunningDigest,
    writer: &mut W,
) -> Result<()> {
    let tweak = session.advance()?;
    let mut tag = digest.finalize();
    session.encrypt_block(&mut tag);
    writer
        .write_all(&tag[..])
        .map_err(|e| FishboxError::io("failed to write authentication tag", e))?;
    debug!(?tweak, "appended authentication tag");
    Ok(())
}

/// Advances the counter once more and checks the final block against `digest`.
///
/// Anything after the tag block also counts as a failure: the artifact is not
/// the one that was sealed.
pub fn check_tag<R: Read>(
    session: &mut CipherSession,
    digest: RunningDigest,
    reader: &mut R,
) -> Result<Verdict> {
    session.advance()?;
    let expected = digest.finalize();

    let mut block = Zeroizing::new([0u8; BLOCK_LEN]);
    let read = read_block(reader, &mut block[..])?;
    if read < BLOCK_LEN {
        warn!(bytes = read, "artifact carries no complete authentication tag");
        return Ok(Verdict::Unauthenticated);
    }

    session.decrypt_block(&mut block);
    let matches = bool::from(block[..].ct_eq(&expected[..]));

    let mut probe = [0u8; 1];
    let trailing = read_block(reader, &mut probe)? > 0;
    if trailing {
        warn!("unexpected data after authentication tag");
    }

    let verdict = if matches && !trailing {
        Verdict::Authenticated
    } else {
        Verdict::AuthenticationFailure
    };
    debug!(%verdict, "checked authentication tag");
    Ok(verdict)
}
