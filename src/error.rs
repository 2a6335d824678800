use std::error::Error as StdError;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCategory {
    /// Any failure that cannot be confidently attributed to any other error
    /// category in this enum.
    ///
    /// Use of Internal is never a guarantee the error is not caused by the
    /// user, merely that the code cannot tell.
    Internal,

    /// The user provided invalid input or performed an action that is
    /// unsupported or impossible to complete.
    User,
}

/// Fine-grained condition flags for consumers that want to branch on error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The tool was invoked incorrectly.
    Usage,
    /// A zero-length passphrase was supplied.
    EmptyPassphrase,
    /// The input file does not exist.
    FileNotFound,
    /// The output file could not be created or written.
    FileWrite,
    /// The artifact ended before the header and commitment blocks.
    TruncatedInput,
    /// The number of plaintext bytes read differs from the recorded length.
    LengthMismatch,
    /// The commitment block did not decrypt to the derived master secret.
    InvalidPassphrase,
    /// The authentication tag did not match the decrypted body.
    AuthenticationFailed,
    /// The artifact carried no authentication tag to check.
    Unauthenticated,
    /// Passphrase could not be obtained from the configured reader.
    PassphraseUnavailable,
    /// The password-hardening KDF rejected its parameters or failed.
    KdfFailure,
    /// The 128-bit block counter would wrap around.
    CounterExhausted,
    /// Interaction with the filesystem, stdin/stdout, or other I/O failed.
    Io,
}

#[derive(Debug, Error)]
#[error("{msg}")]
pub struct FishboxError {
    /// Broad error category, always provided.
    pub category: ErrorCategory,
    /// Optional specific condition tag for consumers that need to
    /// branch their behavior. Any code consuming errors MUST handle
    /// the absence of a defined kind.
    pub kind: Option<ErrorKind>,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    msg: String,
}

impl FishboxError {
    /// Creates a new error that also tags the failure with a kind.
    pub fn with_kind(category: ErrorCategory, kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            category,
            kind: Some(kind),
            source: None,
            msg: msg.into(),
        }
    }

    /// Creates a new error that carries both a kind tag and the originating source error.
    pub fn with_kind_and_source(
        category: ErrorCategory,
        kind: ErrorKind,
        msg: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            category,
            kind: Some(kind),
            source: Some(Box::new(source)),
            msg: msg.into(),
        }
    }

    /// Shorthand for an internal I/O failure that keeps the `io::Error` as source.
    pub fn io(msg: impl Into<String>, source: std::io::Error) -> Self {
        Self::with_kind_and_source(ErrorCategory::Internal, ErrorKind::Io, msg, source)
    }

    /// The user-facing message carried by the error.
    pub fn message(&self) -> &str {
        &self.msg
    }

    /// Returns the preserved source error if present.
    pub fn source_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    /// Wraps the current error with a higher-level message while preserving the original as source.
    pub fn with_context(self, msg: impl Into<String>) -> Self {
        let category = self.category;
        let kind = self.kind;
        Self {
            category,
            kind,
            source: Some(Box::new(self)),
            msg: msg.into(),
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, FishboxError>;
