use std::error::Error as StdError;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCategory {
    /// Any failure that cannot be confidently attributed to any other error
    /// category in this enum.
    ///
    /// In particular this means that use of Internal is never a guarantee
    /// the error is not, for example due to a user error - merely that it
    /// cannot be confidently determined by the code.
    Internal,

    /// The user provided invalid input or performed an action that is
    /// unsupported or impossible to complete.
    User,
}

/// Fine-grained condition flags for consumers that want to branch on error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Base64 text contained a character outside the alphabet, whitespace
    /// and padding set, or misplaced/oversized padding.
    IllegalCharacter,
    /// BEGIN and END markers name different key types, or only one of
    /// them is present.
    MismatchedKeyTypes,
    /// BEGIN and END markers overlap so no body can be extracted.
    MalformedFraming,
    /// Markers agree on a key type this crate does not know.
    UnsupportedKeyType,
    /// A packed key is shorter than the fixed iv + salt header.
    TruncatedBuffer,
    /// A decoded field has the wrong size (iv, salt, signature).
    BinaryFormat,
    /// Usage is neither "sign" nor "verify", or contradicts the key type.
    InvalidUsage,
    /// The secure random source failed.
    RandomSource,
    /// Password-based key derivation failed.
    KeyDerivation,
    /// Unwrapping failed due to an incorrect passphrase or tampering
    /// or corruption.
    AuthenticationFailed,
    /// A signature did not verify against the message.
    SignatureInvalid,
    /// Passphrase could not be obtained from the configured reader.
    PassphraseUnavailable,
    /// Unexpected state reached within easysign logic.
    InternalInvariant,
    /// Interaction with the filesystem, stdin/stdout, or other I/O failed.
    Io,
}

#[derive(Debug, Error)]
#[error("{msg}")]
pub struct EasySignError {
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

impl EasySignError {
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
pub type Result<T> = std::result::Result<T, EasySignError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_context_keeps_kind_and_chain() {
        let inner = EasySignError::with_kind(
            ErrorCategory::User,
            ErrorKind::TruncatedBuffer,
            "packed key is 3 bytes",
        );
        let outer = inner.with_context("failed to unpack key.pem");

        assert_eq!(outer.kind, Some(ErrorKind::TruncatedBuffer));
        assert_eq!(outer.category, ErrorCategory::User);
        assert_eq!(outer.message(), "failed to unpack key.pem");
        let source = outer.source_error().expect("context must keep the source");
        assert_eq!(source.to_string(), "packed key is 3 bytes");
    }

    #[test]
    fn test_source_is_exposed_through_std_error() {
        let err = EasySignError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::Io,
            "failed to read key",
            io::Error::other("disk on fire"),
        );
        let source = StdError::source(&err).expect("source expected");
        assert_eq!(source.to_string(), "disk on fire");
        assert_eq!(err.to_string(), "failed to read key");
    }
}
