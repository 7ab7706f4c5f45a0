//! The engine's own typed error: a `kind` token plus free-text `cause`,
//! used throughout retry/catch classification.
//!
//! This is deliberately *not* the crate-wide error type -- orchestration,
//! checkpoint I/O and template compilation each get their own `thiserror`
//! enum in `wayforge-core`. `WorkflowError` is reserved for the
//! activity-facing error domain: the thing a retry policy or a catch
//! handler matches against.

use std::fmt;

/// Context-deadline or per-attempt timeout exceeded.
pub const KIND_TIMEOUT: &str = "TIMEOUT";
/// Default classification for any activity error that isn't otherwise typed.
pub const KIND_ACTIVITY_FAILED: &str = "ACTIVITY_FAILED";
/// Unrecoverable; never matched by the `ALL` wildcard.
pub const KIND_FATAL: &str = "FATAL";
/// Match-token only -- matches everything except `FATAL`. Never raised.
pub const KIND_ALL: &str = "ALL";

/// A classified workflow error: a matchable `kind` token and a free-text
/// `cause`, optionally wrapping the error that produced it.
///
/// User activities may construct this with any string `kind` -- custom
/// tokens (e.g. `"permission-denied"`) match only that exact token in
/// `error_equals` lists.
#[derive(Debug)]
pub struct WorkflowError {
    kind: String,
    cause: String,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl WorkflowError {
    /// Build a `WorkflowError` with the given kind token and cause text.
    pub fn new(kind: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            cause: cause.into(),
            source: None,
        }
    }

    /// Build a `WorkflowError` that wraps an underlying error, retaining its
    /// source chain. The cause text is the wrapped error's `Display` output.
    pub fn wrap(
        kind: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind: kind.into(),
            cause: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Construct a `TIMEOUT`-kind error.
    pub fn timeout(cause: impl Into<String>) -> Self {
        Self::new(KIND_TIMEOUT, cause)
    }

    /// Construct an `ACTIVITY_FAILED`-kind error.
    pub fn activity_failed(cause: impl Into<String>) -> Self {
        Self::new(KIND_ACTIVITY_FAILED, cause)
    }

    /// Construct a `FATAL`-kind error. Never matched by an `ALL` wildcard.
    pub fn fatal(cause: impl Into<String>) -> Self {
        Self::new(KIND_FATAL, cause)
    }

    /// The match token for this error.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The free-text cause.
    pub fn cause(&self) -> &str {
        &self.cause
    }

    /// True iff this error's kind is `FATAL`.
    pub fn is_fatal(&self) -> bool {
        self.kind == KIND_FATAL
    }

    /// Render the structured `{Error, Cause, Details}` shape a catch handler
    /// stores into a variable.
    pub fn to_error_output(&self) -> serde_json::Value {
        serde_json::json!({
            "Error": self.kind,
            "Cause": self.cause,
            "Details": {},
        })
    }

    /// Evaluate the matching rule: an empty `tokens` list is
    /// treated as `[ALL]`; `ALL` matches any kind except `FATAL`; otherwise
    /// exact string equality against this error's kind.
    pub fn matches(&self, tokens: &[String]) -> bool {
        if tokens.is_empty() {
            return self.kind != KIND_FATAL;
        }
        tokens.iter().any(|token| {
            if token == KIND_ALL {
                self.kind != KIND_FATAL
            } else {
                token == &self.kind
            }
        })
    }
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.cause)
    }
}

impl std::error::Error for WorkflowError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl Clone for WorkflowError {
    /// Clones drop the source chain (trait objects aren't `Clone`); `kind`
    /// and `cause` -- the only fields matching or persistence ever look at
    /// -- are preserved.
    fn clone(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            cause: self.cause.clone(),
            source: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_matches_everything_but_fatal() {
        let err = WorkflowError::activity_failed("boom");
        assert!(err.matches(&[KIND_ALL.to_string()]));

        let fatal = WorkflowError::fatal("boom");
        assert!(!fatal.matches(&[KIND_ALL.to_string()]));
    }

    #[test]
    fn empty_tokens_means_all() {
        let err = WorkflowError::timeout("slow");
        assert!(err.matches(&[]));

        let fatal = WorkflowError::fatal("dead");
        assert!(!fatal.matches(&[]));
    }

    #[test]
    fn custom_token_matches_only_itself() {
        let err = WorkflowError::new("permission-denied", "nope");
        assert!(err.matches(&["permission-denied".to_string()]));
        assert!(!err.matches(&["ACTIVITY_FAILED".to_string()]));
    }

    #[test]
    fn error_output_shape() {
        let err = WorkflowError::new("permission-denied", "missing scope");
        let out = err.to_error_output();
        assert_eq!(out["Error"], "permission-denied");
        assert_eq!(out["Cause"], "missing scope");
        assert_eq!(out["Details"], serde_json::json!({}));
    }

    #[test]
    fn wrap_preserves_source_chain() {
        let io_err = std::io::Error::other("disk full");
        let wrapped = WorkflowError::wrap(KIND_ACTIVITY_FAILED, io_err);
        assert!(wrapped.source().is_some());
        assert_eq!(wrapped.cause(), "disk full");
    }
}
