//! Error types for the broadcast session controller.
//!
//! Each collaborator seam has its own error type. The controller folds all of
//! them into [`SessionError`], which is what callers observe as `last_error`;
//! raw engine codes never leave the controller unclassified.

use thiserror::Error;

use crate::engine::ErrorCode;

/// Failure fetching a token from the issuer.
#[derive(Debug, Error)]
pub enum TokenError {
    /// Transport-level failure (connect, timeout, body read).
    #[error("token request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Issuer answered with a non-success status.
    #[error("token issuer returned status {status}")]
    Status { status: u16 },

    /// Issuer answered 2xx but the body did not carry a usable token.
    #[error("malformed token response: {0}")]
    Malformed(String),

    /// Issuer refused to mint a token for this channel/participant pair.
    #[error("token request rejected: {0}")]
    Rejected(String),
}

/// Failure returned synchronously by a media engine API call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("engine call `{operation}` failed with code {code}")]
pub struct EngineError {
    pub operation: &'static str,
    pub code: ErrorCode,
}

impl EngineError {
    pub fn new(operation: &'static str, code: ErrorCode) -> Self {
        Self { operation, code }
    }
}

/// Failure talking to the session record store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecordStoreError {
    #[error("session record not found: {0}")]
    NotFound(String),

    #[error("record store unavailable: {0}")]
    Unavailable(String),
}

/// Failure from the platform permission prompt itself (not a denial).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("permission request failed: {0}")]
pub struct PermissionError(pub String);

/// Classified session error, surfaced to callers as `last_error`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("camera/microphone permission denied")]
    PermissionDenied,

    #[error("media engine failed to initialize: {0}")]
    EngineInit(String),

    #[error("initial token fetch failed: {0}")]
    TokenFetch(String),

    #[error("join call failed: {0}")]
    JoinFailed(String),

    #[error("join timed out")]
    JoinTimeout,

    /// Engine error resolved by fetching a fresh token.
    #[error("recoverable engine error {code}")]
    RecoverableEngine { code: ErrorCode },

    #[error("fatal engine error {code}")]
    FatalEngine { code: ErrorCode },

    /// Mid-session token renewal failed; the session stays live.
    #[error("token renewal failed: {0}")]
    TokenRenewal(String),

    #[error("token renewal failed {failures} times in a row")]
    RenewalLimitExceeded { failures: u32 },

    #[error("session record store error: {0}")]
    RecordStore(String),

    #[error("invalid session request: {0}")]
    InvalidRequest(String),
}

impl SessionError {
    /// Message the presentation layer shows for this error, if any.
    pub fn user_message(&self) -> Option<&'static str> {
        match self {
            SessionError::PermissionDenied
            | SessionError::EngineInit(_)
            | SessionError::TokenFetch(_)
            | SessionError::JoinFailed(_)
            | SessionError::JoinTimeout
            | SessionError::InvalidRequest(_) => Some("could not start broadcast"),
            SessionError::FatalEngine { .. } | SessionError::RenewalLimitExceeded { .. } => {
                Some("broadcast ended unexpectedly")
            }
            SessionError::RecoverableEngine { .. }
            | SessionError::TokenRenewal(_)
            | SessionError::RecordStore(_) => None,
        }
    }

    /// Whether this error ends (or prevents) the session.
    pub fn is_fatal(&self) -> bool {
        self.user_message().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_failures_share_one_message() {
        for err in [
            SessionError::PermissionDenied,
            SessionError::TokenFetch("503".to_string()),
            SessionError::JoinTimeout,
        ] {
            assert_eq!(err.user_message(), Some("could not start broadcast"));
            assert!(err.is_fatal());
        }
    }

    #[test]
    fn test_mid_session_fatal_message() {
        let err = SessionError::FatalEngine {
            code: ErrorCode(17),
        };
        assert_eq!(err.user_message(), Some("broadcast ended unexpectedly"));
    }

    #[test]
    fn test_recoverable_errors_are_invisible() {
        let err = SessionError::RecoverableEngine {
            code: ErrorCode::TOKEN_EXPIRED,
        };
        assert!(err.user_message().is_none());
        assert!(!SessionError::TokenRenewal("timeout".to_string()).is_fatal());
    }
}
