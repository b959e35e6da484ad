//! Media engine adapter contract.
//!
//! The real-time transport is an external collaborator. The controller only
//! sees this narrow imperative surface plus the [`EngineEvent`] stream the
//! engine pushes back over the sender handed to [`MediaEngine::initialize`].

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::EngineError;
use crate::session::{ChannelId, ParticipantId};
use crate::token::Token;

/// Numeric error code reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    /// The token used to join has expired.
    pub const TOKEN_EXPIRED: ErrorCode = ErrorCode(109);
    /// The token used to join is invalid.
    pub const INVALID_TOKEN: ErrorCode = ErrorCode(110);

    /// Whether a fresh token resolves this error without ending the session.
    pub fn is_recoverable(self) -> bool {
        matches!(self, Self::TOKEN_EXPIRED | Self::INVALID_TOKEN)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// Engine-specific reason code accompanying a connection state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionChangedReason(pub i32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRole {
    Broadcaster,
    Audience,
}

/// Events pushed by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    JoinSuccess {
        elapsed_ms: u64,
    },
    TokenWillExpire,
    /// Informational; never drives a session transition.
    ConnectionStateChanged {
        state: ConnectionState,
        reason: ConnectionChangedReason,
    },
    Error {
        code: ErrorCode,
    },
}

pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;
pub type EngineEventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub app_id: String,
}

/// Imperative surface of the real-time media transport.
///
/// `leave` and `release` must be safe in every state, including before any
/// join and after a previous `release`. `initialize` must fail if called a
/// second time without an intervening `release`.
#[async_trait]
pub trait MediaEngine: Send {
    async fn initialize(
        &mut self,
        config: &EngineConfig,
        events: EngineEventSender,
    ) -> Result<(), EngineError>;

    async fn enable_video(&mut self) -> Result<(), EngineError>;

    async fn set_client_role(&mut self, role: ClientRole) -> Result<(), EngineError>;

    async fn setup_local_preview(&mut self, participant: &ParticipantId) -> Result<(), EngineError>;

    async fn start_preview(&mut self) -> Result<(), EngineError>;

    /// Request to join. Success is confirmed later by [`EngineEvent::JoinSuccess`].
    async fn join(
        &mut self,
        token: Token,
        channel: &ChannelId,
        participant: &ParticipantId,
    ) -> Result<(), EngineError>;

    async fn renew_token(&mut self, token: Token) -> Result<(), EngineError>;

    async fn leave(&mut self) -> Result<(), EngineError>;

    async fn release(&mut self) -> Result<(), EngineError>;
}
