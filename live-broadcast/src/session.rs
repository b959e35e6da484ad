use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::error::SessionError;
use crate::record::RecordId;

/// Identifier of the channel a session broadcasts on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive a fresh channel for a broadcaster. Called once per session.
    pub fn for_broadcaster(participant: &ParticipantId) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        let prefix: String = participant.as_str().chars().take(16).collect();
        Self(format!("live-{}-{}", prefix, &suffix[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of the local broadcasting user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Arguments to start a session, checked before any collaborator is touched.
#[derive(Debug, Validate)]
pub struct SessionRequest {
    #[validate(length(min = 1, max = 64))]
    pub channel_id: String,
    #[validate(length(min = 1, max = 255))]
    pub participant_id: String,
}

impl SessionRequest {
    pub fn new(channel: &ChannelId, participant: &ParticipantId) -> Self {
        Self {
            channel_id: channel.as_str().to_string(),
            participant_id: participant.as_str().to_string(),
        }
    }

    pub fn check(&self) -> Result<(), SessionError> {
        self.validate()
            .map_err(|e| SessionError::InvalidRequest(e.to_string()))
    }
}

/// Lifecycle state of a broadcast session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    AcquiringPermissions,
    Initializing,
    FetchingToken,
    Joining,
    Live,
    Ending,
    Ended,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Ended | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What the presentation layer observes about a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub last_error: Option<SessionError>,
    pub record_id: Option<RecordId>,
}

impl SessionSnapshot {
    pub fn idle() -> Self {
        Self {
            state: SessionState::Idle,
            last_error: None,
            record_id: None,
        }
    }
}
