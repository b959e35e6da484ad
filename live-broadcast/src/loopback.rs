use std::time::Duration;

use async_trait::async_trait;

use crate::engine::{
    ClientRole, ConnectionChangedReason, ConnectionState, EngineConfig, EngineEvent,
    EngineEventSender, ErrorCode, MediaEngine,
};
use crate::error::EngineError;
use crate::session::{ChannelId, ParticipantId};
use crate::token::Token;

/// Engine refused to initialize twice without a release in between.
pub const ERR_ALREADY_INITIALIZED: ErrorCode = ErrorCode(7);
/// Call made before `initialize`.
pub const ERR_NOT_INITIALIZED: ErrorCode = ErrorCode(8);

/// In-process media engine for local runs. Sends no media; it acknowledges a
/// join after `join_delay` and reports connection changes like a real
/// transport would.
pub struct LoopbackEngine {
    join_delay: Duration,
    events: Option<EngineEventSender>,
    joined: bool,
    preview: bool,
    role: Option<ClientRole>,
    channel: Option<ChannelId>,
}

impl LoopbackEngine {
    pub fn new(join_delay: Duration) -> Self {
        Self {
            join_delay,
            events: None,
            joined: false,
            preview: false,
            role: None,
            channel: None,
        }
    }

    pub fn is_joined(&self) -> bool {
        self.joined
    }

    pub fn is_previewing(&self) -> bool {
        self.preview
    }

    pub fn role(&self) -> Option<ClientRole> {
        self.role
    }

    fn events(&self, operation: &'static str) -> Result<&EngineEventSender, EngineError> {
        self.events
            .as_ref()
            .ok_or_else(|| EngineError::new(operation, ERR_NOT_INITIALIZED))
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new(Duration::from_millis(200))
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn initialize(
        &mut self,
        config: &EngineConfig,
        events: EngineEventSender,
    ) -> Result<(), EngineError> {
        if self.events.is_some() {
            return Err(EngineError::new("initialize", ERR_ALREADY_INITIALIZED));
        }
        tracing::debug!("Loopback engine initialized for app {:?}", config.app_id);
        self.events = Some(events);
        Ok(())
    }

    async fn enable_video(&mut self) -> Result<(), EngineError> {
        self.events("enable_video").map(|_| ())
    }

    async fn set_client_role(&mut self, role: ClientRole) -> Result<(), EngineError> {
        self.events("set_client_role")?;
        self.role = Some(role);
        Ok(())
    }

    async fn setup_local_preview(&mut self, participant: &ParticipantId) -> Result<(), EngineError> {
        self.events("setup_local_preview")?;
        tracing::debug!("Local preview bound to {}", participant);
        Ok(())
    }

    async fn start_preview(&mut self) -> Result<(), EngineError> {
        self.events("start_preview")?;
        self.preview = true;
        Ok(())
    }

    async fn join(
        &mut self,
        token: Token,
        channel: &ChannelId,
        participant: &ParticipantId,
    ) -> Result<(), EngineError> {
        let events = self.events("join")?.clone();
        self.channel = Some(channel.clone());
        tracing::info!(
            "Loopback join {} as {} ({}-byte token)",
            channel,
            participant,
            token.value().len()
        );

        let _ = events.send(EngineEvent::ConnectionStateChanged {
            state: ConnectionState::Connecting,
            reason: ConnectionChangedReason(0),
        });
        let delay = self.join_delay;
        tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            tokio::time::sleep(delay).await;
            let _ = events.send(EngineEvent::ConnectionStateChanged {
                state: ConnectionState::Connected,
                reason: ConnectionChangedReason(1),
            });
            let _ = events.send(EngineEvent::JoinSuccess {
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        });
        self.joined = true;
        Ok(())
    }

    async fn renew_token(&mut self, token: Token) -> Result<(), EngineError> {
        self.events("renew_token")?;
        tracing::debug!("Loopback token renewed (issued {})", token.issued_at());
        Ok(())
    }

    async fn leave(&mut self) -> Result<(), EngineError> {
        if self.joined {
            self.joined = false;
            self.emit(EngineEvent::ConnectionStateChanged {
                state: ConnectionState::Disconnected,
                reason: ConnectionChangedReason(5),
            });
            if let Some(channel) = self.channel.take() {
                tracing::info!("Loopback left {}", channel);
            }
        }
        Ok(())
    }

    async fn release(&mut self) -> Result<(), EngineError> {
        self.joined = false;
        self.preview = false;
        self.role = None;
        self.channel = None;
        self.events = None;
        Ok(())
    }
}
