//! Broadcast session state machine.
//!
//! [`SessionMachine::handle`] is the single transition function: it takes one
//! [`Input`], updates the session state, and returns the [`Effect`]s the
//! driver must perform. It does no I/O, so every ordering question (late join
//! success after a timeout, teardown racing an explicit end, renewals piling
//! up) is answered here and tested by feeding input sequences.

use crate::engine::{ConnectionChangedReason, ConnectionState, EngineEvent, ErrorCode};
use crate::error::SessionError;
use crate::permission::PermissionStatus;
use crate::record::{RecordId, RecordStatus};
use crate::session::{SessionSnapshot, SessionState};
use crate::token::Token;

/// Something that happened to the session.
#[derive(Debug)]
pub enum Input {
    Start,
    Permission(PermissionStatus),
    EngineReady,
    EngineInitFailed(String),
    TokenReceived(Token),
    TokenFetchFailed(String),
    /// The join call itself was refused by the engine.
    JoinRequestFailed(String),
    JoinSucceeded,
    JoinTimedOut,
    TokenWillExpire,
    ConnectionChanged {
        state: ConnectionState,
        reason: ConnectionChangedReason,
    },
    EngineError(ErrorCode),
    RenewalTokenReceived(Token),
    /// The engine accepted the renewed token.
    RenewalApplied,
    RenewalFailed(String),
    RecordCreated(RecordId),
    RecordCreateFailed(String),
    EndRequested,
    FinalizeComplete,
    Teardown,
}

impl From<EngineEvent> for Input {
    fn from(event: EngineEvent) -> Self {
        match event {
            EngineEvent::JoinSuccess { .. } => Input::JoinSucceeded,
            EngineEvent::TokenWillExpire => Input::TokenWillExpire,
            EngineEvent::ConnectionStateChanged { state, reason } => {
                Input::ConnectionChanged { state, reason }
            }
            EngineEvent::Error { code } => Input::EngineError(code),
        }
    }
}

/// Work the driver performs on behalf of the machine.
#[derive(Debug, PartialEq)]
pub enum Effect {
    RequestPermissions,
    /// Initialize, enable video, set broadcaster role, start local preview.
    InitializeEngine,
    FetchToken,
    /// Defensive leave, then join with this token. Raced against the join
    /// timer and caller commands.
    Join(Token),
    ArmJoinTimer,
    CancelJoinTimer,
    CreateRecord,
    FetchRenewalToken,
    RenewToken(Token),
    Leave,
    FinalizeRecord {
        record_id: RecordId,
        status: RecordStatus,
        reason: Option<String>,
    },
    Release,
}

pub struct SessionMachine {
    state: SessionState,
    last_error: Option<SessionError>,
    record_id: Option<RecordId>,
    record_finalized: bool,
    engine_allocated: bool,
    join_timer_armed: bool,
    left: bool,
    released: bool,
    renewal_in_flight: bool,
    renewal_failures: u32,
    max_renewal_failures: Option<u32>,
    // Terminal state reached once an in-progress finalize completes.
    outcome: SessionState,
}

impl SessionMachine {
    pub fn new(max_renewal_failures: Option<u32>) -> Self {
        Self {
            state: SessionState::Idle,
            last_error: None,
            record_id: None,
            record_finalized: false,
            engine_allocated: false,
            join_timer_armed: false,
            left: false,
            released: false,
            renewal_in_flight: false,
            renewal_failures: 0,
            max_renewal_failures,
            outcome: SessionState::Ended,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn last_error(&self) -> Option<&SessionError> {
        self.last_error.as_ref()
    }

    pub fn record_id(&self) -> Option<&RecordId> {
        self.record_id.as_ref()
    }

    pub fn renewal_in_flight(&self) -> bool {
        self.renewal_in_flight
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            last_error: self.last_error.clone(),
            record_id: self.record_id.clone(),
        }
    }

    pub fn handle(&mut self, input: Input) -> Vec<Effect> {
        use SessionState::*;

        // Late record creation must still be finalized, even after the
        // session has otherwise finished.
        if let Input::RecordCreated(id) = input {
            return self.on_record_created(id);
        }

        if self.state.is_terminal() {
            tracing::debug!("Ignoring {:?} in terminal state {}", input, self.state);
            return Vec::new();
        }

        match (self.state, input) {
            (Idle, Input::Start) => {
                self.set_state(AcquiringPermissions);
                vec![Effect::RequestPermissions]
            }

            (AcquiringPermissions, Input::Permission(PermissionStatus::Granted)) => {
                self.engine_allocated = true;
                self.set_state(Initializing);
                vec![Effect::InitializeEngine]
            }
            (AcquiringPermissions, Input::Permission(PermissionStatus::Denied)) => {
                self.fail(SessionError::PermissionDenied)
            }

            (Initializing, Input::EngineReady) => {
                self.set_state(FetchingToken);
                vec![Effect::FetchToken]
            }
            (Initializing, Input::EngineInitFailed(msg)) => self.fail(SessionError::EngineInit(msg)),

            (FetchingToken, Input::TokenReceived(token)) => {
                self.set_state(Joining);
                self.join_timer_armed = true;
                vec![Effect::ArmJoinTimer, Effect::Join(token)]
            }
            (FetchingToken, Input::TokenFetchFailed(msg)) => self.fail(SessionError::TokenFetch(msg)),

            (Joining, Input::JoinSucceeded) => {
                let mut effects = Vec::new();
                self.push_cancel_timer(&mut effects);
                self.set_state(Live);
                effects.push(Effect::CreateRecord);
                effects
            }
            (Joining, Input::JoinTimedOut) => {
                // Already fired; nothing left to cancel.
                self.join_timer_armed = false;
                self.fail(SessionError::JoinTimeout)
            }
            (Joining, Input::JoinRequestFailed(msg)) => self.fail(SessionError::JoinFailed(msg)),

            (Joining | Live, Input::TokenWillExpire) => self.begin_renewal(),

            (_, Input::ConnectionChanged { state, reason }) => {
                tracing::debug!("Connection state {:?} (reason {})", state, reason.0);
                Vec::new()
            }

            (Joining | Live, Input::EngineError(code)) if code.is_recoverable() => {
                tracing::warn!("Recoverable engine error {}, renewing token", code);
                self.last_error = Some(SessionError::RecoverableEngine { code });
                self.begin_renewal()
            }
            (Live, Input::EngineError(code)) => {
                tracing::error!("Fatal engine error {} while live", code);
                self.last_error = Some(SessionError::FatalEngine { code });
                self.end_live(Failed)
            }
            (Ending, Input::EngineError(code)) => {
                tracing::debug!("Engine error {} while ending", code);
                Vec::new()
            }
            (_, Input::EngineError(code)) if code.is_recoverable() => {
                tracing::debug!("Engine error {} before join, nothing to renew", code);
                Vec::new()
            }
            (_, Input::EngineError(code)) => self.fail(SessionError::FatalEngine { code }),

            (Joining | Live, Input::RenewalTokenReceived(token)) => vec![Effect::RenewToken(token)],
            (_, Input::RenewalTokenReceived(_)) => {
                self.renewal_in_flight = false;
                Vec::new()
            }
            (_, Input::RenewalApplied) => {
                self.renewal_in_flight = false;
                self.renewal_failures = 0;
                if matches!(
                    self.last_error,
                    Some(SessionError::RecoverableEngine { .. } | SessionError::TokenRenewal(_))
                ) {
                    self.last_error = None;
                }
                Vec::new()
            }
            (state, Input::RenewalFailed(msg)) => {
                self.renewal_in_flight = false;
                if !matches!(state, Joining | Live) {
                    return Vec::new();
                }
                self.on_renewal_failed(msg)
            }

            (Live, Input::RecordCreateFailed(msg)) => {
                tracing::error!("Could not create session record: {}", msg);
                self.last_error = Some(SessionError::RecordStore(msg));
                Vec::new()
            }

            (Idle, Input::EndRequested | Input::Teardown) => {
                self.set_state(Ended);
                Vec::new()
            }
            (AcquiringPermissions | Initializing | FetchingToken | Joining, Input::EndRequested | Input::Teardown) => {
                self.shut_down(Ended)
            }
            (Live, Input::EndRequested) => self.end_live(Ended),
            (Live, Input::Teardown) => self.tear_down_live(),

            (Ending, Input::FinalizeComplete | Input::Teardown) => {
                let mut effects = Vec::new();
                self.set_state(self.outcome);
                self.push_release(&mut effects);
                effects
            }

            (state, input) => {
                tracing::debug!("Ignoring {:?} in state {}", input, state);
                Vec::new()
            }
        }
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state != next {
            tracing::info!("Session state {} -> {}", self.state, next);
            self.state = next;
        }
    }

    fn begin_renewal(&mut self) -> Vec<Effect> {
        if self.renewal_in_flight {
            tracing::debug!("Token renewal already in flight");
            return Vec::new();
        }
        self.renewal_in_flight = true;
        vec![Effect::FetchRenewalToken]
    }

    fn on_renewal_failed(&mut self, msg: String) -> Vec<Effect> {
        self.renewal_failures += 1;
        tracing::warn!(
            "Token renewal failed ({} in a row): {}",
            self.renewal_failures,
            msg
        );
        self.last_error = Some(SessionError::TokenRenewal(msg));

        match self.max_renewal_failures {
            Some(max) if self.renewal_failures >= max => {
                let err = SessionError::RenewalLimitExceeded {
                    failures: self.renewal_failures,
                };
                if self.state == SessionState::Live {
                    self.last_error = Some(err);
                    self.end_live(SessionState::Failed)
                } else {
                    self.fail(err)
                }
            }
            _ => Vec::new(),
        }
    }

    fn on_record_created(&mut self, id: RecordId) -> Vec<Effect> {
        if let Some(existing) = &self.record_id {
            tracing::warn!("Session record {} already set, ignoring {}", existing, id);
            return Vec::new();
        }
        self.record_id = Some(id.clone());
        if self.state == SessionState::Live {
            return Vec::new();
        }
        // Session already left Live before the record landed.
        tracing::warn!("Session record {} created after session ended, finalizing", id);
        self.record_finalized = true;
        let status = if self.state == SessionState::Failed || self.outcome == SessionState::Failed {
            RecordStatus::Failed
        } else {
            RecordStatus::Ended
        };
        vec![Effect::FinalizeRecord {
            record_id: id,
            status,
            reason: self.last_error.as_ref().map(ToString::to_string),
        }]
    }

    /// Failure before the session went live: no record to finalize.
    fn fail(&mut self, err: SessionError) -> Vec<Effect> {
        tracing::error!("Session failed: {}", err);
        self.last_error = Some(err);
        self.shut_down(SessionState::Failed)
    }

    fn shut_down(&mut self, terminal: SessionState) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.push_cancel_timer(&mut effects);
        if self.engine_allocated {
            self.push_leave(&mut effects);
        }
        self.push_release(&mut effects);
        self.set_state(terminal);
        effects
    }

    fn end_live(&mut self, outcome: SessionState) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.push_leave(&mut effects);
        match self.take_finalize(outcome) {
            Some(finalize) => {
                effects.push(finalize);
                self.outcome = outcome;
                self.set_state(SessionState::Ending);
            }
            None => {
                self.push_release(&mut effects);
                self.set_state(outcome);
            }
        }
        effects
    }

    fn tear_down_live(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.push_leave(&mut effects);
        if let Some(finalize) = self.take_finalize(SessionState::Ended) {
            effects.push(finalize);
        }
        self.push_release(&mut effects);
        self.set_state(SessionState::Ended);
        effects
    }

    fn take_finalize(&mut self, outcome: SessionState) -> Option<Effect> {
        if self.record_finalized {
            return None;
        }
        let record_id = self.record_id.clone()?;
        self.record_finalized = true;
        let status = if outcome == SessionState::Failed {
            RecordStatus::Failed
        } else {
            RecordStatus::Ended
        };
        let reason = match outcome {
            SessionState::Failed => self.last_error.as_ref().map(ToString::to_string),
            _ => None,
        };
        Some(Effect::FinalizeRecord {
            record_id,
            status,
            reason,
        })
    }

    fn push_cancel_timer(&mut self, effects: &mut Vec<Effect>) {
        if self.join_timer_armed {
            self.join_timer_armed = false;
            effects.push(Effect::CancelJoinTimer);
        }
    }

    fn push_leave(&mut self, effects: &mut Vec<Effect>) {
        if !self.left {
            self.left = true;
            effects.push(Effect::Leave);
        }
    }

    fn push_release(&mut self, effects: &mut Vec<Effect>) {
        if self.engine_allocated && !self.released {
            self.released = true;
            effects.push(Effect::Release);
        }
    }
}
