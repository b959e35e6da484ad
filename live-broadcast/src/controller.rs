//! Broadcast session controller.
//!
//! Each session runs on one tokio task that owns the [`SessionMachine`], the
//! media engine, and the join timer. Inputs are processed one at a time:
//! engine and record calls run inline, while slow requests (permission
//! prompt, token fetches) run on a [`JoinSet`] and come back as inputs, so an
//! informational engine event can still be observed while a fetch is out.
//! The join call is the one inline engine call raced against the join timer
//! and caller commands; whichever loses is dropped.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Sleep;
use tracing::Instrument;

use crate::config::BroadcastConfig;
use crate::engine::{ClientRole, EngineConfig, EngineEventReceiver, EngineEventSender, MediaEngine};
use crate::error::{EngineError, SessionError};
use crate::machine::{Effect, Input, SessionMachine};
use crate::permission::{PermissionGate, PermissionStatus};
use crate::record::{RecordPatch, SessionRecord, SessionRecordStore};
use crate::session::{ChannelId, ParticipantId, SessionRequest, SessionSnapshot, SessionState};
use crate::token::{Token, TokenService};

/// Builds the media engine for a new session.
pub type EngineFactory = Arc<dyn Fn() -> Box<dyn MediaEngine> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    End,
    Teardown,
}

impl From<Command> for Input {
    fn from(command: Command) -> Self {
        match command {
            Command::End => Input::EndRequested,
            Command::Teardown => Input::Teardown,
        }
    }
}

/// Starts broadcast sessions against a fixed set of collaborators.
#[derive(Clone)]
pub struct SessionController {
    config: Arc<BroadcastConfig>,
    tokens: Arc<dyn TokenService>,
    records: Arc<dyn SessionRecordStore>,
    permissions: Arc<dyn PermissionGate>,
    engines: EngineFactory,
}

impl SessionController {
    pub fn new(
        config: BroadcastConfig,
        tokens: Arc<dyn TokenService>,
        records: Arc<dyn SessionRecordStore>,
        permissions: Arc<dyn PermissionGate>,
        engines: EngineFactory,
    ) -> Self {
        Self {
            config: Arc::new(config),
            tokens,
            records,
            permissions,
            engines,
        }
    }

    /// Start a broadcast. Must be called from within a tokio runtime.
    pub fn start_session(
        &self,
        channel: ChannelId,
        participant: ParticipantId,
    ) -> Result<SessionHandle, SessionError> {
        SessionRequest::new(&channel, &participant).check()?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::idle());
        let (transitions_tx, transitions_rx) = mpsc::unbounded_channel();
        let _ = transitions_tx.send(SessionState::Idle);

        let driver = SessionDriver {
            machine: SessionMachine::new(self.config.max_renewal_failures),
            engines: self.engines.clone(),
            engine: None,
            config: self.config.clone(),
            tokens: self.tokens.clone(),
            records: self.records.clone(),
            permissions: self.permissions.clone(),
            channel: channel.clone(),
            participant: participant.clone(),
            events_tx,
            commands: commands_rx,
            events: events_rx,
            join_timer: None,
            tasks: JoinSet::new(),
            snapshot_tx,
            transitions_tx,
        };

        let span = tracing::info_span!("broadcast", channel = %channel, uid = %participant);
        let task = tokio::spawn(driver.run().instrument(span));
        tracing::info!("Starting broadcast on channel {} for {}", channel, participant);

        Ok(SessionHandle {
            channel,
            participant,
            commands: commands_tx,
            state: snapshot_rx,
            transitions: Some(transitions_rx),
            task: Some(task),
        })
    }
}

/// Caller's handle on a running session. Dropping it tears the session down.
pub struct SessionHandle {
    channel: ChannelId,
    participant: ParticipantId,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionSnapshot>,
    transitions: Option<mpsc::UnboundedReceiver<SessionState>>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    /// Request an orderly end: leave, finalize the record, release.
    pub fn end_session(&self) {
        if self.commands.send(Command::End).is_err() {
            tracing::debug!("End requested after session {} finished", self.channel);
        }
    }

    /// Unconditional teardown. Safe to call any number of times, in any state.
    pub fn teardown(&self) {
        let _ = self.commands.send(Command::Teardown);
    }

    /// Stream of `{state, last_error}` snapshots for the presentation layer.
    pub fn state(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.clone()
    }

    pub fn current(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    /// Every state the session enters, in order, starting with `Idle`.
    /// Available once.
    pub fn take_transitions(&mut self) -> Option<mpsc::UnboundedReceiver<SessionState>> {
        self.transitions.take()
    }

    /// Wait until the session reaches a terminal state and its cleanup has run.
    pub async fn wait_until_finished(&mut self) -> SessionSnapshot {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!("Session task for {} aborted: {}", self.channel, e);
            }
        }
        self.current()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Teardown);
    }
}

struct SessionDriver {
    machine: SessionMachine,
    engines: EngineFactory,
    // Built when the machine asks for initialization.
    engine: Option<Box<dyn MediaEngine>>,
    config: Arc<BroadcastConfig>,
    tokens: Arc<dyn TokenService>,
    records: Arc<dyn SessionRecordStore>,
    permissions: Arc<dyn PermissionGate>,
    channel: ChannelId,
    participant: ParticipantId,
    events_tx: EngineEventSender,
    commands: mpsc::UnboundedReceiver<Command>,
    events: EngineEventReceiver,
    join_timer: Option<Pin<Box<Sleep>>>,
    tasks: JoinSet<Input>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    transitions_tx: mpsc::UnboundedSender<SessionState>,
}

impl SessionDriver {
    async fn run(mut self) {
        self.process(Input::Start).await;

        while !self.machine.state().is_terminal() {
            let input = tokio::select! {
                command = self.commands.recv() => command_input(command),
                Some(event) = self.events.recv() => Input::from(event),
                Some(done) = self.tasks.join_next() => match done {
                    Ok(input) => input,
                    Err(e) => {
                        tracing::error!("Session background task failed: {}", e);
                        continue;
                    }
                },
                () = timer_fired(&mut self.join_timer) => self.join_timed_out(),
            };
            self.process(input).await;
        }

        self.tasks.abort_all();
        let snapshot = self.machine.snapshot();
        match &snapshot.last_error {
            Some(err) if snapshot.state == SessionState::Failed => {
                tracing::error!("Broadcast on {} failed: {}", self.channel, err)
            }
            _ => tracing::info!("Broadcast on {} ended", self.channel),
        }
    }

    /// Feed one input and everything its effects produce, in order.
    async fn process(&mut self, input: Input) {
        let mut queue = VecDeque::from([input]);
        while let Some(input) = queue.pop_front() {
            let before = self.machine.state();
            let effects = self.machine.handle(input);
            self.publish(before);
            for effect in effects {
                if let Some(next) = self.execute(effect).await {
                    queue.push_back(next);
                }
            }
        }
    }

    fn publish(&self, before: SessionState) {
        let after = self.machine.state();
        if after != before {
            let _ = self.transitions_tx.send(after);
        }
        self.snapshot_tx.send_if_modified(|current| {
            let next = self.machine.snapshot();
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    async fn execute(&mut self, effect: Effect) -> Option<Input> {
        match effect {
            Effect::RequestPermissions => {
                let gate = self.permissions.clone();
                self.tasks.spawn(async move {
                    match gate.request_camera_and_mic().await {
                        Ok(status) => Input::Permission(status),
                        Err(e) => {
                            tracing::warn!("{}", e);
                            Input::Permission(PermissionStatus::Denied)
                        }
                    }
                });
                None
            }
            Effect::InitializeEngine => Some(match self.initialize_engine().await {
                Ok(()) => Input::EngineReady,
                Err(e) => Input::EngineInitFailed(e.to_string()),
            }),
            Effect::FetchToken => {
                self.spawn_initial_fetch();
                None
            }
            Effect::Join(token) => self.join(token).await,
            Effect::ArmJoinTimer => {
                self.join_timer = Some(Box::pin(tokio::time::sleep(self.config.join_timeout)));
                None
            }
            Effect::CancelJoinTimer => {
                self.join_timer = None;
                None
            }
            Effect::CreateRecord => {
                let record = SessionRecord::live(self.channel.clone(), self.participant.clone());
                Some(match self.records.create(record).await {
                    Ok(id) => Input::RecordCreated(id),
                    Err(e) => Input::RecordCreateFailed(e.to_string()),
                })
            }
            Effect::FetchRenewalToken => {
                let tokens = self.tokens.clone();
                let channel = self.channel.clone();
                let participant = self.participant.clone();
                self.tasks.spawn(async move {
                    match tokens.fetch_token(&channel, &participant, false).await {
                        Ok(token) => Input::RenewalTokenReceived(token),
                        Err(e) => Input::RenewalFailed(e.to_string()),
                    }
                });
                None
            }
            Effect::RenewToken(token) => {
                let Some(engine) = self.engine.as_mut() else {
                    return Some(Input::RenewalFailed("engine not initialized".to_string()));
                };
                Some(match engine.renew_token(token).await {
                    Ok(()) => {
                        tracing::info!("Token renewed");
                        Input::RenewalApplied
                    }
                    Err(e) => Input::RenewalFailed(e.to_string()),
                })
            }
            Effect::Leave => {
                if let Some(engine) = self.engine.as_mut() {
                    if let Err(e) = engine.leave().await {
                        tracing::warn!("Leave failed: {}", e);
                    }
                }
                None
            }
            Effect::FinalizeRecord {
                record_id,
                status,
                reason,
            } => {
                let patch = RecordPatch {
                    status,
                    ended_at: Utc::now(),
                    end_reason: reason,
                    replay_url: self
                        .config
                        .replay_base_url
                        .as_ref()
                        .map(|base| format!("{}/{}", base, self.channel)),
                };
                if let Err(e) = self.records.update(&record_id, patch).await {
                    tracing::error!("Could not finalize session record {}: {}", record_id, e);
                }
                Some(Input::FinalizeComplete)
            }
            Effect::Release => {
                if let Some(engine) = self.engine.as_mut() {
                    if let Err(e) = engine.release().await {
                        tracing::warn!("Release failed: {}", e);
                    }
                }
                None
            }
        }
    }

    async fn initialize_engine(&mut self) -> Result<(), EngineError> {
        let config = EngineConfig {
            app_id: self.config.app_id.clone(),
        };
        let factory = &self.engines;
        let engine = self.engine.get_or_insert_with(|| factory());
        engine.initialize(&config, self.events_tx.clone()).await?;

        // Configuration calls are best effort; only initialize is fatal.
        if let Err(e) = engine.enable_video().await {
            tracing::warn!("{}", e);
        }
        if let Err(e) = engine.set_client_role(ClientRole::Broadcaster).await {
            tracing::warn!("{}", e);
        }
        if let Err(e) = engine.setup_local_preview(&self.participant).await {
            tracing::warn!("{}", e);
        }
        if let Err(e) = engine.start_preview().await {
            tracing::warn!("{}", e);
        }
        Ok(())
    }

    /// Issue the join. A hung call must not hold back the join timer or a
    /// caller's end/teardown, so it is raced against both.
    async fn join(&mut self, token: Token) -> Option<Input> {
        let Some(engine) = self.engine.as_mut() else {
            return Some(Input::JoinRequestFailed("engine not initialized".to_string()));
        };
        if let Err(e) = engine.leave().await {
            tracing::debug!("Defensive leave before join: {}", e);
        }

        tokio::select! {
            result = engine.join(token, &self.channel, &self.participant) => match result {
                Ok(()) => None,
                Err(e) => Some(Input::JoinRequestFailed(e.to_string())),
            },
            () = timer_fired(&mut self.join_timer) => {
                tracing::warn!("Join call still pending at the deadline, abandoning it");
                Some(self.join_timed_out())
            }
            command = self.commands.recv() => {
                tracing::info!("Join call interrupted by caller");
                Some(command_input(command))
            }
        }
    }

    fn join_timed_out(&mut self) -> Input {
        self.join_timer = None;
        tracing::warn!("Join not confirmed within {:?}", self.config.join_timeout);
        Input::JoinTimedOut
    }

    fn spawn_initial_fetch(&mut self) {
        let tokens = self.tokens.clone();
        let channel = self.channel.clone();
        let participant = self.participant.clone();
        let attempts = self.config.token_fetch_attempts.max(1);
        let delay = self.config.token_retry_delay;

        self.tasks.spawn(async move {
            let mut attempt = 1;
            loop {
                match tokens.fetch_token(&channel, &participant, false).await {
                    Ok(token) => return Input::TokenReceived(token),
                    Err(e) if attempt < attempts => {
                        tracing::warn!("Token fetch attempt {}/{} failed: {}", attempt, attempts, e);
                        attempt += 1;
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => return Input::TokenFetchFailed(e.to_string()),
                }
            }
        });
    }
}

fn command_input(command: Option<Command>) -> Input {
    match command {
        Some(command) => Input::from(command),
        // Every handle is gone: treat as abandonment.
        None => Input::Teardown,
    }
}

async fn timer_fired(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}
