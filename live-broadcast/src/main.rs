use std::sync::Arc;
use std::time::Duration;

use live_broadcast::loopback::LoopbackEngine;
use live_broadcast::permission::AutoGrant;
use live_broadcast::{
    BroadcastConfig, ChannelId, EngineFactory, HttpTokenService, InMemoryRecordStore,
    MediaEngine, ParticipantId, SessionController, SessionState, StaticTokenService, TokenService,
};

#[tokio::main]
async fn main() {
    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let config = BroadcastConfig::from_env();

    let tokens: Arc<dyn TokenService> = match &config.token_service_url {
        Some(url) => match HttpTokenService::new(url.clone(), config.request_timeout) {
            Ok(service) => {
                tracing::info!("Using token issuer at {}", url);
                Arc::new(service)
            }
            Err(e) => {
                tracing::error!("Could not build token client: {}", e);
                std::process::exit(1);
            }
        },
        None => {
            tracing::warn!("TOKEN_SERVICE_URL not set, using a static token");
            Arc::new(StaticTokenService::default())
        }
    };

    let records = InMemoryRecordStore::new();
    let engines: EngineFactory =
        Arc::new(|| Box::new(LoopbackEngine::new(Duration::from_millis(300))) as Box<dyn MediaEngine>);
    let controller = SessionController::new(
        config,
        tokens,
        Arc::new(records.clone()),
        Arc::new(AutoGrant),
        engines,
    );

    let participant = ParticipantId::new(
        std::env::var("BROADCASTER_ID").unwrap_or_else(|_| "local-broadcaster".to_string()),
    );
    let channel = ChannelId::for_broadcaster(&participant);

    let mut handle = match controller.start_session(channel, participant) {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!("Could not start broadcast: {}", e);
            std::process::exit(1);
        }
    };

    let mut state = handle.state();
    let mut interrupted = false;
    loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = state.borrow_and_update().clone();
                tracing::info!("Session is {}", snapshot.state);
                if snapshot.state == SessionState::Live {
                    tracing::info!(
                        "{} is live on {} (Ctrl-C to end)",
                        handle.participant(),
                        handle.channel()
                    );
                }
                if snapshot.state.is_terminal() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                tracing::info!("Ending broadcast...");
                handle.end_session();
            }
        }
    }

    let finished = handle.wait_until_finished().await;
    if let Some(err) = &finished.last_error {
        if let Some(message) = err.user_message() {
            tracing::error!("{} ({})", message, err);
        }
    }
    if let Some(id) = &finished.record_id {
        if let Some(record) = records.get(id).await {
            tracing::info!(
                "Record {}: {:?}, started {}, ended {:?}",
                id,
                record.status,
                record.started_at,
                record.ended_at
            );
        }
    }
}
