//! Live-broadcast session controller.
//!
//! Takes a broadcaster from "go live" to a running outbound video session:
//! acquires permissions, initializes the media engine, fetches a channel
//! token, joins under a timeout, keeps the token fresh, and guarantees the
//! engine is released and the session record finalized however the session
//! ends.

pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod loopback;
pub mod machine;
pub mod permission;
pub mod record;
pub mod session;
pub mod token;

pub use config::BroadcastConfig;
pub use controller::{EngineFactory, SessionController, SessionHandle};
pub use engine::{EngineEvent, ErrorCode, MediaEngine};
pub use error::SessionError;
pub use record::{InMemoryRecordStore, RecordId, SessionRecordStore};
pub use session::{ChannelId, ParticipantId, SessionSnapshot, SessionState};
pub use token::{HttpTokenService, StaticTokenService, Token, TokenService};
