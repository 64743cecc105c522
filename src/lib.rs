//! Synheart Stride - Companion link and biometric session engine for paired workout devices
//!
//! Stride connects a handheld device with a wrist-worn companion and turns
//! platform biometric data into live session metrics and completed workout
//! records:
//! biometric store → live snapshot → metrics relay → companion link.
//!
//! ## Modules
//!
//! - **Link**: Reachability-aware request/reply and queued event channel
//! - **Aggregator**: Live snapshot merge and fan-out/join finalization
//! - **Session**: Workout state machine and its command service
//! - **Projector**: Companion UI state derived from link replies

pub mod aggregator;
pub mod biometrics;
pub mod config;
pub mod error;
pub mod link;
pub mod logging;
pub mod projector;
pub mod session;
pub mod types;

pub use aggregator::{FinalizeRequest, LiveHandle, SessionAggregator};
pub use biometrics::{BiometricStore, MemoryBiometricStore};
pub use config::StrideConfig;
pub use error::{BiometricError, ConfigError, LinkError, SessionError};
pub use link::{LinkChannel, MemoryLink};
pub use projector::{AppState, AppStateProjector};
pub use session::{SessionController, SessionHandle, SessionService};
pub use types::{CompletedSessionRecord, SessionSnapshot, SessionState};

/// Stride version reported in CLI output
pub const STRIDE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name for exported records
pub const PRODUCER_NAME: &str = "synheart-stride";
