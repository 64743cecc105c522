//! Session control
//!
//! The per-activity state machine, its elapsed-time clock, the metrics relay
//! to the companion, and the service task that serializes local and remote
//! commands onto the controller.

pub mod clock;
pub mod controller;
pub mod relay;
pub mod service;

pub use clock::ElapsedClock;
pub use controller::{Driver, SessionController, SessionStatus, StartOrigin};
pub use relay::MetricsRelay;
pub use service::{SessionHandle, SessionService};
