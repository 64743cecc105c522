//! Companion link protocol
//!
//! Duplex, reachability-aware message channel between the handheld and the
//! wrist-worn companion: request/reply, fire-and-forget events, and local
//! queuing of events while the companion is out of reach.

pub mod channel;
pub mod memory;
pub mod message;
pub mod protocol;
pub mod queue;
pub mod transport;

pub use channel::{ActivationState, ConnectionState, InboundHandler, LinkChannel};
pub use memory::{MemoryLink, MemoryTransport, Side};
pub use message::{Frame, LinkMessage, Params, Primitive};
pub use protocol::{Event, FlatPayload, Request};
pub use queue::PendingQueue;
pub use transport::{LinkTransport, PlatformEvent, PlatformSink};
