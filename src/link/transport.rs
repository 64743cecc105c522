//! Transport seam between the link channel and the platform connectivity layer
//!
//! Platform callbacks arrive on arbitrary execution contexts. They never touch
//! channel state directly: the transport reports them through a
//! [`PlatformSink`], which enqueues them on the channel's serialized reactor.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::LinkError;
use crate::link::channel::{ActivationState, ReactorInput};
use crate::link::message::Frame;

/// Platform callback, marshalled onto the reactor
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformEvent {
    /// Activation progressed (completion callback)
    Activation(ActivationState),
    /// Proximity/session signal toggled reachability
    Reachability(bool),
    /// A message arrived from the companion
    Frame(Frame),
}

/// Handle given to the transport for reporting platform callbacks
#[derive(Debug, Clone)]
pub struct PlatformSink {
    tx: mpsc::UnboundedSender<ReactorInput>,
}

impl PlatformSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ReactorInput>) -> Self {
        Self { tx }
    }

    /// Enqueue a platform event. Returns false once the channel has shut down.
    pub fn report(&self, event: PlatformEvent) -> bool {
        self.tx.send(ReactorInput::Platform(event)).is_ok()
    }

    pub fn activation_changed(&self, state: ActivationState) -> bool {
        self.report(PlatformEvent::Activation(state))
    }

    pub fn reachability_changed(&self, reachable: bool) -> bool {
        self.report(PlatformEvent::Reachability(reachable))
    }

    pub fn frame_received(&self, frame: Frame) -> bool {
        self.report(PlatformEvent::Frame(frame))
    }
}

/// Platform connectivity used by the link channel
#[async_trait]
pub trait LinkTransport: Send + Sync + 'static {
    /// Install the sink for platform callbacks. Called once, before `activate`.
    fn bind(&self, sink: PlatformSink);

    /// Start platform activation; completion is reported through the sink
    async fn activate(&self) -> Result<(), LinkError>;

    /// One-way send. Returns once the platform accepted the frame, without
    /// waiting for delivery confirmation.
    async fn send(&self, frame: Frame) -> Result<(), LinkError>;
}
