//! In-process paired transport
//!
//! Two [`MemoryTransport`] ends share one simulated connection. Reachability
//! is driven from the [`MemoryLink`] controller, which also records every
//! frame each end handed to the platform.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::LinkError;
use crate::link::channel::ActivationState;
use crate::link::message::{Frame, LinkMessage};
use crate::link::transport::{LinkTransport, PlatformSink};

/// End of a memory link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Handheld,
    Companion,
}

impl Side {
    fn index(self) -> usize {
        match self {
            Side::Handheld => 0,
            Side::Companion => 1,
        }
    }

    fn peer(self) -> Side {
        match self {
            Side::Handheld => Side::Companion,
            Side::Companion => Side::Handheld,
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    reachable: bool,
    sinks: [Option<PlatformSink>; 2],
    activated: [bool; 2],
    sent: [Vec<Frame>; 2],
    /// Number of upcoming sends that fail, per side
    fail_sends: [usize; 2],
}

/// Controller for a simulated connection between two transports
#[derive(Debug, Clone)]
pub struct MemoryLink {
    shared: Arc<Mutex<Shared>>,
}

/// One end of a memory link
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    side: Side,
    shared: Arc<Mutex<Shared>>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryLink {
    /// Create a connected pair, initially unreachable
    pub fn pair() -> (MemoryLink, MemoryTransport, MemoryTransport) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        (
            MemoryLink {
                shared: shared.clone(),
            },
            MemoryTransport {
                side: Side::Handheld,
                shared: shared.clone(),
            },
            MemoryTransport {
                side: Side::Companion,
                shared,
            },
        )
    }

    /// Toggle reachability and notify both ends
    pub fn set_reachable(&self, reachable: bool) {
        let sinks: Vec<PlatformSink> = {
            let mut shared = lock(&self.shared);
            shared.reachable = reachable;
            shared.sinks.iter().flatten().cloned().collect()
        };
        for sink in sinks {
            sink.reachability_changed(reachable);
        }
    }

    pub fn is_reachable(&self) -> bool {
        lock(&self.shared).reachable
    }

    /// Frames the given end handed to the platform, in order
    pub fn sent_by(&self, side: Side) -> Vec<Frame> {
        lock(&self.shared).sent[side.index()].clone()
    }

    /// Decoded messages the given end handed to the platform
    pub fn messages_sent_by(&self, side: Side) -> Vec<LinkMessage> {
        self.sent_by(side)
            .into_iter()
            .filter_map(|frame| LinkMessage::from_frame(frame).ok())
            .collect()
    }

    /// Make the next `count` sends from `side` fail
    pub fn fail_next_sends(&self, side: Side, count: usize) {
        lock(&self.shared).fail_sends[side.index()] = count;
    }

    /// Deliver a raw frame to `side` as if the peer had sent it
    pub fn inject(&self, side: Side, frame: Frame) -> bool {
        let sink = lock(&self.shared).sinks[side.index()].clone();
        sink.map(|sink| sink.frame_received(frame)).unwrap_or(false)
    }
}

#[async_trait]
impl LinkTransport for MemoryTransport {
    fn bind(&self, sink: PlatformSink) {
        lock(&self.shared).sinks[self.side.index()] = Some(sink);
    }

    async fn activate(&self) -> Result<(), LinkError> {
        let (sink, reachable) = {
            let mut shared = lock(&self.shared);
            shared.activated[self.side.index()] = true;
            (shared.sinks[self.side.index()].clone(), shared.reachable)
        };
        let sink = sink.ok_or_else(|| LinkError::Transport("transport not bound".to_string()))?;
        sink.activation_changed(ActivationState::Activated);
        sink.reachability_changed(reachable);
        Ok(())
    }

    async fn send(&self, frame: Frame) -> Result<(), LinkError> {
        let peer_sink = {
            let mut shared = lock(&self.shared);
            let index = self.side.index();
            if !shared.reachable {
                return Err(LinkError::Unavailable);
            }
            if shared.fail_sends[index] > 0 {
                shared.fail_sends[index] -= 1;
                return Err(LinkError::Transport("simulated send failure".to_string()));
            }
            shared.sent[index].push(frame.clone());
            shared.sinks[self.side.peer().index()].clone()
        };

        if let Some(sink) = peer_sink {
            sink.frame_received(frame);
        }
        Ok(())
    }
}
