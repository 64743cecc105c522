//! Metrics relay
//!
//! Pushes `metrics` events to the companion while a locally driven session is
//! active: once per snapshot change and once per interval tick. Nothing is
//! sent while paused; the relay exits when the session leaves Active/Paused.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::link::protocol::{Event, MetricsEvent};
use crate::link::LinkChannel;
use crate::session::controller::SessionStatus;
use crate::types::{ActivityKind, SessionSnapshot, SessionState};

/// Running relay task; aborted on drop
#[derive(Debug)]
pub struct MetricsRelay {
    task: JoinHandle<()>,
}

impl MetricsRelay {
    pub fn spawn(
        link: LinkChannel,
        activity: ActivityKind,
        snapshots: watch::Receiver<SessionSnapshot>,
        status: watch::Receiver<SessionStatus>,
        interval: Duration,
    ) -> Self {
        Self {
            task: tokio::spawn(run(link, activity, snapshots, status, interval)),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for MetricsRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    link: LinkChannel,
    activity: ActivityKind,
    mut snapshots: watch::Receiver<SessionSnapshot>,
    mut status: watch::Receiver<SessionStatus>,
    interval: Duration,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sent: u64 = 0;

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                drop(snapshots.borrow_and_update());
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = status.borrow_and_update().state;
                if !matches!(state, SessionState::Active | SessionState::Paused) {
                    break;
                }
            }
            _ = tick.tick() => {}
        }

        let (state, elapsed) = {
            let current = status.borrow();
            (current.state, current.clock.elapsed_seconds())
        };
        if state != SessionState::Active {
            continue;
        }

        let mut snapshot = snapshots.borrow().clone();
        snapshot.elapsed_seconds = elapsed;
        let event = Event::Metrics(MetricsEvent::from_snapshot(activity, &snapshot));
        if link.send(&event).is_err() {
            debug!("Metrics relay: link closed");
            break;
        }
        sent += 1;
        trace!("Metrics relay: sent #{} at {:.1}s", sent, elapsed);
    }

    debug!("Metrics relay for {} stopped after {} events", activity.as_str(), sent);
}
