//! App state projection (companion side)
//!
//! Derives the companion's top-level UI state from the latest `schedule` and
//! `activities` replies and the link's reachability. Replies carry the
//! sequence number of the request that produced them; a reply older than the
//! one already held for the same kind is discarded. Replies held from before
//! a disconnect are dropped on reconnect, so the projection shows Loading
//! until fresh ones arrive.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::LinkError;
use crate::link::protocol::{ActivitiesReply, Request, ScheduleEntry, ScheduleReply, WorkoutSummary};
use crate::link::LinkChannel;
use crate::types::ActivityKind;

/// Top-level companion UI state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AppState {
    Loading,
    Disconnected,
    ActiveSession {
        kind: ActivityKind,
        name: String,
    },
    ChooseActivity {
        schedule: Vec<ScheduleEntry>,
        activities: Vec<WorkoutSummary>,
    },
}

#[derive(Debug, Clone)]
struct Latest<T> {
    seq: u64,
    value: T,
}

fn accept<T>(slot: &mut Option<Latest<T>>, floor: u64, seq: u64, value: T) -> bool {
    if seq <= floor || slot.as_ref().is_some_and(|held| held.seq >= seq) {
        return false;
    }
    *slot = Some(Latest { seq, value });
    true
}

/// Pure derivation of the UI state from the inputs held so far.
///
/// Disconnected wins over everything; an active session wins over the
/// planning view.
pub fn project(
    reachable: Option<bool>,
    schedule: Option<&ScheduleReply>,
    activities: Option<&ActivitiesReply>,
) -> AppState {
    if reachable == Some(false) {
        return AppState::Disconnected;
    }
    if let Some(active) = activities.and_then(|a| a.active.as_ref()) {
        return AppState::ActiveSession {
            kind: active.activity,
            name: active.name.clone(),
        };
    }
    match (schedule, activities) {
        (Some(schedule), Some(activities)) => AppState::ChooseActivity {
            schedule: schedule.entries.clone(),
            activities: activities.workouts.clone(),
        },
        _ => AppState::Loading,
    }
}

/// Holds the freshest reply per request kind and the current projection
#[derive(Debug, Clone, Default)]
pub struct AppStateProjector {
    reachable: Option<bool>,
    schedule: Option<Latest<ScheduleReply>>,
    activities: Option<Latest<ActivitiesReply>>,
    next_seq: u64,
    /// Replies to requests numbered at or below this predate the last reconnect
    floor: u64,
}

impl AppStateProjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number for the next outgoing request
    pub fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    pub fn state(&self) -> AppState {
        project(
            self.reachable,
            self.schedule.as_ref().map(|l| &l.value),
            self.activities.as_ref().map(|l| &l.value),
        )
    }

    pub fn set_reachable(&mut self, reachable: bool) -> AppState {
        if reachable && self.reachable == Some(false) {
            debug!("Companion back in reach, dropping replies up to #{}", self.next_seq);
            self.schedule = None;
            self.activities = None;
            self.floor = self.next_seq;
        }
        self.reachable = Some(reachable);
        self.state()
    }

    pub fn apply_schedule(&mut self, seq: u64, reply: ScheduleReply) -> AppState {
        if !accept(&mut self.schedule, self.floor, seq, reply) {
            debug!("Discarding stale schedule reply #{}", seq);
        }
        self.state()
    }

    pub fn apply_activities(&mut self, seq: u64, reply: ActivitiesReply) -> AppState {
        if !accept(&mut self.activities, self.floor, seq, reply) {
            debug!("Discarding stale activities reply #{}", seq);
        }
        self.state()
    }

    /// A failed request. `Unavailable` means the peer is out of reach; other
    /// failures keep the last good replies.
    pub fn apply_failure(&mut self, error: &LinkError) -> AppState {
        if *error == LinkError::Unavailable {
            self.reachable = Some(false);
        } else {
            debug!("Request failed, keeping last replies: {}", error);
        }
        self.state()
    }

    /// Issue `schedule` and `activities` concurrently and fold in the replies
    pub async fn refresh(&mut self, link: &LinkChannel) -> AppState {
        self.set_reachable(link.connection().reachable);
        let schedule_seq = self.next_seq();
        let activities_seq = self.next_seq();

        let (schedule, activities) = futures::join!(
            link.request::<ScheduleReply>(&Request::Schedule),
            link.request::<ActivitiesReply>(&Request::Activities),
        );

        match schedule {
            Ok(reply) => {
                self.apply_schedule(schedule_seq, reply);
            }
            Err(e) => {
                self.apply_failure(&e);
            }
        }
        match activities {
            Ok(reply) => self.apply_activities(activities_seq, reply),
            Err(e) => self.apply_failure(&e),
        }
    }
}
