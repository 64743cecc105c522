//! Session controller state machine
//!
//! ```text
//! Idle -(start)-> Active -(pause)-> Paused -(resume)-> Active
//! Active/Paused -(end)-> Finalizing -> Completed
//! Active/Paused -(companion ended a delegated session)-> Completed
//! Active/Paused -(platform error)-> Failed
//! Completed/Failed -(reset | start)-> Idle
//! ```
//!
//! Exactly one controller owns the current state. It is driven from a single
//! task (see [`SessionService`](crate::session::SessionService)), so transitions
//! never interleave.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregator::{FinalizeRequest, LiveHandle, SessionAggregator};
use crate::biometrics::AuthorizationStatus;
use crate::config::SessionConfig;
use crate::error::{BiometricError, LinkError, SessionError};
use crate::link::protocol::{
    ActiveSessionInfo, CommandEvent, EndedEvent, Event, Request, StartAck, StartActivity,
};
use crate::link::LinkChannel;
use crate::session::clock::ElapsedClock;
use crate::session::relay::MetricsRelay;
use crate::types::{
    ActivityKind, CompletedSessionRecord, LocationType, SessionSnapshot, SessionState, TimeRange,
};

/// Who asked for the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOrigin {
    /// User on this device
    Local,
    /// Peer over the link (`command{start}` or `startActivity`)
    Remote,
}

/// Which device runs the platform workout session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Driver {
    Local,
    Companion,
}

/// Published view of the controller
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub clock: ElapsedClock,
    pub active: Option<ActiveSessionInfo>,
    pub driver: Option<Driver>,
}

impl SessionStatus {
    fn idle() -> Self {
        Self {
            state: SessionState::Idle,
            clock: ElapsedClock::new(),
            active: None,
            driver: None,
        }
    }
}

struct CurrentSession {
    id: Uuid,
    info: ActiveSessionInfo,
    started_at: DateTime<Utc>,
    driver: Driver,
    live: Option<LiveHandle>,
    relay: Option<MetricsRelay>,
}

/// Per-activity state machine driving the aggregator and the link
pub struct SessionController {
    aggregator: SessionAggregator,
    link: LinkChannel,
    config: SessionConfig,
    state: SessionState,
    clock: ElapsedClock,
    current: Option<CurrentSession>,
    status_tx: watch::Sender<SessionStatus>,
    last_record: Option<CompletedSessionRecord>,
}

impl SessionController {
    pub fn new(aggregator: SessionAggregator, link: LinkChannel, config: SessionConfig) -> Self {
        let (status_tx, _) = watch::channel(SessionStatus::idle());
        Self {
            aggregator,
            link,
            config,
            state: SessionState::Idle,
            clock: ElapsedClock::new(),
            current: None,
            status_tx,
            last_record: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Time spent Active; frozen while Paused, Completed or Failed
    pub fn elapsed(&self) -> Duration {
        self.clock.elapsed()
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state,
            clock: self.clock,
            active: self.active_info(),
            driver: self.current.as_ref().map(|c| c.driver),
        }
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    /// Session in progress, if any
    pub fn active_info(&self) -> Option<ActiveSessionInfo> {
        if !self.state.is_in_progress() {
            return None;
        }
        self.current.as_ref().map(|c| c.info.clone())
    }

    /// Latest live snapshot of a locally driven session
    pub fn snapshot(&self) -> Option<SessionSnapshot> {
        let live = self.current.as_ref()?.live.as_ref()?;
        let mut snapshot = live.snapshot();
        snapshot.elapsed_seconds = self.clock.elapsed_seconds();
        Some(snapshot)
    }

    pub fn last_record(&self) -> Option<&CompletedSessionRecord> {
        self.last_record.as_ref()
    }

    /// Id of the current or most recent session
    pub fn session_id(&self) -> Option<Uuid> {
        self.current.as_ref().map(|c| c.id)
    }

    /// Ended flag of the local live collection, if this device drives it
    pub fn watch_live_ended(&self) -> Option<watch::Receiver<bool>> {
        let live = self.current.as_ref()?.live.as_ref()?;
        Some(live.watch_ended())
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.status());
    }

    fn transition(&mut self, to: SessionState) {
        debug!("Session {} -> {}", self.state, to);
        self.state = to;
        self.publish();
    }

    fn invalid(&self, action: &'static str) -> SessionError {
        SessionError::InvalidTransition {
            from: self.state,
            action,
        }
    }

    /// Begin a session with a fresh id. See [`start_with_id`](Self::start_with_id).
    pub async fn start(
        &mut self,
        activity: ActivityKind,
        location: LocationType,
        origin: StartOrigin,
    ) -> Result<Driver, SessionError> {
        self.start_with_id(activity, location, origin, None).await
    }

    /// Begin a session.
    ///
    /// `workout_id` becomes the session id and the id of its record; a fresh
    /// one is generated when absent. A local start hands the session to a
    /// reachable companion when delegation is enabled and the companion
    /// accepts `startActivity`; otherwise the local biometric store drives it.
    /// Refusal, authorization or platform failures are returned and leave the
    /// controller Idle.
    pub async fn start_with_id(
        &mut self,
        activity: ActivityKind,
        location: LocationType,
        origin: StartOrigin,
        workout_id: Option<Uuid>,
    ) -> Result<Driver, SessionError> {
        if self.state.is_in_progress() {
            return Err(SessionError::AlreadyActive(self.state));
        }
        if self.state != SessionState::Idle {
            self.reset()?;
        }

        let delegate = origin == StartOrigin::Local
            && self.config.delegate_to_companion
            && self.link.connection().reachable;
        let id = workout_id.unwrap_or_else(Uuid::new_v4);
        let driver = if delegate {
            self.delegate(id, activity, location).await?
        } else {
            Driver::Local
        };

        let live = match driver {
            Driver::Companion => None,
            Driver::Local => {
                self.authorize().await?;
                Some(self.aggregator.begin_live(activity, location).await?)
            }
        };

        self.current = Some(CurrentSession {
            id,
            info: ActiveSessionInfo {
                activity,
                location,
                name: activity.display_name().to_string(),
            },
            started_at: Utc::now(),
            driver,
            live,
            relay: None,
        });
        self.clock.reset();
        self.clock.run();
        self.transition(SessionState::Active);

        if let Some(current) = self.current.as_mut() {
            if let Some(live) = &current.live {
                current.relay = Some(MetricsRelay::spawn(
                    self.link.clone(),
                    activity,
                    live.subscribe(),
                    self.status_tx.subscribe(),
                    self.config.snapshot_interval(),
                ));
            }
        }

        info!(
            "Session started: {} {} ({:?} origin, {:?} driver)",
            activity.as_str(),
            location.as_str(),
            origin,
            driver
        );
        Ok(driver)
    }

    /// Ask the companion to drive the session. An out-of-reach companion
    /// falls back to local driving; a refusal is surfaced.
    async fn delegate(
        &self,
        id: Uuid,
        activity: ActivityKind,
        location: LocationType,
    ) -> Result<Driver, SessionError> {
        let request = Request::StartActivity(StartActivity {
            activity,
            location,
            workout_id: Some(id),
        });
        match self.link.request::<StartAck>(&request).await {
            Ok(ack) if ack.accepted => Ok(Driver::Companion),
            Ok(ack) => {
                let reason = ack.reason.unwrap_or_else(|| "no reason given".to_string());
                warn!("Companion refused {}: {}", activity.as_str(), reason);
                Err(SessionError::PeerRefused(reason))
            }
            Err(LinkError::Unavailable) => {
                debug!("Companion out of reach, driving {} locally", activity.as_str());
                Ok(Driver::Local)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn authorize(&self) -> Result<(), SessionError> {
        let store = self.aggregator.store();
        let status = match store.authorization_status() {
            AuthorizationStatus::NotDetermined => store.request_authorization().await?,
            status => status,
        };
        if status != AuthorizationStatus::Authorized {
            warn!("Session start refused: biometric authorization {:?}", status);
            return Err(BiometricError::AuthorizationDenied.into());
        }
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Active {
            return Err(self.invalid("pause"));
        }
        self.clock.freeze();
        self.transition(SessionState::Paused);
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Paused {
            return Err(self.invalid("resume"));
        }
        self.clock.run();
        self.transition(SessionState::Active);
        Ok(())
    }

    /// End the session.
    ///
    /// Locally driven sessions are finalized into a record and announced with
    /// `ended`. A session driven by the companion is ended there with
    /// `command{end}` and yields no local record.
    pub async fn end(&mut self) -> Result<Option<CompletedSessionRecord>, SessionError> {
        if !matches!(self.state, SessionState::Active | SessionState::Paused) {
            return Err(self.invalid("end"));
        }
        let Some(mut current) = self.current.take() else {
            return Err(self.invalid("end"));
        };

        self.clock.freeze();
        drop(current.relay.take());
        let driver = current.driver;
        let live = current.live.take();
        let id = current.id;
        let started_at = current.started_at;
        let info = current.info.clone();
        self.current = Some(current);
        self.transition(SessionState::Finalizing);

        let record = match live {
            None => {
                if let Err(e) = self.link.send(&Event::Command(CommandEvent::end())) {
                    warn!("Could not forward end to companion: {}", e);
                }
                None
            }
            Some(live) => {
                live.stop().await;
                let request = FinalizeRequest {
                    id,
                    activity: info.activity,
                    location: info.location,
                    range: TimeRange::new(started_at, Utc::now()),
                };
                let record = self.aggregator.finalize(request).await;
                if let Err(e) = self.link.send(&Event::Ended(EndedEvent { uuid: Some(record.id) })) {
                    warn!("Could not announce session end: {}", e);
                }
                self.last_record = Some(record.clone());
                Some(record)
            }
        };

        self.transition(SessionState::Completed);
        info!(
            "Session ended: {} after {:.1}s active ({:?} driver)",
            info.activity.as_str(),
            self.clock.elapsed_seconds(),
            driver
        );
        Ok(record)
    }

    /// The companion finished a session it was driving for this device.
    ///
    /// Completes the delegated session without a local record. Returns false
    /// when there is no delegated session in progress or `uuid` names a
    /// different session.
    pub fn peer_ended(&mut self, uuid: Option<Uuid>) -> bool {
        if !self.state.is_in_progress() {
            return false;
        }
        let Some(current) = self.current.as_ref() else {
            return false;
        };
        if current.driver != Driver::Companion {
            debug!("Ignoring peer end, session {} is driven locally", current.id);
            return false;
        }
        if uuid.is_some_and(|id| id != current.id) {
            debug!("Ignoring peer end for {:?}, current session is {}", uuid, current.id);
            return false;
        }

        self.clock.freeze();
        let activity = current.info.activity;
        self.transition(SessionState::Completed);
        info!(
            "Companion ended {} after {:.1}s",
            activity.as_str(),
            self.clock.elapsed_seconds()
        );
        true
    }

    /// Record a platform failure of the running session. Elapsed time is
    /// frozen and metrics stop. A locally driven session announces `ended`
    /// without an id so the peer does not wait on it.
    pub fn fail(&mut self, reason: &str) -> Result<(), SessionError> {
        if !matches!(self.state, SessionState::Active | SessionState::Paused) {
            return Err(self.invalid("fail"));
        }
        self.clock.freeze();
        let mut announce = false;
        if let Some(current) = self.current.as_mut() {
            drop(current.relay.take());
            announce = current.live.take().is_some();
        }
        warn!("Session failed: {}", reason);
        if announce {
            if let Err(e) = self.link.send(&Event::Ended(EndedEvent { uuid: None })) {
                warn!("Could not announce failed session: {}", e);
            }
        }
        self.transition(SessionState::Failed);
        Ok(())
    }

    /// Return to Idle after Completed/Failed
    pub fn reset(&mut self) -> Result<(), SessionError> {
        if self.state.is_in_progress() {
            return Err(self.invalid("reset"));
        }
        self.current = None;
        self.clock.reset();
        if self.state != SessionState::Idle {
            self.transition(SessionState::Idle);
        }
        Ok(())
    }
}
