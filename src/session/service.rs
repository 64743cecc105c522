//! Session service
//!
//! Owns the [`SessionController`] on one task. Local callers go through
//! [`SessionHandle`]; remote `command` events and `startActivity` requests
//! arrive through the link's inbound handler and are marshalled onto the same
//! command queue, so every transition is serialized. Platform teardown of a
//! locally driven session and the companion's `ended` for a delegated one are
//! marshalled onto the same queue.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregator::SessionAggregator;
use crate::config::SessionConfig;
use crate::error::{LinkError, SessionError};
use crate::link::protocol::{
    ActivitiesReply, CommandAction, Event, FlatPayload, MetricsEvent, Request, ScheduleReply,
    StartActivity, StartAck, WorkoutSummary,
};
use crate::link::{InboundHandler, LinkChannel, Params};
use crate::session::controller::{Driver, SessionController, SessionStatus, StartOrigin};
use crate::types::{ActivityKind, CompletedSessionRecord, LocationType, SessionSnapshot};

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum SessionCommand {
    Start {
        activity: ActivityKind,
        location: LocationType,
        origin: StartOrigin,
        workout_id: Option<Uuid>,
        reply: Option<Reply<Driver>>,
    },
    Pause(Reply<()>),
    Resume(Reply<()>),
    End(Option<Reply<Option<CompletedSessionRecord>>>),
    Fail(String),
    /// Every live observation stream of the given session ended
    PlatformLost(Uuid),
    PeerEnded(Option<Uuid>),
    Reset(Reply<()>),
    Activities(oneshot::Sender<ActivitiesReply>),
    Snapshot(oneshot::Sender<Option<SessionSnapshot>>),
}

struct ServiceTask {
    controller: SessionController,
    commands: mpsc::WeakUnboundedSender<SessionCommand>,
    recent: VecDeque<WorkoutSummary>,
    recent_limit: usize,
}

impl ServiceTask {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionCommand>) {
        debug!("Session service started");
        while let Some(command) = rx.recv().await {
            self.handle(command).await;
        }
        debug!("Session service exiting");
    }

    async fn handle(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Start {
                activity,
                location,
                origin,
                workout_id,
                reply,
            } => {
                let result = self
                    .controller
                    .start_with_id(activity, location, origin, workout_id)
                    .await;
                match &result {
                    Ok(Driver::Local) => self.watch_platform(),
                    Ok(Driver::Companion) => {}
                    Err(e) => warn!("Start {} ({:?}) rejected: {}", activity.as_str(), origin, e),
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            SessionCommand::Pause(reply) => {
                let _ = reply.send(self.controller.pause());
            }
            SessionCommand::Resume(reply) => {
                let _ = reply.send(self.controller.resume());
            }
            SessionCommand::End(reply) => {
                let result = self.controller.end().await;
                match &result {
                    Ok(Some(record)) => self.remember(record),
                    Ok(None) => {}
                    Err(e) => debug!("End ignored: {}", e),
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            SessionCommand::Fail(reason) => {
                if let Err(e) = self.controller.fail(&reason) {
                    debug!("Failure report ignored: {}", e);
                }
            }
            SessionCommand::PlatformLost(id) => {
                if self.controller.session_id() != Some(id) {
                    debug!("Platform loss for earlier session {} ignored", id);
                } else if let Err(e) = self.controller.fail("biometric observation ended") {
                    debug!("Platform loss ignored: {}", e);
                }
            }
            SessionCommand::PeerEnded(uuid) => {
                if !self.controller.peer_ended(uuid) {
                    debug!("Peer end {:?} does not match a delegated session", uuid);
                }
            }
            SessionCommand::Reset(reply) => {
                let _ = reply.send(self.controller.reset());
            }
            SessionCommand::Activities(reply) => {
                let _ = reply.send(ActivitiesReply {
                    active: self.controller.active_info(),
                    workouts: self.recent.iter().cloned().collect(),
                });
            }
            SessionCommand::Snapshot(reply) => {
                let _ = reply.send(self.controller.snapshot());
            }
        }
    }

    /// Fail the new local session if the platform drops its live streams
    fn watch_platform(&self) {
        let (Some(id), Some(mut ended)) =
            (self.controller.session_id(), self.controller.watch_live_ended())
        else {
            return;
        };
        let commands = self.commands.clone();
        tokio::spawn(async move {
            if ended.wait_for(|ended| *ended).await.is_ok() {
                if let Some(commands) = commands.upgrade() {
                    let _ = commands.send(SessionCommand::PlatformLost(id));
                }
            }
        });
    }

    fn remember(&mut self, record: &CompletedSessionRecord) {
        self.recent.push_front(WorkoutSummary::from(record));
        self.recent.truncate(self.recent_limit);
    }
}

/// Inbound link handler feeding the service
struct ServiceInbound {
    commands: mpsc::UnboundedSender<SessionCommand>,
    schedule: ScheduleReply,
    peer_metrics: watch::Sender<Option<MetricsEvent>>,
}

impl ServiceInbound {
    fn submit(&self, command: SessionCommand) -> bool {
        let submitted = self.commands.send(command).is_ok();
        if !submitted {
            debug!("Session service gone, dropping inbound command");
        }
        submitted
    }

    async fn start_activity(&self, request: StartActivity) -> StartAck {
        let (tx, rx) = oneshot::channel();
        let submitted = self.submit(SessionCommand::Start {
            activity: request.activity,
            location: request.location,
            origin: StartOrigin::Remote,
            workout_id: request.workout_id,
            reply: Some(tx),
        });

        let result = match rx.await {
            Ok(result) if submitted => result.map(|_| ()).map_err(|e| e.to_string()),
            _ => Err("session service stopped".to_string()),
        };
        StartAck {
            accepted: result.is_ok(),
            reason: result.err(),
        }
    }
}

#[async_trait]
impl InboundHandler for ServiceInbound {
    async fn on_event(&self, kind: &str, params: &Params) {
        let event = match Event::parse(kind, params) {
            Ok(event) => event,
            Err(e) => {
                warn!("Dropping inbound '{}': {}", kind, e);
                return;
            }
        };

        match event {
            Event::Command(command) => match command.action {
                CommandAction::Start => {
                    let activity = command.activity.unwrap_or(ActivityKind::Other);
                    let location = command.location.unwrap_or(LocationType::Indoor);
                    info!("Remote start: {} {}", activity.as_str(), location.as_str());
                    self.submit(SessionCommand::Start {
                        activity,
                        location,
                        origin: StartOrigin::Remote,
                        workout_id: None,
                        reply: None,
                    });
                }
                CommandAction::End => {
                    info!("Remote end");
                    self.submit(SessionCommand::End(None));
                }
            },
            Event::Metrics(metrics) => {
                self.peer_metrics.send_replace(Some(metrics));
            }
            Event::Ended(ended) => {
                match ended.uuid {
                    Some(id) => info!("Peer session ended, record {}", id),
                    None => info!("Peer session ended without a record"),
                }
                self.peer_metrics.send_replace(None);
                self.submit(SessionCommand::PeerEnded(ended.uuid));
            }
        }
    }

    async fn on_request(&self, kind: &str, params: &Params) -> Option<Params> {
        match Request::parse(kind, params) {
            Ok(Request::Schedule) => Some(self.schedule.to_params()),
            Ok(Request::Activities) => {
                let (tx, rx) = oneshot::channel();
                if !self.submit(SessionCommand::Activities(tx)) {
                    return None;
                }
                rx.await.ok().map(|reply| reply.to_params())
            }
            Ok(Request::StartActivity(request)) => {
                Some(self.start_activity(request).await.to_params())
            }
            Err(e) => {
                let ack = StartAck {
                    accepted: false,
                    reason: Some(e.to_string()),
                };
                debug!("Unanswerable request '{}': {}", kind, e);
                (kind == crate::link::protocol::KIND_START_ACTIVITY).then(|| ack.to_params())
            }
        }
    }
}

/// Composition of a controller, its command task and the link handler
pub struct SessionService;

impl SessionService {
    /// Spawn the service task and register it as the link's inbound handler.
    ///
    /// `schedule` answers `schedule` requests from the peer.
    pub fn spawn(
        aggregator: SessionAggregator,
        link: LinkChannel,
        config: &SessionConfig,
        schedule: ScheduleReply,
    ) -> Result<SessionHandle, LinkError> {
        let controller = SessionController::new(aggregator, link.clone(), config.clone());
        let status_rx = controller.watch_status();
        let (commands, rx) = mpsc::unbounded_channel();
        let (peer_metrics, peer_metrics_rx) = watch::channel(None);

        let task = ServiceTask {
            controller,
            commands: commands.downgrade(),
            recent: VecDeque::with_capacity(config.recent_workouts),
            recent_limit: config.recent_workouts,
        };
        tokio::spawn(task.run(rx));

        link.on_inbound_message(Arc::new(ServiceInbound {
            commands: commands.clone(),
            schedule,
            peer_metrics,
        }))?;

        Ok(SessionHandle {
            commands,
            status_rx,
            peer_metrics_rx,
        })
    }
}

/// Cloneable front end to a running session service
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    status_rx: watch::Receiver<SessionStatus>,
    peer_metrics_rx: watch::Receiver<Option<MetricsEvent>>,
}

impl SessionHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| SessionError::Link(LinkError::Closed))?;
        rx.await.map_err(|_| SessionError::Link(LinkError::Closed))
    }

    pub async fn start(
        &self,
        activity: ActivityKind,
        location: LocationType,
    ) -> Result<Driver, SessionError> {
        self.call(|reply| SessionCommand::Start {
            activity,
            location,
            origin: StartOrigin::Local,
            workout_id: None,
            reply: Some(reply),
        })
        .await?
    }

    pub async fn pause(&self) -> Result<(), SessionError> {
        self.call(SessionCommand::Pause).await?
    }

    pub async fn resume(&self) -> Result<(), SessionError> {
        self.call(SessionCommand::Resume).await?
    }

    pub async fn end(&self) -> Result<Option<CompletedSessionRecord>, SessionError> {
        self.call(|reply| SessionCommand::End(Some(reply))).await?
    }

    pub async fn reset(&self) -> Result<(), SessionError> {
        self.call(SessionCommand::Reset).await?
    }

    /// Report a platform failure of the running session
    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.commands.send(SessionCommand::Fail(reason.into()));
    }

    /// Same payload the peer gets for an `activities` request
    pub async fn activities(&self) -> Result<ActivitiesReply, SessionError> {
        self.call(SessionCommand::Activities).await
    }

    pub async fn snapshot(&self) -> Result<Option<SessionSnapshot>, SessionError> {
        self.call(SessionCommand::Snapshot).await
    }

    pub fn status(&self) -> SessionStatus {
        self.status_rx.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }

    /// Latest `metrics` received from the peer's session
    pub fn watch_peer_metrics(&self) -> watch::Receiver<Option<MetricsEvent>> {
        self.peer_metrics_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::biometrics::MemoryBiometricStore;
    use crate::config::{AggregationConfig, LinkConfig};
    use crate::link::protocol::ScheduleEntry;
    use crate::link::{MemoryLink, Side};
    use crate::types::SessionState;
    use std::time::Duration;

    struct Pair {
        memory: MemoryLink,
        store: Arc<MemoryBiometricStore>,
        handheld: SessionHandle,
        handheld_link: LinkChannel,
        companion_link: LinkChannel,
    }

    async fn pair(config: SessionConfig) -> Pair {
        let (memory, handheld_end, companion_end) = MemoryLink::pair();
        let link_config = LinkConfig::default();
        let handheld_link = LinkChannel::spawn("handheld", Arc::new(handheld_end), &link_config);
        let companion_link = LinkChannel::spawn("companion", Arc::new(companion_end), &link_config);

        let store = Arc::new(MemoryBiometricStore::new());
        let aggregator = SessionAggregator::new(store.clone(), AggregationConfig::default());
        let schedule = ScheduleReply {
            entries: vec![ScheduleEntry {
                day: "mon".to_string(),
                activity: ActivityKind::Running,
                name: "Easy run".to_string(),
            }],
        };
        let handheld =
            SessionService::spawn(aggregator, handheld_link.clone(), &config, schedule).unwrap();

        memory.set_reachable(true);
        handheld_link.activate().unwrap();
        companion_link.activate().unwrap();
        for link in [&handheld_link, &companion_link] {
            link.watch_connection()
                .wait_for(|c| c.is_deliverable())
                .await
                .unwrap();
        }

        Pair {
            memory,
            store,
            handheld,
            handheld_link,
            companion_link,
        }
    }

    #[tokio::test]
    async fn test_schedule_request_answered() {
        let p = pair(SessionConfig::default()).await;
        let reply: ScheduleReply = p.companion_link.request(&Request::Schedule).await.unwrap();
        assert_eq!(reply.entries.len(), 1);
        assert_eq!(reply.entries[0].name, "Easy run");
    }

    #[tokio::test]
    async fn test_start_activity_request_starts_session() {
        let p = pair(SessionConfig::default()).await;
        let ack: StartAck = p
            .companion_link
            .request(&Request::StartActivity(StartActivity {
                activity: ActivityKind::Cycling,
                location: LocationType::Outdoor,
                workout_id: None,
            }))
            .await
            .unwrap();
        assert!(ack.accepted);

        let activities: ActivitiesReply =
            p.companion_link.request(&Request::Activities).await.unwrap();
        let active = activities.active.expect("session in progress");
        assert_eq!(active.activity, ActivityKind::Cycling);
        assert_eq!(p.handheld.status().driver, Some(Driver::Local));

        // a second start is refused with a reason
        let ack: StartAck = p
            .companion_link
            .request(&Request::StartActivity(StartActivity {
                activity: ActivityKind::Running,
                location: LocationType::Indoor,
                workout_id: None,
            }))
            .await
            .unwrap();
        assert!(!ack.accepted);
        assert!(ack.reason.is_some());
    }

    #[tokio::test]
    async fn test_completed_workouts_are_listed() {
        let config = SessionConfig {
            delegate_to_companion: false,
            recent_workouts: 2,
            ..SessionConfig::default()
        };
        let p = pair(config).await;

        for _ in 0..3 {
            p.handheld
                .start(ActivityKind::Walking, LocationType::Indoor)
                .await
                .unwrap();
            assert!(p.handheld.end().await.unwrap().is_some());
        }

        let activities = p.handheld.activities().await.unwrap();
        assert!(activities.active.is_none());
        assert_eq!(activities.workouts.len(), 2);
        assert_eq!(p.handheld.status().state, SessionState::Completed);

        // drain the reactor's command queue before inspecting sent frames
        p.handheld_link.pending_len().await.unwrap();
        let ended = p
            .memory
            .messages_sent_by(Side::Handheld)
            .iter()
            .filter(|m| m.kind() == "ended")
            .count();
        assert_eq!(ended, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_end_stops_session() {
        let p = pair(SessionConfig::default()).await;
        p.companion_link
            .send(&Event::Command(crate::link::protocol::CommandEvent::start(
                ActivityKind::Running,
                LocationType::Indoor,
            )))
            .unwrap();
        let mut status = p.handheld.watch_status();
        status
            .wait_for(|s| s.state == SessionState::Active)
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(3)).await;
        p.companion_link
            .send(&Event::Command(crate::link::protocol::CommandEvent::end()))
            .unwrap();
        status
            .wait_for(|s| s.state == SessionState::Completed)
            .await
            .unwrap();

        let activities = p.handheld.activities().await.unwrap();
        assert_eq!(activities.workouts.len(), 1);
    }

    #[tokio::test]
    async fn test_platform_teardown_fails_local_session() {
        let config = SessionConfig {
            delegate_to_companion: false,
            ..SessionConfig::default()
        };
        let p = pair(config).await;
        assert_eq!(
            p.handheld
                .start(ActivityKind::Running, LocationType::Indoor)
                .await
                .unwrap(),
            Driver::Local
        );

        p.store.end_live();
        let mut status = p.handheld.watch_status();
        let failed = tokio::time::timeout(
            Duration::from_secs(2),
            status.wait_for(|s| s.state == SessionState::Failed),
        )
        .await
        .expect("teardown reaches the controller")
        .unwrap()
        .clone();
        assert!(!failed.clock.is_running());

        // the peer is told the session is over
        p.handheld_link.pending_len().await.unwrap();
        let ended: Vec<_> = p
            .memory
            .messages_sent_by(Side::Handheld)
            .into_iter()
            .filter(|m| m.kind() == "ended")
            .collect();
        assert_eq!(ended.len(), 1);

        // a later session is not affected by the earlier teardown
        p.handheld
            .start(ActivityKind::Walking, LocationType::Indoor)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(p.handheld.status().state, SessionState::Active);
    }
}
