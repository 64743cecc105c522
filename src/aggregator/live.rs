//! Live snapshot collection
//!
//! One observation stream per biometric kind, merged into a single task that
//! owns the [`SessionSnapshot`]. Each observation replaces only its own field
//! and publishes immediately; no kind waits for another. If every stream
//! ends on its own, the platform has dropped the workout session and the
//! handle's ended flag turns true.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::biometrics::{BiometricStore, Observation, ObservationStream};
use crate::error::BiometricError;
use crate::types::{ActivityKind, BiometricKind, GeoPoint, LocationType, SessionSnapshot};

/// Handle to a running live collection
pub struct LiveHandle {
    activity: ActivityKind,
    snapshot_rx: watch::Receiver<SessionSnapshot>,
    ended_rx: watch::Receiver<bool>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl LiveHandle {
    pub fn activity(&self) -> ActivityKind {
        self.activity
    }

    /// Latest snapshot
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Receiver notified on every snapshot change
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Flag set once all observation streams ended without `stop`
    pub fn watch_ended(&self) -> watch::Receiver<bool> {
        self.ended_rx.clone()
    }

    /// Tear down the subscriptions and return the final snapshot
    pub async fn stop(mut self) -> SessionSnapshot {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            debug!("Live collection task ended abnormally: {}", e);
        }
        self.snapshot()
    }
}

impl Drop for LiveHandle {
    fn drop(&mut self) {
        if self.stop_tx.is_some() {
            self.task.abort();
        }
    }
}

pub(crate) async fn begin_live(
    store: Arc<dyn BiometricStore>,
    activity: ActivityKind,
    location: LocationType,
) -> Result<LiveHandle, BiometricError> {
    let kinds = BiometricKind::live_kinds(location);
    let mut streams: Vec<ObservationStream> = Vec::with_capacity(kinds.len());
    for kind in &kinds {
        streams.push(store.observe(*kind).await?);
    }
    debug!(
        "Live {}: observing {} kinds ({})",
        activity.as_str(),
        kinds.len(),
        location.as_str()
    );

    let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());
    let (ended_tx, ended_rx) = watch::channel(false);
    let (stop_tx, stop_rx) = oneshot::channel();
    let task = tokio::spawn(collect(
        stream::select_all(streams),
        snapshot_tx,
        ended_tx,
        stop_rx,
    ));

    Ok(LiveHandle {
        activity,
        snapshot_rx,
        ended_rx,
        stop_tx: Some(stop_tx),
        task,
    })
}

async fn collect(
    mut observations: stream::SelectAll<ObservationStream>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    ended_tx: watch::Sender<bool>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            next = observations.next() => match next {
                Some(observation) => apply(&snapshot_tx, observation),
                None => {
                    warn!("Live observation streams ended before stop");
                    ended_tx.send_replace(true);
                    let _ = (&mut stop_rx).await;
                    break;
                }
            },
        }
    }
}

fn apply(snapshot_tx: &watch::Sender<SessionSnapshot>, observation: Observation) {
    snapshot_tx.send_modify(|snapshot| match observation {
        Observation::Sample(sample) => {
            trace!("Live {} = {}", sample.kind.as_str(), sample.value);
            match sample.kind {
                BiometricKind::HeartRate => snapshot.heart_rate = sample.value,
                BiometricKind::Energy => snapshot.active_energy = sample.value,
                BiometricKind::Distance => snapshot.distance_meters = sample.value,
                BiometricKind::Cadence => snapshot.cadence_spm = sample.value,
                BiometricKind::Location => {}
            }
        }
        Observation::Fix(fix) => {
            snapshot.last_fix = Some(GeoPoint {
                latitude: fix.latitude,
                longitude: fix.longitude,
            });
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::biometrics::MemoryBiometricStore;
    use crate::types::{BiometricSample, LocationSample};
    use chrono::Utc;

    #[tokio::test]
    async fn test_each_kind_updates_its_own_field() {
        let store = Arc::new(MemoryBiometricStore::new());
        let live = begin_live(store.clone(), ActivityKind::Running, LocationType::Indoor)
            .await
            .unwrap();
        let mut rx = live.subscribe();

        store.push_live(BiometricSample::new(BiometricKind::HeartRate, Utc::now(), 128.0));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().heart_rate, 128.0);
        assert_eq!(rx.borrow().distance_meters, 0.0);

        store.push_live(BiometricSample::new(BiometricKind::Distance, Utc::now(), 812.0));
        rx.changed().await.unwrap();
        {
            let snapshot = rx.borrow_and_update();
            assert_eq!(snapshot.distance_meters, 812.0);
            assert_eq!(snapshot.heart_rate, 128.0);
        }

        let last = live.stop().await;
        assert_eq!(last.distance_meters, 812.0);
    }

    #[tokio::test]
    async fn test_outdoor_session_tracks_fix() {
        let store = Arc::new(MemoryBiometricStore::new());
        let live = begin_live(store.clone(), ActivityKind::Cycling, LocationType::Outdoor)
            .await
            .unwrap();
        assert_eq!(store.subscriber_count(BiometricKind::Location), 1);
        let mut rx = live.subscribe();

        store.push_fix(LocationSample {
            latitude: 45.5,
            longitude: -73.6,
            timestamp: Utc::now(),
            vertical_accuracy: 2.0,
            altitude: 40.0,
        });
        rx.changed().await.unwrap();
        assert_eq!(
            rx.borrow().last_fix,
            Some(GeoPoint { latitude: 45.5, longitude: -73.6 })
        );
        live.stop().await;
    }

    #[tokio::test]
    async fn test_indoor_session_skips_location() {
        let store = Arc::new(MemoryBiometricStore::new());
        let live = begin_live(store.clone(), ActivityKind::Rowing, LocationType::Indoor)
            .await
            .unwrap();
        assert_eq!(store.subscriber_count(BiometricKind::Location), 0);
        assert_eq!(store.subscriber_count(BiometricKind::Cadence), 1);
        live.stop().await;
    }

    #[tokio::test]
    async fn test_stop_releases_subscriptions() {
        let store = Arc::new(MemoryBiometricStore::new());
        let live = begin_live(store.clone(), ActivityKind::Walking, LocationType::Indoor)
            .await
            .unwrap();
        live.stop().await;
        assert_eq!(store.subscriber_count(BiometricKind::HeartRate), 0);
    }

    #[tokio::test]
    async fn test_platform_teardown_sets_ended() {
        let store = Arc::new(MemoryBiometricStore::new());
        let live = begin_live(store.clone(), ActivityKind::Running, LocationType::Indoor)
            .await
            .unwrap();
        let mut ended = live.watch_ended();
        assert!(!*ended.borrow());

        store.end_live();
        ended.wait_for(|ended| *ended).await.unwrap();
        live.stop().await;
    }

    #[tokio::test]
    async fn test_stop_does_not_set_ended() {
        let store = Arc::new(MemoryBiometricStore::new());
        let live = begin_live(store, ActivityKind::Running, LocationType::Indoor)
            .await
            .unwrap();
        let mut ended = live.watch_ended();
        live.stop().await;
        // sender dropped without ever flagging the end
        assert!(ended.wait_for(|ended| *ended).await.is_err());
    }

    #[tokio::test]
    async fn test_observe_failure_is_reported() {
        let store = Arc::new(MemoryBiometricStore::new());
        store.fail_observe("workout session rejected");
        let result = begin_live(store, ActivityKind::Running, LocationType::Indoor).await;
        assert!(matches!(result, Err(BiometricError::Unavailable(_))));
    }
}
