//! Session and aggregation scenarios across the link, controller and store

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use uuid::Uuid;

use synheart_stride::aggregator::{FinalizeRequest, SessionAggregator};
use synheart_stride::biometrics::MemoryBiometricStore;
use synheart_stride::config::{AggregationConfig, LinkConfig, SessionConfig};
use synheart_stride::link::protocol::{CommandEvent, Event, FlatPayload, MetricsEvent, ScheduleReply};
use synheart_stride::link::{InboundHandler, LinkChannel, MemoryLink, Params};
use synheart_stride::session::{Driver, SessionHandle, SessionService};
use synheart_stride::SessionError;
use synheart_stride::types::{
    ActivityKind, BiometricKind, BiometricSample, EnrichmentField, LocationType, SessionState,
    TimeRange,
};

struct MetricsSink {
    tx: mpsc::UnboundedSender<MetricsEvent>,
}

#[async_trait]
impl InboundHandler for MetricsSink {
    async fn on_event(&self, kind: &str, params: &Params) {
        if kind == "metrics" {
            if let Ok(metrics) = MetricsEvent::from_params(params) {
                let _ = self.tx.send(metrics);
            }
        }
    }
}

struct Rig {
    store: Arc<MemoryBiometricStore>,
    handheld: SessionHandle,
    companion: LinkChannel,
    metrics_rx: mpsc::UnboundedReceiver<MetricsEvent>,
}

async fn rig(delegate_to_companion: bool) -> Rig {
    let (memory, handheld_end, companion_end) = MemoryLink::pair();
    let link_config = LinkConfig::default();
    let handheld_link = LinkChannel::spawn("handheld", Arc::new(handheld_end), &link_config);
    let companion = LinkChannel::spawn("companion", Arc::new(companion_end), &link_config);

    let (tx, metrics_rx) = mpsc::unbounded_channel();
    companion.on_inbound_message(Arc::new(MetricsSink { tx })).unwrap();

    let store = Arc::new(MemoryBiometricStore::new());
    let session_config = SessionConfig {
        snapshot_interval_ms: 100,
        delegate_to_companion,
        ..SessionConfig::default()
    };
    let handheld = SessionService::spawn(
        SessionAggregator::new(store.clone(), AggregationConfig::default()),
        handheld_link.clone(),
        &session_config,
        ScheduleReply::default(),
    )
    .unwrap();

    memory.set_reachable(true);
    handheld_link.activate().unwrap();
    companion.activate().unwrap();
    for link in [&handheld_link, &companion] {
        link.watch_connection()
            .wait_for(|c| c.is_deliverable())
            .await
            .unwrap();
    }

    Rig {
        store,
        handheld,
        companion,
        metrics_rx,
    }
}

#[tokio::test]
async fn remote_start_streams_metrics() {
    let mut rig = rig(true).await;
    let mut status = rig.handheld.watch_status();

    rig.companion
        .send(&Event::Command(CommandEvent::start(
            ActivityKind::Running,
            LocationType::Outdoor,
        )))
        .unwrap();
    status
        .wait_for(|s| s.state == SessionState::Active)
        .await
        .unwrap();

    let first = tokio::time::timeout(Duration::from_secs(2), rig.metrics_rx.recv())
        .await
        .expect("metrics within a snapshot cycle")
        .unwrap();
    assert_eq!(first.activity, ActivityKind::Running);

    rig.store
        .push_live(BiometricSample::new(BiometricKind::HeartRate, Utc::now(), 151.0));
    let with_heart_rate = loop {
        let metrics = tokio::time::timeout(Duration::from_secs(2), rig.metrics_rx.recv())
            .await
            .expect("metrics keep flowing")
            .unwrap();
        if metrics.heart_rate > 0.0 {
            break metrics;
        }
    };
    assert_eq!(with_heart_rate.heart_rate, 151.0);
}

async fn next_metrics(rx: &mut mpsc::UnboundedReceiver<MetricsEvent>) -> MetricsEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("metrics within a snapshot cycle")
        .unwrap()
}

#[tokio::test]
async fn paused_session_stops_metrics_and_elapsed() {
    let mut rig = rig(false).await;
    let driver = rig
        .handheld
        .start(ActivityKind::Cycling, LocationType::Indoor)
        .await
        .unwrap_or_else(|e| panic!("start failed: {}", e));
    assert_eq!(driver, Driver::Local);
    next_metrics(&mut rig.metrics_rx).await;

    rig.handheld.pause().await.unwrap();
    // let anything sent just before the pause arrive, then discard it
    tokio::time::sleep(Duration::from_millis(150)).await;
    while rig.metrics_rx.try_recv().is_ok() {}

    let first = rig.handheld.status().clock.elapsed();
    rig.store
        .push_live(BiometricSample::new(BiometricKind::HeartRate, Utc::now(), 163.0));
    tokio::time::sleep(Duration::from_millis(450)).await;
    let second = rig.handheld.status().clock.elapsed();
    assert_eq!(first, second);
    assert!(rig.metrics_rx.try_recv().is_err(), "no metrics while paused");

    rig.handheld.resume().await.unwrap();
    let resumed = next_metrics(&mut rig.metrics_rx).await;
    assert_eq!(resumed.heart_rate, 163.0);
    assert!(resumed.elapsed_seconds >= second.as_secs_f64());

    assert!(rig.handheld.end().await.unwrap().is_some());
}

struct Devices {
    handheld: SessionHandle,
    companion: SessionHandle,
}

/// Two full session services talking over one memory link
async fn devices(companion_store: MemoryBiometricStore) -> Devices {
    let (memory, handheld_end, companion_end) = MemoryLink::pair();
    let link_config = LinkConfig::default();
    let handheld_link = LinkChannel::spawn("handheld", Arc::new(handheld_end), &link_config);
    let companion_link = LinkChannel::spawn("companion", Arc::new(companion_end), &link_config);

    let handheld = SessionService::spawn(
        SessionAggregator::new(Arc::new(MemoryBiometricStore::new()), AggregationConfig::default()),
        handheld_link.clone(),
        &SessionConfig::default(),
        ScheduleReply::default(),
    )
    .unwrap();
    let companion = SessionService::spawn(
        SessionAggregator::new(Arc::new(companion_store), AggregationConfig::default()),
        companion_link.clone(),
        &SessionConfig::default(),
        ScheduleReply::default(),
    )
    .unwrap();

    memory.set_reachable(true);
    for link in [&handheld_link, &companion_link] {
        link.activate().unwrap();
        link.watch_connection()
            .wait_for(|c| c.is_deliverable())
            .await
            .unwrap();
    }
    Devices { handheld, companion }
}

#[tokio::test]
async fn delegated_session_completes_when_companion_ends() {
    let devices = devices(MemoryBiometricStore::new()).await;
    let driver = devices
        .handheld
        .start(ActivityKind::Running, LocationType::Outdoor)
        .await
        .unwrap();
    assert_eq!(driver, Driver::Companion);
    assert_eq!(devices.companion.status().state, SessionState::Active);
    assert_eq!(devices.companion.status().driver, Some(Driver::Local));

    let record = devices.companion.end().await.unwrap();
    assert!(record.is_some());

    let mut status = devices.handheld.watch_status();
    tokio::time::timeout(
        Duration::from_secs(2),
        status.wait_for(|s| s.state == SessionState::Completed),
    )
    .await
    .expect("companion end reaches the handheld")
    .unwrap();
    assert!(!devices.handheld.status().clock.is_running());

    // the handheld is free to start the next session
    let driver = devices
        .handheld
        .start(ActivityKind::Walking, LocationType::Indoor)
        .await
        .unwrap();
    assert_eq!(driver, Driver::Companion);
}

#[tokio::test]
async fn companion_refusal_leaves_handheld_idle() {
    let devices = devices(MemoryBiometricStore::denied()).await;
    let err = devices
        .handheld
        .start(ActivityKind::Running, LocationType::Outdoor)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::PeerRefused(_)));
    assert_eq!(devices.handheld.status().state, SessionState::Idle);
    assert_eq!(devices.companion.status().state, SessionState::Idle);
}

#[tokio::test]
async fn finalize_with_no_samples_keeps_identity_and_duration() {
    let store = Arc::new(MemoryBiometricStore::new());
    let aggregator = SessionAggregator::new(store, AggregationConfig::default());
    let start = Utc.with_ymd_and_hms(2024, 7, 4, 9, 15, 0).unwrap();
    let request = FinalizeRequest {
        id: Uuid::new_v4(),
        activity: ActivityKind::Walking,
        location: LocationType::Outdoor,
        range: TimeRange::new(start, start + ChronoDuration::seconds(2_400)),
    };

    let record = aggregator.finalize(request).await;
    assert_eq!(record.id, request.id);
    assert_eq!(record.heart_rate_avg, 0.0);
    assert!(record.splits.is_empty());
    assert!(record.route.is_empty());
    assert_eq!(record.elevation_gain_m, 0.0);
    assert_eq!(record.duration_seconds, 2_400.0);
    // empty is a real answer, not a failure
    assert!(record.is_fully_enriched());

    let again = aggregator.finalize(request).await;
    assert_eq!(record, again);
}

#[tokio::test]
async fn failing_store_degrades_single_fields() {
    let store = Arc::new(MemoryBiometricStore::new());
    let start = Utc.with_ymd_and_hms(2024, 7, 4, 9, 15, 0).unwrap();
    for i in 0..4 {
        store.record(BiometricSample::new(
            BiometricKind::Distance,
            start + ChronoDuration::seconds(i * 240 + 200),
            500.0,
        ));
    }
    store.fail_queries(BiometricKind::HeartRate);

    let aggregator = SessionAggregator::new(store, AggregationConfig::default());
    let record = aggregator
        .finalize(FinalizeRequest {
            id: Uuid::new_v4(),
            activity: ActivityKind::Running,
            location: LocationType::Indoor,
            range: TimeRange::new(start, start + ChronoDuration::minutes(20)),
        })
        .await;

    assert_eq!(
        record.unavailable.iter().copied().collect::<Vec<_>>(),
        vec![EnrichmentField::HeartRateStats, EnrichmentField::HeartRateSeries]
    );
    assert_eq!(record.splits.len(), 2);
    assert_eq!(record.distance_meters, 2_000.0);
}
