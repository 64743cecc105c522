//! Finalize fan-out
//!
//! Each enrichment part runs as its own task against the store, bounded by the
//! configured query timeout, and reports through a [`PartReporter`]. The
//! record is assembled only after every part has reported.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregator::elevation::{ElevationAccumulator, RouteSummary};
use crate::aggregator::join::{CountedJoin, PartOutcome, PartReporter};
use crate::aggregator::splits::{compute_splits, SplitSummary};
use crate::biometrics::{AuthorizationStatus, BiometricStore};
use crate::error::BiometricError;
use crate::types::{
    ActivityKind, BiometricKind, CompletedSessionRecord, EnrichmentField, LocationType,
    SeriesPoint, Statistics, TimeRange,
};

/// Identity and window of the session being finalized
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FinalizeRequest {
    pub id: Uuid,
    pub activity: ActivityKind,
    pub location: LocationType,
    pub range: TimeRange,
}

/// Value produced by one finalize part
#[derive(Debug, Clone, PartialEq)]
pub enum PartValue {
    HeartRateStats(Statistics),
    HeartRateSeries(Vec<SeriesPoint>),
    Cadence(f64),
    Route(RouteSummary),
    Splits(SplitSummary),
    Energy(f64),
}

pub(crate) async fn finalize(
    store: Arc<dyn BiometricStore>,
    request: FinalizeRequest,
    query_timeout: Duration,
    split_distance_m: f64,
) -> CompletedSessionRecord {
    let mut record =
        CompletedSessionRecord::bare(request.id, request.activity, request.location, request.range);

    if !ensure_authorized(store.as_ref()).await {
        warn!(
            "Finalize {}: biometric store not authorized, record carries identity only",
            request.id
        );
        record.unavailable.extend(EnrichmentField::ALL);
        return record;
    }

    let (join, reporters) = CountedJoin::new(EnrichmentField::ALL);
    debug!("Finalize {}: issuing {} queries", request.id, join.expected());

    for reporter in reporters {
        tokio::spawn(run_part(
            store.clone(),
            reporter,
            request.range,
            query_timeout,
            split_distance_m,
        ));
    }

    for (field, outcome) in join.wait().await {
        match outcome {
            PartOutcome::Resolved(value) => apply(&mut record, value),
            PartOutcome::Unavailable(reason) => {
                warn!("Finalize {}: {} unavailable: {}", request.id, field.as_str(), reason);
                record.unavailable.insert(field);
            }
        }
    }

    info!(
        "Finalize {}: {} complete, {:.0}s, {:.0}m, {} splits, {} unavailable",
        request.id,
        request.activity.as_str(),
        record.duration_seconds,
        record.distance_meters,
        record.splits.len(),
        record.unavailable.len()
    );
    record
}

async fn ensure_authorized(store: &dyn BiometricStore) -> bool {
    match store.authorization_status() {
        AuthorizationStatus::Authorized => true,
        AuthorizationStatus::Denied => false,
        AuthorizationStatus::NotDetermined => matches!(
            store.request_authorization().await,
            Ok(AuthorizationStatus::Authorized)
        ),
    }
}

async fn run_part(
    store: Arc<dyn BiometricStore>,
    reporter: PartReporter<EnrichmentField, PartValue>,
    range: TimeRange,
    query_timeout: Duration,
    split_distance_m: f64,
) {
    let field = reporter.key();
    let query = query_part(store.as_ref(), field, range, split_distance_m);

    match tokio::time::timeout(query_timeout, query).await {
        Ok(Ok(value)) => reporter.resolve(value),
        Ok(Err(e)) => reporter.unavailable(e.to_string()),
        Err(_) => reporter.unavailable(format!("timed out after {:?}", query_timeout)),
    }
}

async fn query_part(
    store: &dyn BiometricStore,
    field: EnrichmentField,
    range: TimeRange,
    split_distance_m: f64,
) -> Result<PartValue, BiometricError> {
    let value = match field {
        EnrichmentField::HeartRateStats => {
            PartValue::HeartRateStats(store.statistics(BiometricKind::HeartRate, range).await?)
        }
        EnrichmentField::HeartRateSeries => {
            let mut series = store.series(BiometricKind::HeartRate, range).await?;
            series.sort_by(|a, b| a.offset_seconds.total_cmp(&b.offset_seconds));
            PartValue::HeartRateSeries(series)
        }
        EnrichmentField::Cadence => {
            let stats = store.statistics(BiometricKind::Cadence, range).await?;
            PartValue::Cadence(stats.average.unwrap_or(0.0))
        }
        EnrichmentField::Route => {
            let mut batches = store.route(range).await?;
            let mut elevation = ElevationAccumulator::new();
            while let Some(batch) = batches.next().await {
                elevation.extend(&batch);
            }
            PartValue::Route(elevation.into_route())
        }
        EnrichmentField::Splits => {
            let samples = store.samples(BiometricKind::Distance, range).await?;
            PartValue::Splits(compute_splits(&samples, range.start, split_distance_m))
        }
        EnrichmentField::Energy => {
            let stats = store.statistics(BiometricKind::Energy, range).await?;
            PartValue::Energy(stats.sum.unwrap_or(0.0))
        }
    };
    Ok(value)
}

fn apply(record: &mut CompletedSessionRecord, value: PartValue) {
    match value {
        PartValue::HeartRateStats(stats) => {
            record.heart_rate_avg = stats.average.unwrap_or(0.0);
            record.heart_rate_max = stats.maximum.unwrap_or(0.0);
        }
        PartValue::HeartRateSeries(series) => record.heart_rate_series = series,
        PartValue::Cadence(cadence) => record.cadence_avg_spm = cadence,
        PartValue::Route(route) => {
            record.route = route.points;
            record.elevation_gain_m = route.elevation_gain_m;
            record.elevation_loss_m = route.elevation_loss_m;
        }
        PartValue::Splits(summary) => {
            record.splits = summary.splits;
            record.distance_meters = summary.total_distance_m;
        }
        PartValue::Energy(energy) => record.energy_kcal = energy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::biometrics::MemoryBiometricStore;
    use crate::types::{BiometricSample, LocationSample};
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn request() -> FinalizeRequest {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 7, 0, 0).unwrap();
        FinalizeRequest {
            id: Uuid::from_u128(0x5717_1de5),
            activity: ActivityKind::Running,
            location: LocationType::Outdoor,
            range: TimeRange::new(start, start + ChronoDuration::minutes(30)),
        }
    }

    fn seeded_store(req: &FinalizeRequest) -> MemoryBiometricStore {
        let store = MemoryBiometricStore::new();
        let at = |secs: i64| req.range.start + ChronoDuration::seconds(secs);
        for i in 0..6 {
            store.record(BiometricSample::new(BiometricKind::HeartRate, at(i * 300), 140.0 + i as f64 * 4.0));
            store.record(BiometricSample::new(BiometricKind::Distance, at(i * 300 + 150), 450.0));
            store.record(BiometricSample::new(BiometricKind::Energy, at(i * 300 + 10), 55.0));
            store.record(BiometricSample::new(BiometricKind::Cadence, at(i * 300 + 20), 170.0));
        }
        store.record_route((0..4).map(|i| LocationSample {
            latitude: 52.52,
            longitude: 13.40 + i as f64 * 0.001,
            timestamp: at(i * 60),
            vertical_accuracy: 4.0,
            altitude: 34.0 + (i % 2) as f64 * 3.0,
        }));
        store
    }

    async fn run(store: MemoryBiometricStore, req: FinalizeRequest) -> CompletedSessionRecord {
        finalize(Arc::new(store), req, Duration::from_secs(10), 1000.0).await
    }

    #[tokio::test]
    async fn test_finalize_assembles_all_parts() {
        let req = request();
        let record = run(seeded_store(&req), req).await;

        assert!(record.is_fully_enriched());
        assert!((record.duration_seconds - 1800.0).abs() < 0.001);
        assert!((record.heart_rate_avg - 150.0).abs() < 0.001);
        assert!((record.heart_rate_max - 160.0).abs() < 0.001);
        assert_eq!(record.heart_rate_series.len(), 6);
        assert!((record.distance_meters - 2700.0).abs() < 0.001);
        assert_eq!(record.splits.len(), 2);
        assert!((record.energy_kcal - 330.0).abs() < 0.001);
        assert!((record.cadence_avg_spm - 170.0).abs() < 0.001);
        assert_eq!(record.route.len(), 4);
        assert!((record.elevation_gain_m - 6.0).abs() < 0.001);
        assert!((record.elevation_loss_m - 3.0).abs() < 0.001);
    }

    #[tokio::test]
    async fn test_finalize_is_deterministic() {
        let req = request();
        let first = run(seeded_store(&req), req).await;
        let second = run(seeded_store(&req), req).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_failed_part_marked_unavailable() {
        let req = request();
        let store = seeded_store(&req);
        store.fail_queries(BiometricKind::Cadence);

        let record = run(store, req).await;
        assert_eq!(record.cadence_avg_spm, 0.0);
        assert_eq!(
            record.unavailable.iter().copied().collect::<Vec<_>>(),
            vec![EnrichmentField::Cadence]
        );
        assert!((record.energy_kcal - 330.0).abs() < 0.001);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_part_times_out() {
        let req = request();
        let store = seeded_store(&req);
        store.stall_queries(BiometricKind::Location);

        let record = finalize(Arc::new(store), req, Duration::from_millis(500), 1000.0).await;
        assert!(record.unavailable.contains(&EnrichmentField::Route));
        assert!(record.route.is_empty());
        assert_eq!(record.splits.len(), 2);
    }

    #[tokio::test]
    async fn test_denied_store_yields_bare_record() {
        let req = request();
        let record = run(MemoryBiometricStore::denied(), req).await;

        assert_eq!(record.id, req.id);
        assert!((record.duration_seconds - 1800.0).abs() < 0.001);
        assert_eq!(record.unavailable.len(), EnrichmentField::ALL.len());
    }

    #[tokio::test]
    async fn test_not_determined_requests_authorization() {
        let req = request();
        let store = seeded_store(&req);
        store.set_authorization(AuthorizationStatus::NotDetermined);

        let record = run(store, req).await;
        assert!(record.is_fully_enriched());
    }
}
