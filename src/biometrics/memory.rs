//! In-memory biometric store
//!
//! Serves recorded samples for finalize queries and fans live pushes out to
//! observation subscribers. Queries for a kind can be made to fail or to
//! never resolve, to exercise degraded finalization.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;

use super::{AuthorizationStatus, BiometricStore, Observation, ObservationStream, RouteStream};
use crate::error::BiometricError;
use crate::types::{
    BiometricKind, BiometricSample, LocationSample, SeriesPoint, Statistics, TimeRange,
};

/// Route batches are delivered in chunks of this size
const ROUTE_BATCH: usize = 64;

#[derive(Debug)]
struct Inner {
    authorization: AuthorizationStatus,
    grant_on_request: bool,
    samples: Vec<BiometricSample>,
    route: Vec<LocationSample>,
    failing: HashSet<BiometricKind>,
    stalled: HashSet<BiometricKind>,
    observe_error: Option<String>,
    subscribers: HashMap<BiometricKind, Vec<mpsc::UnboundedSender<Observation>>>,
}

/// Biometric store backed by recorded data
#[derive(Debug)]
pub struct MemoryBiometricStore {
    inner: Mutex<Inner>,
}

impl Default for MemoryBiometricStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBiometricStore {
    /// Authorized store with no data
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                authorization: AuthorizationStatus::Authorized,
                grant_on_request: true,
                samples: Vec::new(),
                route: Vec::new(),
                failing: HashSet::new(),
                stalled: HashSet::new(),
                observe_error: None,
                subscribers: HashMap::new(),
            }),
        }
    }

    /// Store whose access has been denied, and stays denied
    pub fn denied() -> Self {
        let store = Self::new();
        {
            let mut inner = store.lock();
            inner.authorization = AuthorizationStatus::Denied;
            inner.grant_on_request = false;
        }
        store
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_authorization(&self, status: AuthorizationStatus) {
        self.lock().authorization = status;
    }

    pub fn record(&self, sample: BiometricSample) {
        self.lock().samples.push(sample);
    }

    pub fn record_all(&self, samples: impl IntoIterator<Item = BiometricSample>) {
        self.lock().samples.extend(samples);
    }

    pub fn record_route(&self, fixes: impl IntoIterator<Item = LocationSample>) {
        self.lock().route.extend(fixes);
    }

    /// Queries touching `kind` return an error
    pub fn fail_queries(&self, kind: BiometricKind) {
        self.lock().failing.insert(kind);
    }

    /// Queries touching `kind` never resolve
    pub fn stall_queries(&self, kind: BiometricKind) {
        self.lock().stalled.insert(kind);
    }

    /// Subsequent `observe` calls fail with a platform error
    pub fn fail_observe(&self, message: &str) {
        self.lock().observe_error = Some(message.to_string());
    }

    /// Deliver a live sample to subscribers of its kind
    pub fn push_live(&self, sample: BiometricSample) {
        self.broadcast(sample.kind, Observation::Sample(sample));
    }

    /// Deliver a live GPS fix to location subscribers
    pub fn push_fix(&self, fix: LocationSample) {
        self.broadcast(BiometricKind::Location, Observation::Fix(fix));
    }

    /// Close every live subscription
    pub fn end_live(&self) {
        self.lock().subscribers.clear();
    }

    pub fn subscriber_count(&self, kind: BiometricKind) -> usize {
        self.lock()
            .subscribers
            .get(&kind)
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    fn broadcast(&self, kind: BiometricKind, observation: Observation) {
        let mut inner = self.lock();
        if let Some(subscribers) = inner.subscribers.get_mut(&kind) {
            subscribers.retain(|tx| tx.send(observation.clone()).is_ok());
        }
    }

    /// Authorization and failure-injection gate shared by all queries
    async fn gate(&self, kind: BiometricKind) -> Result<(), BiometricError> {
        let (authorization, failing, stalled) = {
            let inner = self.lock();
            (
                inner.authorization,
                inner.failing.contains(&kind),
                inner.stalled.contains(&kind),
            )
        };
        if authorization != AuthorizationStatus::Authorized {
            return Err(BiometricError::AuthorizationDenied);
        }
        if stalled {
            futures::future::pending::<()>().await;
        }
        if failing {
            return Err(BiometricError::Query(format!("{} query failed", kind.as_str())));
        }
        Ok(())
    }

    fn samples_in(&self, kind: BiometricKind, range: TimeRange) -> Vec<BiometricSample> {
        let mut samples: Vec<BiometricSample> = self
            .lock()
            .samples
            .iter()
            .filter(|s| s.kind == kind && range.contains(s.timestamp))
            .cloned()
            .collect();
        samples.sort_by_key(|s| s.timestamp);
        samples
    }
}

#[async_trait]
impl BiometricStore for MemoryBiometricStore {
    fn authorization_status(&self) -> AuthorizationStatus {
        self.lock().authorization
    }

    async fn request_authorization(&self) -> Result<AuthorizationStatus, BiometricError> {
        let mut inner = self.lock();
        if inner.authorization == AuthorizationStatus::NotDetermined {
            inner.authorization = if inner.grant_on_request {
                AuthorizationStatus::Authorized
            } else {
                AuthorizationStatus::Denied
            };
        }
        Ok(inner.authorization)
    }

    async fn statistics(
        &self,
        kind: BiometricKind,
        range: TimeRange,
    ) -> Result<Statistics, BiometricError> {
        self.gate(kind).await?;
        let values: Vec<f64> = self
            .samples_in(kind, range)
            .iter()
            .map(|s| s.value)
            .collect();
        if values.is_empty() {
            return Ok(Statistics::default());
        }
        let sum: f64 = values.iter().sum();
        let maximum = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Ok(Statistics {
            average: Some(sum / values.len() as f64),
            maximum: Some(maximum),
            sum: Some(sum),
        })
    }

    async fn series(
        &self,
        kind: BiometricKind,
        range: TimeRange,
    ) -> Result<Vec<SeriesPoint>, BiometricError> {
        self.gate(kind).await?;
        Ok(self
            .samples_in(kind, range)
            .iter()
            .map(|s| SeriesPoint {
                offset_seconds: (s.timestamp - range.start).num_milliseconds() as f64 / 1000.0,
                value: s.value,
            })
            .collect())
    }

    async fn samples(
        &self,
        kind: BiometricKind,
        range: TimeRange,
    ) -> Result<Vec<BiometricSample>, BiometricError> {
        self.gate(kind).await?;
        Ok(self.samples_in(kind, range))
    }

    async fn route(&self, range: TimeRange) -> Result<RouteStream, BiometricError> {
        self.gate(BiometricKind::Location).await?;
        let mut fixes: Vec<LocationSample> = self
            .lock()
            .route
            .iter()
            .filter(|fix| range.contains(fix.timestamp))
            .cloned()
            .collect();
        fixes.sort_by_key(|fix| fix.timestamp);

        let batches: Vec<Vec<LocationSample>> =
            fixes.chunks(ROUTE_BATCH).map(|chunk| chunk.to_vec()).collect();
        Ok(stream::iter(batches).boxed())
    }

    async fn observe(&self, kind: BiometricKind) -> Result<ObservationStream, BiometricError> {
        let rx = {
            let mut inner = self.lock();
            if inner.authorization != AuthorizationStatus::Authorized {
                return Err(BiometricError::AuthorizationDenied);
            }
            if let Some(message) = &inner.observe_error {
                return Err(BiometricError::Unavailable(message.clone()));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            inner.subscribers.entry(kind).or_default().push(tx);
            rx
        };

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|observation| (observation, rx))
        })
        .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn range() -> TimeRange {
        let start = Utc.with_ymd_and_hms(2024, 4, 10, 18, 0, 0).unwrap();
        TimeRange::new(start, start + Duration::minutes(30))
    }

    #[tokio::test]
    async fn test_statistics_scoped_to_range() {
        let store = MemoryBiometricStore::new();
        let r = range();
        store.record_all([
            BiometricSample::new(BiometricKind::HeartRate, r.start, 120.0),
            BiometricSample::new(BiometricKind::HeartRate, r.start + Duration::minutes(10), 160.0),
            // end is exclusive
            BiometricSample::new(BiometricKind::HeartRate, r.end, 200.0),
        ]);

        let stats = store.statistics(BiometricKind::HeartRate, r).await.unwrap();
        assert_eq!(stats.average, Some(140.0));
        assert_eq!(stats.maximum, Some(160.0));
        assert_eq!(stats.sum, Some(280.0));
    }

    #[tokio::test]
    async fn test_series_offsets_from_start() {
        let store = MemoryBiometricStore::new();
        let r = range();
        store.record(BiometricSample::new(BiometricKind::HeartRate, r.start + Duration::seconds(90), 131.0));

        let series = store.series(BiometricKind::HeartRate, r).await.unwrap();
        assert_eq!(series, vec![SeriesPoint { offset_seconds: 90.0, value: 131.0 }]);
    }

    #[tokio::test]
    async fn test_denied_store_rejects_queries() {
        let store = MemoryBiometricStore::denied();
        assert_eq!(
            store.statistics(BiometricKind::Energy, range()).await,
            Err(BiometricError::AuthorizationDenied)
        );
        assert_eq!(
            store.request_authorization().await,
            Ok(AuthorizationStatus::Denied)
        );
    }

    #[tokio::test]
    async fn test_live_push_reaches_subscriber() {
        let store = MemoryBiometricStore::new();
        let mut stream = store.observe(BiometricKind::HeartRate).await.unwrap();
        assert_eq!(store.subscriber_count(BiometricKind::HeartRate), 1);

        let sample = BiometricSample::new(BiometricKind::HeartRate, range().start, 99.0);
        store.push_live(sample.clone());
        assert_eq!(stream.next().await, Some(Observation::Sample(sample)));

        store.end_live();
        assert_eq!(stream.next().await, None);
    }
}
