//! Biometric query adapter
//!
//! Wraps the platform biometric store behind [`BiometricStore`]: point,
//! statistics and series queries, the route query, and live observation
//! subscriptions. The store handle is constructed by the composition root and
//! injected wherever it is needed.

mod memory;

pub use memory::MemoryBiometricStore;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::BiometricError;
use crate::types::{
    BiometricKind, BiometricSample, LocationSample, SeriesPoint, Statistics, TimeRange,
};

/// Access grant for the biometric store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationStatus {
    NotDetermined,
    Denied,
    Authorized,
}

/// Live observation delivered by a subscription
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    Sample(BiometricSample),
    Fix(LocationSample),
}

/// Live observation stream; ends when the subscription is torn down
pub type ObservationStream = BoxStream<'static, Observation>;

/// Route query stream: ordered batches, stream end is the "done" signal
pub type RouteStream = BoxStream<'static, Vec<LocationSample>>;

/// Platform biometric data service
#[async_trait]
pub trait BiometricStore: Send + Sync + 'static {
    fn authorization_status(&self) -> AuthorizationStatus;

    async fn request_authorization(&self) -> Result<AuthorizationStatus, BiometricError>;

    /// Average/maximum/sum over `[start, end)`
    async fn statistics(
        &self,
        kind: BiometricKind,
        range: TimeRange,
    ) -> Result<Statistics, BiometricError>;

    /// Time-ordered `(offset from range start, value)` pairs
    async fn series(
        &self,
        kind: BiometricKind,
        range: TimeRange,
    ) -> Result<Vec<SeriesPoint>, BiometricError>;

    /// Raw samples in time order
    async fn samples(
        &self,
        kind: BiometricKind,
        range: TimeRange,
    ) -> Result<Vec<BiometricSample>, BiometricError>;

    /// Ordered GPS fixes for the window
    async fn route(&self, range: TimeRange) -> Result<RouteStream, BiometricError>;

    /// Subscribe to live observations of one kind
    async fn observe(&self, kind: BiometricKind) -> Result<ObservationStream, BiometricError>;
}
