//! Session aggregator
//!
//! Two modes over the same biometric store:
//! - live: merge per-kind observation streams into a [`SessionSnapshot`]
//! - finalize: fan out the enrichment queries for a finished session and join
//!   them into one [`CompletedSessionRecord`]
//!
//! [`SessionSnapshot`]: crate::types::SessionSnapshot

pub mod elevation;
pub mod finalize;
pub mod join;
pub mod live;
pub mod splits;

pub use elevation::{ElevationAccumulator, RouteSummary};
pub use finalize::{FinalizeRequest, PartValue};
pub use join::{CountedJoin, PartOutcome, PartReporter};
pub use live::LiveHandle;
pub use splits::{compute_splits, SplitSummary};

use std::sync::Arc;

use crate::biometrics::BiometricStore;
use crate::config::AggregationConfig;
use crate::error::BiometricError;
use crate::types::{ActivityKind, CompletedSessionRecord, LocationType};

/// Aggregation front end bound to one biometric store
#[derive(Clone)]
pub struct SessionAggregator {
    store: Arc<dyn BiometricStore>,
    config: AggregationConfig,
}

impl SessionAggregator {
    pub fn new(store: Arc<dyn BiometricStore>, config: AggregationConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn BiometricStore> {
        &self.store
    }

    /// Subscribe to live observations for the session's kinds
    pub async fn begin_live(
        &self,
        activity: ActivityKind,
        location: LocationType,
    ) -> Result<LiveHandle, BiometricError> {
        live::begin_live(self.store.clone(), activity, location).await
    }

    /// Build the completed record for a finished session.
    ///
    /// Never fails: parts that cannot be queried are left zero/empty and listed
    /// in `unavailable`. The part queries run as detached tasks, so dropping
    /// this future does not cancel queries already in flight.
    pub async fn finalize(&self, request: FinalizeRequest) -> CompletedSessionRecord {
        finalize::finalize(
            self.store.clone(),
            request,
            self.config.query_timeout(),
            self.config.split_distance_m,
        )
        .await
    }
}
