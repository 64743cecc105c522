//! Core types for Synheart Stride
//!
//! This module defines the data structures shared by the link protocol, the
//! biometric aggregation pipeline and the session controller: activity
//! descriptors, biometric samples, the live snapshot and the completed record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Kind of workout being tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Running,
    Walking,
    Cycling,
    Hiking,
    Rowing,
    Other,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Running => "running",
            ActivityKind::Walking => "walking",
            ActivityKind::Cycling => "cycling",
            ActivityKind::Hiking => "hiking",
            ActivityKind::Rowing => "rowing",
            ActivityKind::Other => "other",
        }
    }

    /// Human-readable name shown on the companion display
    pub fn display_name(&self) -> &'static str {
        match self {
            ActivityKind::Running => "Run",
            ActivityKind::Walking => "Walk",
            ActivityKind::Cycling => "Ride",
            ActivityKind::Hiking => "Hike",
            ActivityKind::Rowing => "Row",
            ActivityKind::Other => "Workout",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(ActivityKind::Running),
            "walking" => Some(ActivityKind::Walking),
            "cycling" => Some(ActivityKind::Cycling),
            "hiking" => Some(ActivityKind::Hiking),
            "rowing" => Some(ActivityKind::Rowing),
            "other" => Some(ActivityKind::Other),
            _ => None,
        }
    }
}

/// Where the workout takes place; outdoor sessions also collect a route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationType {
    Indoor,
    Outdoor,
}

impl LocationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationType::Indoor => "indoor",
            LocationType::Outdoor => "outdoor",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "indoor" => Some(LocationType::Indoor),
            "outdoor" => Some(LocationType::Outdoor),
            _ => None,
        }
    }
}

/// Biometric data kinds consumed from the platform store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiometricKind {
    /// Beats per minute
    HeartRate,
    /// Meters
    Distance,
    /// Active energy, kilocalories
    Energy,
    /// Steps per minute
    Cadence,
    /// GPS fixes
    Location,
}

impl BiometricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BiometricKind::HeartRate => "heart_rate",
            BiometricKind::Distance => "distance",
            BiometricKind::Energy => "energy",
            BiometricKind::Cadence => "cadence",
            BiometricKind::Location => "location",
        }
    }

    /// Kinds observed during a live session of the given location type
    pub fn live_kinds(location: LocationType) -> Vec<BiometricKind> {
        let mut kinds = vec![
            BiometricKind::HeartRate,
            BiometricKind::Energy,
            BiometricKind::Distance,
            BiometricKind::Cadence,
        ];
        if location == LocationType::Outdoor {
            kinds.push(BiometricKind::Location);
        }
        kinds
    }
}

/// Point-in-time reading from the biometric store. Never mutated once sourced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiometricSample {
    pub kind: BiometricKind,
    /// End timestamp of the sample interval (UTC)
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl BiometricSample {
    pub fn new(kind: BiometricKind, timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            kind,
            timestamp,
            value,
        }
    }
}

/// GPS fix as delivered by the route query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    /// Negative values mark an invalid altitude reading
    pub vertical_accuracy: f64,
    /// Meters above sea level
    pub altitude: f64,
}

impl LocationSample {
    pub fn has_valid_altitude(&self) -> bool {
        self.vertical_accuracy >= 0.0 && self.altitude.is_finite()
    }
}

/// Latitude/longitude pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// Half-open time window `[start, end)` scoping a finalize query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }

    /// Window length in seconds, never negative
    pub fn duration_seconds(&self) -> f64 {
        let millis = (self.end - self.start).num_milliseconds().max(0);
        millis as f64 / 1000.0
    }
}

/// Statistics query result for one biometric kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub average: Option<f64>,
    pub maximum: Option<f64>,
    pub sum: Option<f64>,
}

/// Series query element: value at an offset from the session start
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub offset_seconds: f64,
    pub value: f64,
}

/// Latest-known-per-field live metrics during an active session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Beats per minute
    pub heart_rate: f64,
    /// Kilocalories since session start
    pub active_energy: f64,
    /// Meters since session start
    pub distance_meters: f64,
    /// Steps per minute
    pub cadence_spm: f64,
    pub elapsed_seconds: f64,
    /// Most recent GPS fix (outdoor sessions only)
    pub last_fix: Option<GeoPoint>,
}

/// One kilometre split
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Split {
    /// 1-based split number
    pub index: u32,
    pub distance_meters: f64,
    pub duration_seconds: f64,
    /// Timestamp of the boundary crossing that closed this split
    pub ended_at: DateTime<Utc>,
}

/// Route point kept in the completed record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutePoint {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    /// Absent when the fix had no valid vertical accuracy
    pub altitude: Option<f64>,
}

/// Record fields enriched from the biometric store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentField {
    HeartRateStats,
    HeartRateSeries,
    Cadence,
    Route,
    Splits,
    Energy,
}

impl EnrichmentField {
    pub const ALL: [EnrichmentField; 6] = [
        EnrichmentField::HeartRateStats,
        EnrichmentField::HeartRateSeries,
        EnrichmentField::Cadence,
        EnrichmentField::Route,
        EnrichmentField::Splits,
        EnrichmentField::Energy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentField::HeartRateStats => "heart_rate_stats",
            EnrichmentField::HeartRateSeries => "heart_rate_series",
            EnrichmentField::Cadence => "cadence",
            EnrichmentField::Route => "route",
            EnrichmentField::Splits => "splits",
            EnrichmentField::Energy => "energy",
        }
    }
}

/// Immutable result of finalization, built exactly once per session.
///
/// Enrichment fields that could not be queried are zero/empty and listed in
/// `unavailable`, so "genuinely zero" and "not available" stay distinguishable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedSessionRecord {
    pub id: Uuid,
    pub activity: ActivityKind,
    pub location: LocationType,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_seconds: f64,
    pub energy_kcal: f64,
    pub heart_rate_avg: f64,
    pub heart_rate_max: f64,
    pub heart_rate_series: Vec<SeriesPoint>,
    pub distance_meters: f64,
    pub route: Vec<RoutePoint>,
    pub splits: Vec<Split>,
    pub elevation_gain_m: f64,
    pub elevation_loss_m: f64,
    pub cadence_avg_spm: f64,
    pub unavailable: BTreeSet<EnrichmentField>,
}

impl CompletedSessionRecord {
    /// Record carrying only identity and duration
    pub fn bare(
        id: Uuid,
        activity: ActivityKind,
        location: LocationType,
        range: TimeRange,
    ) -> Self {
        Self {
            id,
            activity,
            location,
            start: range.start,
            end: range.end,
            duration_seconds: range.duration_seconds(),
            energy_kcal: 0.0,
            heart_rate_avg: 0.0,
            heart_rate_max: 0.0,
            heart_rate_series: Vec::new(),
            distance_meters: 0.0,
            route: Vec::new(),
            splits: Vec::new(),
            elevation_gain_m: 0.0,
            elevation_loss_m: 0.0,
            cadence_avg_spm: 0.0,
            unavailable: BTreeSet::new(),
        }
    }

    pub fn is_fully_enriched(&self) -> bool {
        self.unavailable.is_empty()
    }
}

/// Session controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Active,
    Paused,
    Finalizing,
    Completed,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Active => "active",
            SessionState::Paused => "paused",
            SessionState::Finalizing => "finalizing",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
        }
    }

    /// A session is in progress (live collection or awaiting finalize)
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            SessionState::Active | SessionState::Paused | SessionState::Finalizing
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_time_range_is_half_open() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 7, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 3, 1, 7, 30, 0).unwrap();
        let range = TimeRange::new(start, end);

        assert!(range.contains(start));
        assert!(!range.contains(end));
        assert_eq!(range.duration_seconds(), 1800.0);
    }

    #[test]
    fn test_inverted_range_has_zero_duration() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 7, 30, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 3, 1, 7, 0, 0).unwrap();
        assert_eq!(TimeRange::new(start, end).duration_seconds(), 0.0);
    }

    #[test]
    fn test_live_kinds_include_location_outdoors_only() {
        assert!(!BiometricKind::live_kinds(LocationType::Indoor).contains(&BiometricKind::Location));
        assert!(BiometricKind::live_kinds(LocationType::Outdoor).contains(&BiometricKind::Location));
    }

    #[test]
    fn test_activity_kind_round_trips_through_str() {
        for kind in [ActivityKind::Running, ActivityKind::Cycling, ActivityKind::Other] {
            assert_eq!(ActivityKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ActivityKind::parse("skydiving"), None);
    }
}
