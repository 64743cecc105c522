//! Typed message kinds exchanged between the handheld and the companion
//!
//! Requests: `schedule`, `activities`, `startActivity`.
//! Events: `metrics`, `ended`, `command`.
//!
//! Lists are flattened with indexed keys: `<prefix>.count` followed by
//! `<prefix>.<i>.<field>`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LinkError;
use crate::link::message::Params;
use crate::types::{ActivityKind, CompletedSessionRecord, LocationType, SessionSnapshot};

pub const KIND_SCHEDULE: &str = "schedule";
pub const KIND_ACTIVITIES: &str = "activities";
pub const KIND_START_ACTIVITY: &str = "startActivity";
pub const KIND_METRICS: &str = "metrics";
pub const KIND_ENDED: &str = "ended";
pub const KIND_COMMAND: &str = "command";

/// Conversion to and from a flat parameter map
pub trait FlatPayload: Sized {
    fn to_params(&self) -> Params;
    fn from_params(params: &Params) -> Result<Self, LinkError>;
}

fn malformed(message: impl Into<String>) -> LinkError {
    LinkError::Serialization(message.into())
}

fn parse_activity(raw: &str) -> Result<ActivityKind, LinkError> {
    ActivityKind::parse(raw).ok_or_else(|| malformed(format!("unknown activity '{}'", raw)))
}

fn parse_location(raw: &str) -> Result<LocationType, LinkError> {
    LocationType::parse(raw).ok_or_else(|| malformed(format!("unknown location '{}'", raw)))
}

fn parse_uuid(raw: &str) -> Result<Uuid, LinkError> {
    Uuid::parse_str(raw).map_err(|e| malformed(format!("invalid uuid '{}': {}", raw, e)))
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, LinkError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| malformed(format!("invalid timestamp '{}': {}", raw, e)))
}

fn write_list<T>(params: &mut Params, prefix: &str, items: &[T], write: impl Fn(&mut Params, &str, &T)) {
    params.insert(format!("{}.count", prefix), items.len() as f64);
    for (i, item) in items.iter().enumerate() {
        write(params, &format!("{}.{}", prefix, i), item);
    }
}

fn read_list<T>(
    params: &Params,
    prefix: &str,
    read: impl Fn(&Params, &str) -> Result<T, LinkError>,
) -> Result<Vec<T>, LinkError> {
    let count = params.get_f64(&format!("{}.count", prefix)).unwrap_or(0.0);
    if count < 0.0 || count.fract() != 0.0 {
        return Err(malformed(format!("invalid {}.count", prefix)));
    }
    (0..count as usize)
        .map(|i| read(params, &format!("{}.{}", prefix, i)))
        .collect()
}

/// Planned workout for a day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    /// Day label, e.g. "mon"
    pub day: String,
    pub activity: ActivityKind,
    pub name: String,
}

/// Reply to `schedule`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleReply {
    pub entries: Vec<ScheduleEntry>,
}

impl FlatPayload for ScheduleReply {
    fn to_params(&self) -> Params {
        let mut params = Params::new();
        write_list(&mut params, "entries", &self.entries, |params, p, entry| {
            params.insert(format!("{}.day", p), entry.day.as_str());
            params.insert(format!("{}.activity", p), entry.activity.as_str());
            params.insert(format!("{}.name", p), entry.name.as_str());
        });
        params
    }

    fn from_params(params: &Params) -> Result<Self, LinkError> {
        let entries = read_list(params, "entries", |params, p| {
            Ok(ScheduleEntry {
                day: params.require_str(&format!("{}.day", p))?.to_string(),
                activity: parse_activity(params.require_str(&format!("{}.activity", p))?)?,
                name: params.require_str(&format!("{}.name", p))?.to_string(),
            })
        })?;
        Ok(Self { entries })
    }
}

/// Session currently running on the replying device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveSessionInfo {
    pub activity: ActivityKind,
    pub location: LocationType,
    pub name: String,
}

/// Summary of a completed workout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkoutSummary {
    pub id: Uuid,
    pub activity: ActivityKind,
    pub ended_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub energy_kcal: f64,
    pub distance_meters: f64,
}

impl From<&CompletedSessionRecord> for WorkoutSummary {
    fn from(record: &CompletedSessionRecord) -> Self {
        Self {
            id: record.id,
            activity: record.activity,
            ended_at: record.end,
            duration_seconds: record.duration_seconds,
            energy_kcal: record.energy_kcal,
            distance_meters: record.distance_meters,
        }
    }
}

/// Reply to `activities`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivitiesReply {
    pub active: Option<ActiveSessionInfo>,
    pub workouts: Vec<WorkoutSummary>,
}

impl FlatPayload for ActivitiesReply {
    fn to_params(&self) -> Params {
        let mut params = Params::new();
        if let Some(active) = &self.active {
            params.insert("activeActivity", active.activity.as_str());
            params.insert("activeLocation", active.location.as_str());
            params.insert("activeName", active.name.as_str());
        }
        write_list(&mut params, "workouts", &self.workouts, |params, p, w| {
            params.insert(format!("{}.uuid", p), w.id.to_string());
            params.insert(format!("{}.activity", p), w.activity.as_str());
            params.insert(format!("{}.end", p), w.ended_at.to_rfc3339());
            params.insert(format!("{}.durationSeconds", p), w.duration_seconds);
            params.insert(format!("{}.energyKcal", p), w.energy_kcal);
            params.insert(format!("{}.distanceMeters", p), w.distance_meters);
        });
        params
    }

    fn from_params(params: &Params) -> Result<Self, LinkError> {
        let active = match params.get_str("activeActivity") {
            Some(raw) => {
                let activity = parse_activity(raw)?;
                Some(ActiveSessionInfo {
                    activity,
                    location: parse_location(params.require_str("activeLocation")?)?,
                    name: params
                        .get_str("activeName")
                        .unwrap_or(activity.display_name())
                        .to_string(),
                })
            }
            None => None,
        };
        let workouts = read_list(params, "workouts", |params, p| {
            Ok(WorkoutSummary {
                id: parse_uuid(params.require_str(&format!("{}.uuid", p))?)?,
                activity: parse_activity(params.require_str(&format!("{}.activity", p))?)?,
                ended_at: parse_time(params.require_str(&format!("{}.end", p))?)?,
                duration_seconds: params.require_f64(&format!("{}.durationSeconds", p))?,
                energy_kcal: params.get_f64(&format!("{}.energyKcal", p)).unwrap_or(0.0),
                distance_meters: params.get_f64(&format!("{}.distanceMeters", p)).unwrap_or(0.0),
            })
        })?;
        Ok(Self { active, workouts })
    }
}

/// `startActivity` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartActivity {
    pub activity: ActivityKind,
    pub location: LocationType,
    pub workout_id: Option<Uuid>,
}

impl FlatPayload for StartActivity {
    fn to_params(&self) -> Params {
        let mut params = Params::new()
            .with("activity", self.activity.as_str())
            .with("location", self.location.as_str());
        if let Some(id) = self.workout_id {
            params.insert("workoutId", id.to_string());
        }
        params
    }

    fn from_params(params: &Params) -> Result<Self, LinkError> {
        Ok(Self {
            activity: parse_activity(params.require_str("activity")?)?,
            location: parse_location(params.require_str("location")?)?,
            workout_id: params.get_str("workoutId").map(parse_uuid).transpose()?,
        })
    }
}

/// Acknowledgement for `startActivity`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartAck {
    pub accepted: bool,
    pub reason: Option<String>,
}

impl FlatPayload for StartAck {
    fn to_params(&self) -> Params {
        let mut params = Params::new().with("accepted", self.accepted);
        if let Some(reason) = &self.reason {
            params.insert("reason", reason.as_str());
        }
        params
    }

    fn from_params(params: &Params) -> Result<Self, LinkError> {
        Ok(Self {
            accepted: params
                .get_bool("accepted")
                .ok_or_else(|| malformed("missing accepted"))?,
            reason: params.get_str("reason").map(str::to_string),
        })
    }
}

/// `metrics` event: live snapshot broadcast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsEvent {
    pub activity: ActivityKind,
    pub heart_rate: f64,
    pub distance_meters: f64,
    pub active_energy_kcal: f64,
    pub cadence_spm: f64,
    pub elapsed_seconds: f64,
}

impl MetricsEvent {
    pub fn from_snapshot(activity: ActivityKind, snapshot: &SessionSnapshot) -> Self {
        Self {
            activity,
            heart_rate: snapshot.heart_rate,
            distance_meters: snapshot.distance_meters,
            active_energy_kcal: snapshot.active_energy,
            cadence_spm: snapshot.cadence_spm,
            elapsed_seconds: snapshot.elapsed_seconds,
        }
    }
}

impl FlatPayload for MetricsEvent {
    fn to_params(&self) -> Params {
        Params::new()
            .with("activity", self.activity.as_str())
            .with("heartRate", self.heart_rate)
            .with("distanceMeters", self.distance_meters)
            .with("activeEnergyKcal", self.active_energy_kcal)
            .with("cadenceSpm", self.cadence_spm)
            .with("elapsedSeconds", self.elapsed_seconds)
    }

    fn from_params(params: &Params) -> Result<Self, LinkError> {
        Ok(Self {
            activity: parse_activity(params.require_str("activity")?)?,
            heart_rate: params.get_f64("heartRate").unwrap_or(0.0),
            distance_meters: params.get_f64("distanceMeters").unwrap_or(0.0),
            active_energy_kcal: params.get_f64("activeEnergyKcal").unwrap_or(0.0),
            cadence_spm: params.get_f64("cadenceSpm").unwrap_or(0.0),
            elapsed_seconds: params.require_f64("elapsedSeconds")?,
        })
    }
}

/// `ended` event: the session finished, with the stored record id if any
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndedEvent {
    pub uuid: Option<Uuid>,
}

impl FlatPayload for EndedEvent {
    fn to_params(&self) -> Params {
        match self.uuid {
            Some(id) => Params::new().with("uuid", id.to_string()),
            None => Params::new(),
        }
    }

    fn from_params(params: &Params) -> Result<Self, LinkError> {
        Ok(Self {
            uuid: params.get_str("uuid").map(parse_uuid).transpose()?,
        })
    }
}

/// Remote session command action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandAction {
    Start,
    End,
}

/// `command` event: trigger a session remotely
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEvent {
    pub action: CommandAction,
    pub activity: Option<ActivityKind>,
    pub location: Option<LocationType>,
}

impl CommandEvent {
    pub fn start(activity: ActivityKind, location: LocationType) -> Self {
        Self {
            action: CommandAction::Start,
            activity: Some(activity),
            location: Some(location),
        }
    }

    pub fn end() -> Self {
        Self {
            action: CommandAction::End,
            activity: None,
            location: None,
        }
    }
}

impl FlatPayload for CommandEvent {
    fn to_params(&self) -> Params {
        let action = match self.action {
            CommandAction::Start => "start",
            CommandAction::End => "end",
        };
        let mut params = Params::new().with("action", action);
        if let Some(activity) = self.activity {
            params.insert("activity", activity.as_str());
        }
        if let Some(location) = self.location {
            params.insert("location", location.as_str());
        }
        params
    }

    fn from_params(params: &Params) -> Result<Self, LinkError> {
        let action = match params.require_str("action")? {
            "start" => CommandAction::Start,
            "end" => CommandAction::End,
            other => return Err(malformed(format!("unknown command '{}'", other))),
        };
        Ok(Self {
            action,
            activity: params.get_str("activity").map(parse_activity).transpose()?,
            location: params.get_str("location").map(parse_location).transpose()?,
        })
    }
}

/// Inbound request decoded by kind
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Schedule,
    Activities,
    StartActivity(StartActivity),
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Schedule => KIND_SCHEDULE,
            Request::Activities => KIND_ACTIVITIES,
            Request::StartActivity(_) => KIND_START_ACTIVITY,
        }
    }

    pub fn to_params(&self) -> Params {
        match self {
            Request::Schedule | Request::Activities => Params::new(),
            Request::StartActivity(start) => start.to_params(),
        }
    }

    pub fn parse(kind: &str, params: &Params) -> Result<Self, LinkError> {
        match kind {
            KIND_SCHEDULE => Ok(Request::Schedule),
            KIND_ACTIVITIES => Ok(Request::Activities),
            KIND_START_ACTIVITY => Ok(Request::StartActivity(StartActivity::from_params(params)?)),
            other => Err(malformed(format!("unknown request kind '{}'", other))),
        }
    }
}

/// Inbound event decoded by kind
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Metrics(MetricsEvent),
    Ended(EndedEvent),
    Command(CommandEvent),
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Metrics(_) => KIND_METRICS,
            Event::Ended(_) => KIND_ENDED,
            Event::Command(_) => KIND_COMMAND,
        }
    }

    pub fn to_params(&self) -> Params {
        match self {
            Event::Metrics(e) => e.to_params(),
            Event::Ended(e) => e.to_params(),
            Event::Command(e) => e.to_params(),
        }
    }

    pub fn parse(kind: &str, params: &Params) -> Result<Self, LinkError> {
        match kind {
            KIND_METRICS => Ok(Event::Metrics(MetricsEvent::from_params(params)?)),
            KIND_ENDED => Ok(Event::Ended(EndedEvent::from_params(params)?)),
            KIND_COMMAND => Ok(Event::Command(CommandEvent::from_params(params)?)),
            other => Err(malformed(format!("unknown event kind '{}'", other))),
        }
    }
}
