use irrigation_common::messages::{
    ActuatorStatus, Command, CommandKind, Consumption, Decision, DecisionAction, Plan,
};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

pub fn shared() -> SharedState {
    Arc::new(RwLock::new(SystemState::new()))
}

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    /// Bus connectivity per service name.
    pub services: BTreeMap<String, bool>,
    /// Keyed by "zone/field".
    pub fields: BTreeMap<String, FieldStatus>,
    /// Keyed by "zone/field/actuator".
    pub actuators: BTreeMap<String, ActuatorState>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FieldStatus {
    pub zone_id: String,
    pub field_id: String,
    pub moisture_avg: Option<f64>,
    pub threshold: f64,
    pub rain_predicted: bool,
    pub decision: Option<DecisionAction>,
    #[serde(with = "time::serde::rfc3339")]
    pub evaluated_at: OffsetDateTime,
}

#[derive(Clone, Debug, Serialize)]
pub struct ActuatorState {
    pub status: ActuatorStatus,
    pub value: f64,
    pub measurement: String,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

#[derive(Clone, Debug, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Decision,
    Plan,
    Command,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub services: BTreeMap<String, bool>,
    pub fields: Vec<FieldStatus>,
    pub actuators: BTreeMap<String, ActuatorState>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            services: BTreeMap::new(),
            fields: BTreeMap::new(),
            actuators: BTreeMap::new(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Record a bus connect/disconnect for a service; only transitions are logged as events.
    pub fn set_connected(&mut self, service: &str, connected: bool) {
        let previous = self.services.insert(service.to_string(), connected);
        if previous != Some(connected) {
            let word = if connected { "connected" } else { "disconnected" };
            self.push_event(EventKind::System, format!("{service} {word}"));
        }
    }

    /// Record the outcome of one field evaluation.
    pub fn record_evaluation(&mut self, status: FieldStatus, decision: Option<&Decision>) {
        let key = format!("{}/{}", status.zone_id, status.field_id);
        if let Some(d) = decision {
            self.push_event(
                EventKind::Decision,
                format!(
                    "{key}: {:?} avg={:.1} smt={:.1} rain={} ({})",
                    d.action,
                    status.moisture_avg.unwrap_or(f64::NAN),
                    status.threshold,
                    status.rain_predicted,
                    d.reason
                ),
            );
        }
        self.fields.insert(key, status);
    }

    pub fn record_plan(&mut self, zone_id: &str, field_id: &str, plan: &Plan) {
        let detail = match plan.value {
            Some(v) => format!("{zone_id}/{field_id}: {:?} {v} L", plan.action),
            None => format!("{zone_id}/{field_id}: {:?}", plan.action),
        };
        self.push_event(EventKind::Plan, detail);
    }

    pub fn record_command(&mut self, zone_id: &str, field_id: &str, command: &Command) {
        let word = match command.command {
            CommandKind::Start => "start",
            CommandKind::Stop => "stop",
        };
        self.push_event(EventKind::Command, format!("{zone_id}/{field_id}: {word}"));
    }

    /// Track an actuator's last consumption report; status flips become events.
    pub fn record_consumption(
        &mut self,
        zone_id: &str,
        field_id: &str,
        actuator_id: &str,
        consumption: &Consumption,
    ) {
        let key = format!("{zone_id}/{field_id}/{actuator_id}");
        let flipped = self
            .actuators
            .get(&key)
            .map_or(true, |a| a.status != consumption.status);
        self.actuators.insert(
            key.clone(),
            ActuatorState {
                status: consumption.status,
                value: consumption.value,
                measurement: consumption.measurement.clone(),
                last_seen: OffsetDateTime::now_utc(),
            },
        );
        if flipped {
            let word = match consumption.status {
                ActuatorStatus::On => "on",
                ActuatorStatus::Off => "off",
            };
            self.push_event(EventKind::System, format!("{key} reports {word}"));
        }
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            services: self.services.clone(),
            fields: self.fields.values().cloned().collect(),
            actuators: self.actuators.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
