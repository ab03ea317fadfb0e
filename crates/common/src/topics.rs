//! Topic grammar shared by every service.
//!
//! ```text
//! zone/{z}/field/{f}/sensor/{s}/{type}                 telemetry
//! zone/{z}/field/{f}/actuator/{a}/{type}/consumption   consumption feedback
//! analyzer/zone/{z}/field/{f}                          decisions
//! planner/zone/{z}/field/{f}                           plans
//! executor/zone/{z}/field/{f}                          commands
//! ```
//!
//! Parsing is strict: any deviation in segment count, a literal segment or
//! an empty identifier is a [`TopicError`].

use crate::topology::{ActuatorKind, SensorKind, UnknownKind};
use thiserror::Error;

pub const TELEMETRY_FILTER: &str = "zone/+/field/+/sensor/+/+";
pub const CONSUMPTION_FILTER: &str = "zone/+/field/+/actuator/+/+/consumption";

const TELEMETRY_SHAPE: &str = "zone/{}/field/{}/sensor/{}/{}";
const CONSUMPTION_SHAPE: &str = "zone/{}/field/{}/actuator/{}/{}/consumption";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("topic '{topic}' does not match '{expected}'")]
    Shape { topic: String, expected: String },
    #[error("topic '{topic}' has an empty identifier")]
    EmptySegment { topic: String },
    #[error("topic '{topic}': {source}")]
    Kind {
        topic: String,
        #[source]
        source: UnknownKind,
    },
}

/// Match `topic` against a `/`-separated shape where `{}` captures a
/// non-empty segment and anything else must match literally.
fn capture<'a>(topic: &'a str, shape: &str) -> Result<Vec<&'a str>, TopicError> {
    let parts: Vec<&str> = topic.split('/').collect();
    let pattern: Vec<&str> = shape.split('/').collect();
    let mismatch = || TopicError::Shape {
        topic: topic.to_string(),
        expected: shape.to_string(),
    };

    if parts.len() != pattern.len() {
        return Err(mismatch());
    }

    let mut captured = Vec::new();
    for (part, pat) in parts.iter().zip(&pattern) {
        if *pat == "{}" {
            if part.is_empty() {
                return Err(TopicError::EmptySegment {
                    topic: topic.to_string(),
                });
            }
            captured.push(*part);
        } else if part != pat {
            return Err(mismatch());
        }
    }
    Ok(captured)
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryTopic {
    pub zone_id: String,
    pub field_id: String,
    pub sensor_id: String,
    pub kind: SensorKind,
}

impl TelemetryTopic {
    pub fn parse(topic: &str) -> Result<Self, TopicError> {
        let seg = capture(topic, TELEMETRY_SHAPE)?;
        let kind = seg[3].parse().map_err(|source| TopicError::Kind {
            topic: topic.to_string(),
            source,
        })?;
        Ok(Self {
            zone_id: seg[0].to_string(),
            field_id: seg[1].to_string(),
            sensor_id: seg[2].to_string(),
            kind,
        })
    }

    pub fn format(zone_id: &str, field_id: &str, sensor_id: &str, kind: SensorKind) -> String {
        format!("zone/{zone_id}/field/{field_id}/sensor/{sensor_id}/{kind}")
    }
}

// ---------------------------------------------------------------------------
// Consumption
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumptionTopic {
    pub zone_id: String,
    pub field_id: String,
    pub actuator_id: String,
    pub kind: ActuatorKind,
}

impl ConsumptionTopic {
    pub fn parse(topic: &str) -> Result<Self, TopicError> {
        let seg = capture(topic, CONSUMPTION_SHAPE)?;
        let kind = seg[3].parse().map_err(|source| TopicError::Kind {
            topic: topic.to_string(),
            source,
        })?;
        Ok(Self {
            zone_id: seg[0].to_string(),
            field_id: seg[1].to_string(),
            actuator_id: seg[2].to_string(),
            kind,
        })
    }

    pub fn format(zone_id: &str, field_id: &str, actuator_id: &str, kind: ActuatorKind) -> String {
        format!("zone/{zone_id}/field/{field_id}/actuator/{actuator_id}/{kind}/consumption")
    }
}

// ---------------------------------------------------------------------------
// Stage topics (analyzer / planner / executor)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Analyzer,
    Planner,
    Executor,
}

impl Stage {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Analyzer => "analyzer",
            Self::Planner => "planner",
            Self::Executor => "executor",
        }
    }

    pub fn topic(&self, zone_id: &str, field_id: &str) -> String {
        format!("{}/zone/{zone_id}/field/{field_id}", self.prefix())
    }

    pub fn filter(&self) -> String {
        format!("{}/zone/+/field/+", self.prefix())
    }

    /// Parse `{prefix}/zone/{z}/field/{f}` into `(zone_id, field_id)`.
    pub fn parse(&self, topic: &str) -> Result<(String, String), TopicError> {
        let shape = format!("{}/zone/{{}}/field/{{}}", self.prefix());
        let seg = capture(topic, &shape)?;
        Ok((seg[0].to_string(), seg[1].to_string()))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
