use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

/// Payload on `zone/{z}/field/{f}/sensor/{s}/{type}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub value: f64,
}

// ---------------------------------------------------------------------------
// Analyzer → planner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    TriggerIrrigation,
    StopIrrigation,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub action: DecisionAction,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Planner → executor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    StartIrrigation,
    StopIrrigation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub action: PlanAction,
    pub reason: String,
    /// Water need in liters; only present on start plans.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

// ---------------------------------------------------------------------------
// Executor → actuators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    #[serde(alias = "start_irrigation")]
    Start,
    #[serde(alias = "stop_irrigation")]
    Stop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub command: CommandKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Actuator consumption feedback
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActuatorStatus {
    On,
    Off,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consumption {
    /// Volume delivered per second of simulated time.
    pub value: f64,
    pub measurement: String,
    pub status: ActuatorStatus,
}

// ===========================================================================
// Tests
// ===========================================================================
