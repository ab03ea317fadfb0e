//! Plan validation and command dispatch to a field's actuators.

use anyhow::{Context, Result};
use irrigation_common::bus::{BusConnection, BusEvent};
use irrigation_common::messages::{Command, CommandKind, PlanAction};
use irrigation_common::topics::Stage;
use rumqttc::{AsyncClient, QoS};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::state::SharedState;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("plan is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("plan is missing '{0}'")]
    Missing(&'static str),
    #[error("plan value {0} is not a valid water need")]
    InvalidValue(f64),
}

/// Loose shape so missing fields surface as `PlanError::Missing` rather
/// than a generic decode error.
#[derive(Deserialize)]
struct RawPlan {
    action: Option<PlanAction>,
    reason: Option<String>,
    value: Option<f64>,
}

/// Validate a plan payload and turn it into the actuator command.
pub fn command_for(payload: &[u8]) -> Result<Command, PlanError> {
    let raw: RawPlan = serde_json::from_slice(payload)?;
    let action = raw.action.ok_or(PlanError::Missing("action"))?;
    let reason = raw
        .reason
        .filter(|r| !r.trim().is_empty())
        .ok_or(PlanError::Missing("reason"))?;
    if let Some(v) = raw.value {
        if !v.is_finite() || v < 0.0 {
            return Err(PlanError::InvalidValue(v));
        }
    }

    let command = match action {
        PlanAction::StartIrrigation => CommandKind::Start,
        PlanAction::StopIrrigation => CommandKind::Stop,
    };
    Ok(Command {
        command,
        value: raw.value,
        reason: Some(reason),
    })
}

pub fn subscriptions() -> Vec<String> {
    vec![Stage::Planner.filter()]
}

pub struct Executor {
    client: AsyncClient,
    state: SharedState,
}

impl Executor {
    pub fn new(client: AsyncClient, state: SharedState) -> Self {
        Self { client, state }
    }

    pub async fn handle(&self, topic: &str, payload: &[u8]) -> Result<Command> {
        let (zone_id, field_id) = Stage::Planner.parse(topic)?;
        let command = command_for(payload)?;

        let out = Stage::Executor.topic(&zone_id, &field_id);
        self.client
            .publish(out.as_str(), QoS::AtLeastOnce, false, serde_json::to_vec(&command)?)
            .await
            .with_context(|| format!("publish {out}"))?;
        info!(zone = %zone_id, field = %field_id, command = ?command.command, value = ?command.value, "command sent");
        self.state
            .write()
            .await
            .record_command(&zone_id, &field_id, &command);
        Ok(command)
    }

    pub async fn run(self, mut bus: BusConnection, mut shutdown: watch::Receiver<bool>) {
        let name = bus.name().to_string();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = bus.events.recv() => match event {
                    None => break,
                    Some(BusEvent::Connected) => self.state.write().await.set_connected(&name, true),
                    Some(BusEvent::Disconnected) => self.state.write().await.set_connected(&name, false),
                    Some(BusEvent::Message { topic, payload }) => {
                        if let Err(e) = self.handle(&topic, &payload).await {
                            warn!(topic = %topic, "dropping plan: {e:#}");
                            self.state.write().await.record_error(format!("{topic}: {e:#}"));
                        }
                    }
                },
            }
        }
        bus.shutdown().await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
