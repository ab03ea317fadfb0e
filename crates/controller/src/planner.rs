//! Decision → plan translation.

use anyhow::{Context, Result};
use irrigation_common::bus::{BusConnection, BusEvent};
use irrigation_common::messages::{Decision, DecisionAction, Plan, PlanAction};
use irrigation_common::topics::Stage;
use rumqttc::{AsyncClient, QoS};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::state::SharedState;

/// Map a decision onto a plan.  `none` decisions produce nothing.
pub fn plan(decision: &Decision, water_need_liters: f64) -> Option<Plan> {
    match decision.action {
        DecisionAction::TriggerIrrigation => Some(Plan {
            action: PlanAction::StartIrrigation,
            reason: decision.reason.clone(),
            value: Some(water_need_liters),
        }),
        DecisionAction::StopIrrigation => Some(Plan {
            action: PlanAction::StopIrrigation,
            reason: decision.reason.clone(),
            value: None,
        }),
        DecisionAction::None => None,
    }
}

pub fn subscriptions() -> Vec<String> {
    vec![Stage::Analyzer.filter()]
}

pub struct Planner {
    client: AsyncClient,
    state: SharedState,
    water_need_liters: f64,
}

impl Planner {
    pub fn new(client: AsyncClient, state: SharedState, water_need_liters: f64) -> Self {
        Self {
            client,
            state,
            water_need_liters,
        }
    }

    pub async fn handle(&self, topic: &str, payload: &[u8]) -> Result<Option<Plan>> {
        let (zone_id, field_id) = Stage::Analyzer.parse(topic)?;
        let decision: Decision =
            serde_json::from_slice(payload).context("invalid decision payload")?;

        let Some(plan) = plan(&decision, self.water_need_liters) else {
            debug!(zone = %zone_id, field = %field_id, "no action decided");
            return Ok(None);
        };

        let out = Stage::Planner.topic(&zone_id, &field_id);
        self.client
            .publish(out.as_str(), QoS::AtLeastOnce, false, serde_json::to_vec(&plan)?)
            .await
            .with_context(|| format!("publish {out}"))?;
        info!(zone = %zone_id, field = %field_id, action = ?plan.action, water_need = ?plan.value, "plan published");
        self.state.write().await.record_plan(&zone_id, &field_id, &plan);
        Ok(Some(plan))
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
                            warn!(topic = %topic, "dropping decision: {e:#}");
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
