//! The simulated field station.
//!
//! Owns the sensor registry and every actuator.  On each tick it publishes
//! one reading per sensor; executor commands switch actuators on and off;
//! consumption reports (its own, echoed back by the broker) feed water into
//! the soil-moisture sensors.
//!
//! The topology is fetched again on every bus (re)connect, and on every
//! tick while it is still empty.  New fields get their actuators then.

use anyhow::{anyhow, bail, Context, Result};
use irrigation_common::backend::BackendClient;
use irrigation_common::bus::{BusConnection, BusEvent};
use irrigation_common::messages::{ActuatorStatus, Command, Consumption, SensorReading};
use irrigation_common::topics::{ConsumptionTopic, Stage, TelemetryTopic, CONSUMPTION_FILTER};
use irrigation_common::topology::Registry;
use rumqttc::{AsyncClient, QoS};
use std::collections::HashMap;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::actuator::Actuator;
use crate::config::SimSettings;
use crate::sim::{self, IrrigationTracker};

pub fn subscriptions() -> Vec<String> {
    vec![Stage::Executor.filter(), CONSUMPTION_FILTER.to_string()]
}

type FieldKey = (String, String);

/// Create actuators for every field that has none yet, in id order.
/// Returns how many were created.
fn add_missing_actuators(registry: &Registry, actuators: &mut HashMap<FieldKey, Vec<Actuator>>) -> usize {
    let mut created = 0;
    for zone in registry.zones() {
        for field in zone.fields.values() {
            let key = (zone.zone_id.clone(), field.field_id.clone());
            if actuators.contains_key(&key) {
                continue;
            }
            let mut specs: Vec<_> = field.actuators().cloned().collect();
            specs.sort_by(|a, b| a.actuator_id.cmp(&b.actuator_id));
            created += specs.len();
            actuators.insert(key, specs.into_iter().map(Actuator::new).collect());
        }
    }
    created
}

pub struct Station {
    registry: Registry,
    actuators: HashMap<FieldKey, Vec<Actuator>>,
    irrigation: IrrigationTracker,
    backend: BackendClient,
    client: AsyncClient,
    sim: SimSettings,
}

impl Station {
    pub fn new(registry: Registry, backend: BackendClient, client: AsyncClient, sim: SimSettings) -> Self {
        let mut actuators = HashMap::new();
        let count = add_missing_actuators(&registry, &mut actuators);
        info!(
            fields = registry.field_count(),
            sensors = registry.sensor_count(),
            actuators = count,
            "field station ready"
        );
        Self {
            registry,
            actuators,
            irrigation: IrrigationTracker::default(),
            backend,
            client,
            sim,
        }
    }

    #[cfg(test)]
    fn registry(&self) -> &Registry {
        &self.registry
    }

    #[cfg(test)]
    fn actuators(&self, zone_id: &str, field_id: &str) -> &[Actuator] {
        self.actuators
            .get(&(zone_id.to_string(), field_id.to_string()))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    #[cfg(test)]
    fn is_irrigating(&self, zone_id: &str, field_id: &str) -> bool {
        self.irrigation.is_irrigating(zone_id, field_id)
    }

    // -----------------------------------------------------------------------
    // Topology
    // -----------------------------------------------------------------------

    /// Merge zones and fields the backend knows but the station does not.
    /// Known fields keep their sensor values and running actuators.
    pub async fn reload_topology(&mut self) -> Result<usize> {
        let docs = self
            .backend
            .get_zones()
            .await
            .context("topology reload failed")?;
        let added = self.registry.merge_docs(&docs);
        if added > 0 {
            let actuators = add_missing_actuators(&self.registry, &mut self.actuators);
            info!(fields = added, actuators, "topology updated");
        }
        Ok(added)
    }

    async fn refresh_topology(&mut self) {
        if let Err(e) = self.reload_topology().await {
            warn!("{e:#}, keeping current topology");
        }
    }

    // -----------------------------------------------------------------------
    // Telemetry
    // -----------------------------------------------------------------------

    /// Advance every sensor one step and publish its reading.  Returns the
    /// number of readings published.
    pub async fn tick(&mut self) -> usize {
        if self.registry.is_empty() {
            self.refresh_topology().await;
        }
        let mut outgoing = Vec::new();
        for zone in self.registry.zones_mut() {
            for field in zone.fields.values_mut() {
                let irrigating = self.irrigation.is_irrigating(&field.zone_id, &field.field_id);
                for sensor in field.sensors_mut() {
                    let value = sim::next_value(sensor, irrigating);
                    let topic = TelemetryTopic::format(
                        &sensor.zone_id,
                        &sensor.field_id,
                        &sensor.sensor_id,
                        sensor.kind,
                    );
                    outgoing.push((topic, SensorReading { value }));
                }
            }
        }

        let mut published = 0;
        for (topic, reading) in outgoing {
            let payload = match serde_json::to_vec(&reading) {
                Ok(p) => p,
                Err(e) => {
                    warn!(topic = %topic, "cannot encode reading: {e}");
                    continue;
                }
            };
            match self
                .client
                .publish(topic.as_str(), QoS::AtLeastOnce, false, payload)
                .await
            {
                Ok(()) => published += 1,
                Err(e) => warn!(topic = %topic, "telemetry publish failed: {e}"),
            }
        }
        debug!(published, "telemetry tick");
        published
    }

    // -----------------------------------------------------------------------
    // Incoming messages
    // -----------------------------------------------------------------------

    pub async fn handle(&mut self, topic: &str, payload: &[u8]) -> Result<()> {
        if topic.split('/').next() == Some(Stage::Executor.prefix()) {
            let (zone_id, field_id) = Stage::Executor.parse(topic)?;
            let command: Command =
                serde_json::from_slice(payload).context("invalid command payload")?;
            self.apply_command(&zone_id, &field_id, &command).await
        } else {
            let parsed = ConsumptionTopic::parse(topic)?;
            let report: Consumption =
                serde_json::from_slice(payload).context("invalid consumption payload")?;
            self.apply_consumption(&parsed, &report)
        }
    }

    /// Forward a command to every actuator of the field.  One actuator
    /// failing does not keep the others from acting.
    async fn apply_command(&mut self, zone_id: &str, field_id: &str, command: &Command) -> Result<()> {
        let key = (zone_id.to_string(), field_id.to_string());
        let Some(actuators) = self.actuators.get_mut(&key) else {
            bail!("no actuators for field {zone_id}/{field_id}");
        };
        info!(zone = %zone_id, field = %field_id, command = ?command.command, reason = ?command.reason, "command received");

        let mut failed = 0;
        for actuator in actuators.iter_mut() {
            match actuator.apply(command, &self.client, &self.sim).await {
                Ok(()) => {
                    debug!(actuator = %actuator.id(), status = ?actuator.status(), power = ?actuator.power(), "command applied");
                }
                Err(e) => {
                    warn!(actuator = %actuator.id(), "command not applied: {e:#}");
                    failed += 1;
                }
            }
        }
        if failed > 0 && failed == actuators.len() {
            return Err(anyhow!("no actuator of {zone_id}/{field_id} accepted the command"));
        }
        Ok(())
    }

    fn apply_consumption(&mut self, topic: &ConsumptionTopic, report: &Consumption) -> Result<()> {
        let field = self.registry.field_mut(&topic.zone_id, &topic.field_id)?;
        let irrigating = self.irrigation.update(
            &topic.zone_id,
            &topic.field_id,
            &topic.actuator_id,
            report.status,
        );
        if report.status == ActuatorStatus::On {
            let moved =
                sim::apply_consumption(field, report.value, self.sim.infiltration_efficiency);
            debug!(zone = %topic.zone_id, field = %topic.field_id, moved, "irrigation feedback applied");
        }
        debug!(zone = %topic.zone_id, field = %topic.field_id, irrigating, "irrigation state");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Stop every running actuator.
    pub async fn stop_all(&mut self) {
        let running = self
            .actuators
            .values_mut()
            .flatten()
            .filter(|a| a.status() == ActuatorStatus::On);
        for actuator in running {
            info!(actuator = %actuator.id(), power = ?actuator.power(), "stopping actuator");
            if let Err(e) = actuator.stop(&self.client).await {
                warn!(actuator = %actuator.id(), "stop failed: {e:#}");
            }
        }
    }

    pub async fn run(mut self, mut bus: BusConnection, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.sim.tick);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
                event = bus.events.recv() => match event {
                    None => break,
                    Some(BusEvent::Connected) => {
                        info!("field station online");
                        self.refresh_topology().await;
                    }
                    Some(BusEvent::Disconnected) => warn!("field station offline"),
                    Some(BusEvent::Message { topic, payload }) => {
                        if let Err(e) = self.handle(&topic, &payload).await {
                            warn!(topic = %topic, "dropping message: {e:#}");
                        }
                    }
                },
            }
        }
        self.stop_all().await;
        bus.shutdown().await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
