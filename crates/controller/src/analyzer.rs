//! Telemetry ingestion and per-field irrigation decisions.
//!
//! The analyzer owns the authoritative sensor registry.  Telemetry updates
//! it; each evaluation reads the soil-moisture average, refreshes the
//! field's threshold from preferences, asks the weather client about rain
//! and publishes `{action, reason}` on `analyzer/zone/{z}/field/{f}`.

use anyhow::{Context, Result};
use irrigation_common::backend::BackendClient;
use irrigation_common::bus::{BusConnection, BusEvent};
use irrigation_common::messages::{Consumption, Decision, DecisionAction, SensorReading};
use irrigation_common::topics::{
    ConsumptionTopic, Stage, TelemetryTopic, CONSUMPTION_FILTER, TELEMETRY_FILTER,
};
use irrigation_common::topology::{Registry, SensorKind};
use rumqttc::{AsyncClient, QoS};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::AnalyzerConfig;
use crate::state::{FieldStatus, SharedState};
use crate::weather::WeatherClient;

pub const TRIGGER_REASON: &str = "(Sml ≤ Smt) ⋀ ⌐Rp";
pub const STOP_REASON: &str = "(Sml > Smt) ⋁ Rp";

/// Minimum gap between topology fetches triggered by telemetry.
const TOPOLOGY_RETRY: Duration = Duration::from_secs(30);

/// Irrigate when the soil is at or below threshold and no rain is coming.
/// The two branches are exact complements, so every input yields one action.
pub fn decide(sml: f64, smt: f64, rain_predicted: bool) -> Decision {
    if sml <= smt && !rain_predicted {
        Decision {
            action: DecisionAction::TriggerIrrigation,
            reason: TRIGGER_REASON.to_string(),
        }
    } else {
        Decision {
            action: DecisionAction::StopIrrigation,
            reason: STOP_REASON.to_string(),
        }
    }
}

pub fn subscriptions() -> Vec<String> {
    vec![TELEMETRY_FILTER.to_string(), CONSUMPTION_FILTER.to_string()]
}

/// Topology at startup; an unreachable backend yields an empty registry.
pub async fn load_registry(backend: &BackendClient) -> Registry {
    match backend.get_zones().await {
        Ok(docs) => {
            let registry = Registry::from_docs(&docs);
            info!(
                zones = docs.len(),
                fields = registry.field_count(),
                sensors = registry.sensor_count(),
                "topology loaded"
            );
            registry
        }
        Err(e) => {
            warn!("failed to load topology from {}: {e:#}", backend.base_url());
            Registry::default()
        }
    }
}

/// Outcome of one periodic sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub evaluated: usize,
    pub errors: usize,
}

pub struct Analyzer {
    registry: RwLock<Registry>,
    backend: BackendClient,
    weather: WeatherClient,
    client: AsyncClient,
    state: SharedState,
    cfg: AnalyzerConfig,
    topology_attempt: Mutex<Option<Instant>>,
}

impl Analyzer {
    pub fn new(
        registry: Registry,
        backend: BackendClient,
        weather: WeatherClient,
        client: AsyncClient,
        state: SharedState,
        cfg: AnalyzerConfig,
    ) -> Self {
        Self {
            registry: RwLock::new(registry),
            backend,
            weather,
            client,
            state,
            cfg,
            topology_attempt: Mutex::new(None),
        }
    }

    // -- topology -------------------------------------------------------------

    /// Fetch the topology and merge in zones and fields not seen yet.
    /// Returns how many fields were added.
    pub async fn reload_topology(&self) -> Result<usize> {
        *self.topology_attempt.lock().await = Some(Instant::now());
        let docs = self
            .backend
            .get_zones()
            .await
            .context("topology reload failed")?;
        let added = self.registry.write().await.merge_docs(&docs);
        if added > 0 {
            info!(added, "topology updated");
        }
        Ok(added)
    }

    async fn refresh_topology(&self) {
        if let Err(e) = self.reload_topology().await {
            warn!("{e:#}, keeping current topology");
        }
    }

    /// An empty topology is retried from the telemetry path, at most once
    /// per `TOPOLOGY_RETRY`.
    async fn ensure_topology(&self) {
        if !self.registry.read().await.is_empty() {
            return;
        }
        let due = self
            .topology_attempt
            .lock()
            .await
            .map_or(true, |at| at.elapsed() >= TOPOLOGY_RETRY);
        if due {
            self.refresh_topology().await;
        }
    }

    // -- ingestion ------------------------------------------------------------

    /// Store one telemetry reading.  Returns the `(zone, field)` it belongs to.
    pub async fn ingest(&self, topic: &str, payload: &[u8]) -> Result<(String, String)> {
        let t = TelemetryTopic::parse(topic)?;
        let reading: SensorReading =
            serde_json::from_slice(payload).context("invalid telemetry payload")?;

        let stored = self.registry.write().await.record_reading(
            &t.zone_id,
            &t.field_id,
            &t.sensor_id,
            t.kind,
            reading.value,
            self.cfg.register_unknown_sensors,
        )?;
        debug!(zone = %t.zone_id, field = %t.field_id, sensor = %t.sensor_id, value = stored, "reading stored");
        Ok((t.zone_id, t.field_id))
    }

    fn parse_consumption(&self, topic: &str, payload: &[u8]) -> Result<(ConsumptionTopic, Consumption)> {
        let t = ConsumptionTopic::parse(topic)?;
        let c: Consumption =
            serde_json::from_slice(payload).context("invalid consumption payload")?;
        Ok((t, c))
    }

    // -- decisions ------------------------------------------------------------

    /// Threshold for the next decision: preferences win and are written
    /// back to the field; on fetch failure the field keeps its last value.
    pub async fn resolve_threshold(&self, zone_id: &str, field_id: &str) -> Result<f64> {
        let fetched = match self.backend.get_preferences().await {
            Ok(prefs) => prefs.and_then(|p| p.moisture_threshold),
            Err(e) => {
                debug!(zone = %zone_id, field = %field_id, "preferences unavailable: {e:#}");
                None
            }
        };

        let mut registry = self.registry.write().await;
        let field = registry.field_mut(zone_id, field_id)?;
        if let Some(t) = fetched {
            field.moisture_threshold = Some(t);
        }
        Ok(field.moisture_threshold.unwrap_or(self.cfg.default_threshold))
    }

    /// Decide for one field.  `None` when no soil-moisture sensor has data yet.
    pub async fn evaluate(&self, zone_id: &str, field_id: &str) -> Result<Option<Decision>> {
        let (average, coordinates) = {
            let registry = self.registry.read().await;
            let field = registry.field(zone_id, field_id)?;
            (field.average(SensorKind::SoilMoisture), field.coordinates())
        };

        let Some(sml) = average else {
            debug!(zone = %zone_id, field = %field_id, "no soil-moisture data yet");
            return Ok(None);
        };

        let smt = self.resolve_threshold(zone_id, field_id).await?;
        let rain = match coordinates {
            Some((lat, lon)) => self.weather.is_rain_predicted(lat, lon).await,
            None => false,
        };
        let decision = decide(sml, smt, rain);

        self.state.write().await.record_evaluation(
            FieldStatus {
                zone_id: zone_id.to_string(),
                field_id: field_id.to_string(),
                moisture_avg: Some(sml),
                threshold: smt,
                rain_predicted: rain,
                decision: Some(decision.action),
                evaluated_at: OffsetDateTime::now_utc(),
            },
            Some(&decision),
        );
        info!(zone = %zone_id, field = %field_id, sml, smt, rain, action = ?decision.action, "decision");
        Ok(Some(decision))
    }

    pub async fn publish(&self, zone_id: &str, field_id: &str, decision: &Decision) -> Result<()> {
        let topic = Stage::Analyzer.topic(zone_id, field_id);
        let payload = serde_json::to_vec(decision)?;
        self.client
            .publish(topic.as_str(), QoS::AtLeastOnce, false, payload)
            .await
            .with_context(|| format!("publish {topic}"))?;
        Ok(())
    }

    pub async fn analyze_field(&self, zone_id: &str, field_id: &str) -> Result<()> {
        if let Some(decision) = self.evaluate(zone_id, field_id).await? {
            self.publish(zone_id, field_id, &decision).await?;
        }
        Ok(())
    }

    /// Refresh the topology, then evaluate every known field.  One field's
    /// failure never stops the rest.
    pub async fn sweep(&self) -> SweepSummary {
        self.refresh_topology().await;
        let keys = self.registry.read().await.field_keys();
        let mut summary = SweepSummary::default();
        for (zone_id, field_id) in keys {
            summary.evaluated += 1;
            if let Err(e) = self.analyze_field(&zone_id, &field_id).await {
                summary.errors += 1;
                warn!(zone = %zone_id, field = %field_id, "analysis failed: {e:#}");
                self.state
                    .write()
                    .await
                    .record_error(format!("{zone_id}/{field_id}: {e:#}"));
            }
        }
        if summary.errors > 0 {
            warn!(evaluated = summary.evaluated, errors = summary.errors, "analysis sweep finished");
        } else {
            debug!(evaluated = summary.evaluated, "analysis sweep finished");
        }
        summary
    }

    // -- dispatch -------------------------------------------------------------

    pub async fn handle(&self, topic: &str, payload: &[u8]) -> Result<()> {
        if topic.ends_with("/consumption") {
            let (t, c) = self.parse_consumption(topic, payload)?;
            self.state
                .write()
                .await
                .record_consumption(&t.zone_id, &t.field_id, &t.actuator_id, &c);
            return Ok(());
        }

        self.ensure_topology().await;
        let (zone_id, field_id) = self.ingest(topic, payload).await?;
        if self.cfg.mode.on_telemetry() {
            self.analyze_field(&zone_id, &field_id).await?;
        }
        Ok(())
    }

    pub async fn run(self: Arc<Self>, mut bus: BusConnection, mut shutdown: watch::Receiver<bool>) {
        let name = bus.name().to_string();
        let sweeper = self.cfg.mode.sweeps().then(|| {
            let analyzer = Arc::clone(&self);
            let mut stop = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(analyzer.cfg.interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            analyzer.sweep().await;
                        }
                        _ = stop.changed() => break,
                    }
                }
            })
        });

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = bus.events.recv() => match event {
                    None => break,
                    Some(BusEvent::Connected) => {
                        self.state.write().await.set_connected(&name, true);
                        self.refresh_topology().await;
                    }
                    Some(BusEvent::Disconnected) => self.state.write().await.set_connected(&name, false),
                    Some(BusEvent::Message { topic, payload }) => {
                        if let Err(e) = self.handle(&topic, &payload).await {
                            warn!(topic = %topic, "dropping message: {e:#}");
                            self.state.write().await.record_error(format!("{topic}: {e:#}"));
                        }
                    }
                },
            }
        }

        if let Some(task) = sweeper {
            task.abort();
        }
        bus.shutdown().await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
