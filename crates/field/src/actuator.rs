//! Simulated irrigation actuator.
//!
//! Two states, `off` and `on`.  Starting spawns the only task that
//! publishes this actuator's consumption; stopping signals it, waits for it
//! to finish, then publishes one final zero/off report.  Repeated starts or
//! stops are no-ops.

use anyhow::{bail, Context, Result};
use irrigation_common::messages::{ActuatorStatus, Command, CommandKind, Consumption};
use irrigation_common::topics::ConsumptionTopic;
use irrigation_common::topology::ActuatorSpec;
use rumqttc::{AsyncClient, QoS};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ConsumptionModel, SimSettings};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PowerError {
    #[error("consumption rate must be a positive number, got {0}")]
    InvalidConsumption(f64),
    #[error("water need must be a non-negative number, got {0}")]
    InvalidWaterNeed(f64),
}

/// Power (percent) that delivers `water_need` liters within the hour at the
/// actuator's rated flow, clamped into its power bounds.
pub fn power_percentage(water_need: f64, spec: &ActuatorSpec) -> Result<f64, PowerError> {
    if !spec.consumption.is_finite() || spec.consumption <= 0.0 {
        return Err(PowerError::InvalidConsumption(spec.consumption));
    }
    if !water_need.is_finite() || water_need < 0.0 {
        return Err(PowerError::InvalidWaterNeed(water_need));
    }
    let runtime_minutes = water_need / spec.consumption;
    let percentage = (runtime_minutes / 60.0) * 100.0;
    Ok(percentage.clamp(spec.min_value, spec.max_value))
}

/// Volume reported per second while running at `power`.
pub fn consumption_per_second(
    model: ConsumptionModel,
    spec: &ActuatorSpec,
    power: f64,
    time_scale: f64,
) -> f64 {
    match model {
        ConsumptionModel::Flat => spec.consumption / 60.0,
        ConsumptionModel::Proportional => {
            if spec.max_value <= 0.0 {
                return 0.0;
            }
            (power / spec.max_value) * spec.consumption / 60.0 * time_scale
        }
    }
}

struct ConsumptionTask {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct Actuator {
    spec: ActuatorSpec,
    topic: String,
    power: Option<f64>,
    task: Option<ConsumptionTask>,
}

impl Actuator {
    pub fn new(spec: ActuatorSpec) -> Self {
        let topic =
            ConsumptionTopic::format(&spec.zone_id, &spec.field_id, &spec.actuator_id, spec.kind);
        Self {
            spec,
            topic,
            power: None,
            task: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.actuator_id
    }

    #[cfg(test)]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn status(&self) -> ActuatorStatus {
        if self.task.is_some() {
            ActuatorStatus::On
        } else {
            ActuatorStatus::Off
        }
    }

    pub fn power(&self) -> Option<f64> {
        self.power
    }

    /// `off → on`.  Returns `false` when already on.
    pub fn start(&mut self, power: f64, client: &AsyncClient, sim: &SimSettings) -> Result<bool> {
        if self.task.is_some() {
            debug!(actuator = %self.spec.actuator_id, "already on");
            return Ok(false);
        }
        let power = power.clamp(self.spec.min_value, self.spec.max_value);
        let report = Consumption {
            value: consumption_per_second(sim.consumption_model, &self.spec, power, sim.time_scale),
            measurement: self.spec.measurement.clone(),
            status: ActuatorStatus::On,
        };
        let payload = serde_json::to_vec(&report)?;

        let (stop, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(report_consumption(
            client.clone(),
            self.topic.clone(),
            payload,
            sim.report_every,
            stop_rx,
        ));
        self.power = Some(power);
        self.task = Some(ConsumptionTask { stop, handle });
        info!(actuator = %self.spec.actuator_id, power, per_second = report.value, "actuator on");
        Ok(true)
    }

    /// `on → off`.  Waits for the reporting task, then publishes a final
    /// zero report.  Returns `false` when already off.
    pub async fn stop(&mut self, client: &AsyncClient) -> Result<bool> {
        let Some(task) = self.task.take() else {
            debug!(actuator = %self.spec.actuator_id, "already off");
            return Ok(false);
        };
        self.power = None;
        let _ = task.stop.send(());
        if let Err(e) = task.handle.await {
            warn!(actuator = %self.spec.actuator_id, "consumption task ended abnormally: {e}");
        }

        let last = Consumption {
            value: 0.0,
            measurement: self.spec.measurement.clone(),
            status: ActuatorStatus::Off,
        };
        client
            .publish(self.topic.as_str(), QoS::AtLeastOnce, false, serde_json::to_vec(&last)?)
            .await
            .with_context(|| format!("publish {}", self.topic))?;
        info!(actuator = %self.spec.actuator_id, "actuator off");
        Ok(true)
    }

    /// Apply an executor command.  A start needs a water need to size power.
    pub async fn apply(
        &mut self,
        command: &Command,
        client: &AsyncClient,
        sim: &SimSettings,
    ) -> Result<()> {
        match command.command {
            CommandKind::Start => {
                if self.task.is_some() {
                    debug!(actuator = %self.spec.actuator_id, "start ignored, already on");
                    return Ok(());
                }
                let Some(water_need) = command.value else {
                    bail!("start command without a water need");
                };
                let power = power_percentage(water_need, &self.spec)?;
                self.start(power, client, sim)?;
            }
            CommandKind::Stop => {
                self.stop(client).await?;
            }
        }
        Ok(())
    }
}

async fn report_consumption(
    client: AsyncClient,
    topic: String,
    payload: Vec<u8>,
    every: Duration,
    mut stop: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            // Fires on an explicit stop and when the actuator is dropped.
            _ = &mut stop => break,
            _ = ticker.tick() => {
                if let Err(e) = client
                    .publish(topic.as_str(), QoS::AtLeastOnce, false, payload.clone())
                    .await
                {
                    warn!(topic = %topic, "consumption publish failed: {e}");
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use irrigation_common::topology::ActuatorKind;
    use rumqttc::MqttOptions;

    fn test_mqtt() -> (AsyncClient, rumqttc::EventLoop) {
        let opts = MqttOptions::new("test-actuator", "localhost", 1883);
        AsyncClient::new(opts, 64)
    }

    fn spec(consumption: f64) -> ActuatorSpec {
        ActuatorSpec {
            actuator_id: "a1".into(),
            kind: ActuatorKind::Sprinkler,
            zone_id: "z1".into(),
            field_id: "f1".into(),
            consumption,
            measurement: "L/min".into(),
            min_value: 0.0,
            max_value: 100.0,
        }
    }

    fn start_cmd(value: Option<f64>) -> Command {
        Command {
            command: CommandKind::Start,
            value,
            reason: None,
        }
    }

    fn stop_cmd() -> Command {
        Command {
            command: CommandKind::Stop,
            value: None,
            reason: None,
        }
    }

    // -- power_percentage -------------------------------------------------

    #[test]
    fn power_reference_value() {
        // 30 L at 60 L/min is half a minute of a 60-minute window.
        let p = power_percentage(30.0, &spec(60.0)).unwrap();
        assert!((p - 50.0 / 60.0).abs() < 1e-12, "{p}");
    }

    #[test]
    fn power_clamped_to_max() {
        assert_eq!(power_percentage(10_000.0, &spec(1.0)).unwrap(), 100.0);
    }

    #[test]
    fn power_clamped_to_min() {
        let mut s = spec(60.0);
        s.min_value = 10.0;
        assert_eq!(power_percentage(0.0, &s).unwrap(), 10.0);
    }

    #[test]
    fn power_rejects_zero_and_negative_consumption() {
        assert_eq!(power_percentage(30.0, &spec(0.0)), Err(PowerError::InvalidConsumption(0.0)));
        assert!(power_percentage(30.0, &spec(-5.0)).is_err());
        assert!(power_percentage(30.0, &spec(f64::INFINITY)).is_err());
    }

    #[test]
    fn power_rejects_bad_water_need() {
        assert!(power_percentage(-1.0, &spec(60.0)).is_err());
        assert!(power_percentage(f64::NAN, &spec(60.0)).is_err());
    }

    #[test]
    fn power_monotonic_in_water_need() {
        let s = spec(2.0);
        let mut prev = 0.0;
        for need in (0..=400).step_by(10).map(f64::from) {
            let p = power_percentage(need, &s).unwrap();
            assert!(p >= prev, "power decreased at need={need}");
            assert!((s.min_value..=s.max_value).contains(&p));
            prev = p;
        }
    }

    // -- consumption_per_second -------------------------------------------

    #[test]
    fn proportional_consumption() {
        let v = consumption_per_second(ConsumptionModel::Proportional, &spec(60.0), 50.0, 120.0);
        assert!((v - 60.0).abs() < 1e-12, "{v}");
    }

    #[test]
    fn flat_consumption_ignores_power() {
        let s = spec(60.0);
        assert_eq!(consumption_per_second(ConsumptionModel::Flat, &s, 10.0, 120.0), 1.0);
        assert_eq!(consumption_per_second(ConsumptionModel::Flat, &s, 90.0, 120.0), 1.0);
    }

    // -- state machine ----------------------------------------------------

    #[test]
    fn topic_matches_grammar() {
        let a = Actuator::new(spec(60.0));
        assert_eq!(a.topic(), "zone/z1/field/f1/actuator/a1/sprinkler/consumption");
    }

    #[tokio::test]
    async fn start_then_stop() {
        let (client, _el) = test_mqtt();
        let sim = SimSettings::default();
        let mut a = Actuator::new(spec(60.0));
        assert_eq!(a.status(), ActuatorStatus::Off);

        assert!(a.start(40.0, &client, &sim).unwrap());
        assert_eq!(a.status(), ActuatorStatus::On);
        assert_eq!(a.power(), Some(40.0));

        assert!(a.stop(&client).await.unwrap());
        assert_eq!(a.status(), ActuatorStatus::Off);
        assert_eq!(a.power(), None);
    }

    #[tokio::test]
    async fn start_while_on_is_noop() {
        let (client, _el) = test_mqtt();
        let sim = SimSettings::default();
        let mut a = Actuator::new(spec(60.0));
        assert!(a.start(40.0, &client, &sim).unwrap());
        assert!(!a.start(90.0, &client, &sim).unwrap());
        assert_eq!(a.power(), Some(40.0));
        a.stop(&client).await.unwrap();
    }

    #[tokio::test]
    async fn stop_while_off_is_noop() {
        let (client, _el) = test_mqtt();
        let mut a = Actuator::new(spec(60.0));
        assert!(!a.stop(&client).await.unwrap());
    }

    #[tokio::test]
    async fn start_clamps_power() {
        let (client, _el) = test_mqtt();
        let mut a = Actuator::new(spec(60.0));
        a.start(250.0, &client, &SimSettings::default()).unwrap();
        assert_eq!(a.power(), Some(100.0));
        a.stop(&client).await.unwrap();
    }

    #[tokio::test]
    async fn restart_after_stop() {
        let (client, _el) = test_mqtt();
        let sim = SimSettings::default();
        let mut a = Actuator::new(spec(60.0));
        a.start(10.0, &client, &sim).unwrap();
        a.stop(&client).await.unwrap();
        assert!(a.start(20.0, &client, &sim).unwrap());
        assert_eq!(a.power(), Some(20.0));
        a.stop(&client).await.unwrap();
    }

    // -- apply ------------------------------------------------------------

    #[tokio::test]
    async fn apply_start_sizes_power_from_water_need() {
        let (client, _el) = test_mqtt();
        let mut a = Actuator::new(spec(0.5));
        a.apply(&start_cmd(Some(30.0)), &client, &SimSettings::default())
            .await
            .unwrap();
        assert_eq!(a.power(), Some(100.0));
        a.apply(&stop_cmd(), &client, &SimSettings::default()).await.unwrap();
        assert_eq!(a.status(), ActuatorStatus::Off);
    }

    #[tokio::test]
    async fn apply_start_without_value_fails() {
        let (client, _el) = test_mqtt();
        let mut a = Actuator::new(spec(60.0));
        assert!(a
            .apply(&start_cmd(None), &client, &SimSettings::default())
            .await
            .is_err());
        assert_eq!(a.status(), ActuatorStatus::Off);
    }

    #[tokio::test]
    async fn apply_start_with_zero_consumption_does_not_start() {
        let (client, _el) = test_mqtt();
        let mut a = Actuator::new(spec(0.0));
        let err = a
            .apply(&start_cmd(Some(30.0)), &client, &SimSettings::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("consumption rate"));
        assert_eq!(a.status(), ActuatorStatus::Off);
    }
}
