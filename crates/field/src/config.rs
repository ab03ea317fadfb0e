//! Field station settings, read once from the environment at startup.

use anyhow::{bail, Result};
use irrigation_common::settings::{env_opt, env_parse, BackendSettings, MqttSettings};
use std::str::FromStr;
use std::time::Duration;

/// How an actuator turns its power level into reported consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumptionModel {
    /// Scaled by power fraction and the simulation time scale.
    Proportional,
    /// Rated flow per second regardless of power.
    Flat,
}

impl FromStr for ConsumptionModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "proportional" => Ok(Self::Proportional),
            "flat" => Ok(Self::Flat),
            other => Err(format!("unknown consumption model '{other}' (proportional|flat)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimSettings {
    pub tick: Duration,
    pub consumption_model: ConsumptionModel,
    pub time_scale: f64,
    pub infiltration_efficiency: f64,
    /// Interval between consumption reports of a running actuator.
    pub report_every: Duration,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(10),
            consumption_model: ConsumptionModel::Proportional,
            time_scale: 120.0,
            infiltration_efficiency: 0.7,
            report_every: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldConfig {
    pub mqtt: MqttSettings,
    pub backend: BackendSettings,
    pub sim: SimSettings,
}

impl FieldConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = SimSettings::default();
        let tick_s: u64 = env_parse("SIM_TICK_S", 10);
        if tick_s == 0 {
            bail!("SIM_TICK_S must be positive");
        }
        let consumption_model = match env_opt("CONSUMPTION_MODEL") {
            Some(raw) => raw.parse().map_err(anyhow::Error::msg)?,
            None => defaults.consumption_model,
        };
        let time_scale: f64 = env_parse("TIME_SCALE", defaults.time_scale);
        if !(time_scale > 0.0) {
            bail!("TIME_SCALE must be positive, got {time_scale}");
        }
        let infiltration_efficiency: f64 =
            env_parse("INFILTRATION_EFFICIENCY", defaults.infiltration_efficiency);
        if !(0.0..=1.0).contains(&infiltration_efficiency) {
            bail!("INFILTRATION_EFFICIENCY must be within [0, 1], got {infiltration_efficiency}");
        }

        Ok(Self {
            mqtt: MqttSettings::from_env(),
            backend: BackendSettings::from_env(),
            sim: SimSettings {
                tick: Duration::from_secs(tick_s),
                consumption_model,
                time_scale,
                infiltration_efficiency,
                report_every: defaults.report_every,
            },
        })
    }
}
