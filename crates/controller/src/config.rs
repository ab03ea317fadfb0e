//! Controller settings, read once from the environment at startup.

use anyhow::{bail, Result};
use irrigation_common::settings::{
    env_flag, env_opt, env_or, env_parse, BackendSettings, MqttSettings,
};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_WEATHER_URL: &str = "https://api.openweathermap.org/data/2.5/forecast";

// ---------------------------------------------------------------------------
// Service selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Analyzer,
    Planner,
    Executor,
}

impl Service {
    pub const ALL: [Service; 3] = [Service::Analyzer, Service::Planner, Service::Executor];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analyzer => "analyzer",
            Self::Planner => "planner",
            Self::Executor => "executor",
        }
    }

    /// MQTT client id; each service is its own bus participant.
    pub fn client_id(&self) -> String {
        format!("irrigation-{}", self.as_str())
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Service {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "analyzer" => Ok(Self::Analyzer),
            "planner" => Ok(Self::Planner),
            "executor" => Ok(Self::Executor),
            other => Err(format!("unknown service '{other}'")),
        }
    }
}

/// Parse a comma list like "analyzer,executor".  Blank means every service.
pub fn parse_services(raw: &str) -> Result<Vec<Service>> {
    if raw.trim().is_empty() {
        return Ok(Service::ALL.to_vec());
    }
    let mut out = Vec::new();
    let mut errors = Vec::new();
    for part in raw.split(',').filter(|p| !p.trim().is_empty()) {
        match part.parse::<Service>() {
            Ok(s) if !out.contains(&s) => out.push(s),
            Ok(_) => {}
            Err(e) => errors.push(e),
        }
    }
    if !errors.is_empty() {
        bail!("SERVICES: {}", errors.join(", "));
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Analysis mode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisMode {
    /// Evaluate every field on a fixed interval.
    Sweep,
    /// Evaluate a field whenever one of its sensors reports.
    Event,
    Both,
}

impl AnalysisMode {
    pub fn sweeps(&self) -> bool {
        matches!(self, Self::Sweep | Self::Both)
    }

    pub fn on_telemetry(&self) -> bool {
        matches!(self, Self::Event | Self::Both)
    }
}

impl FromStr for AnalysisMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sweep" => Ok(Self::Sweep),
            "event" => Ok(Self::Event),
            "both" => Ok(Self::Both),
            other => Err(format!("unknown analysis mode '{other}' (sweep|event|both)")),
        }
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    pub mode: AnalysisMode,
    pub interval: Duration,
    pub default_threshold: f64,
    pub register_unknown_sensors: bool,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            mode: AnalysisMode::Sweep,
            interval: Duration::from_secs(60),
            default_threshold: 30.0,
            register_unknown_sensors: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WeatherConfig {
    pub url: String,
    /// `None` disables forecasts entirely; every field then reads "no rain".
    pub api_key: Option<String>,
    pub lookahead: usize,
    pub ttl: Duration,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub services: Vec<Service>,
    pub mqtt: MqttSettings,
    pub backend: BackendSettings,
    pub analyzer: AnalyzerConfig,
    pub water_need_liters: f64,
    pub weather: WeatherConfig,
    pub web_port: u16,
    pub seed_path: Option<String>,
}

impl ControllerConfig {
    pub fn from_env() -> Result<Self> {
        let services = parse_services(&env_or("SERVICES", ""))?;
        let mode = match env_opt("ANALYSIS_MODE") {
            Some(raw) => raw.parse::<AnalysisMode>().map_err(anyhow::Error::msg)?,
            None => AnalysisMode::Sweep,
        };
        let interval_s: u64 = env_parse("ANALYSIS_INTERVAL_S", 60);
        if interval_s == 0 {
            bail!("ANALYSIS_INTERVAL_S must be positive");
        }
        let water_need_liters: f64 = env_parse("WATER_NEED_LITERS", 30.0);
        if !(water_need_liters >= 0.0) {
            bail!("WATER_NEED_LITERS must be a non-negative number, got {water_need_liters}");
        }
        let backend = BackendSettings::from_env();

        Ok(Self {
            services,
            mqtt: MqttSettings::from_env(),
            analyzer: AnalyzerConfig {
                mode,
                interval: Duration::from_secs(interval_s),
                default_threshold: env_parse("DEFAULT_MOISTURE_THRESHOLD", 30.0),
                register_unknown_sensors: env_flag("REGISTER_UNKNOWN_SENSORS", false),
            },
            water_need_liters,
            weather: WeatherConfig {
                url: env_or("WEATHER_URL", DEFAULT_WEATHER_URL),
                api_key: env_opt("WEATHER_API_KEY"),
                lookahead: env_parse("WEATHER_LOOKAHEAD", 1),
                ttl: Duration::from_secs(env_parse("WEATHER_TTL_S", 600)),
                timeout: backend.timeout,
            },
            backend,
            web_port: env_parse("WEB_PORT", 8080),
            seed_path: env_opt("SEED_PATH"),
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- parse_services -----------------------------------------------------

    #[test]
    fn blank_services_means_all() {
        assert_eq!(parse_services("").unwrap(), Service::ALL.to_vec());
        assert_eq!(parse_services("  ").unwrap(), Service::ALL.to_vec());
    }

    #[test]
    fn services_subset_in_order() {
        assert_eq!(
            parse_services("executor, Analyzer").unwrap(),
            vec![Service::Executor, Service::Analyzer]
        );
    }

    #[test]
    fn services_duplicates_collapsed() {
        assert_eq!(parse_services("planner,planner,").unwrap(), vec![Service::Planner]);
    }

    #[test]
    fn services_unknown_rejected() {
        let err = parse_services("planner,scheduler").unwrap_err();
        assert!(err.to_string().contains("unknown service 'scheduler'"));
    }

    #[test]
    fn client_ids_are_distinct() {
        let ids: Vec<String> = Service::ALL.iter().map(|s| s.client_id()).collect();
        assert_eq!(ids, vec!["irrigation-analyzer", "irrigation-planner", "irrigation-executor"]);
    }

    // -- AnalysisMode ---------------------------------------------------------

    #[test]
    fn analysis_mode_parse() {
        assert_eq!("sweep".parse::<AnalysisMode>().unwrap(), AnalysisMode::Sweep);
        assert_eq!("EVENT".parse::<AnalysisMode>().unwrap(), AnalysisMode::Event);
        assert_eq!("both".parse::<AnalysisMode>().unwrap(), AnalysisMode::Both);
        assert!("hourly".parse::<AnalysisMode>().is_err());
    }

    #[test]
    fn analysis_mode_flags() {
        assert!(AnalysisMode::Sweep.sweeps() && !AnalysisMode::Sweep.on_telemetry());
        assert!(!AnalysisMode::Event.sweeps() && AnalysisMode::Event.on_telemetry());
        assert!(AnalysisMode::Both.sweeps() && AnalysisMode::Both.on_telemetry());
    }

    #[test]
    fn analyzer_defaults() {
        let cfg = AnalyzerConfig::default();
        assert_eq!(cfg.interval, Duration::from_secs(60));
        assert_eq!(cfg.default_threshold, 30.0);
        assert!(!cfg.register_unknown_sensors);
    }
}
