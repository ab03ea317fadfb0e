//! Zone → field → sensor/actuator topology.
//!
//! `ZoneDoc` and friends are the document shape served by the backend (and
//! read from the seed file).  `Zone`, `Field`, `Sensor` and `ActuatorSpec`
//! are the validated in-memory form.  A [`Registry`] indexes zones by id and
//! is the single mutable copy of the graph inside a process.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

/// Field footprint used by the infiltration model when a document omits it.
pub const DEFAULT_AREA_M2: f64 = 100.0;
/// Root-zone depth used by the infiltration model when a document omits it.
pub const DEFAULT_SOIL_DEPTH_M: f64 = 0.3;
/// Power bounds (percent) for actuators whose document omits them.
pub const DEFAULT_POWER_BOUNDS: (f64, f64) = (0.0, 100.0);

// ---------------------------------------------------------------------------
// Closed type sets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {family} type '{value}'")]
pub struct UnknownKind {
    pub family: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    SoilMoisture,
    Light,
    Humidity,
    Temperature,
}

impl SensorKind {
    pub const ALL: [SensorKind; 4] = [
        SensorKind::SoilMoisture,
        SensorKind::Light,
        SensorKind::Humidity,
        SensorKind::Temperature,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SoilMoisture => "soil_moisture",
            Self::Light => "light",
            Self::Humidity => "humidity",
            Self::Temperature => "temperature",
        }
    }

    /// Half-width of the uniform random-walk step applied each tick.
    pub fn walk_delta(&self) -> f64 {
        match self {
            Self::SoilMoisture => 2.0,
            Self::Light => 50.0,
            Self::Humidity => 5.0,
            Self::Temperature => 1.0,
        }
    }

    /// Value bounds assumed when neither the document nor the seed gives any.
    pub fn default_bounds(&self) -> (f64, f64) {
        match self {
            Self::SoilMoisture | Self::Humidity => (0.0, 100.0),
            Self::Light => (0.0, 3000.0),
            Self::Temperature => (-20.0, 60.0),
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| UnknownKind {
                family: "sensor",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActuatorKind {
    Sprinkler,
    DripIrrigation,
}

impl ActuatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sprinkler => "sprinkler",
            Self::DripIrrigation => "drip_irrigation",
        }
    }
}

impl fmt::Display for ActuatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActuatorKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sprinkler" => Ok(Self::Sprinkler),
            "drip_irrigation" => Ok(Self::DripIrrigation),
            other => Err(UnknownKind {
                family: "actuator",
                value: other.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Backend documents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneDoc {
    pub zone_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub fields: Vec<FieldDoc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDoc {
    pub field_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(
        default,
        alias = "soil_moisture_threshold",
        skip_serializing_if = "Option::is_none"
    )]
    pub moisture_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soil_depth: Option<f64>,
    #[serde(default)]
    pub sensors: Vec<SensorDoc>,
    #[serde(default)]
    pub actuators: Vec<ActuatorDoc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorDoc {
    pub sensor_id: String,
    #[serde(rename = "type", alias = "sensor_type")]
    pub sensor_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorDoc {
    pub actuator_id: String,
    #[serde(rename = "type", alias = "actuator_type")]
    pub actuator_type: String,
    pub consumption: f64,
    #[serde(default = "default_measurement")]
    pub measurement: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,
}

fn default_measurement() -> String {
    "L/min".to_string()
}

// ---------------------------------------------------------------------------
// In-memory entities
// ---------------------------------------------------------------------------

/// A sensor reading slot.  `zone_id`/`field_id` are lookup keys back into
/// the registry, not ownership.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sensor {
    pub sensor_id: String,
    pub kind: SensorKind,
    pub value: Option<f64>,
    pub min_value: f64,
    pub max_value: f64,
    pub zone_id: String,
    pub field_id: String,
}

impl Sensor {
    /// Build a sensor, rejecting inverted or non-finite bounds.
    pub fn new(
        sensor_id: &str,
        kind: SensorKind,
        bounds: (f64, f64),
        zone_id: &str,
        field_id: &str,
    ) -> Option<Self> {
        let (min_value, max_value) = bounds;
        if !min_value.is_finite() || !max_value.is_finite() || min_value > max_value {
            return None;
        }
        Some(Self {
            sensor_id: sensor_id.to_string(),
            kind,
            value: None,
            min_value,
            max_value,
            zone_id: zone_id.to_string(),
            field_id: field_id.to_string(),
        })
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min_value, self.max_value)
    }

    /// Store `value` clamped into `[min_value, max_value]`; returns what was stored.
    pub fn set_value(&mut self, value: f64) -> f64 {
        let clamped = self.clamp(value);
        self.value = Some(clamped);
        clamped
    }

    pub fn midpoint(&self) -> f64 {
        (self.min_value + self.max_value) / 2.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActuatorSpec {
    pub actuator_id: String,
    pub kind: ActuatorKind,
    pub zone_id: String,
    pub field_id: String,
    /// Flow at full power, volume per minute.
    pub consumption: f64,
    pub measurement: String,
    pub min_value: f64,
    pub max_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Field {
    pub field_id: String,
    pub zone_id: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub moisture_threshold: Option<f64>,
    pub area: f64,
    pub soil_depth: f64,
    pub sensors: HashMap<SensorKind, HashMap<String, Sensor>>,
    pub actuators: HashMap<ActuatorKind, HashMap<String, ActuatorSpec>>,
}

impl Field {
    pub fn new(field_id: &str, zone_id: &str) -> Self {
        Self {
            field_id: field_id.to_string(),
            zone_id: zone_id.to_string(),
            latitude: None,
            longitude: None,
            moisture_threshold: None,
            area: DEFAULT_AREA_M2,
            soil_depth: DEFAULT_SOIL_DEPTH_M,
            sensors: HashMap::new(),
            actuators: HashMap::new(),
        }
    }

    pub fn coordinates(&self) -> Option<(f64, f64)> {
        Some((self.latitude?, self.longitude?))
    }

    /// Insert a sensor.  Returns `false` (and keeps the existing one) when
    /// the id is already taken within its type bucket.
    pub fn add_sensor(&mut self, sensor: Sensor) -> bool {
        let bucket = self.sensors.entry(sensor.kind).or_default();
        if bucket.contains_key(&sensor.sensor_id) {
            return false;
        }
        bucket.insert(sensor.sensor_id.clone(), sensor);
        true
    }

    pub fn add_actuator(&mut self, actuator: ActuatorSpec) -> bool {
        let bucket = self.actuators.entry(actuator.kind).or_default();
        if bucket.contains_key(&actuator.actuator_id) {
            return false;
        }
        bucket.insert(actuator.actuator_id.clone(), actuator);
        true
    }

    pub fn sensor(&self, kind: SensorKind, sensor_id: &str) -> Option<&Sensor> {
        self.sensors.get(&kind)?.get(sensor_id)
    }

    pub fn sensor_mut(&mut self, kind: SensorKind, sensor_id: &str) -> Option<&mut Sensor> {
        self.sensors.get_mut(&kind)?.get_mut(sensor_id)
    }

    pub fn sensors(&self) -> impl Iterator<Item = &Sensor> {
        self.sensors.values().flat_map(|bucket| bucket.values())
    }

    pub fn sensors_mut(&mut self) -> impl Iterator<Item = &mut Sensor> {
        self.sensors.values_mut().flat_map(|bucket| bucket.values_mut())
    }

    pub fn sensors_of_mut(&mut self, kind: SensorKind) -> impl Iterator<Item = &mut Sensor> {
        self.sensors
            .get_mut(&kind)
            .into_iter()
            .flat_map(|bucket| bucket.values_mut())
    }

    pub fn actuators(&self) -> impl Iterator<Item = &ActuatorSpec> {
        self.actuators.values().flat_map(|bucket| bucket.values())
    }

    /// Mean of every `kind` sensor that has reported; `None` when none has.
    pub fn average(&self, kind: SensorKind) -> Option<f64> {
        let values: Vec<f64> = self
            .sensors
            .get(&kind)?
            .values()
            .filter_map(|s| s.value)
            .collect();
        if values.is_empty() {
            return None;
        }
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Zone {
    pub zone_id: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub fields: HashMap<String, Field>,
}

impl Zone {
    /// Build a zone from its document.  Entries with an unknown type,
    /// inverted bounds or a duplicate id are skipped with a warning; they
    /// never fail the whole zone.
    pub fn from_doc(doc: &ZoneDoc) -> Self {
        let mut zone = Zone {
            zone_id: doc.zone_id.clone(),
            latitude: doc.latitude,
            longitude: doc.longitude,
            fields: HashMap::new(),
        };

        for fd in &doc.fields {
            if zone.fields.contains_key(&fd.field_id) {
                warn!(zone = %doc.zone_id, field = %fd.field_id, "duplicate field id, keeping first");
                continue;
            }
            let field = zone.build_field(fd);
            zone.fields.insert(field.field_id.clone(), field);
        }

        zone
    }

    fn build_field(&self, fd: &FieldDoc) -> Field {
        let mut field = Field::new(&fd.field_id, &self.zone_id);
        field.latitude = fd.latitude.or(self.latitude);
        field.longitude = fd.longitude.or(self.longitude);
        field.moisture_threshold = fd.moisture_threshold;
        field.area = fd.area.unwrap_or(DEFAULT_AREA_M2);
        field.soil_depth = fd.soil_depth.unwrap_or(DEFAULT_SOIL_DEPTH_M);

        for sd in &fd.sensors {
            let kind = match sd.sensor_type.parse::<SensorKind>() {
                Ok(k) => k,
                Err(e) => {
                    warn!(zone = %self.zone_id, field = %fd.field_id, sensor = %sd.sensor_id, "skipping sensor: {e}");
                    continue;
                }
            };
            let (dmin, dmax) = kind.default_bounds();
            let bounds = (sd.min_value.unwrap_or(dmin), sd.max_value.unwrap_or(dmax));
            let Some(mut sensor) =
                Sensor::new(&sd.sensor_id, kind, bounds, &self.zone_id, &fd.field_id)
            else {
                warn!(zone = %self.zone_id, field = %fd.field_id, sensor = %sd.sensor_id, ?bounds, "skipping sensor: invalid bounds");
                continue;
            };
            if let Some(v) = sd.value.filter(|v| v.is_finite()) {
                sensor.set_value(v);
            }
            if !field.add_sensor(sensor) {
                warn!(zone = %self.zone_id, field = %fd.field_id, sensor = %sd.sensor_id, "duplicate sensor id, keeping first");
            }
        }

        for ad in &fd.actuators {
            let kind = match ad.actuator_type.parse::<ActuatorKind>() {
                Ok(k) => k,
                Err(e) => {
                    warn!(zone = %self.zone_id, field = %fd.field_id, actuator = %ad.actuator_id, "skipping actuator: {e}");
                    continue;
                }
            };
            let (dmin, dmax) = DEFAULT_POWER_BOUNDS;
            let spec = ActuatorSpec {
                actuator_id: ad.actuator_id.clone(),
                kind,
                zone_id: self.zone_id.clone(),
                field_id: fd.field_id.clone(),
                consumption: ad.consumption,
                measurement: ad.measurement.clone(),
                min_value: ad.min_value.unwrap_or(dmin),
                max_value: ad.max_value.unwrap_or(dmax),
            };
            if spec.min_value > spec.max_value {
                warn!(zone = %self.zone_id, field = %fd.field_id, actuator = %ad.actuator_id, "skipping actuator: min_value exceeds max_value");
                continue;
            }
            if !field.add_actuator(spec) {
                warn!(zone = %self.zone_id, field = %fd.field_id, actuator = %ad.actuator_id, "duplicate actuator id, keeping first");
            }
        }

        field
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("unknown zone '{0}'")]
    UnknownZone(String),
    #[error("unknown field '{field_id}' in zone '{zone_id}'")]
    UnknownField { zone_id: String, field_id: String },
    #[error("unknown {kind} sensor '{sensor_id}' in field '{field_id}'")]
    UnknownSensor {
        field_id: String,
        sensor_id: String,
        kind: SensorKind,
    },
    #[error("reading {0} is not a finite number")]
    NonFinite(f64),
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    zones: HashMap<String, Zone>,
}

impl Registry {
    pub fn from_docs(docs: &[ZoneDoc]) -> Self {
        let mut zones = HashMap::new();
        for doc in docs {
            if zones.contains_key(&doc.zone_id) {
                warn!(zone = %doc.zone_id, "duplicate zone id, keeping first");
                continue;
            }
            zones.insert(doc.zone_id.clone(), Zone::from_doc(doc));
        }
        Self { zones }
    }

    /// Add zones and fields that are not known yet.  Fields already in the
    /// registry keep their readings and threshold.  Returns how many fields
    /// were added.
    pub fn merge_docs(&mut self, docs: &[ZoneDoc]) -> usize {
        let mut added = 0;
        for doc in docs {
            let incoming = Zone::from_doc(doc);
            match self.zones.get_mut(&doc.zone_id) {
                None => {
                    added += incoming.fields.len();
                    self.zones.insert(doc.zone_id.clone(), incoming);
                }
                Some(zone) => {
                    for (field_id, field) in incoming.fields {
                        if let Entry::Vacant(slot) = zone.fields.entry(field_id) {
                            slot.insert(field);
                            added += 1;
                        }
                    }
                }
            }
        }
        added
    }

    pub fn is_empty(&self) -> bool {
        self.field_count() == 0
    }

    pub fn zones(&self) -> impl Iterator<Item = &Zone> {
        self.zones.values()
    }

    pub fn zones_mut(&mut self) -> impl Iterator<Item = &mut Zone> {
        self.zones.values_mut()
    }

    pub fn zone(&self, zone_id: &str) -> Option<&Zone> {
        self.zones.get(zone_id)
    }

    pub fn field(&self, zone_id: &str, field_id: &str) -> Result<&Field, RegistryError> {
        self.zones
            .get(zone_id)
            .ok_or_else(|| RegistryError::UnknownZone(zone_id.to_string()))?
            .fields
            .get(field_id)
            .ok_or_else(|| RegistryError::UnknownField {
                zone_id: zone_id.to_string(),
                field_id: field_id.to_string(),
            })
    }

    pub fn field_mut(&mut self, zone_id: &str, field_id: &str) -> Result<&mut Field, RegistryError> {
        self.zones
            .get_mut(zone_id)
            .ok_or_else(|| RegistryError::UnknownZone(zone_id.to_string()))?
            .fields
            .get_mut(field_id)
            .ok_or_else(|| RegistryError::UnknownField {
                zone_id: zone_id.to_string(),
                field_id: field_id.to_string(),
            })
    }

    /// Every `(zone_id, field_id)` pair, sorted for a stable sweep order.
    pub fn field_keys(&self) -> Vec<(String, String)> {
        let mut keys: Vec<(String, String)> = self
            .zones
            .values()
            .flat_map(|z| z.fields.keys().map(|f| (z.zone_id.clone(), f.clone())))
            .collect();
        keys.sort();
        keys
    }

    pub fn field_count(&self) -> usize {
        self.zones.values().map(|z| z.fields.len()).sum()
    }

    pub fn sensor_count(&self) -> usize {
        self.zones
            .values()
            .flat_map(|z| z.fields.values())
            .map(|f| f.sensors().count())
            .sum()
    }

    /// Store a telemetry value for a sensor, clamped into its bounds.
    ///
    /// With `register_unknown` an unknown sensor in a known field is created
    /// with its type's default bounds; unknown zones/fields always fail.
    pub fn record_reading(
        &mut self,
        zone_id: &str,
        field_id: &str,
        sensor_id: &str,
        kind: SensorKind,
        value: f64,
        register_unknown: bool,
    ) -> Result<f64, RegistryError> {
        if !value.is_finite() {
            return Err(RegistryError::NonFinite(value));
        }
        let field = self.field_mut(zone_id, field_id)?;

        if field.sensor(kind, sensor_id).is_none() {
            let created = register_unknown
                .then(|| Sensor::new(sensor_id, kind, kind.default_bounds(), zone_id, field_id))
                .flatten();
            match created {
                Some(sensor) => {
                    field.add_sensor(sensor);
                }
                None => {
                    return Err(RegistryError::UnknownSensor {
                        field_id: field_id.to_string(),
                        sensor_id: sensor_id.to_string(),
                        kind,
                    });
                }
            }
        }

        let sensor = field
            .sensor_mut(kind, sensor_id)
            .ok_or_else(|| RegistryError::UnknownSensor {
                field_id: field_id.to_string(),
                sensor_id: sensor_id.to_string(),
                kind,
            })?;
        Ok(sensor.set_value(value))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
