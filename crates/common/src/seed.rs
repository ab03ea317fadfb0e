//! TOML topology seed file: loading, validation, and first-run seeding of
//! the backend.

use crate::backend::BackendClient;
use crate::topology::{ActuatorKind, FieldDoc, SensorKind, ZoneDoc};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;

#[derive(Debug, Default, Deserialize)]
pub struct SeedFile {
    #[serde(default)]
    pub zones: Vec<ZoneDoc>,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn label(kind: &str, id: &str, index: usize) -> String {
    if id.trim().is_empty() {
        format!("{kind}[{index}]")
    } else {
        format!("{kind} '{id}'")
    }
}

fn check_coordinates(ctx: &str, lat: Option<f64>, lon: Option<f64>, errors: &mut Vec<String>) {
    if let Some(lat) = lat {
        if !(-90.0..=90.0).contains(&lat) {
            errors.push(format!("{ctx}: latitude {lat} out of range [-90, 90]"));
        }
    }
    if let Some(lon) = lon {
        if !(-180.0..=180.0).contains(&lon) {
            errors.push(format!("{ctx}: longitude {lon} out of range [-180, 180]"));
        }
    }
}

impl SeedFile {
    /// Validate every entry. Returns `Ok(())` or an error listing every
    /// violation found.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();
        let mut seen_zones: HashSet<&str> = HashSet::new();

        for (i, z) in self.zones.iter().enumerate() {
            let ctx = label("zone", &z.zone_id, i);
            if z.zone_id.trim().is_empty() {
                errors.push(format!("{ctx}: zone_id is empty"));
            } else if !seen_zones.insert(&z.zone_id) {
                errors.push(format!("{ctx}: duplicate zone_id"));
            }
            check_coordinates(&ctx, z.latitude, z.longitude, &mut errors);

            let mut seen_fields: HashSet<&str> = HashSet::new();
            for (j, f) in z.fields.iter().enumerate() {
                let fctx = format!("{ctx} {}", label("field", &f.field_id, j));
                if f.field_id.trim().is_empty() {
                    errors.push(format!("{fctx}: field_id is empty"));
                } else if !seen_fields.insert(&f.field_id) {
                    errors.push(format!("{fctx}: duplicate field_id"));
                }
                validate_field(&fctx, f, &mut errors);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "seed validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }
}

fn validate_field(ctx: &str, f: &FieldDoc, errors: &mut Vec<String>) {
    check_coordinates(ctx, f.latitude, f.longitude, errors);
    if let Some(area) = f.area {
        if !(area > 0.0) {
            errors.push(format!("{ctx}: area must be positive, got {area}"));
        }
    }
    if let Some(depth) = f.soil_depth {
        if !(depth > 0.0) {
            errors.push(format!("{ctx}: soil_depth must be positive, got {depth}"));
        }
    }

    let mut seen: HashSet<(SensorKind, &str)> = HashSet::new();
    for (k, s) in f.sensors.iter().enumerate() {
        let sctx = format!("{ctx} {}", label("sensor", &s.sensor_id, k));
        if s.sensor_id.trim().is_empty() {
            errors.push(format!("{sctx}: sensor_id is empty"));
        }
        let kind = match s.sensor_type.parse::<SensorKind>() {
            Ok(kind) => kind,
            Err(e) => {
                errors.push(format!("{sctx}: {e}"));
                continue;
            }
        };
        if !s.sensor_id.trim().is_empty() && !seen.insert((kind, s.sensor_id.as_str())) {
            errors.push(format!("{sctx}: duplicate sensor_id for type {kind}"));
        }

        let (dmin, dmax) = kind.default_bounds();
        let min = s.min_value.unwrap_or(dmin);
        let max = s.max_value.unwrap_or(dmax);
        if min >= max {
            errors.push(format!("{sctx}: min_value ({min}) must be less than max_value ({max})"));
        } else if let Some(v) = s.value {
            if !(min..=max).contains(&v) {
                errors.push(format!("{sctx}: value {v} outside [{min}, {max}]"));
            }
        }
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for (k, a) in f.actuators.iter().enumerate() {
        let actx = format!("{ctx} {}", label("actuator", &a.actuator_id, k));
        if a.actuator_id.trim().is_empty() {
            errors.push(format!("{actx}: actuator_id is empty"));
        } else if !seen.insert(&a.actuator_id) {
            errors.push(format!("{actx}: duplicate actuator_id"));
        }
        if let Err(e) = a.actuator_type.parse::<ActuatorKind>() {
            errors.push(format!("{actx}: {e}"));
        }
        if !(a.consumption > 0.0) {
            errors.push(format!(
                "{actx}: consumption must be positive, got {}",
                a.consumption
            ));
        }
        let min = a.min_value.unwrap_or(0.0);
        let max = a.max_value.unwrap_or(100.0);
        if min < 0.0 || min >= max {
            errors.push(format!(
                "{actx}: power bounds must satisfy 0 <= min_value < max_value, got [{min}, {max}]"
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML seed file.
pub fn load(path: &str) -> Result<SeedFile> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read seed file: {path}"))?;
    let seed: SeedFile =
        toml::from_str(&contents).with_context(|| format!("failed to parse seed file: {path}"))?;
    seed.validate()
        .with_context(|| format!("invalid seed file: {path}"))?;
    Ok(seed)
}

/// Push the seed topology to the backend unless it already holds zones.
/// Returns the number of zones created.
pub async fn apply(seed: &SeedFile, backend: &BackendClient) -> Result<usize> {
    let existing = backend
        .get_zones()
        .await
        .context("failed to list zones before seeding")?;
    if !existing.is_empty() {
        tracing::info!(zones = existing.len(), "backend already has a topology, skipping seed");
        return Ok(0);
    }

    for z in &seed.zones {
        let shell = ZoneDoc {
            fields: Vec::new(),
            ..z.clone()
        };
        backend
            .add_zone(&shell)
            .await
            .with_context(|| format!("failed to create zone '{}'", z.zone_id))?;
        for f in &z.fields {
            backend
                .add_field(&z.zone_id, f)
                .await
                .with_context(|| format!("failed to create field '{}/{}'", z.zone_id, f.field_id))?;
        }
    }

    tracing::info!(zones = seed.zones.len(), "seed topology applied");
    Ok(seed.zones.len())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
[[zones]]
zone_id = "z1"
latitude = 45.0
longitude = 9.0

[[zones.fields]]
field_id = "f1"
moisture_threshold = 30.0
area = 120.0
soil_depth = 0.3

[[zones.fields.sensors]]
sensor_id = "s1"
type = "soil_moisture"
value = 40.0
min_value = 0.0
max_value = 100.0

[[zones.fields.sensors]]
sensor_id = "s2"
type = "light"

[[zones.fields.actuators]]
actuator_id = "a1"
type = "sprinkler"
consumption = 60.0
"#;

    fn valid_seed() -> SeedFile {
        toml::from_str(VALID).unwrap()
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(seed: &SeedFile, needle: &str) {
        let err = seed.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_nested_tables() {
        let seed = valid_seed();
        assert_eq!(seed.zones.len(), 1);
        let f = &seed.zones[0].fields[0];
        assert_eq!(f.sensors.len(), 2);
        assert_eq!(f.sensors[1].sensor_type, "light");
        assert_eq!(f.actuators[0].measurement, "L/min");
    }

    #[test]
    fn parse_empty_seed() {
        let seed: SeedFile = toml::from_str("").unwrap();
        assert!(seed.zones.is_empty());
        seed.validate().unwrap();
    }

    #[test]
    fn valid_seed_passes() {
        valid_seed().validate().unwrap();
    }

    // -- Identity ---------------------------------------------------------

    #[test]
    fn duplicate_zone_rejected() {
        let mut seed = valid_seed();
        let dup = seed.zones[0].clone();
        seed.zones.push(dup);
        assert_validation_err(&seed, "duplicate zone_id");
    }

    #[test]
    fn empty_field_id_rejected() {
        let mut seed = valid_seed();
        seed.zones[0].fields[0].field_id = " ".into();
        assert_validation_err(&seed, "field_id is empty");
    }

    #[test]
    fn same_sensor_id_in_different_types_allowed() {
        let mut seed = valid_seed();
        seed.zones[0].fields[0].sensors[1].sensor_id = "s1".into();
        seed.validate().unwrap();
    }

    #[test]
    fn duplicate_sensor_in_same_type_rejected() {
        let mut seed = valid_seed();
        let dup = seed.zones[0].fields[0].sensors[0].clone();
        seed.zones[0].fields[0].sensors.push(dup);
        assert_validation_err(&seed, "duplicate sensor_id");
    }

    #[test]
    fn unknown_sensor_type_rejected() {
        let mut seed = valid_seed();
        seed.zones[0].fields[0].sensors[0].sensor_type = "ph".into();
        assert_validation_err(&seed, "unknown sensor type 'ph'");
    }

    // -- Bounds -----------------------------------------------------------

    #[test]
    fn inverted_sensor_bounds_rejected() {
        let mut seed = valid_seed();
        seed.zones[0].fields[0].sensors[0].min_value = Some(100.0);
        seed.zones[0].fields[0].sensors[0].max_value = Some(0.0);
        assert_validation_err(&seed, "must be less than max_value");
    }

    #[test]
    fn initial_value_outside_bounds_rejected() {
        let mut seed = valid_seed();
        seed.zones[0].fields[0].sensors[0].value = Some(120.0);
        assert_validation_err(&seed, "value 120 outside");
    }

    #[test]
    fn zero_consumption_rejected() {
        let mut seed = valid_seed();
        seed.zones[0].fields[0].actuators[0].consumption = 0.0;
        assert_validation_err(&seed, "consumption must be positive");
    }

    #[test]
    fn negative_power_min_rejected() {
        let mut seed = valid_seed();
        seed.zones[0].fields[0].actuators[0].min_value = Some(-5.0);
        assert_validation_err(&seed, "power bounds");
    }

    #[test]
    fn non_positive_area_rejected() {
        let mut seed = valid_seed();
        seed.zones[0].fields[0].area = Some(0.0);
        assert_validation_err(&seed, "area must be positive");
    }

    #[test]
    fn latitude_out_of_range_rejected() {
        let mut seed = valid_seed();
        seed.zones[0].latitude = Some(91.0);
        assert_validation_err(&seed, "latitude 91 out of range");
    }

    // -- Multiple errors reported at once ---------------------------------

    #[test]
    fn multiple_errors_collected() {
        let mut seed = valid_seed();
        seed.zones[0].longitude = Some(200.0);
        seed.zones[0].fields[0].soil_depth = Some(-1.0);
        seed.zones[0].fields[0].actuators[0].actuator_type = "hose".into();
        let msg = format!("{:#}", seed.validate().unwrap_err());
        assert!(msg.contains("3 errors"), "{msg}");
        assert!(msg.contains("longitude"));
        assert!(msg.contains("soil_depth"));
        assert!(msg.contains("unknown actuator type"));
    }

    // -- Load -------------------------------------------------------------

    #[test]
    fn load_missing_file_fails() {
        let err = load("/nonexistent/seed.toml").unwrap_err();
        assert!(format!("{err:#}").contains("failed to read seed file"));
    }

    #[test]
    fn load_reads_and_validates() {
        let path = std::env::temp_dir().join(format!("irrigation-seed-{}.toml", std::process::id()));
        std::fs::write(&path, VALID).unwrap();
        let seed = load(path.to_str().unwrap()).unwrap();
        assert_eq!(seed.zones[0].zone_id, "z1");
        std::fs::remove_file(&path).ok();
    }

    // -- Apply ------------------------------------------------------------

    mod apply_backend {
        use super::*;
        use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
        use serde_json::Value;
        use std::sync::{Arc, Mutex};
        use std::time::Duration;

        type Calls = Arc<Mutex<Vec<String>>>;

        async fn spawn(existing: Vec<Value>, calls: Calls) -> BackendClient {
            let zones = Arc::new(existing);
            let list = {
                let zones = zones.clone();
                move || {
                    let zones = zones.clone();
                    async move { Json((*zones).clone()) }
                }
            };
            let app = Router::new()
                .route(
                    "/zones",
                    get(list).post(|State(c): State<Calls>, Json(z): Json<Value>| async move {
                        c.lock().unwrap().push(format!("zone:{}", z["zone_id"].as_str().unwrap_or("")));
                        StatusCode::CREATED
                    }),
                )
                .route(
                    "/zones/{id}/fields",
                    axum::routing::post(
                        |State(c): State<Calls>,
                         axum::extract::Path(id): axum::extract::Path<String>,
                         Json(f): Json<Value>| async move {
                            c.lock()
                                .unwrap()
                                .push(format!("field:{id}/{}", f["field_id"].as_str().unwrap_or("")));
                            StatusCode::CREATED
                        },
                    ),
                )
                .with_state(calls);
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });
            BackendClient::new(&format!("http://{addr}"), Duration::from_secs(5)).unwrap()
        }

        #[tokio::test]
        async fn seeds_empty_backend() {
            let calls = Calls::default();
            let backend = spawn(vec![], calls.clone()).await;
            let created = apply(&valid_seed(), &backend).await.unwrap();
            assert_eq!(created, 1);
            assert_eq!(*calls.lock().unwrap(), vec!["zone:z1", "field:z1/f1"]);
        }

        #[tokio::test]
        async fn skips_populated_backend() {
            let calls = Calls::default();
            let existing = vec![serde_json::json!({"zone_id": "other", "fields": []})];
            let backend = spawn(existing, calls.clone()).await;
            let created = apply(&valid_seed(), &backend).await.unwrap();
            assert_eq!(created, 0);
            assert!(calls.lock().unwrap().is_empty());
        }
    }
}
