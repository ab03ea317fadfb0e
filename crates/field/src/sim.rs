//! Sensor value simulation for the field station.
//!
//! Every sensor follows a bounded random walk whose step size depends on its
//! type.  Soil-moisture sensors also respond to irrigation: while any
//! actuator of their field is running the walk is suspended, and each
//! consumption report raises the moisture through a simple infiltration
//! model instead.

use irrigation_common::messages::ActuatorStatus;
use irrigation_common::topology::{Field, Sensor, SensorKind};
use std::collections::{HashMap, HashSet};

// ---------------------------------------------------------------------------
// Random walk
// ---------------------------------------------------------------------------

/// Uniform step in `[-delta, +delta]` for a sensor of `kind`.
pub fn walk_step(kind: SensorKind) -> f64 {
    (fastrand::f64() * 2.0 - 1.0) * kind.walk_delta()
}

/// Advance `sensor` one step.  A sensor without a value starts from the
/// middle of its bounds.
pub fn random_walk(sensor: &mut Sensor) -> f64 {
    let current = sensor.value.unwrap_or_else(|| sensor.midpoint());
    sensor.set_value(current + walk_step(sensor.kind))
}

/// Next published value for `sensor`.  Soil moisture holds still while its
/// field is being irrigated; the feedback path moves it instead.
pub fn next_value(sensor: &mut Sensor, field_irrigating: bool) -> f64 {
    match sensor.kind {
        SensorKind::SoilMoisture if field_irrigating => {
            let current = sensor.value.unwrap_or_else(|| sensor.midpoint());
            sensor.set_value(current)
        }
        _ => random_walk(sensor),
    }
}

// ---------------------------------------------------------------------------
// Irrigation feedback
// ---------------------------------------------------------------------------

/// Moisture gain from `liters_per_minute` of water spread over a field of
/// `area_m2` with a root zone `soil_depth_m` deep.
pub fn infiltration_gain(
    liters_per_minute: f64,
    efficiency: f64,
    area_m2: f64,
    soil_depth_m: f64,
) -> f64 {
    let soil_volume = area_m2 * soil_depth_m;
    if !(soil_volume > 0.0) || !liters_per_minute.is_finite() {
        return 0.0;
    }
    (liters_per_minute * 0.001 * efficiency) / soil_volume
}

/// Apply one consumption report (volume per second) to every soil-moisture
/// sensor of `field`.  Returns how many sensors moved.
pub fn apply_consumption(field: &mut Field, per_second: f64, efficiency: f64) -> usize {
    let gain = infiltration_gain(per_second * 60.0, efficiency, field.area, field.soil_depth);
    let mut touched = 0;
    for sensor in field.sensors_of_mut(SensorKind::SoilMoisture) {
        let current = sensor.value.unwrap_or_else(|| sensor.midpoint());
        sensor.set_value(current + gain);
        touched += 1;
    }
    touched
}

/// Which actuators are currently running, per field.
#[derive(Debug, Default)]
pub struct IrrigationTracker {
    running: HashMap<(String, String), HashSet<String>>,
}

impl IrrigationTracker {
    /// Record an actuator's reported status.  Returns whether the field is
    /// irrigating afterwards.
    pub fn update(
        &mut self,
        zone_id: &str,
        field_id: &str,
        actuator_id: &str,
        status: ActuatorStatus,
    ) -> bool {
        let key = (zone_id.to_string(), field_id.to_string());
        match status {
            ActuatorStatus::On => {
                self.running
                    .entry(key)
                    .or_default()
                    .insert(actuator_id.to_string());
                true
            }
            ActuatorStatus::Off => {
                if let Some(set) = self.running.get_mut(&key) {
                    set.remove(actuator_id);
                    if set.is_empty() {
                        self.running.remove(&key);
                    }
                }
                self.is_irrigating(zone_id, field_id)
            }
        }
    }

    pub fn is_irrigating(&self, zone_id: &str, field_id: &str) -> bool {
        self.running
            .get(&(zone_id.to_string(), field_id.to_string()))
            .is_some_and(|set| !set.is_empty())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sensor(kind: SensorKind, bounds: (f64, f64)) -> Sensor {
        Sensor::new("s1", kind, bounds, "z1", "f1").unwrap()
    }

    fn field_with_soil(values: &[f64]) -> Field {
        let mut field = Field::new("f1", "z1");
        field.area = 100.0;
        field.soil_depth = 0.3;
        for (i, v) in values.iter().enumerate() {
            let mut s = Sensor::new(&format!("s{i}"), SensorKind::SoilMoisture, (0.0, 100.0), "z1", "f1")
                .unwrap();
            s.set_value(*v);
            field.add_sensor(s);
        }
        field
    }

    // -- random walk ------------------------------------------------------

    #[test]
    fn readings_stay_within_bounds() {
        for kind in SensorKind::ALL {
            let mut s = sensor(kind, kind.default_bounds());
            for _ in 0..500 {
                let v = random_walk(&mut s);
                assert!(
                    (s.min_value..=s.max_value).contains(&v),
                    "{kind} out of range: {v}"
                );
            }
        }
    }

    #[test]
    fn steps_bounded_by_delta() {
        for kind in SensorKind::ALL {
            for _ in 0..200 {
                let step = walk_step(kind);
                assert!(step.abs() <= kind.walk_delta(), "{kind} step {step}");
            }
        }
    }

    #[test]
    fn consecutive_readings_are_close() {
        let mut s = sensor(SensorKind::Light, (0.0, 3000.0));
        s.set_value(1500.0);
        let mut prev = 1500.0;
        for _ in 0..100 {
            let v = random_walk(&mut s);
            assert!((v - prev).abs() <= 50.0 + 1e-9);
            prev = v;
        }
    }

    #[test]
    fn walk_starts_from_midpoint() {
        let mut s = sensor(SensorKind::Temperature, (-20.0, 60.0));
        let v = random_walk(&mut s);
        assert!((v - 20.0).abs() <= 1.0);
    }

    #[test]
    fn walk_clamps_at_edge() {
        let mut s = sensor(SensorKind::SoilMoisture, (0.0, 100.0));
        s.set_value(100.0);
        for _ in 0..50 {
            assert!(random_walk(&mut s) <= 100.0);
        }
    }

    // -- next_value -------------------------------------------------------

    #[test]
    fn soil_holds_still_while_irrigating() {
        let mut s = sensor(SensorKind::SoilMoisture, (0.0, 100.0));
        s.set_value(40.0);
        for _ in 0..20 {
            assert_eq!(next_value(&mut s, true), 40.0);
        }
    }

    #[test]
    fn other_kinds_keep_walking_while_irrigating() {
        let mut s = sensor(SensorKind::Humidity, (0.0, 100.0));
        s.set_value(50.0);
        let moved = (0..50).any(|_| next_value(&mut s, true) != 50.0);
        assert!(moved, "humidity should keep walking");
    }

    // -- infiltration -----------------------------------------------------

    #[test]
    fn infiltration_reference_values() {
        // 60 L/min over 100 m² x 0.3 m at 70% efficiency.
        let gain = infiltration_gain(60.0, 0.7, 100.0, 0.3);
        assert!((gain - 0.0014).abs() < 1e-12, "{gain}");
    }

    #[test]
    fn infiltration_zero_volume_is_noop() {
        assert_eq!(infiltration_gain(60.0, 0.7, 0.0, 0.3), 0.0);
        assert_eq!(infiltration_gain(60.0, 0.7, 100.0, 0.0), 0.0);
    }

    #[test]
    fn consumption_raises_all_soil_sensors() {
        let mut field = field_with_soil(&[20.0, 30.0]);
        let moved = apply_consumption(&mut field, 60.0, 0.7);
        assert_eq!(moved, 2);
        // 60 per second -> 3600 L/min -> 0.084 gain.
        let s0 = field.sensor(SensorKind::SoilMoisture, "s0").unwrap().value.unwrap();
        assert!((s0 - 20.084).abs() < 1e-9, "{s0}");
    }

    #[test]
    fn consumption_clamps_at_max() {
        let mut field = field_with_soil(&[99.99]);
        for _ in 0..10 {
            apply_consumption(&mut field, 60.0, 0.7);
        }
        let v = field.sensor(SensorKind::SoilMoisture, "s0").unwrap().value.unwrap();
        assert_eq!(v, 100.0);
    }

    #[test]
    fn final_zero_report_changes_nothing() {
        let mut field = field_with_soil(&[42.0]);
        apply_consumption(&mut field, 0.0, 0.7);
        let v = field.sensor(SensorKind::SoilMoisture, "s0").unwrap().value.unwrap();
        assert_eq!(v, 42.0);
    }

    // -- tracker ----------------------------------------------------------

    #[test]
    fn tracker_requires_all_actuators_off() {
        let mut t = IrrigationTracker::default();
        assert!(t.update("z1", "f1", "a1", ActuatorStatus::On));
        assert!(t.update("z1", "f1", "a2", ActuatorStatus::On));
        assert!(t.update("z1", "f1", "a1", ActuatorStatus::Off));
        assert!(!t.update("z1", "f1", "a2", ActuatorStatus::Off));
        assert!(!t.is_irrigating("z1", "f1"));
    }

    #[test]
    fn tracker_fields_are_independent() {
        let mut t = IrrigationTracker::default();
        t.update("z1", "f1", "a1", ActuatorStatus::On);
        assert!(t.is_irrigating("z1", "f1"));
        assert!(!t.is_irrigating("z1", "f2"));
    }

    #[test]
    fn tracker_off_for_unknown_is_harmless() {
        let mut t = IrrigationTracker::default();
        assert!(!t.update("z1", "f1", "ghost", ActuatorStatus::Off));
    }
}
