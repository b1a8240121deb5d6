//! Dosing controllers: hold a measured value inside a target band by
//! pulsing chemical pumps, one per direction.
//!
//! Direction semantics: for pH, "up" is the base pump and "down" the acid
//! pump; for ORP, "up" is oxidizer and "down" reducer; for EC, "up" is
//! nutrient concentrate and "down" top-up water.
//!
//! Each direction runs a three-state machine IDLE → DOSING → COOLDOWN.
//! A dose is a single arbiter pulse; the cooldown starts at dose time and
//! gates the next dose in the same direction. Consecutive doses in one
//! direction saturate at `daily_max_doses`, disabling that direction for
//! 24 hours.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::time::Duration;

use super::{ActionLogEntry, ArbiterOp, Controller, ProcessCtx, ProcessOutcome};
use crate::db::ControllerRecord;
use crate::error::{Error, Result};
use crate::store::MeasurementKind;

fn default_dose_duration_ms() -> u64 {
    1000
}

fn default_cooldown_seconds() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub target: f64,
    pub tolerance: f64,
    pub dose_pump_pin_up: u8,
    pub dose_pump_pin_down: u8,
    #[serde(default = "default_dose_duration_ms")]
    pub dose_duration_ms: u64,
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
    #[serde(default)]
    pub daily_max_doses: Option<u32>,
}

pub fn validate(config: &serde_json::Value, declared_pins: &[u8]) -> Result<()> {
    let cfg: Config = serde_json::from_value(config.clone())
        .map_err(|e| Error::config("config", e.to_string()))?;
    if cfg.tolerance < 0.0 {
        return Err(Error::config("tolerance", "must be non-negative"));
    }
    if cfg.dose_pump_pin_up == cfg.dose_pump_pin_down {
        return Err(Error::config(
            "dose_pump_pin_down",
            "up and down pumps must use distinct pins",
        ));
    }
    for pin in [cfg.dose_pump_pin_up, cfg.dose_pump_pin_down] {
        if !declared_pins.contains(&pin) {
            return Err(Error::config(
                "dose_pump_pin",
                format!("pin {pin} not in declared output pool"),
            ));
        }
    }
    Ok(())
}

pub fn open_ph(record: &ControllerRecord) -> Result<Box<dyn Controller>> {
    open(record, MeasurementKind::Ph)
}

pub fn open_orp(record: &ControllerRecord) -> Result<Box<dyn Controller>> {
    open(record, MeasurementKind::Orp)
}

pub fn open_ec(record: &ControllerRecord) -> Result<Box<dyn Controller>> {
    open(record, MeasurementKind::Ec)
}

fn open(record: &ControllerRecord, kind: MeasurementKind) -> Result<Box<dyn Controller>> {
    let config: Config = serde_json::from_str(&record.config)?;
    Ok(Box::new(Dosing::new(kind, config)))
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

impl Direction {
    fn action(&self) -> &'static str {
        match self {
            Self::Up => "dose_up",
            Self::Down => "dose_down",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DoseState {
    Idle,
    Dosing,
    Cooldown,
}

#[derive(Debug, Default)]
struct DirState {
    /// End of the in-flight pulse.
    dosing_until: Option<DateTime<Utc>>,
    /// End of the cooldown that started with the last dose.
    blocked_until: Option<DateTime<Utc>>,
    /// Consecutive doses without the reading returning in-band.
    consecutive: u32,
    saturated_until: Option<DateTime<Utc>>,
}

impl DirState {
    fn state(&self, now: DateTime<Utc>) -> DoseState {
        if self.dosing_until.is_some_and(|t| now < t) {
            DoseState::Dosing
        } else if self.blocked_until.is_some_and(|t| now < t) {
            DoseState::Cooldown
        } else {
            DoseState::Idle
        }
    }

    fn saturated(&self, now: DateTime<Utc>) -> bool {
        self.saturated_until.is_some_and(|t| now < t)
    }
}

pub struct Dosing {
    kind: MeasurementKind,
    config: Config,
    up: DirState,
    down: DirState,
}

impl Dosing {
    pub fn new(kind: MeasurementKind, config: Config) -> Self {
        Self {
            kind,
            config,
            up: DirState::default(),
            down: DirState::default(),
        }
    }

    fn dose(&mut self, direction: Direction, value: f64, now: DateTime<Utc>) -> ProcessOutcome {
        let config = self.config.clone();
        let kind = self.kind;
        let dir_state = match direction {
            Direction::Up => &mut self.up,
            Direction::Down => &mut self.down,
        };

        dir_state.dosing_until =
            Some(now + ChronoDuration::milliseconds(config.dose_duration_ms as i64));
        dir_state.blocked_until = Some(now + ChronoDuration::seconds(config.cooldown_seconds as i64));
        dir_state.consecutive += 1;

        let pin = match direction {
            Direction::Up => config.dose_pump_pin_up,
            Direction::Down => config.dose_pump_pin_down,
        };

        let mut outcome = ProcessOutcome {
            ops: vec![ArbiterOp::Pulse {
                pin,
                duration: Duration::from_millis(config.dose_duration_ms),
            }],
            log: vec![ActionLogEntry {
                action: direction.action().into(),
                details: serde_json::json!({
                    "kind": kind.as_str(),
                    "value": value,
                    "target": config.target,
                    "dose_duration_ms": config.dose_duration_ms,
                }),
            }],
        };

        if let Some(max) = config.daily_max_doses {
            if dir_state.consecutive >= max {
                dir_state.saturated_until = Some(now + ChronoDuration::hours(24));
                outcome.log.push(ActionLogEntry {
                    action: "dose_saturation".into(),
                    details: serde_json::json!({
                        "direction": direction.action(),
                        "doses": dir_state.consecutive,
                    }),
                });
            }
        }
        outcome
    }
}

impl Controller for Dosing {
    fn actuator_pins(&self) -> Vec<u8> {
        vec![self.config.dose_pump_pin_up, self.config.dose_pump_pin_down]
    }

    fn process(&mut self, ctx: &ProcessCtx) -> Result<ProcessOutcome> {
        let Some(reading) = ctx.readings.get("reading") else {
            return Ok(ProcessOutcome::default());
        };

        let age_ms = ctx.now.timestamp_millis() - reading.ts;
        if age_ms > 3 * ctx.update_interval * 1000 {
            return Ok(ProcessOutcome {
                ops: vec![],
                log: vec![ActionLogEntry {
                    action: "stale_reading".into(),
                    details: serde_json::json!({
                        "kind": self.kind.as_str(),
                        "age_ms": age_ms,
                    }),
                }],
            });
        }

        let x = reading.value;
        let (target, tolerance) = (self.config.target, self.config.tolerance);

        if (x - target).abs() <= tolerance {
            self.up.consecutive = 0;
            self.down.consecutive = 0;
            return Ok(ProcessOutcome::default());
        }

        let direction = if x < target - tolerance {
            Direction::Up
        } else {
            Direction::Down
        };
        let dir_state = match direction {
            Direction::Up => &self.up,
            Direction::Down => &self.down,
        };

        if dir_state.state(ctx.now) != DoseState::Idle {
            return Ok(ProcessOutcome::default());
        }
        if dir_state.saturated(ctx.now) {
            return Ok(ProcessOutcome::default());
        }

        Ok(self.dose(direction, x, ctx.now))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Measurement;
    use std::collections::HashMap;

    fn config() -> Config {
        Config {
            target: 6.0,
            tolerance: 0.2,
            dose_pump_pin_up: 5,
            dose_pump_pin_down: 6,
            dose_duration_ms: 500,
            cooldown_seconds: 60,
            daily_max_doses: None,
        }
    }

    fn reading(value: f64, ts_ms: i64) -> HashMap<&'static str, Measurement> {
        let mut map = HashMap::new();
        map.insert(
            "reading",
            Measurement {
                sensor_id: 1,
                ts: ts_ms,
                kind: MeasurementKind::Ph,
                value,
                unit: "pH".into(),
                raw: None,
            },
        );
        map
    }

    fn step(
        dosing: &mut Dosing,
        value: f64,
        at_secs: i64,
        base: DateTime<Utc>,
    ) -> ProcessOutcome {
        let now = base + ChronoDuration::seconds(at_secs);
        let readings = reading(value, now.timestamp_millis());
        let ctx = ProcessCtx {
            now,
            readings: &readings,
            update_interval: 10,
        };
        dosing.process(&ctx).unwrap()
    }

    fn base_time() -> DateTime<Utc> {
        Utc::now()
    }

    // -- Band behaviour -------------------------------------------------------

    #[test]
    fn in_band_reading_is_idle() {
        let mut dosing = Dosing::new(MeasurementKind::Ph, config());
        let out = step(&mut dosing, 6.1, 0, base_time());
        assert!(out.ops.is_empty());
        assert!(out.log.is_empty());
    }

    #[test]
    fn band_edges_are_inclusive() {
        let mut dosing = Dosing::new(MeasurementKind::Ph, config());
        assert!(step(&mut dosing, 5.8, 0, base_time()).ops.is_empty());
        assert!(step(&mut dosing, 6.2, 1, base_time()).ops.is_empty());
    }

    #[test]
    fn below_band_doses_up() {
        let mut dosing = Dosing::new(MeasurementKind::Ph, config());
        let out = step(&mut dosing, 5.5, 0, base_time());

        assert_eq!(
            out.ops,
            vec![ArbiterOp::Pulse {
                pin: 5,
                duration: Duration::from_millis(500)
            }]
        );
        assert_eq!(out.log[0].action, "dose_up");
        assert_eq!(out.log[0].details["target"], 6.0);
    }

    #[test]
    fn above_band_doses_down() {
        let mut dosing = Dosing::new(MeasurementKind::Ph, config());
        let out = step(&mut dosing, 6.5, 0, base_time());
        assert_eq!(
            out.ops,
            vec![ArbiterOp::Pulse {
                pin: 6,
                duration: Duration::from_millis(500)
            }]
        );
        assert_eq!(out.log[0].action, "dose_down");
    }

    // -- Cooldown -------------------------------------------------------------

    #[test]
    fn cooldown_gates_repeat_doses() {
        // Readings at t = 0, 10, 20, 70 s: dose, quiet, quiet, dose.
        let base = base_time();
        let mut dosing = Dosing::new(MeasurementKind::Ph, config());

        let out = step(&mut dosing, 5.5, 0, base);
        assert_eq!(out.log[0].action, "dose_up");

        assert!(step(&mut dosing, 5.6, 10, base).ops.is_empty());
        assert!(step(&mut dosing, 5.7, 20, base).ops.is_empty());

        let out = step(&mut dosing, 5.7, 70, base);
        assert_eq!(out.log[0].action, "dose_up", "cooldown expired");
    }

    #[test]
    fn directions_cool_down_independently() {
        let base = base_time();
        let mut dosing = Dosing::new(MeasurementKind::Ph, config());

        step(&mut dosing, 5.5, 0, base); // up dose, up now cooling
        let out = step(&mut dosing, 6.5, 10, base);
        assert_eq!(out.log[0].action, "dose_down", "down direction unaffected");
    }

    // -- Staleness ------------------------------------------------------------

    #[test]
    fn stale_reading_logs_and_skips() {
        let base = base_time();
        let mut dosing = Dosing::new(MeasurementKind::Ph, config());

        // Reading is 31 s old with a 10 s interval (3x = 30 s threshold).
        let now = base + ChronoDuration::seconds(100);
        let readings = reading(5.0, (now - ChronoDuration::seconds(31)).timestamp_millis());
        let ctx = ProcessCtx {
            now,
            readings: &readings,
            update_interval: 10,
        };
        let out = dosing.process(&ctx).unwrap();

        assert!(out.ops.is_empty());
        assert_eq!(out.log[0].action, "stale_reading");
    }

    #[test]
    fn missing_reading_is_quiet() {
        let mut dosing = Dosing::new(MeasurementKind::Ph, config());
        let readings = HashMap::new();
        let ctx = ProcessCtx {
            now: base_time(),
            readings: &readings,
            update_interval: 10,
        };
        let out = dosing.process(&ctx).unwrap();
        assert!(out.ops.is_empty());
        assert!(out.log.is_empty());
    }

    // -- Saturation -----------------------------------------------------------

    #[test]
    fn saturation_disables_direction_for_a_day() {
        let base = base_time();
        let mut cfg = config();
        cfg.daily_max_doses = Some(2);
        let mut dosing = Dosing::new(MeasurementKind::Ph, cfg);

        step(&mut dosing, 5.5, 0, base);
        let out = step(&mut dosing, 5.5, 70, base);
        assert!(
            out.log.iter().any(|e| e.action == "dose_saturation"),
            "second dose hits the cap"
        );

        // Third attempt after cooldown: direction is saturated.
        let out = step(&mut dosing, 5.5, 140, base);
        assert!(out.ops.is_empty());

        // A day later the direction works again.
        let out = step(&mut dosing, 5.5, 24 * 3600 + 200, base);
        assert_eq!(out.log[0].action, "dose_up");
    }

    #[test]
    fn in_band_resets_consecutive_counter() {
        let base = base_time();
        let mut cfg = config();
        cfg.daily_max_doses = Some(2);
        let mut dosing = Dosing::new(MeasurementKind::Ph, cfg);

        step(&mut dosing, 5.5, 0, base);
        step(&mut dosing, 6.0, 70, base); // back in band: counter resets
        let out = step(&mut dosing, 5.5, 140, base);
        assert_eq!(out.log.len(), 1, "no saturation after reset");
        assert_eq!(out.log[0].action, "dose_up");
    }

    // -- EC flavor ------------------------------------------------------------

    #[test]
    fn ec_dosing_reports_its_kind() {
        let base = base_time();
        let mut cfg = config();
        cfg.target = 1500.0;
        cfg.tolerance = 100.0;
        let mut dosing = Dosing::new(MeasurementKind::Ec, cfg);

        let now = base;
        let mut readings = HashMap::new();
        readings.insert(
            "reading",
            Measurement {
                sensor_id: 1,
                ts: now.timestamp_millis(),
                kind: MeasurementKind::Ec,
                value: 1300.0,
                unit: "µS/cm".into(),
                raw: None,
            },
        );
        let ctx = ProcessCtx {
            now,
            readings: &readings,
            update_interval: 10,
        };
        let out = dosing.process(&ctx).unwrap();
        // EC low: nutrient pump is the "up" direction.
        assert_eq!(out.log[0].action, "dose_up");
        assert_eq!(out.log[0].details["kind"], "ec");
    }

    // -- Validation -----------------------------------------------------------

    #[test]
    fn validate_needs_pins_in_pool() {
        let cfg = serde_json::json!({
            "target": 6.0, "tolerance": 0.2,
            "dose_pump_pin_up": 5, "dose_pump_pin_down": 6
        });
        validate(&cfg, &[5, 6]).unwrap();
        assert!(validate(&cfg, &[5]).is_err());
    }

    #[test]
    fn validate_rejects_shared_pin() {
        let cfg = serde_json::json!({
            "target": 6.0, "tolerance": 0.2,
            "dose_pump_pin_up": 5, "dose_pump_pin_down": 5
        });
        assert!(validate(&cfg, &[5]).is_err());
    }

    #[test]
    fn validate_rejects_unknown_fields() {
        let cfg = serde_json::json!({
            "target": 6.0, "tolerance": 0.2,
            "dose_pump_pin_up": 5, "dose_pump_pin_down": 6,
            "dose_seconds": 1
        });
        assert!(validate(&cfg, &[5, 6]).is_err());
    }

    #[test]
    fn validate_rejects_negative_tolerance() {
        let cfg = serde_json::json!({
            "target": 6.0, "tolerance": -0.1,
            "dose_pump_pin_up": 5, "dose_pump_pin_down": 6
        });
        assert!(validate(&cfg, &[5, 6]).is_err());
    }
}
