//! Controller framework: the controller trait, the compile-time registry
//! keyed by controller type, role resolution from bound sensors, and the
//! application of returned actions through the output arbiter.
//!
//! A controller never touches GPIO itself — `process` returns arbiter
//! operations, the framework checks them against the controller's declared
//! actuator pins and applies them. Interlock refusals are logged and
//! skipped; the controller keeps running.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::db::{now_ms, ControllerRecord, Db};
use crate::error::{Error, Result};
use crate::outputs::OutputArbiter;
use crate::store::{Measurement, MeasurementKind, MeasurementStore};

pub mod dosing;
pub mod pump_timer;

// ---------------------------------------------------------------------------
// Capability surface
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct RoleSpec {
    pub role: &'static str,
    pub kind: MeasurementKind,
    /// Required roles gate enabling; optional ones merely enrich.
    pub required: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ControllerInfo {
    pub tag: &'static str,
    pub summary: &'static str,
    pub roles: &'static [RoleSpec],
}

/// Everything a controller sees on one process step.
pub struct ProcessCtx<'a> {
    pub now: DateTime<Utc>,
    /// role name -> newest measurement from the bound sensor, if any.
    pub readings: &'a HashMap<&'static str, Measurement>,
    /// The controller's own update interval, for staleness checks.
    pub update_interval: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArbiterOp {
    Set { pin: u8, on: bool },
    Pulse { pin: u8, duration: Duration },
}

impl ArbiterOp {
    pub fn pin(&self) -> u8 {
        match self {
            Self::Set { pin, .. } | Self::Pulse { pin, .. } => *pin,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActionLogEntry {
    pub action: String,
    pub details: serde_json::Value,
}

#[derive(Debug, Default)]
pub struct ProcessOutcome {
    pub ops: Vec<ArbiterOp>,
    pub log: Vec<ActionLogEntry>,
}

pub trait Controller: Send {
    /// Pins this controller is allowed to operate. Ops on any other pin
    /// are rejected by the framework.
    fn actuator_pins(&self) -> Vec<u8>;

    fn process(&mut self, ctx: &ProcessCtx) -> Result<ProcessOutcome>;

    fn close(&mut self) {}
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

type OpenFn = fn(&ControllerRecord) -> Result<Box<dyn Controller>>;
/// Validation sees the declared output pin pool so configs referencing
/// unmanaged pins are rejected up front.
type ValidateFn = fn(&serde_json::Value, &[u8]) -> Result<()>;

pub struct ControllerSpec {
    pub info: ControllerInfo,
    pub open: OpenFn,
    pub validate: ValidateFn,
}

pub static REGISTRY: &[ControllerSpec] = &[
    ControllerSpec {
        info: ControllerInfo {
            tag: "ph_dosing",
            summary: "pH hold via base (up) and acid (down) pumps",
            roles: &[RoleSpec {
                role: "reading",
                kind: MeasurementKind::Ph,
                required: true,
            }],
        },
        open: dosing::open_ph,
        validate: dosing::validate,
    },
    ControllerSpec {
        info: ControllerInfo {
            tag: "orp_dosing",
            summary: "ORP hold via oxidizer (up) and reducer (down) pumps",
            roles: &[RoleSpec {
                role: "reading",
                kind: MeasurementKind::Orp,
                required: true,
            }],
        },
        open: dosing::open_orp,
        validate: dosing::validate,
    },
    ControllerSpec {
        info: ControllerInfo {
            tag: "ec_dosing",
            summary: "EC hold via nutrient (up) and top-up water (down) pumps",
            roles: &[RoleSpec {
                role: "reading",
                kind: MeasurementKind::Ec,
                required: true,
            }],
        },
        open: dosing::open_ec,
        validate: dosing::validate,
    },
    ControllerSpec {
        info: ControllerInfo {
            tag: "pump_timer",
            summary: "Daily circulation pump window with temperature-scaled runtime",
            roles: &[RoleSpec {
                role: "temperature",
                kind: MeasurementKind::Temperature,
                required: true,
            }],
        },
        open: pump_timer::open,
        validate: pump_timer::validate,
    },
];

pub fn controller_spec(tag: &str) -> Option<&'static ControllerSpec> {
    REGISTRY.iter().find(|spec| spec.info.tag == tag)
}

pub fn available_controllers() -> Vec<&'static str> {
    REGISTRY.iter().map(|spec| spec.info.tag).collect()
}

pub fn validate_config(tag: &str, config: &serde_json::Value, declared_pins: &[u8]) -> Result<()> {
    let spec = controller_spec(tag)
        .ok_or_else(|| Error::config("controller_type", format!("unknown type '{tag}'")))?;
    (spec.validate)(config, declared_pins)
}

pub fn open_controller(record: &ControllerRecord) -> Result<Box<dyn Controller>> {
    let spec = controller_spec(&record.controller_type).ok_or_else(|| {
        Error::config(
            "controller_type",
            format!("unknown type '{}'", record.controller_type),
        )
    })?;
    (spec.open)(record)
}

// ---------------------------------------------------------------------------
// Role resolution
// ---------------------------------------------------------------------------

/// Check that every required role is covered by a bound sensor whose
/// driver produces that measurement kind. Gates enabling a controller.
pub async fn validate_bindings(record: &ControllerRecord, db: &Db) -> Result<()> {
    let spec = controller_spec(&record.controller_type).ok_or_else(|| {
        Error::config(
            "controller_type",
            format!("unknown type '{}'", record.controller_type),
        )
    })?;
    let bound = db.bound_sensors(record.id).await?;
    for role in spec.info.roles.iter().filter(|r| r.required) {
        let covered = bound.iter().any(|s| sensor_produces(&s.driver, role.kind));
        if !covered {
            return Err(Error::config(
                "sensors",
                format!(
                    "role '{}' needs a bound sensor producing {}",
                    role.role, role.kind
                ),
            ));
        }
    }
    Ok(())
}

fn sensor_produces(driver_tag: &str, kind: MeasurementKind) -> bool {
    crate::sensor::driver_spec(driver_tag)
        .map(|spec| spec.info.outputs.iter().any(|(k, _)| *k == kind))
        .unwrap_or(false)
}

/// Map each declared role to the newest measurement of the right kind
/// among the controller's bound sensors.
pub async fn resolve_readings(
    record: &ControllerRecord,
    db: &Db,
    store: &MeasurementStore,
) -> Result<HashMap<&'static str, Measurement>> {
    let spec = controller_spec(&record.controller_type).ok_or_else(|| {
        Error::config(
            "controller_type",
            format!("unknown type '{}'", record.controller_type),
        )
    })?;
    let bound = db.bound_sensors(record.id).await?;

    let mut readings = HashMap::new();
    for role in spec.info.roles {
        let mut newest: Option<Measurement> = None;
        for sensor in bound.iter().filter(|s| sensor_produces(&s.driver, role.kind)) {
            // The latest cache holds the newest sample of any kind; for
            // multi-output sensors fall back to the per-kind scan.
            let candidate = match store.latest(sensor.id).await {
                Some(m) if m.kind == role.kind => Some(m),
                _ => store
                    .range(sensor.id, 0, i64::MAX, None)
                    .await
                    .into_iter()
                    .filter(|m| m.kind == role.kind)
                    .next_back(),
            };
            if let Some(m) = candidate {
                if newest.as_ref().is_none_or(|n| n.ts < m.ts) {
                    newest = Some(m);
                }
            }
        }
        if let Some(m) = newest {
            readings.insert(role.role, m);
        }
    }
    Ok(readings)
}

// ---------------------------------------------------------------------------
// Process step execution
// ---------------------------------------------------------------------------

/// One controller tick: resolve readings, run `process`, apply the ops
/// through the arbiter, persist log entries. Returns the persisted entries
/// (interlock refusals included).
pub async fn run_step(
    record: &ControllerRecord,
    controller: &mut dyn Controller,
    db: &Db,
    store: &MeasurementStore,
    arbiter: &Arc<OutputArbiter>,
) -> Result<Vec<ActionLogEntry>> {
    let readings = resolve_readings(record, db, store).await?;
    let ctx = ProcessCtx {
        now: Utc::now(),
        readings: &readings,
        update_interval: record.update_interval,
    };

    let outcome = controller.process(&ctx)?;

    let declared = controller.actuator_pins();
    let mut entries = outcome.log;
    for op in outcome.ops {
        if !declared.contains(&op.pin()) {
            return Err(Error::config(
                "actuator_pins",
                format!("operation on undeclared pin {}", op.pin()),
            ));
        }
        let applied = match op {
            ArbiterOp::Set { pin, on } => arbiter.set(pin, on).map(|_| ()),
            ArbiterOp::Pulse { pin, duration } => arbiter.pulse(pin, duration).map(|_| ()),
        };
        if let Err(Error::Safety(reason)) = applied {
            warn!(
                controller = %record.name,
                %reason,
                "arbiter refused controller operation"
            );
            entries.push(ActionLogEntry {
                action: "interlock_refused".into(),
                details: serde_json::json!({ "reason": reason }),
            });
        } else {
            applied?;
        }
    }

    let ts = now_ms();
    for entry in &entries {
        db.insert_action(record.id, ts, &entry.action, &entry.details.to_string())
            .await?;
    }
    Ok(entries)
}

// ===========================================================================
// Tests
// ===========================================================================
