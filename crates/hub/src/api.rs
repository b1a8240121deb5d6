//! Service-layer operations behind the HTTP surface: sensor and
//! controller CRUD, calibration, outputs, and system control.
//!
//! All validation lives here — the web layer only translates HTTP to
//! these calls. Mutations take the same per-entity locks the scheduler
//! runs entities under, and every mutating operation is idempotent when
//! its inputs reproduce the current state.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::calibration::{CalPoint, Calibration};
use crate::controller;
use crate::db::{now_ms, ControllerFields, ControllerRecord, SensorFields, SensorRecord};
use crate::error::{Error, Result};
use crate::events::{EventKind, SystemEvent};
use crate::outputs::PinStatus;
use crate::scheduler::{EntityKind, Runtime};
use crate::sensor;
use crate::store::Measurement;

// ---------------------------------------------------------------------------
// Inputs & views
// ---------------------------------------------------------------------------

fn default_enabled() -> bool {
    true
}

fn default_interval() -> i64 {
    60
}

fn default_config() -> serde_json::Value {
    serde_json::json!({})
}

#[derive(Debug, Clone, Deserialize)]
pub struct SensorInput {
    pub name: String,
    pub driver: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_interval")]
    pub update_interval: i64,
    #[serde(default = "default_config")]
    pub config: serde_json::Value,
    #[serde(default)]
    pub calibration: Vec<CalPoint>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControllerInput {
    pub name: String,
    pub controller_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_interval")]
    pub update_interval: i64,
    #[serde(default = "default_config")]
    pub config: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct SensorView {
    pub id: i64,
    pub name: String,
    pub driver: String,
    pub description: String,
    pub enabled: bool,
    pub update_interval: i64,
    pub config: serde_json::Value,
    pub calibration: Vec<CalPoint>,
    pub last_measurement_at: Option<i64>,
    /// Present while the sensor is FAULTED; cleared by a config update.
    pub fault: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ControllerView {
    pub id: i64,
    pub name: String,
    pub controller_type: String,
    pub description: String,
    pub enabled: bool,
    pub update_interval: i64,
    pub config: serde_json::Value,
    pub last_run_at: Option<i64>,
    pub fault: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub running: bool,
    pub last_tick_ms: i64,
    pub sensor_count: usize,
    pub controller_count: usize,
    pub outputs: Vec<PinStatus>,
    pub events: Vec<SystemEvent>,
}

fn sensor_view(runtime: &Runtime, record: SensorRecord) -> SensorView {
    let fault = runtime
        .fault_for((EntityKind::Sensor, record.id))
        .map(|f| f.message);
    SensorView {
        id: record.id,
        config: serde_json::from_str(&record.config).unwrap_or_default(),
        calibration: Calibration::from_json(&record.calibration)
            .map(|c| c.points().to_vec())
            .unwrap_or_default(),
        name: record.name,
        driver: record.driver,
        description: record.description,
        enabled: record.enabled,
        update_interval: record.update_interval,
        last_measurement_at: record.last_measurement_at,
        fault,
    }
}

fn controller_view(runtime: &Runtime, record: ControllerRecord) -> ControllerView {
    let fault = runtime
        .fault_for((EntityKind::Controller, record.id))
        .map(|f| f.message);
    ControllerView {
        id: record.id,
        config: serde_json::from_str(&record.config).unwrap_or_default(),
        name: record.name,
        controller_type: record.controller_type,
        description: record.description,
        enabled: record.enabled,
        update_interval: record.update_interval,
        last_run_at: record.last_run_at,
        fault,
    }
}

// ---------------------------------------------------------------------------
// Sensors
// ---------------------------------------------------------------------------

fn sensor_fields(input: &SensorInput) -> Result<SensorFields> {
    if input.name.trim().is_empty() {
        return Err(Error::config("name", "must not be empty"));
    }
    if input.update_interval < 1 {
        return Err(Error::config("update_interval", "must be >= 1 second"));
    }
    sensor::validate_config(&input.driver, &input.config)?;
    let mut calibration = Calibration::new();
    for p in &input.calibration {
        calibration.add_point(p.raw, p.real);
    }
    Ok(SensorFields {
        name: input.name.clone(),
        driver: input.driver.clone(),
        description: input.description.clone(),
        enabled: input.enabled,
        update_interval: input.update_interval,
        config: input.config.to_string(),
        calibration: calibration.to_json(),
    })
}

pub fn available_drivers() -> Vec<&'static str> {
    sensor::available_drivers()
}

pub async fn list_sensors(runtime: &Runtime) -> Result<Vec<SensorView>> {
    let records = runtime.db.list_sensors().await?;
    Ok(records
        .into_iter()
        .map(|r| sensor_view(runtime, r))
        .collect())
}

pub async fn get_sensor(runtime: &Runtime, id: i64) -> Result<Option<SensorView>> {
    Ok(runtime
        .db
        .get_sensor(id)
        .await?
        .map(|r| sensor_view(runtime, r)))
}

pub async fn create_sensor(runtime: &Runtime, input: &SensorInput) -> Result<SensorView> {
    let fields = sensor_fields(input)?;
    let record = runtime.db.create_sensor(&fields).await?;
    runtime.record_event(EventKind::System, format!("sensor '{}' created", record.name));
    runtime.wake.notify_one();
    Ok(sensor_view(runtime, record))
}

/// Atomic replace. A payload identical to the current state is a no-op
/// (the record's revision does not move).
pub async fn update_sensor(
    runtime: &Runtime,
    id: i64,
    input: &SensorInput,
) -> Result<Option<SensorView>> {
    let fields = sensor_fields(input)?;
    let lock = runtime.entity_lock((EntityKind::Sensor, id));
    let _guard = lock.lock().await;

    let Some(current) = runtime.db.get_sensor(id).await? else {
        return Ok(None);
    };
    let unchanged = current.name == fields.name
        && current.driver == fields.driver
        && current.description == fields.description
        && current.enabled == fields.enabled
        && current.update_interval == fields.update_interval
        && current.config == fields.config
        && current.calibration == fields.calibration;
    if unchanged {
        return Ok(Some(sensor_view(runtime, current)));
    }

    let updated = runtime.db.update_sensor(id, &fields).await?;
    if updated.is_some() {
        runtime.evict_sensor(id).await;
        runtime.clear_fault((EntityKind::Sensor, id));
        runtime.wake.notify_one();
    }
    Ok(updated.map(|r| sensor_view(runtime, r)))
}

/// Deleting a sensor purges its measurements with it.
pub async fn delete_sensor(runtime: &Runtime, id: i64) -> Result<bool> {
    let lock = runtime.entity_lock((EntityKind::Sensor, id));
    let _guard = lock.lock().await;

    let deleted = runtime.db.delete_sensor(id).await?;
    if deleted {
        runtime.store.purge(id).await?;
        runtime.evict_sensor(id).await;
        runtime.clear_fault((EntityKind::Sensor, id));
        runtime.record_event(EventKind::System, format!("sensor {id} deleted"));
    }
    Ok(deleted)
}

pub async fn sensor_measurements(
    runtime: &Runtime,
    id: i64,
    t_start: i64,
    t_end: i64,
    limit: Option<usize>,
) -> Result<Vec<Measurement>> {
    if runtime.db.get_sensor(id).await?.is_none() {
        return Err(Error::config("sensor_id", format!("no sensor {id}")));
    }
    Ok(runtime.store.range(id, t_start, t_end, limit).await)
}

// ---------------------------------------------------------------------------
// Calibration
// ---------------------------------------------------------------------------

pub async fn calibration_points(runtime: &Runtime, id: i64) -> Result<Vec<CalPoint>> {
    let record = runtime
        .db
        .get_sensor(id)
        .await?
        .ok_or_else(|| Error::config("sensor_id", format!("no sensor {id}")))?;
    Ok(Calibration::from_json(&record.calibration)?.points().to_vec())
}

pub async fn add_calibration_point(
    runtime: &Runtime,
    id: i64,
    raw: f64,
    real: f64,
) -> Result<Vec<CalPoint>> {
    let lock = runtime.entity_lock((EntityKind::Sensor, id));
    let _guard = lock.lock().await;

    let record = runtime
        .db
        .get_sensor(id)
        .await?
        .ok_or_else(|| Error::config("sensor_id", format!("no sensor {id}")))?;
    let mut calibration = Calibration::from_json(&record.calibration)?;
    calibration.add_point(raw, real);

    let fields = SensorFields {
        name: record.name.clone(),
        driver: record.driver.clone(),
        description: record.description.clone(),
        enabled: record.enabled,
        update_interval: record.update_interval,
        config: record.config.clone(),
        calibration: calibration.to_json(),
    };
    runtime.db.update_sensor(id, &fields).await?;
    runtime.evict_sensor(id).await;
    Ok(calibration.points().to_vec())
}

pub async fn clear_calibration(runtime: &Runtime, id: i64) -> Result<()> {
    let lock = runtime.entity_lock((EntityKind::Sensor, id));
    let _guard = lock.lock().await;

    let record = runtime
        .db
        .get_sensor(id)
        .await?
        .ok_or_else(|| Error::config("sensor_id", format!("no sensor {id}")))?;
    let fields = SensorFields {
        name: record.name.clone(),
        driver: record.driver.clone(),
        description: record.description.clone(),
        enabled: record.enabled,
        update_interval: record.update_interval,
        config: record.config.clone(),
        calibration: Calibration::new().to_json(),
    };
    runtime.db.update_sensor(id, &fields).await?;
    runtime.evict_sensor(id).await;
    Ok(())
}

/// Read the sensor's current uncalibrated value, outside the schedule.
pub async fn sample_raw(runtime: &Runtime, id: i64) -> Result<Vec<(String, f64)>> {
    let record = runtime
        .db
        .get_sensor(id)
        .await?
        .ok_or_else(|| Error::config("sensor_id", format!("no sensor {id}")))?;
    let samples = runtime.sample_sensor_raw(&record).await?;
    Ok(samples
        .into_iter()
        .map(|s| (s.kind.as_str().to_string(), s.raw))
        .collect())
}

// ---------------------------------------------------------------------------
// Controllers
// ---------------------------------------------------------------------------

fn controller_fields(runtime: &Runtime, input: &ControllerInput) -> Result<ControllerFields> {
    if input.name.trim().is_empty() {
        return Err(Error::config("name", "must not be empty"));
    }
    if input.update_interval < 1 {
        return Err(Error::config("update_interval", "must be >= 1 second"));
    }
    let declared: Vec<u8> = runtime.arbiter.list().iter().map(|p| p.pin).collect();
    controller::validate_config(&input.controller_type, &input.config, &declared)?;
    Ok(ControllerFields {
        name: input.name.clone(),
        controller_type: input.controller_type.clone(),
        description: input.description.clone(),
        enabled: input.enabled,
        update_interval: input.update_interval,
        config: input.config.to_string(),
    })
}

pub fn available_controllers() -> Vec<&'static str> {
    controller::available_controllers()
}

pub async fn list_controllers(runtime: &Runtime) -> Result<Vec<ControllerView>> {
    let records = runtime.db.list_controllers().await?;
    Ok(records
        .into_iter()
        .map(|r| controller_view(runtime, r))
        .collect())
}

pub async fn get_controller(runtime: &Runtime, id: i64) -> Result<Option<ControllerView>> {
    Ok(runtime
        .db
        .get_controller(id)
        .await?
        .map(|r| controller_view(runtime, r)))
}

/// A controller can only be created enabled if its sensor roles are
/// already satisfiable — which they never are before binding — so new
/// controllers start disabled and are enabled through an update.
pub async fn create_controller(
    runtime: &Runtime,
    input: &ControllerInput,
) -> Result<ControllerView> {
    let fields = controller_fields(runtime, input)?;
    if fields.enabled {
        return Err(Error::config(
            "enabled",
            "create disabled, bind sensors, then enable",
        ));
    }
    let record = runtime.db.create_controller(&fields).await?;
    runtime.record_event(
        EventKind::System,
        format!("controller '{}' created", record.name),
    );
    Ok(controller_view(runtime, record))
}

pub async fn update_controller(
    runtime: &Runtime,
    id: i64,
    input: &ControllerInput,
) -> Result<Option<ControllerView>> {
    let fields = controller_fields(runtime, input)?;
    let lock = runtime.entity_lock((EntityKind::Controller, id));
    let _guard = lock.lock().await;

    let Some(current) = runtime.db.get_controller(id).await? else {
        return Ok(None);
    };

    if fields.enabled {
        // Role coverage gates enabling.
        let probe = ControllerRecord {
            controller_type: fields.controller_type.clone(),
            ..current.clone()
        };
        controller::validate_bindings(&probe, &runtime.db).await?;
    }

    let unchanged = current.name == fields.name
        && current.controller_type == fields.controller_type
        && current.description == fields.description
        && current.enabled == fields.enabled
        && current.update_interval == fields.update_interval
        && current.config == fields.config;
    if unchanged {
        return Ok(Some(controller_view(runtime, current)));
    }

    let updated = runtime.db.update_controller(id, &fields).await?;
    if updated.is_some() {
        runtime.evict_controller(id).await;
        runtime.clear_fault((EntityKind::Controller, id));
        runtime.wake.notify_one();
    }
    Ok(updated.map(|r| controller_view(runtime, r)))
}

pub async fn delete_controller(runtime: &Runtime, id: i64) -> Result<bool> {
    let lock = runtime.entity_lock((EntityKind::Controller, id));
    let _guard = lock.lock().await;

    let deleted = runtime.db.delete_controller(id).await?;
    if deleted {
        runtime.evict_controller(id).await;
        runtime.clear_fault((EntityKind::Controller, id));
        runtime.record_event(EventKind::System, format!("controller {id} deleted"));
    }
    Ok(deleted)
}

pub async fn bind_sensor(runtime: &Runtime, controller_id: i64, sensor_id: i64) -> Result<()> {
    if runtime.db.get_controller(controller_id).await?.is_none() {
        return Err(Error::config(
            "controller_id",
            format!("no controller {controller_id}"),
        ));
    }
    if runtime.db.get_sensor(sensor_id).await?.is_none() {
        return Err(Error::config("sensor_id", format!("no sensor {sensor_id}")));
    }
    runtime.db.bind_sensor(controller_id, sensor_id).await
}

/// Unbinding from an enabled controller must not strip a required role.
pub async fn unbind_sensor(runtime: &Runtime, controller_id: i64, sensor_id: i64) -> Result<bool> {
    let record = runtime
        .db
        .get_controller(controller_id)
        .await?
        .ok_or_else(|| {
            Error::config("controller_id", format!("no controller {controller_id}"))
        })?;

    let unbound = runtime.db.unbind_sensor(controller_id, sensor_id).await?;
    if unbound && record.enabled {
        if let Err(violation) = controller::validate_bindings(&record, &runtime.db).await {
            // Restore the binding rather than leave an enabled controller
            // without its role.
            runtime.db.bind_sensor(controller_id, sensor_id).await?;
            return Err(violation);
        }
        runtime.evict_controller(controller_id).await;
    }
    Ok(unbound)
}

pub async fn list_bound_sensors(runtime: &Runtime, controller_id: i64) -> Result<Vec<SensorView>> {
    let records = runtime.db.bound_sensors(controller_id).await?;
    Ok(records
        .into_iter()
        .map(|r| sensor_view(runtime, r))
        .collect())
}

pub async fn run_now(runtime: &Runtime, controller_id: i64) -> Result<()> {
    let record = runtime
        .db
        .get_controller(controller_id)
        .await?
        .ok_or_else(|| {
            Error::config("controller_id", format!("no controller {controller_id}"))
        })?;
    if !record.enabled {
        return Err(Error::config("enabled", "controller is disabled"));
    }
    runtime.run_now(controller_id);
    Ok(())
}

pub async fn recent_actions(
    runtime: &Runtime,
    controller_id: i64,
    limit: i64,
) -> Result<Vec<crate::db::ActionRecord>> {
    runtime.db.recent_actions(controller_id, limit).await
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

pub fn list_outputs(runtime: &Runtime) -> Vec<PinStatus> {
    runtime.arbiter.list()
}

pub fn set_output(runtime: &Runtime, pin: u8, on: bool) -> Result<bool> {
    let previous = runtime.arbiter.set(pin, on)?;
    if previous != on {
        runtime.record_event(
            EventKind::Action,
            format!("output {pin} set {}", if on { "HIGH" } else { "LOW" }),
        );
    }
    Ok(previous)
}

pub fn pulse_output(runtime: &Runtime, pin: u8, seconds: f64) -> Result<()> {
    if !(seconds > 0.0) {
        return Err(Error::config("seconds", "must be positive"));
    }
    runtime
        .arbiter
        .pulse(pin, Duration::from_secs_f64(seconds))?;
    runtime.record_event(
        EventKind::Action,
        format!("output {pin} pulsed for {seconds}s"),
    );
    Ok(())
}

pub fn panic_off(runtime: &Runtime) -> Result<()> {
    runtime.record_event(EventKind::Safety, "panic-off requested");
    runtime.arbiter.panic_off()
}

pub fn clear_panic(runtime: &Runtime) {
    runtime.arbiter.clear_panic();
    runtime.record_event(EventKind::Safety, "panic-off cleared");
}

// ---------------------------------------------------------------------------
// System
// ---------------------------------------------------------------------------

pub fn start_scheduler(runtime: &Runtime) {
    runtime.start();
    runtime.record_event(EventKind::System, "scheduler resumed");
}

pub fn stop_scheduler(runtime: &Runtime) {
    runtime.stop();
    runtime.record_event(EventKind::System, "scheduler paused");
}

pub async fn system_status(runtime: &Runtime) -> Result<SystemStatus> {
    let sensors = runtime.db.list_sensors().await?;
    let controllers = runtime.db.list_controllers().await?;
    Ok(SystemStatus {
        running: runtime.is_running(),
        last_tick_ms: runtime.last_tick_ms(),
        sensor_count: sensors.len(),
        controller_count: controllers.len(),
        outputs: runtime.arbiter.list(),
        events: runtime.events.lock().snapshot(),
    })
}

/// Measurements across every sensor over the trailing `hours`.
pub async fn recent_measurements(runtime: &Runtime, hours: f64) -> Result<Vec<Measurement>> {
    if !(hours > 0.0) {
        return Err(Error::config("hours", "must be positive"));
    }
    let since = now_ms() - (hours * 3600.0 * 1000.0) as i64;
    Ok(runtime.store.recent_all(since).await)
}

// ===========================================================================
// Tests
// ===========================================================================
