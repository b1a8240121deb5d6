//! Cooperative scheduler: one task per enabled sensor and controller,
//! each with its own next-fire time, all driven from a single loop.
//!
//! Entity records are re-read from the database on every pass so API-side
//! edits take effect at the next tick. Driver and controller instances
//! are cached per entity and re-opened whenever the record's `updated_at`
//! changes. Transient faults retry at the entity's next normal tick;
//! configuration and persistent faults park the entity as FAULTED until
//! an update replaces its config. Missed fires coalesce — the next fire
//! is always scheduled from "now", never queued up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::controller::{self, Controller};
use crate::db::{now_ms, ControllerRecord, Db, SensorRecord};
use crate::error::{Error, Result};
use crate::events::{EventKind, EventRing};
use crate::hw::Hardware;
use crate::outputs::OutputArbiter;
use crate::sensor::{self, SensorDriver};
use crate::store::MeasurementStore;

/// Idle poll cap: new/edited entities are noticed within this bound even
/// when every existing task is far from firing.
const MAX_IDLE: Duration = Duration::from_secs(1);

/// Grace period for in-flight work on shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Sensor,
    Controller,
}

pub type EntityKey = (EntityKind, i64);

#[derive(Debug, Clone)]
pub struct Fault {
    /// `updated_at` of the record when it faulted; an update clears it.
    pub rev: i64,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Shared runtime
// ---------------------------------------------------------------------------

/// Everything the scheduler and the API front-end share. The scheduler
/// owns the lifecycles; the API mutates entities under the same per-entity
/// locks the scheduler runs them under.
pub struct Runtime {
    pub db: Db,
    pub store: Arc<MeasurementStore>,
    pub arbiter: Arc<OutputArbiter>,
    pub hw: Arc<dyn Hardware>,
    pub events: parking_lot::Mutex<EventRing>,

    running: AtomicBool,
    last_tick_ms: AtomicI64,
    pub(crate) wake: Notify,

    locks: parking_lot::Mutex<HashMap<EntityKey, Arc<tokio::sync::Mutex<()>>>>,
    faults: parking_lot::Mutex<HashMap<EntityKey, Fault>>,
    force_due: parking_lot::Mutex<Vec<i64>>,
    drivers: tokio::sync::Mutex<HashMap<i64, DriverSlot>>,
    controllers: tokio::sync::Mutex<HashMap<i64, ControllerSlot>>,
}

struct DriverSlot {
    driver: Box<dyn SensorDriver>,
    rev: i64,
}

struct ControllerSlot {
    controller: Box<dyn Controller>,
    rev: i64,
}

impl Runtime {
    pub fn new(
        db: Db,
        store: Arc<MeasurementStore>,
        arbiter: Arc<OutputArbiter>,
        hw: Arc<dyn Hardware>,
    ) -> Self {
        Self {
            db,
            store,
            arbiter,
            hw,
            events: parking_lot::Mutex::new(EventRing::new()),
            running: AtomicBool::new(true),
            last_tick_ms: AtomicI64::new(0),
            wake: Notify::new(),
            locks: parking_lot::Mutex::new(HashMap::new()),
            faults: parking_lot::Mutex::new(HashMap::new()),
            force_due: parking_lot::Mutex::new(Vec::new()),
            drivers: tokio::sync::Mutex::new(HashMap::new()),
            controllers: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn record_event(&self, kind: EventKind, detail: impl Into<String>) {
        self.events.lock().record(kind, detail);
    }

    /// Per-entity mutual exclusion shared by the scheduler and the API.
    pub fn entity_lock(&self, key: EntityKey) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.locks.lock().entry(key).or_default())
    }

    pub fn fault_for(&self, key: EntityKey) -> Option<Fault> {
        self.faults.lock().get(&key).cloned()
    }

    fn set_fault(&self, key: EntityKey, rev: i64, message: String) {
        self.record_event(EventKind::Fault, message.clone());
        self.faults.lock().insert(key, Fault { rev, message });
    }

    /// Drop a stale fault if the record was updated since it was set.
    fn clear_stale_fault(&self, key: EntityKey, current_rev: i64) -> bool {
        let mut faults = self.faults.lock();
        match faults.get(&key) {
            Some(fault) if fault.rev == current_rev => false, // still FAULTED
            Some(_) => {
                faults.remove(&key);
                true
            }
            None => true,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::Relaxed);
        self.wake.notify_one();
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn last_tick_ms(&self) -> i64 {
        self.last_tick_ms.load(Ordering::Relaxed)
    }

    /// Force a controller's next process step to happen on the next pass.
    pub fn run_now(&self, controller_id: i64) {
        self.force_due.lock().push(controller_id);
        self.wake.notify_one();
    }

    /// Drop a cached instance so the next tick re-opens it (used after a
    /// fault and on entity deletion).
    pub async fn evict_sensor(&self, id: i64) {
        if let Some(mut slot) = self.drivers.lock().await.remove(&id) {
            slot.driver.close();
        }
    }

    pub async fn evict_controller(&self, id: i64) {
        if let Some(mut slot) = self.controllers.lock().await.remove(&id) {
            slot.controller.close();
        }
    }

    pub fn clear_fault(&self, key: EntityKey) {
        self.faults.lock().remove(&key);
    }

    /// Read a sensor once outside the schedule (calibration raw sampling).
    pub async fn sample_sensor_raw(&self, record: &SensorRecord) -> Result<Vec<sensor::RawSample>> {
        let lock = self.entity_lock((EntityKind::Sensor, record.id));
        let _guard = lock.lock().await;
        let mut drivers = self.drivers.lock().await;
        let slot = self.driver_slot(&mut drivers, record).await?;
        slot.driver.read(&sensor::ReadCtx::default())
    }

    async fn driver_slot<'a>(
        &self,
        drivers: &'a mut HashMap<i64, DriverSlot>,
        record: &SensorRecord,
    ) -> Result<&'a mut DriverSlot> {
        let reopen = match drivers.get(&record.id) {
            Some(slot) => slot.rev != record.updated_at,
            None => true,
        };
        if reopen {
            if let Some(mut old) = drivers.remove(&record.id) {
                old.driver.close();
            }
            let driver = sensor::open_driver(record, Arc::clone(&self.hw))?;
            drivers.insert(
                record.id,
                DriverSlot {
                    driver,
                    rev: record.updated_at,
                },
            );
        }
        Ok(drivers.get_mut(&record.id).expect("slot just ensured"))
    }

    async fn controller_slot<'a>(
        &self,
        controllers: &'a mut HashMap<i64, ControllerSlot>,
        record: &ControllerRecord,
    ) -> Result<&'a mut ControllerSlot> {
        let reopen = match controllers.get(&record.id) {
            Some(slot) => slot.rev != record.updated_at,
            None => true,
        };
        if reopen {
            if let Some(mut old) = controllers.remove(&record.id) {
                old.controller.close();
            }
            controller::validate_bindings(record, &self.db).await?;
            let instance = controller::open_controller(record)?;
            controllers.insert(
                record.id,
                ControllerSlot {
                    controller: instance,
                    rev: record.updated_at,
                },
            );
        }
        Ok(controllers.get_mut(&record.id).expect("slot just ensured"))
    }

    /// Close every cached instance and panic-off the outputs. Called once
    /// at shutdown after the loop has stopped.
    pub async fn shutdown(&self) -> Result<()> {
        for (_, mut slot) in self.drivers.lock().await.drain() {
            slot.driver.close();
        }
        for (_, mut slot) in self.controllers.lock().await.drain() {
            slot.controller.close();
        }
        self.record_event(EventKind::System, "shutdown: outputs to panic-off");
        self.arbiter.panic_off()
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    runtime: Arc<Runtime>,
    next_fire: HashMap<EntityKey, i64>,
}

impl Scheduler {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self {
            runtime,
            next_fire: HashMap::new(),
        }
    }

    /// Run until `shutdown` flips true, then close everything down.
    pub async fn run(&mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<()> {
        info!("scheduler started");
        self.runtime
            .record_event(EventKind::System, "scheduler started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            if !self.runtime.is_running() {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = self.runtime.wake.notified() => {}
                    _ = tokio::time::sleep(MAX_IDLE) => {}
                }
                continue;
            }

            let earliest = match self.pass().await {
                Ok(earliest) => earliest,
                Err(e) if e.is_fatal() => {
                    error!("fatal scheduler fault: {e}");
                    let _ = tokio::time::timeout(SHUTDOWN_GRACE, self.runtime.shutdown()).await;
                    return Err(e);
                }
                Err(e) => {
                    warn!("scheduler pass failed: {e}");
                    now_ms() + 1000
                }
            };

            let sleep = Duration::from_millis((earliest - now_ms()).clamp(10, 1000) as u64);
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = self.runtime.wake.notified() => {}
                _ = tokio::time::sleep(sleep) => {}
            }
        }

        info!("scheduler stopping");
        tokio::time::timeout(SHUTDOWN_GRACE, self.runtime.shutdown())
            .await
            .map_err(|_| Error::fatal("shutdown grace period elapsed"))??;
        Ok(())
    }

    /// One scheduler pass: run everything due, return the earliest next
    /// fire time in unix millis.
    pub async fn pass(&mut self) -> Result<i64> {
        let now = now_ms();
        self.runtime.last_tick_ms.store(now, Ordering::Relaxed);

        let sensors = self.runtime.db.list_sensors().await?;
        let controllers = self.runtime.db.list_controllers().await?;
        let forced: Vec<i64> = std::mem::take(&mut *self.runtime.force_due.lock());

        // Drop scheduling state for entities that disappeared or were
        // disabled so re-enabling fires promptly.
        let live: std::collections::HashSet<EntityKey> = sensors
            .iter()
            .filter(|s| s.enabled)
            .map(|s| (EntityKind::Sensor, s.id))
            .chain(
                controllers
                    .iter()
                    .filter(|c| c.enabled)
                    .map(|c| (EntityKind::Controller, c.id)),
            )
            .collect();
        self.next_fire.retain(|key, _| live.contains(key));

        let mut earliest = now + MAX_IDLE.as_millis() as i64;

        for record in sensors.iter().filter(|s| s.enabled) {
            let key = (EntityKind::Sensor, record.id);
            let due = *self.next_fire.entry(key).or_insert(now);
            if due <= now {
                self.run_sensor(record).await?;
                let next = now + record.update_interval * 1000;
                self.next_fire.insert(key, next);
                earliest = earliest.min(next);
            } else {
                earliest = earliest.min(due);
            }
        }

        for record in controllers.iter().filter(|c| c.enabled) {
            let key = (EntityKind::Controller, record.id);
            let due = *self.next_fire.entry(key).or_insert(now);
            if due <= now || forced.contains(&record.id) {
                self.run_controller(record).await?;
                let next = now + record.update_interval * 1000;
                self.next_fire.insert(key, next);
                earliest = earliest.min(next);
            } else {
                earliest = earliest.min(due);
            }
        }

        Ok(earliest)
    }

    async fn run_sensor(&self, record: &SensorRecord) -> Result<()> {
        let runtime = &self.runtime;
        let key = (EntityKind::Sensor, record.id);
        if !runtime.clear_stale_fault(key, record.updated_at) {
            return Ok(());
        }

        let lock = runtime.entity_lock(key);
        let _guard = lock.lock().await;

        // Re-fetch under the lock: an API update may have landed between
        // the list query and here.
        let Some(record) = runtime.db.get_sensor(record.id).await? else {
            return Ok(());
        };
        if !record.enabled {
            return Ok(());
        }

        let mut drivers = runtime.drivers.lock().await;
        let outcome = match runtime.driver_slot(&mut drivers, &record).await {
            Ok(slot) => sensor::take_reading(&record, slot.driver.as_mut(), &runtime.store).await,
            Err(e) => Err(e),
        };
        drop(drivers);

        match outcome {
            Ok(measurements) => {
                let ts = measurements.first().map(|m| m.ts).unwrap_or_else(now_ms);
                runtime.db.touch_sensor_measurement(record.id, ts).await?;
                debug!(
                    sensor = %record.name,
                    count = measurements.len(),
                    "measurements recorded"
                );
                runtime.record_event(
                    EventKind::Reading,
                    format!(
                        "{}: {}",
                        record.name,
                        measurements
                            .iter()
                            .map(|m| format!("{}={:.3}{}", m.kind, m.value, m.unit))
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                );
            }
            Err(Error::Transient(reason)) => {
                warn!(sensor = %record.name, %reason, "transient read fault, will retry");
            }
            Err(Error::Fatal(reason)) => return Err(Error::Fatal(reason)),
            Err(e) => {
                warn!(sensor = %record.name, "sensor faulted: {e}");
                runtime.evict_sensor(record.id).await;
                runtime.set_fault(key, record.updated_at, format!("{}: {e}", record.name));
            }
        }
        Ok(())
    }

    async fn run_controller(&self, record: &ControllerRecord) -> Result<()> {
        let runtime = &self.runtime;
        let key = (EntityKind::Controller, record.id);
        if !runtime.clear_stale_fault(key, record.updated_at) {
            return Ok(());
        }

        let lock = runtime.entity_lock(key);
        let _guard = lock.lock().await;

        let Some(record) = runtime.db.get_controller(record.id).await? else {
            return Ok(());
        };
        if !record.enabled {
            return Ok(());
        }

        let mut controllers = runtime.controllers.lock().await;
        let outcome = match runtime.controller_slot(&mut controllers, &record).await {
            Ok(slot) => {
                controller::run_step(
                    &record,
                    slot.controller.as_mut(),
                    &runtime.db,
                    &runtime.store,
                    &runtime.arbiter,
                )
                .await
            }
            Err(e) => Err(e),
        };
        drop(controllers);

        match outcome {
            Ok(entries) => {
                runtime.db.touch_controller_run(record.id, now_ms()).await?;
                for entry in &entries {
                    runtime.record_event(
                        EventKind::Action,
                        format!("{}: {}", record.name, entry.action),
                    );
                }
            }
            Err(Error::Transient(reason)) => {
                warn!(controller = %record.name, %reason, "transient fault, will retry");
            }
            Err(Error::Fatal(reason)) => return Err(Error::Fatal(reason)),
            Err(e) => {
                warn!(controller = %record.name, "controller faulted: {e}");
                runtime.evict_controller(record.id).await;
                runtime.set_fault(key, record.updated_at, format!("{}: {e}", record.name));
            }
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
