//! Output arbiter: sole owner of every controllable pin.
//!
//! All MOSFET/relay transitions flow through here — controllers and the
//! API never touch GPIO directly. The arbiter serializes transitions under
//! one lock (GPIO writes never suspend), enforces per-pin interlocks, and
//! provides the global panic-off used on shutdown and fatal faults.
//!
//! Interlocks per pin:
//! - maximum continuous HIGH duration (watchdog force-lowers violators)
//! - minimum interval between two HIGH transitions
//! - optional daily HIGH budget (resets at UTC midnight)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::warn;

use crate::db::now_ms;
use crate::error::{Error, Result};
use crate::hw::Hardware;

/// How often the watchdog checks for pins held HIGH too long.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Pin configuration & status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct PinConfig {
    pub pin: u8,
    /// Maximum continuous HIGH duration before the watchdog intervenes.
    pub max_on: Duration,
    /// Minimum spacing between two LOW→HIGH transitions.
    pub min_interval: Duration,
    /// Optional cap on total HIGH time per UTC day.
    pub daily_budget: Option<Duration>,
}

impl PinConfig {
    pub fn new(pin: u8) -> Self {
        Self {
            pin,
            max_on: Duration::from_secs(600),
            min_interval: Duration::ZERO,
            daily_budget: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PinLevel {
    Low,
    High,
    Pulsing,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PinStatus {
    pub pin: u8,
    pub level: PinLevel,
    /// Unix millis when the in-flight pulse ends, if pulsing.
    pub pulse_ends_at: Option<i64>,
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

struct PinEntry {
    cfg: PinConfig,
    level: bool,
    /// Monotonically increasing pulse generation; a stale generation's
    /// completion is a no-op.
    pulse_gen: u64,
    pulse_ends_at: Option<i64>,
    pulse_task: Option<tokio::task::JoinHandle<()>>,
    last_high_at: Option<Instant>,
    high_since: Option<Instant>,
    on_today: Duration,
    day: NaiveDate,
}

impl PinEntry {
    fn new(cfg: PinConfig) -> Self {
        Self {
            cfg,
            level: false,
            pulse_gen: 0,
            pulse_ends_at: None,
            pulse_task: None,
            last_high_at: None,
            high_since: None,
            on_today: Duration::ZERO,
            day: chrono::Utc::now().date_naive(),
        }
    }

    fn roll_day(&mut self) {
        let today = chrono::Utc::now().date_naive();
        if today != self.day {
            self.day = today;
            self.on_today = Duration::ZERO;
        }
    }

    /// HIGH time consumed today, including the current run.
    fn on_budget_used(&self) -> Duration {
        self.on_today
            + self
                .high_since
                .map(|since| since.elapsed())
                .unwrap_or(Duration::ZERO)
    }
}

struct Inner {
    pins: HashMap<u8, PinEntry>,
    panicked: bool,
}

pub struct OutputArbiter {
    hw: Arc<dyn Hardware>,
    inner: Arc<Mutex<Inner>>,
}

/// Handle to an in-flight pulse; cancelling drives the pin LOW early.
pub struct PulseHandle {
    pin: u8,
    gen: u64,
    hw: Arc<dyn Hardware>,
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for PulseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PulseHandle")
            .field("pin", &self.pin)
            .field("gen", &self.gen)
            .finish_non_exhaustive()
    }
}

impl PulseHandle {
    pub fn cancel(&self) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.pins.get_mut(&self.pin) else {
            return;
        };
        if entry.pulse_gen != self.gen || !entry.level {
            return; // superseded or already finished
        }
        drive_low(&self.hw, entry);
        entry.pulse_ends_at = None;
        if let Some(task) = entry.pulse_task.take() {
            task.abort();
        }
    }
}

fn drive_low(hw: &Arc<dyn Hardware>, entry: &mut PinEntry) {
    if entry.level {
        let _ = hw.set_output(entry.cfg.pin, false);
        entry.level = false;
        if let Some(since) = entry.high_since.take() {
            entry.on_today += since.elapsed();
        }
    }
}

impl OutputArbiter {
    /// Register the declared pin set and drive everything LOW (fail-safe
    /// startup state, same as power-on).
    pub fn new(hw: Arc<dyn Hardware>, pins: &[PinConfig]) -> Result<Self> {
        let mut map = HashMap::new();
        for cfg in pins {
            hw.set_output(cfg.pin, false)?;
            map.insert(cfg.pin, PinEntry::new(*cfg));
        }
        Ok(Self {
            hw,
            inner: Arc::new(Mutex::new(Inner {
                pins: map,
                panicked: false,
            })),
        })
    }

    pub fn declared(&self, pin: u8) -> bool {
        self.inner.lock().pins.contains_key(&pin)
    }

    /// Set a pin permanently. Idempotent: returns the previous level and
    /// produces no edge when the level is unchanged. An explicit set
    /// cancels any in-flight pulse on the pin.
    pub fn set(&self, pin: u8, on: bool) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.panicked {
            return Err(Error::safety("outputs are in panic-off"));
        }
        let entry = inner
            .pins
            .get_mut(&pin)
            .ok_or_else(|| Error::config("pin", format!("pin {pin} not in declared pool")))?;
        entry.roll_day();

        // A permanent set supersedes a pulse either way.
        if let Some(task) = entry.pulse_task.take() {
            task.abort();
        }
        entry.pulse_ends_at = None;
        entry.pulse_gen += 1;

        let prev = entry.level;
        if prev == on {
            return Ok(prev);
        }

        if on {
            check_high_interlocks(entry, None)?;
            self.hw.set_output(pin, true)?;
            entry.level = true;
            let now = Instant::now();
            entry.last_high_at = Some(now);
            entry.high_since = Some(now);
        } else {
            drive_low(&self.hw, entry);
        }
        Ok(prev)
    }

    /// Drive HIGH for `duration`, then LOW. A second pulse on a pulsing pin
    /// cancels the previous one and starts fresh.
    pub fn pulse(&self, pin: u8, duration: Duration) -> Result<PulseHandle> {
        let mut inner = self.inner.lock();
        if inner.panicked {
            return Err(Error::safety("outputs are in panic-off"));
        }
        let entry = inner
            .pins
            .get_mut(&pin)
            .ok_or_else(|| Error::config("pin", format!("pin {pin} not in declared pool")))?;
        entry.roll_day();

        if duration > entry.cfg.max_on {
            return Err(Error::safety(format!(
                "pulse of {:?} exceeds pin {pin} max-on {:?}",
                duration, entry.cfg.max_on
            )));
        }
        check_high_interlocks(entry, Some(duration))?;

        // Cancel any previous pulse; the new one owns the pin.
        if let Some(task) = entry.pulse_task.take() {
            task.abort();
        }
        entry.pulse_gen += 1;
        let gen = entry.pulse_gen;

        if !entry.level {
            self.hw.set_output(pin, true)?;
            entry.level = true;
            let now = Instant::now();
            entry.last_high_at = Some(now);
            entry.high_since = Some(now);
        }
        let ends_at = Instant::now() + duration;
        entry.pulse_ends_at = Some(now_ms() + duration.as_millis() as i64);

        let hw = Arc::clone(&self.hw);
        let shared = Arc::clone(&self.inner);
        entry.pulse_task = Some(tokio::spawn(async move {
            tokio::time::sleep_until(ends_at).await;
            let mut inner = shared.lock();
            if let Some(entry) = inner.pins.get_mut(&pin) {
                if entry.pulse_gen == gen {
                    drive_low(&hw, entry);
                    entry.pulse_ends_at = None;
                    entry.pulse_task = None;
                }
            }
        }));

        Ok(PulseHandle {
            pin,
            gen,
            hw: Arc::clone(&self.hw),
            inner: Arc::clone(&self.inner),
        })
    }

    /// Snapshot of every managed pin.
    pub fn list(&self) -> Vec<PinStatus> {
        let inner = self.inner.lock();
        let mut out: Vec<PinStatus> = inner
            .pins
            .values()
            .map(|entry| PinStatus {
                pin: entry.cfg.pin,
                level: match (entry.level, entry.pulse_ends_at) {
                    (true, Some(_)) => PinLevel::Pulsing,
                    (true, None) => PinLevel::High,
                    (false, _) => PinLevel::Low,
                },
                pulse_ends_at: entry.pulse_ends_at,
            })
            .collect();
        out.sort_by_key(|s| s.pin);
        out
    }

    /// Drive every managed pin LOW and refuse further writes until
    /// `clear_panic`. Failing to lower a pin here is fatal.
    pub fn panic_off(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.panicked = true;
        let mut first_err = None;
        for entry in inner.pins.values_mut() {
            if let Some(task) = entry.pulse_task.take() {
                task.abort();
            }
            entry.pulse_ends_at = None;
            entry.pulse_gen += 1;
            if entry.level {
                if let Err(e) = self.hw.set_output(entry.cfg.pin, false) {
                    first_err.get_or_insert(e);
                    continue;
                }
                entry.level = false;
                if let Some(since) = entry.high_since.take() {
                    entry.on_today += since.elapsed();
                }
            }
        }
        match first_err {
            Some(e) => Err(Error::fatal(format!("panic-off incomplete: {e}"))),
            None => Ok(()),
        }
    }

    pub fn is_panicked(&self) -> bool {
        self.inner.lock().panicked
    }

    pub fn clear_panic(&self) {
        self.inner.lock().panicked = false;
    }

    /// Watchdog pass: force-lower any pin held HIGH past its cap. Returns
    /// the pins that were lowered.
    pub fn watchdog_pass(&self) -> Vec<u8> {
        let mut inner = self.inner.lock();
        let mut lowered = Vec::new();
        for entry in inner.pins.values_mut() {
            let over = entry
                .high_since
                .is_some_and(|since| since.elapsed() > entry.cfg.max_on);
            if over {
                warn!(
                    pin = entry.cfg.pin,
                    max_on_secs = entry.cfg.max_on.as_secs(),
                    "watchdog: forcing pin low after max-on violation"
                );
                if let Some(task) = entry.pulse_task.take() {
                    task.abort();
                }
                entry.pulse_ends_at = None;
                entry.pulse_gen += 1;
                drive_low(&self.hw, entry);
                lowered.push(entry.cfg.pin);
            }
        }
        lowered
    }
}

fn check_high_interlocks(entry: &PinEntry, pulse: Option<Duration>) -> Result<()> {
    let pin = entry.cfg.pin;
    if entry.cfg.min_interval > Duration::ZERO {
        if let Some(last) = entry.last_high_at {
            if last.elapsed() < entry.cfg.min_interval {
                return Err(Error::safety(format!(
                    "pin {pin} re-energized within min-interval {:?}",
                    entry.cfg.min_interval
                )));
            }
        }
    }
    if let Some(budget) = entry.cfg.daily_budget {
        let projected = entry.on_budget_used() + pulse.unwrap_or(Duration::ZERO);
        if projected >= budget {
            return Err(Error::safety(format!(
                "pin {pin} daily on-budget {budget:?} exhausted"
            )));
        }
    }
    Ok(())
}

/// Spawn the periodic interlock watchdog. Aborted on shutdown.
pub fn spawn_watchdog(arbiter: Arc<OutputArbiter>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(WATCHDOG_INTERVAL);
        loop {
            ticker.tick().await;
            arbiter.watchdog_pass();
        }
    })
}

// ===========================================================================
// Tests
// ===========================================================================
