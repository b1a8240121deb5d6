//! Temperature-driven circulation pump timer.
//!
//! The pump runs inside a daily window (wrap across midnight allowed)
//! until the day's runtime target is met. The target follows water
//! temperature: the configured threshold table maps a temperature floor
//! to required minutes, and the largest floor at or below the current
//! temperature wins; below every floor the minimum run time applies.
//! `temp_check_delay_minutes` into a run the target starts tracking the
//! live temperature, so a warming afternoon extends the run.
//!
//! A `force_run_until` timestamp overrides the window entirely — the
//! manual override for backwashing or chemical mixing.

use chrono::{DateTime, NaiveDate, Timelike, Utc};
use serde::Deserialize;

use super::{ActionLogEntry, ArbiterOp, Controller, ProcessCtx, ProcessOutcome};
use crate::db::ControllerRecord;
use crate::error::{Error, Result};

fn default_min_run() -> i64 {
    15
}

fn default_max_run() -> i64 {
    120
}

fn default_check_delay() -> i64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub pump_pin: u8,
    /// Window start hour, 24 h clock.
    pub start_hour: u32,
    /// Window end hour; values below `start_hour` wrap across midnight.
    pub end_hour: u32,
    /// Temperature floor (°C, map key) -> required daily runtime minutes.
    pub temp_thresholds: std::collections::BTreeMap<String, i64>,
    #[serde(default = "default_min_run")]
    pub min_run_time: i64,
    #[serde(default = "default_max_run")]
    pub max_run_time: i64,
    #[serde(default = "default_check_delay")]
    pub temp_check_delay_minutes: i64,
    /// Unix millis; while in the future the pump runs regardless of window.
    #[serde(default)]
    pub force_run_until: Option<i64>,
}

pub fn validate(config: &serde_json::Value, declared_pins: &[u8]) -> Result<()> {
    let cfg: Config = serde_json::from_value(config.clone())
        .map_err(|e| Error::config("config", e.to_string()))?;
    if cfg.start_hour > 23 || cfg.end_hour > 23 {
        return Err(Error::config("start_hour", "hours must be 0..=23"));
    }
    if cfg.min_run_time < 1 || cfg.max_run_time < cfg.min_run_time {
        return Err(Error::config(
            "max_run_time",
            "need 1 <= min_run_time <= max_run_time",
        ));
    }
    if !declared_pins.contains(&cfg.pump_pin) {
        return Err(Error::config(
            "pump_pin",
            format!("pin {} not in declared output pool", cfg.pump_pin),
        ));
    }
    parse_thresholds(&cfg.temp_thresholds)?;
    Ok(())
}

pub fn open(record: &ControllerRecord) -> Result<Box<dyn Controller>> {
    let config: Config = serde_json::from_str(&record.config)?;
    let thresholds = parse_thresholds(&config.temp_thresholds)?;
    Ok(Box::new(PumpTimer {
        config,
        thresholds,
        day: None,
        today_target: None,
        ran_today_min: 0.0,
        run_started_at: None,
        run_start_ran: 0.0,
        forced: false,
    }))
}

fn parse_thresholds(raw: &std::collections::BTreeMap<String, i64>) -> Result<Vec<(f64, i64)>> {
    let mut out = Vec::with_capacity(raw.len());
    for (key, minutes) in raw {
        let floor: f64 = key
            .parse()
            .map_err(|_| Error::config("temp_thresholds", format!("bad temperature '{key}'")))?;
        if *minutes < 0 {
            return Err(Error::config("temp_thresholds", "minutes must be >= 0"));
        }
        out.push((floor, *minutes));
    }
    out.sort_by(|a, b| a.0.total_cmp(&b.0));
    Ok(out)
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct PumpTimer {
    config: Config,
    /// (temperature floor, minutes), sorted ascending by floor.
    thresholds: Vec<(f64, i64)>,
    day: Option<NaiveDate>,
    today_target: Option<i64>,
    ran_today_min: f64,
    run_started_at: Option<DateTime<Utc>>,
    /// `ran_today_min` at the moment the current run started.
    run_start_ran: f64,
    forced: bool,
}

impl PumpTimer {
    /// Required minutes for a temperature: largest floor <= T, clamped to
    /// the run-time bounds; below every floor the minimum applies.
    fn target_for(&self, temperature: f64) -> i64 {
        let mut minutes = self.config.min_run_time;
        for (floor, m) in &self.thresholds {
            if temperature >= *floor {
                minutes = *m;
            } else {
                break;
            }
        }
        minutes.clamp(self.config.min_run_time, self.config.max_run_time)
    }

    fn in_window(&self, now: DateTime<Utc>) -> bool {
        let hour = now.hour();
        let (start, end) = (self.config.start_hour, self.config.end_hour);
        if start <= end {
            hour >= start && hour < end
        } else {
            hour >= start || hour < end
        }
    }

    fn rollover(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if self.day != Some(today) {
            self.day = Some(today);
            self.ran_today_min = 0.0;
            self.run_start_ran = 0.0;
            self.today_target = None;
            // A run crossing midnight keeps going; its minutes before the
            // boundary belonged to yesterday.
            if self.run_started_at.is_some() {
                self.run_started_at = Some(now);
            }
        }
    }

    fn elapsed_min(&self, now: DateTime<Utc>) -> f64 {
        self.run_started_at
            .map(|start| (now - start).num_seconds() as f64 / 60.0)
            .unwrap_or(0.0)
    }

    fn start_run(&mut self, now: DateTime<Utc>, out: &mut ProcessOutcome) {
        self.run_started_at = Some(now);
        self.run_start_ran = self.ran_today_min;
        out.ops.push(ArbiterOp::Set {
            pin: self.config.pump_pin,
            on: true,
        });
        out.log.push(ActionLogEntry {
            action: "run_start".into(),
            details: serde_json::json!({
                "target_minutes": self.today_target,
                "ran_today_minutes": self.ran_today_min,
            }),
        });
    }

    fn stop_run(&mut self, now: DateTime<Utc>, reason: &str, out: &mut ProcessOutcome) {
        let elapsed = self.elapsed_min(now);
        self.ran_today_min = self.run_start_ran + elapsed;
        self.run_started_at = None;
        out.ops.push(ArbiterOp::Set {
            pin: self.config.pump_pin,
            on: false,
        });
        out.log.push(ActionLogEntry {
            action: "run_end".into(),
            details: serde_json::json!({
                "minutes": elapsed,
                "ran_today_minutes": self.ran_today_min,
                "reason": reason,
            }),
        });
    }
}

impl Controller for PumpTimer {
    fn actuator_pins(&self) -> Vec<u8> {
        vec![self.config.pump_pin]
    }

    fn process(&mut self, ctx: &ProcessCtx) -> Result<ProcessOutcome> {
        let now = ctx.now;
        let mut out = ProcessOutcome::default();
        self.rollover(now);

        let temperature = ctx.readings.get("temperature").map(|m| m.value);

        // Manual override takes precedence over everything.
        let force_active = self
            .config
            .force_run_until
            .is_some_and(|until| now.timestamp_millis() < until);
        if force_active {
            if self.run_started_at.is_none() {
                self.start_run(now, &mut out);
                self.forced = true;
                out.log.push(ActionLogEntry {
                    action: "force_run_start".into(),
                    details: serde_json::json!({
                        "until": self.config.force_run_until,
                    }),
                });
            }
            return Ok(out);
        }
        if self.forced {
            self.forced = false;
            if self.run_started_at.is_some() {
                self.stop_run(now, "force_expired", &mut out);
            }
            return Ok(out);
        }

        if !self.in_window(now) {
            if self.run_started_at.is_some() {
                self.stop_run(now, "window_closed", &mut out);
            }
            return Ok(out);
        }

        // Derive the day's target from the most recent temperature; until
        // one arrives the minimum keeps the water moving.
        if self.today_target.is_none() {
            self.today_target = Some(match temperature {
                Some(t) => self.target_for(t),
                None => self.config.min_run_time,
            });
        }

        if let Some(start) = self.run_started_at {
            let elapsed = (now - start).num_seconds() as f64 / 60.0;

            // Past the settling delay the target tracks live temperature.
            if elapsed >= self.config.temp_check_delay_minutes as f64 {
                if let Some(t) = temperature {
                    let fresh = self.target_for(t);
                    if Some(fresh) != self.today_target {
                        out.log.push(ActionLogEntry {
                            action: "target_adjusted".into(),
                            details: serde_json::json!({
                                "temperature": t,
                                "target_minutes": fresh,
                            }),
                        });
                        self.today_target = Some(fresh);
                    }
                }
            }

            let target = self.today_target.unwrap_or(self.config.min_run_time) as f64;
            let total = self.run_start_ran + elapsed;

            if elapsed >= self.config.max_run_time as f64 {
                self.stop_run(now, "max_run_time", &mut out);
            } else if total >= target && elapsed >= self.config.min_run_time as f64 {
                self.stop_run(now, "target_met", &mut out);
            }
            return Ok(out);
        }

        let target = self.today_target.unwrap_or(self.config.min_run_time) as f64;
        if self.ran_today_min < target {
            self.start_run(now, &mut out);
        }
        Ok(out)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
