//! TOML runtime configuration: database/web/mqtt endpoints, the declared
//! output pin pool with per-pin interlocks, retention limits, and optional
//! seed entities so a fresh install boots with its probe set configured.
//!
//! Every table rejects unknown fields and the whole file is validated
//! before anything touches hardware — the process refuses to start on a
//! violation. Seeding only creates entities that are missing (matched by
//! unique name); it never overwrites API-side edits.

use std::time::Duration;

use serde::Deserialize;

use crate::calibration::Calibration;
use crate::controller;
use crate::db::{ControllerFields, Db, SensorFields};
use crate::error::{Error, Result};
use crate::mqtt::MqttSettings;
use crate::outputs::PinConfig;
use crate::sensor;
use crate::store::RetentionPolicy;

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

fn default_db_url() -> String {
    "sqlite:aquahub.db?mode=rwc".to_string()
}

fn default_web_bind() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseSettings {
    #[serde(default = "default_db_url")]
    pub url: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: default_db_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebSettings {
    #[serde(default = "default_web_bind")]
    pub bind: String,
}

impl Default for WebSettings {
    fn default() -> Self {
        Self {
            bind: default_web_bind(),
        }
    }
}

fn default_memory_hours() -> u64 {
    24
}

fn default_memory_max_points() -> usize {
    100_000
}

fn default_persist_hours() -> u64 {
    6
}

fn default_actions_days() -> u64 {
    7
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionSettings {
    #[serde(default = "default_memory_hours")]
    pub memory_hours: u64,
    #[serde(default = "default_memory_max_points")]
    pub memory_max_points: usize,
    #[serde(default = "default_persist_hours")]
    pub persist_hours: u64,
    #[serde(default = "default_actions_days")]
    pub actions_days: u64,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            memory_hours: default_memory_hours(),
            memory_max_points: default_memory_max_points(),
            persist_hours: default_persist_hours(),
            actions_days: default_actions_days(),
        }
    }
}

impl RetentionSettings {
    pub fn policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            memory_window_ms: (self.memory_hours * 3600 * 1000) as i64,
            memory_max_points: self.memory_max_points,
            persist_window_ms: (self.persist_hours * 3600 * 1000) as i64,
            actions_window_ms: (self.actions_days * 24 * 3600 * 1000) as i64,
        }
    }
}

fn default_max_on_secs() -> u64 {
    600
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputEntry {
    pub pin: u8,
    #[serde(default = "default_max_on_secs")]
    pub max_on_secs: u64,
    #[serde(default)]
    pub min_interval_secs: u64,
    #[serde(default)]
    pub daily_budget_secs: Option<u64>,
}

impl OutputEntry {
    fn pin_config(&self) -> PinConfig {
        PinConfig {
            pin: self.pin,
            max_on: Duration::from_secs(self.max_on_secs),
            min_interval: Duration::from_secs(self.min_interval_secs),
            daily_budget: self.daily_budget_secs.map(Duration::from_secs),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_interval() -> i64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeedSensor {
    pub name: String,
    pub driver: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_interval")]
    pub update_interval: i64,
    #[serde(default)]
    pub config: toml::Table,
    /// (raw, real) pairs.
    #[serde(default)]
    pub calibration: Vec<[f64; 2]>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeedController {
    pub name: String,
    pub controller_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_interval")]
    pub update_interval: i64,
    #[serde(default)]
    pub config: toml::Table,
    /// Sensor names to bind.
    #[serde(default)]
    pub sensors: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeedSection {
    #[serde(default)]
    pub sensors: Vec<SeedSensor>,
    #[serde(default)]
    pub controllers: Vec<SeedController>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub web: WebSettings,
    #[serde(default)]
    pub mqtt: MqttSettings,
    #[serde(default)]
    pub retention: RetentionSettings,
    #[serde(default)]
    pub outputs: Vec<OutputEntry>,
    #[serde(default)]
    pub seed: SeedSection,
}

// ---------------------------------------------------------------------------
// Load + validate
// ---------------------------------------------------------------------------

pub fn load(path: &str) -> Result<Config> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::config("config_path", format!("failed to read {path}: {e}")))?;
    parse(&contents)
}

pub fn parse(contents: &str) -> Result<Config> {
    let config: Config =
        toml::from_str(contents).map_err(|e| Error::config("config", e.to_string()))?;
    config.validate()?;
    Ok(config)
}

fn toml_to_json(table: &toml::Table) -> Result<serde_json::Value> {
    serde_json::to_value(table).map_err(|e| Error::config("config", e.to_string()))
}

impl Config {
    pub fn pin_configs(&self) -> Vec<PinConfig> {
        self.outputs.iter().map(|o| o.pin_config()).collect()
    }

    pub fn declared_pins(&self) -> Vec<u8> {
        self.outputs.iter().map(|o| o.pin).collect()
    }

    fn validate(&self) -> Result<()> {
        let mut pins = self.declared_pins();
        pins.sort_unstable();
        let before = pins.len();
        pins.dedup();
        if pins.len() != before {
            return Err(Error::config("outputs", "duplicate pin declarations"));
        }

        if self.mqtt.enabled && self.mqtt.host.is_empty() {
            return Err(Error::config("mqtt.host", "required when mqtt is enabled"));
        }

        for entry in &self.outputs {
            if entry.max_on_secs == 0 {
                return Err(Error::config("outputs.max_on_secs", "must be positive"));
            }
        }

        let declared = self.declared_pins();
        let mut seen_sensor_names = std::collections::HashSet::new();
        for seed in &self.seed.sensors {
            if !seen_sensor_names.insert(&seed.name) {
                return Err(Error::config(
                    "seed.sensors",
                    format!("duplicate sensor name '{}'", seed.name),
                ));
            }
            if seed.update_interval < 1 {
                return Err(Error::config("seed.sensors", "update_interval must be >= 1"));
            }
            sensor::validate_config(&seed.driver, &toml_to_json(&seed.config)?)?;
        }

        for seed in &self.seed.controllers {
            if seed.update_interval < 1 {
                return Err(Error::config(
                    "seed.controllers",
                    "update_interval must be >= 1",
                ));
            }
            controller::validate_config(
                &seed.controller_type,
                &toml_to_json(&seed.config)?,
                &declared,
            )?;
            for sensor_name in &seed.sensors {
                if !self.seed.sensors.iter().any(|s| &s.name == sensor_name)
                {
                    // Binding by name can also target pre-existing sensors,
                    // so this is only advisory at parse time.
                    tracing::debug!(
                        controller = %seed.name,
                        sensor = %sensor_name,
                        "seed binding targets a sensor not in this file"
                    );
                }
            }
        }
        Ok(())
    }

    /// Create any seeded entities that do not exist yet (matched by name)
    /// and establish their bindings. Existing rows are left untouched.
    pub async fn apply_seed(&self, db: &Db) -> Result<(usize, usize)> {
        let mut sensors_created = 0;
        for seed in &self.seed.sensors {
            if db.get_sensor_by_name(&seed.name).await?.is_some() {
                continue;
            }
            let calibration =
                Calibration::from_points(seed.calibration.iter().map(|p| (p[0], p[1])));
            db.create_sensor(&SensorFields {
                name: seed.name.clone(),
                driver: seed.driver.clone(),
                description: seed.description.clone(),
                enabled: seed.enabled,
                update_interval: seed.update_interval,
                config: toml_to_json(&seed.config)?.to_string(),
                calibration: calibration.to_json(),
            })
            .await?;
            sensors_created += 1;
        }

        let mut controllers_created = 0;
        for seed in &self.seed.controllers {
            let existing = db.get_controller_by_name(&seed.name).await?;
            let record = match existing {
                Some(record) => record,
                None => {
                    controllers_created += 1;
                    db.create_controller(&ControllerFields {
                        name: seed.name.clone(),
                        controller_type: seed.controller_type.clone(),
                        description: seed.description.clone(),
                        enabled: seed.enabled,
                        update_interval: seed.update_interval,
                        config: toml_to_json(&seed.config)?.to_string(),
                    })
                    .await?
                }
            };
            for sensor_name in &seed.sensors {
                if let Some(sensor) = db.get_sensor_by_name(sensor_name).await? {
                    db.bind_sensor(record.id, sensor.id).await?;
                }
            }
        }

        Ok((sensors_created, controllers_created))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
