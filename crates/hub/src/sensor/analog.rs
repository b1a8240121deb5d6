//! Analog probe drivers backed by the CS1237 sampler: pH, ORP, EC, and
//! the generic piecewise-calibrated channel.
//!
//! Each driver owns one sampler thread. `read` never touches the wire —
//! it picks the median-filtered value out of the sampler ring, so a slow
//! probe can run at 10 Hz while the scheduler polls every 30 s.

use std::sync::Arc;

use serde::Deserialize;

use super::{RawSample, ReadCtx, SensorDriver};
use crate::cs1237::{AdcConfig, AdcPins, AdcSampler, Channel, Pga, SamplerConfig, Speed};
use crate::db::SensorRecord;
use crate::error::{Error, Result};
use crate::hw::Hardware;
use crate::store::MeasurementKind;

fn default_speed() -> u16 {
    10
}

fn default_vref() -> f64 {
    3300.0
}

fn default_buffer() -> usize {
    20
}

fn default_pga() -> u16 {
    1
}

fn default_k_value() -> f64 {
    1.0
}

fn default_factor() -> f64 {
    1.0
}

// ---------------------------------------------------------------------------
// Configs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhConfig {
    pub sck_pin: u8,
    pub dout_pin: u8,
    pub din_pin: u8,
    #[serde(default = "default_speed")]
    pub speed_hz: u16,
    #[serde(default = "default_vref")]
    pub vref_mv: f64,
    #[serde(default = "default_buffer")]
    pub buffer_size: usize,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrpConfig {
    pub sck_pin: u8,
    pub dout_pin: u8,
    pub din_pin: u8,
    #[serde(default = "default_speed")]
    pub speed_hz: u16,
    #[serde(default = "default_vref")]
    pub vref_mv: f64,
    #[serde(default = "default_buffer")]
    pub buffer_size: usize,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EcConfig {
    pub sck_pin: u8,
    pub dout_pin: u8,
    pub din_pin: u8,
    #[serde(default = "default_speed")]
    pub speed_hz: u16,
    #[serde(default = "default_vref")]
    pub vref_mv: f64,
    #[serde(default = "default_buffer")]
    pub buffer_size: usize,
    /// Cell constant of the conductivity cell.
    #[serde(default = "default_k_value")]
    pub k_value: f64,
    /// Scale trim from solution calibration.
    #[serde(default = "default_factor")]
    pub calibration_factor: f64,
    /// Sensor id whose latest temperature compensates the reading.
    #[serde(default)]
    pub temp_sensor_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenericConfig {
    pub sck_pin: u8,
    pub dout_pin: u8,
    pub din_pin: u8,
    #[serde(default = "default_pga")]
    pub pga: u16,
    #[serde(default = "default_speed")]
    pub speed_hz: u16,
    #[serde(default = "default_vref")]
    pub vref_mv: f64,
    #[serde(default = "default_buffer")]
    pub buffer_size: usize,
    /// Unit string attached to the calibrated value.
    #[serde(default)]
    pub unit: String,
}

pub fn validate_ph(config: &serde_json::Value) -> Result<()> {
    parse::<PhConfig>(config).map(|_| ())
}

pub fn validate_orp(config: &serde_json::Value) -> Result<()> {
    parse::<OrpConfig>(config).map(|_| ())
}

pub fn validate_ec(config: &serde_json::Value) -> Result<()> {
    parse::<EcConfig>(config).map(|_| ())
}

pub fn validate_generic(config: &serde_json::Value) -> Result<()> {
    parse::<GenericConfig>(config).map(|_| ())
}

fn parse<T: serde::de::DeserializeOwned>(config: &serde_json::Value) -> Result<T> {
    serde_json::from_value(config.clone()).map_err(|e| Error::config("config", e.to_string()))
}

fn spawn_sampler(
    hw: Arc<dyn Hardware>,
    sck: u8,
    dout: u8,
    din: u8,
    pga: Pga,
    speed_hz: u16,
    vref_mv: f64,
    buffer_size: usize,
) -> Result<AdcSampler> {
    AdcSampler::spawn(
        hw,
        AdcPins {
            sck,
            dout,
            din,
        },
        AdcConfig {
            pga,
            speed: Speed::try_from(speed_hz)?,
            channel: Channel::Analog,
            refo: false,
        },
        SamplerConfig {
            vref_mv,
            buffer_size,
            median_window: 5,
        },
    )
}

// ---------------------------------------------------------------------------
// pH
// ---------------------------------------------------------------------------

pub fn open_ph(record: &SensorRecord, hw: Arc<dyn Hardware>) -> Result<Box<dyn SensorDriver>> {
    let cfg: PhConfig = serde_json::from_str(&record.config)?;
    let sampler = spawn_sampler(
        hw,
        cfg.sck_pin,
        cfg.dout_pin,
        cfg.din_pin,
        Pga::X128,
        cfg.speed_hz,
        cfg.vref_mv,
        cfg.buffer_size,
    )?;
    Ok(Box::new(PhProbe { sampler }))
}

pub struct PhProbe {
    sampler: AdcSampler,
}

impl SensorDriver for PhProbe {
    fn read(&mut self, _ctx: &ReadCtx) -> Result<Vec<RawSample>> {
        let mv = self
            .sampler
            .filtered_millivolts()
            .ok_or_else(|| Error::transient("ph probe: no conversion yet"))?;
        // Calibration maps electrode volts to pH.
        Ok(vec![RawSample {
            kind: MeasurementKind::Ph,
            raw: mv / 1000.0,
            unit: "pH".into(),
        }])
    }

    fn close(&mut self) {
        self.sampler.stop();
    }
}

// ---------------------------------------------------------------------------
// ORP
// ---------------------------------------------------------------------------

pub fn open_orp(record: &SensorRecord, hw: Arc<dyn Hardware>) -> Result<Box<dyn SensorDriver>> {
    let cfg: OrpConfig = serde_json::from_str(&record.config)?;
    let sampler = spawn_sampler(
        hw,
        cfg.sck_pin,
        cfg.dout_pin,
        cfg.din_pin,
        Pga::X1,
        cfg.speed_hz,
        cfg.vref_mv,
        cfg.buffer_size,
    )?;
    Ok(Box::new(OrpProbe { sampler }))
}

pub struct OrpProbe {
    sampler: AdcSampler,
}

impl SensorDriver for OrpProbe {
    fn read(&mut self, _ctx: &ReadCtx) -> Result<Vec<RawSample>> {
        let mv = self
            .sampler
            .filtered_millivolts()
            .ok_or_else(|| Error::transient("orp probe: no conversion yet"))?;
        // Calibration adds the electrode offset in mV.
        Ok(vec![RawSample {
            kind: MeasurementKind::Orp,
            raw: mv,
            unit: "mV".into(),
        }])
    }

    fn close(&mut self) {
        self.sampler.stop();
    }
}

// ---------------------------------------------------------------------------
// EC
// ---------------------------------------------------------------------------

pub fn open_ec(record: &SensorRecord, hw: Arc<dyn Hardware>) -> Result<Box<dyn SensorDriver>> {
    let cfg: EcConfig = serde_json::from_str(&record.config)?;
    let sampler = spawn_sampler(
        hw,
        cfg.sck_pin,
        cfg.dout_pin,
        cfg.din_pin,
        Pga::X1,
        cfg.speed_hz,
        cfg.vref_mv,
        cfg.buffer_size,
    )?;
    Ok(Box::new(EcCell {
        sampler,
        k_value: cfg.k_value,
        calibration_factor: cfg.calibration_factor,
        temp_sensor_id: cfg.temp_sensor_id,
    }))
}

pub struct EcCell {
    sampler: AdcSampler,
    k_value: f64,
    calibration_factor: f64,
    temp_sensor_id: Option<i64>,
}

impl SensorDriver for EcCell {
    fn read(&mut self, ctx: &ReadCtx) -> Result<Vec<RawSample>> {
        let mv = self
            .sampler
            .filtered_millivolts()
            .ok_or_else(|| Error::transient("ec cell: no conversion yet"))?;
        let ec = conductivity_us_cm(mv, self.k_value, self.calibration_factor, ctx.water_temp_c);
        Ok(vec![RawSample {
            kind: MeasurementKind::Ec,
            raw: ec,
            unit: "µS/cm".into(),
        }])
    }

    fn wants_water_temp_from(&self) -> Option<i64> {
        self.temp_sensor_id
    }

    fn close(&mut self) {
        self.sampler.stop();
    }
}

/// Cell voltage → conductivity. The 2%/°C compensation references 25 °C
/// and is bypassed when no water temperature is bound.
pub fn conductivity_us_cm(mv: f64, k_value: f64, factor: f64, water_temp_c: Option<f64>) -> f64 {
    let mut ec = mv * k_value * factor;
    if let Some(t) = water_temp_c {
        ec *= 1.0 + 0.02 * (t - 25.0);
    }
    ec
}

// ---------------------------------------------------------------------------
// Generic
// ---------------------------------------------------------------------------

pub fn open_generic(record: &SensorRecord, hw: Arc<dyn Hardware>) -> Result<Box<dyn SensorDriver>> {
    let cfg: GenericConfig = serde_json::from_str(&record.config)?;
    let sampler = spawn_sampler(
        hw,
        cfg.sck_pin,
        cfg.dout_pin,
        cfg.din_pin,
        Pga::try_from(cfg.pga)?,
        cfg.speed_hz,
        cfg.vref_mv,
        cfg.buffer_size,
    )?;
    Ok(Box::new(GenericChannel {
        sampler,
        unit: cfg.unit,
    }))
}

pub struct GenericChannel {
    sampler: AdcSampler,
    unit: String,
}

impl SensorDriver for GenericChannel {
    fn read(&mut self, _ctx: &ReadCtx) -> Result<Vec<RawSample>> {
        let counts = self
            .sampler
            .latest_raw()
            .ok_or_else(|| Error::transient("analog channel: no conversion yet"))?;
        Ok(vec![RawSample {
            kind: MeasurementKind::Generic,
            raw: counts as f64,
            unit: self.unit.clone(),
        }])
    }

    fn close(&mut self) {
        self.sampler.stop();
    }
}

// ===========================================================================
// Tests
// ===========================================================================
