//! Sensor driver framework: the driver trait, the compile-time registry
//! keyed by driver tag, and the read → calibrate → persist pipeline the
//! scheduler runs for each enabled sensor.
//!
//! Adding a driver is a source edit: implement [`SensorDriver`], add a
//! [`DriverSpec`] row to [`REGISTRY`]. Config payloads are validated
//! against the driver's typed config struct (unknown fields rejected)
//! before a sensor row is ever created or updated.

use std::sync::Arc;

use serde::Serialize;

use crate::calibration::Calibration;
use crate::db::{now_ms, SensorRecord};
use crate::error::{Error, Result};
use crate::hw::Hardware;
use crate::store::{Measurement, MeasurementKind, MeasurementStore};

pub mod analog;
pub mod ds18b20;
pub mod sht41;

// ---------------------------------------------------------------------------
// Driver capability surface
// ---------------------------------------------------------------------------

/// One uncalibrated sample. Multi-output drivers (SHT41) return several
/// per read cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    pub kind: MeasurementKind,
    pub raw: f64,
    pub unit: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationStyle {
    None,
    TwoPointPh,
    OffsetOrp,
    FactorEc,
    Piecewise,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct DriverInfo {
    pub tag: &'static str,
    pub summary: &'static str,
    /// (kind, unit) tuples this driver emits; the first entry is the
    /// primary output the calibration point set applies to.
    pub outputs: &'static [(MeasurementKind, &'static str)],
    pub calibration: CalibrationStyle,
}

/// Context assembled by the framework before each read.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReadCtx {
    /// Latest water temperature from the sensor a driver asked for via
    /// [`SensorDriver::wants_water_temp_from`], if one was available.
    pub water_temp_c: Option<f64>,
}

pub trait SensorDriver: Send {
    /// Take one reading. Transient faults (bus hiccup, no sample ready
    /// yet) must map to [`Error::Transient`] so the scheduler retries on
    /// the next tick.
    fn read(&mut self, ctx: &ReadCtx) -> Result<Vec<RawSample>>;

    /// Sensor id whose latest temperature should be resolved into
    /// [`ReadCtx::water_temp_c`] (EC compensation).
    fn wants_water_temp_from(&self) -> Option<i64> {
        None
    }

    fn close(&mut self) {}
}

impl std::fmt::Debug for dyn SensorDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn SensorDriver")
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

type OpenFn = fn(&SensorRecord, Arc<dyn Hardware>) -> Result<Box<dyn SensorDriver>>;
type ValidateFn = fn(&serde_json::Value) -> Result<()>;

pub struct DriverSpec {
    pub info: DriverInfo,
    pub open: OpenFn,
    pub validate: ValidateFn,
}

pub static REGISTRY: &[DriverSpec] = &[
    DriverSpec {
        info: DriverInfo {
            tag: "ds18b20",
            summary: "DS18B20 1-Wire water temperature probe",
            outputs: &[(MeasurementKind::Temperature, "°C")],
            calibration: CalibrationStyle::None,
        },
        open: ds18b20::open,
        validate: ds18b20::validate,
    },
    DriverSpec {
        info: DriverInfo {
            tag: "sht41",
            summary: "SHT41 I²C air temperature + humidity",
            outputs: &[
                (MeasurementKind::Temperature, "°C"),
                (MeasurementKind::Humidity, "%"),
            ],
            calibration: CalibrationStyle::None,
        },
        open: sht41::open,
        validate: sht41::validate,
    },
    DriverSpec {
        info: DriverInfo {
            tag: "cs1237_ph",
            summary: "pH probe on CS1237 (channel A, PGA 128)",
            outputs: &[(MeasurementKind::Ph, "pH")],
            calibration: CalibrationStyle::TwoPointPh,
        },
        open: analog::open_ph,
        validate: analog::validate_ph,
    },
    DriverSpec {
        info: DriverInfo {
            tag: "cs1237_orp",
            summary: "ORP probe on CS1237 (channel A, PGA 1)",
            outputs: &[(MeasurementKind::Orp, "mV")],
            calibration: CalibrationStyle::OffsetOrp,
        },
        open: analog::open_orp,
        validate: analog::validate_orp,
    },
    DriverSpec {
        info: DriverInfo {
            tag: "cs1237_ec",
            summary: "EC cell on CS1237 (channel A, PGA 1), temperature compensated",
            outputs: &[(MeasurementKind::Ec, "µS/cm")],
            calibration: CalibrationStyle::FactorEc,
        },
        open: analog::open_ec,
        validate: analog::validate_ec,
    },
    DriverSpec {
        info: DriverInfo {
            tag: "cs1237_generic",
            summary: "Generic analog channel on CS1237, piecewise calibrated",
            outputs: &[(MeasurementKind::Generic, "")],
            calibration: CalibrationStyle::Piecewise,
        },
        open: analog::open_generic,
        validate: analog::validate_generic,
    },
];

pub fn driver_spec(tag: &str) -> Option<&'static DriverSpec> {
    REGISTRY.iter().find(|spec| spec.info.tag == tag)
}

pub fn available_drivers() -> Vec<&'static str> {
    REGISTRY.iter().map(|spec| spec.info.tag).collect()
}

/// Validate a driver tag + config payload without opening any hardware.
pub fn validate_config(tag: &str, config: &serde_json::Value) -> Result<()> {
    let spec = driver_spec(tag)
        .ok_or_else(|| Error::config("driver", format!("unknown driver '{tag}'")))?;
    (spec.validate)(config)
}

pub fn open_driver(
    record: &SensorRecord,
    hw: Arc<dyn Hardware>,
) -> Result<Box<dyn SensorDriver>> {
    let spec = driver_spec(&record.driver)
        .ok_or_else(|| Error::config("driver", format!("unknown driver '{}'", record.driver)))?;
    (spec.open)(record, hw)
}

// ---------------------------------------------------------------------------
// Read pipeline
// ---------------------------------------------------------------------------

/// One full read cycle for a sensor: resolve the driver's context, read,
/// calibrate the primary output, and persist every sample. The caller
/// holds the sensor's entity lock, which is what makes the calibration
/// snapshot race-free.
pub async fn take_reading(
    record: &SensorRecord,
    driver: &mut dyn SensorDriver,
    store: &MeasurementStore,
) -> Result<Vec<Measurement>> {
    let mut ctx = ReadCtx::default();
    if let Some(temp_sensor) = driver.wants_water_temp_from() {
        ctx.water_temp_c = store
            .latest(temp_sensor)
            .await
            .filter(|m| m.kind == MeasurementKind::Temperature)
            .map(|m| m.value);
    }

    let samples = driver.read(&ctx)?;
    if samples.is_empty() {
        return Err(Error::transient(format!(
            "driver '{}' produced no samples",
            record.driver
        )));
    }

    let calibration = Calibration::from_json(&record.calibration)?;
    let primary_kind = driver_spec(&record.driver).map(|spec| spec.info.outputs[0].0);

    let ts = now_ms();
    let mut out = Vec::with_capacity(samples.len());
    for sample in samples {
        let calibrated = if Some(sample.kind) == primary_kind {
            calibration.evaluate(sample.raw)
        } else {
            sample.raw
        };
        let m = Measurement {
            sensor_id: record.id,
            ts,
            kind: sample.kind,
            value: calibrated,
            unit: sample.unit,
            raw: Some(sample.raw),
        };
        store.append(m.clone()).await?;
        out.push(m);
    }
    Ok(out)
}

// ===========================================================================
// Tests
// ===========================================================================
