//! SHT41 I²C air temperature + humidity driver.
//!
//! One measure command, a conversion wait, then a six-byte frame: two
//! 16-bit words each followed by a Sensirion CRC-8. Both physical values
//! come out of one cycle, so this is the framework's multi-output driver.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use super::{RawSample, ReadCtx, SensorDriver};
use crate::db::SensorRecord;
use crate::error::{Error, Result};
use crate::hw::Hardware;
use crate::store::MeasurementKind;

/// High-precision measurement, no heater.
const CMD_MEASURE: u8 = 0xfd;
/// High-precision conversion takes ~8.3 ms; leave margin.
const CONVERSION_WAIT: Duration = Duration::from_millis(10);

fn default_bus() -> u8 {
    1
}

fn default_address() -> u16 {
    0x44
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_bus")]
    pub i2c_bus: u8,
    #[serde(default = "default_address")]
    pub address: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            i2c_bus: default_bus(),
            address: default_address(),
        }
    }
}

pub fn validate(config: &serde_json::Value) -> Result<()> {
    serde_json::from_value::<Config>(config.clone())
        .map(|_| ())
        .map_err(|e| Error::config("config", e.to_string()))
}

pub fn open(record: &SensorRecord, hw: Arc<dyn Hardware>) -> Result<Box<dyn SensorDriver>> {
    let config: Config = serde_json::from_str(&record.config)?;
    Ok(Box::new(Sht41 {
        hw,
        bus: config.i2c_bus,
        address: config.address,
    }))
}

pub struct Sht41 {
    hw: Arc<dyn Hardware>,
    bus: u8,
    address: u16,
}

impl SensorDriver for Sht41 {
    fn read(&mut self, _ctx: &ReadCtx) -> Result<Vec<RawSample>> {
        self.hw
            .i2c_write_raw(self.bus, self.address, &[CMD_MEASURE])?;
        std::thread::sleep(CONVERSION_WAIT);
        let frame = self.hw.i2c_read_raw(self.bus, self.address, 6)?;
        let (temperature, humidity) = decode_frame(&frame)?;
        Ok(vec![
            RawSample {
                kind: MeasurementKind::Temperature,
                raw: temperature,
                unit: "°C".into(),
            },
            RawSample {
                kind: MeasurementKind::Humidity,
                raw: humidity,
                unit: "%".into(),
            },
        ])
    }
}

/// Decode a measurement frame into (°C, %RH) per the datasheet transfer
/// functions. CRC mismatches are transient — the next cycle re-measures.
pub fn decode_frame(frame: &[u8]) -> Result<(f64, f64)> {
    if frame.len() != 6 {
        return Err(Error::transient(format!(
            "sht41 short frame ({} bytes)",
            frame.len()
        )));
    }
    if crc8(&frame[0..2]) != frame[2] || crc8(&frame[3..5]) != frame[5] {
        return Err(Error::transient("sht41 frame crc mismatch"));
    }
    let t_ticks = u16::from_be_bytes([frame[0], frame[1]]) as f64;
    let rh_ticks = u16::from_be_bytes([frame[3], frame[4]]) as f64;

    let temperature = -45.0 + 175.0 * t_ticks / 65535.0;
    let humidity = (-6.0 + 125.0 * rh_ticks / 65535.0).clamp(0.0, 100.0);
    Ok((temperature, humidity))
}

/// Sensirion CRC-8: polynomial 0x31, init 0xff.
fn crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0xff;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x31
            } else {
                crc << 1
            };
        }
    }
    crc
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::stub::StubHardware;

    fn frame_for(t_ticks: u16, rh_ticks: u16) -> Vec<u8> {
        let t = t_ticks.to_be_bytes();
        let rh = rh_ticks.to_be_bytes();
        vec![t[0], t[1], crc8(&t), rh[0], rh[1], crc8(&rh)]
    }

    fn record(config: &str) -> SensorRecord {
        SensorRecord {
            id: 2,
            name: "air".into(),
            driver: "sht41".into(),
            description: String::new(),
            enabled: true,
            update_interval: 60,
            config: config.into(),
            calibration: "[]".into(),
            last_measurement_at: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    // -- Frame decoding -------------------------------------------------------

    #[test]
    fn decode_midscale_frame() {
        // Mid-scale ticks: T = -45 + 175*0.5 = 42.5 °C, RH = -6 + 125*0.5.
        let half = (65535u32 / 2) as u16;
        let (t, rh) = decode_frame(&frame_for(half, half)).unwrap();
        assert!((t - 42.5).abs() < 0.01);
        assert!((rh - 56.5).abs() < 0.01);
    }

    #[test]
    fn decode_zero_ticks() {
        let (t, rh) = decode_frame(&frame_for(0, 0)).unwrap();
        assert!((t + 45.0).abs() < 1e-9);
        assert_eq!(rh, 0.0, "humidity clamps at 0 (formula gives -6)");
    }

    #[test]
    fn decode_full_scale_clamps_humidity() {
        let (t, rh) = decode_frame(&frame_for(u16::MAX, u16::MAX)).unwrap();
        assert!((t - 130.0).abs() < 0.01);
        assert_eq!(rh, 100.0, "humidity clamps at 100 (formula gives 119)");
    }

    #[test]
    fn corrupt_crc_is_transient() {
        let mut frame = frame_for(30000, 30000);
        frame[2] ^= 0xff;
        let err = decode_frame(&frame).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn short_frame_is_transient() {
        assert!(decode_frame(&[1, 2, 3]).unwrap_err().is_transient());
    }

    #[test]
    fn crc8_datasheet_vector() {
        assert_eq!(crc8(&[0xbe, 0xef]), 0x92);
    }

    // -- Config ---------------------------------------------------------------

    #[test]
    fn validate_defaults_and_overrides() {
        validate(&serde_json::json!({})).unwrap();
        validate(&serde_json::json!({"i2c_bus": 0, "address": 0x45})).unwrap();
    }

    #[test]
    fn validate_rejects_unknown_fields() {
        assert!(validate(&serde_json::json!({"bus": 1})).is_err());
    }

    // -- Driver ---------------------------------------------------------------

    #[test]
    fn read_issues_measure_command_and_decodes() {
        let hw = Arc::new(StubHardware::new());
        hw.push_i2c_response(1, 0x44, frame_for(32768, 32768));

        let mut driver = open(&record("{}"), hw.clone() as Arc<dyn Hardware>).unwrap();
        let samples = driver.read(&ReadCtx::default()).unwrap();

        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].kind, MeasurementKind::Temperature);
        assert_eq!(samples[1].kind, MeasurementKind::Humidity);

        // The measure command went out before the frame read.
        let calls = hw.calls();
        assert!(calls.iter().any(|c| matches!(
            c,
            crate::hw::stub::HwCall::I2cWriteRaw(1, 0x44, bytes) if bytes == &vec![CMD_MEASURE]
        )));
    }

    #[test]
    fn read_on_alternate_address() {
        let hw = Arc::new(StubHardware::new());
        hw.push_i2c_response(1, 0x45, frame_for(30000, 30000));

        let mut driver = open(
            &record(r#"{"address": 69}"#), // 0x45
            hw as Arc<dyn Hardware>,
        )
        .unwrap();
        assert!(driver.read(&ReadCtx::default()).is_ok());
    }

    #[test]
    fn read_without_device_is_transient() {
        let hw = Arc::new(StubHardware::new());
        let mut driver = open(&record("{}"), hw as Arc<dyn Hardware>).unwrap();
        let err = driver.read(&ReadCtx::default()).unwrap_err();
        assert!(err.is_transient());
    }
}
