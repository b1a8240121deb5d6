//! DS18B20 1-Wire temperature driver.
//!
//! Reads the kernel w1-therm slave file. The first line carries the CRC
//! verdict (`... crc=xx YES|NO`), the second the raw reading as
//! `t=<millidegrees>`. CRC failures retry a few times before surfacing as
//! a transient fault.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use super::{RawSample, ReadCtx, SensorDriver};
use crate::db::SensorRecord;
use crate::error::{Error, Result};
use crate::hw::Hardware;
use crate::store::MeasurementKind;

const CRC_RETRIES: u32 = 3;
const CRC_RETRY_PAUSE: Duration = Duration::from_millis(50);

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Specific slave id (e.g. "28-0316a2f9c1ff"); the first detected
    /// DS18B20 is used when unset.
    #[serde(default)]
    pub slave_id: Option<String>,
}

pub fn validate(config: &serde_json::Value) -> Result<()> {
    serde_json::from_value::<Config>(config.clone())
        .map(|_| ())
        .map_err(|e| Error::config("config", e.to_string()))
}

pub fn open(record: &SensorRecord, hw: Arc<dyn Hardware>) -> Result<Box<dyn SensorDriver>> {
    let config: Config = serde_json::from_str(&record.config)?;
    let slave_id = match config.slave_id {
        Some(id) => id,
        None => hw
            .onewire_list()?
            .into_iter()
            .next()
            .ok_or_else(|| Error::persistent("no DS18B20 slaves on the 1-wire bus"))?,
    };
    debug!(sensor = %record.name, slave = %slave_id, "ds18b20 opened");
    Ok(Box::new(Ds18b20 { hw, slave_id }))
}

pub struct Ds18b20 {
    hw: Arc<dyn Hardware>,
    slave_id: String,
}

impl SensorDriver for Ds18b20 {
    fn read(&mut self, _ctx: &ReadCtx) -> Result<Vec<RawSample>> {
        let mut body = self.hw.onewire_read(&self.slave_id)?;
        let mut retries = CRC_RETRIES;
        while !crc_ok(&body) && retries > 0 {
            std::thread::sleep(CRC_RETRY_PAUSE);
            body = self.hw.onewire_read(&self.slave_id)?;
            retries -= 1;
        }
        let celsius = parse_w1_slave(&body)?;
        Ok(vec![RawSample {
            kind: MeasurementKind::Temperature,
            raw: celsius,
            unit: "°C".into(),
        }])
    }
}

fn crc_ok(body: &str) -> bool {
    body.lines()
        .next()
        .is_some_and(|line| line.trim_end().ends_with("YES"))
}

/// Parse a w1_slave file body into degrees Celsius.
pub fn parse_w1_slave(body: &str) -> Result<f64> {
    if !crc_ok(body) {
        return Err(Error::transient("ds18b20 crc check failed"));
    }
    let second = body
        .lines()
        .nth(1)
        .ok_or_else(|| Error::transient("ds18b20 slave file truncated"))?;
    let raw = second
        .split_once("t=")
        .map(|(_, tail)| tail.trim())
        .ok_or_else(|| Error::transient("ds18b20 slave file missing t= field"))?;
    let millidegrees: f64 = raw
        .parse()
        .map_err(|_| Error::transient(format!("ds18b20 unparsable reading '{raw}'")))?;
    Ok(millidegrees / 1000.0)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::stub::{w1_slave_text, StubHardware};

    fn record(config: &str) -> SensorRecord {
        SensorRecord {
            id: 1,
            name: "water-temp".into(),
            driver: "ds18b20".into(),
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

    // -- Parsing --------------------------------------------------------------

    #[test]
    fn parse_positive_temperature() {
        let body = w1_slave_text(21_437, true);
        assert!((parse_w1_slave(&body).unwrap() - 21.437).abs() < 1e-9);
    }

    #[test]
    fn parse_negative_temperature() {
        let body = w1_slave_text(-1_250, true);
        assert!((parse_w1_slave(&body).unwrap() + 1.25).abs() < 1e-9);
    }

    #[test]
    fn crc_failure_is_transient() {
        let body = w1_slave_text(21_437, false);
        let err = parse_w1_slave(&body).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn truncated_body_is_transient() {
        let err = parse_w1_slave("xx yy zz : crc=e9 YES\n").unwrap_err();
        assert!(err.is_transient());
    }

    // -- Config ---------------------------------------------------------------

    #[test]
    fn validate_accepts_empty_and_explicit_id() {
        validate(&serde_json::json!({})).unwrap();
        validate(&serde_json::json!({"slave_id": "28-abc"})).unwrap();
    }

    #[test]
    fn validate_rejects_unknown_fields() {
        assert!(validate(&serde_json::json!({"slave": "28-abc"})).is_err());
    }

    // -- Driver ---------------------------------------------------------------

    #[test]
    fn open_autodetects_first_slave() {
        let hw = Arc::new(StubHardware::new());
        hw.add_onewire_slave("28-aaa", &w1_slave_text(20_000, true));
        hw.add_onewire_slave("28-bbb", &w1_slave_text(25_000, true));

        let mut driver = open(&record("{}"), hw as Arc<dyn Hardware>).unwrap();
        let samples = driver.read(&ReadCtx::default()).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].kind, MeasurementKind::Temperature);
        assert!((samples[0].raw - 20.0).abs() < 1e-9, "first slave in order");
    }

    #[test]
    fn open_with_explicit_slave_id() {
        let hw = Arc::new(StubHardware::new());
        hw.add_onewire_slave("28-aaa", &w1_slave_text(20_000, true));
        hw.add_onewire_slave("28-bbb", &w1_slave_text(25_000, true));

        let mut driver = open(
            &record(r#"{"slave_id":"28-bbb"}"#),
            hw as Arc<dyn Hardware>,
        )
        .unwrap();
        let samples = driver.read(&ReadCtx::default()).unwrap();
        assert!((samples[0].raw - 25.0).abs() < 1e-9);
    }

    #[test]
    fn open_fails_persistent_when_bus_is_empty() {
        let hw = Arc::new(StubHardware::new());
        let err = open(&record("{}"), hw as Arc<dyn Hardware>).unwrap_err();
        assert!(matches!(err, Error::Persistent(_)));
    }

    #[test]
    fn read_missing_slave_is_persistent() {
        let hw = Arc::new(StubHardware::new());
        hw.add_onewire_slave("28-aaa", &w1_slave_text(20_000, true));
        let mut driver = open(&record("{}"), hw.clone() as Arc<dyn Hardware>).unwrap();

        // Probe unplugged between open and read.
        let fresh = Arc::new(StubHardware::new());
        let mut gone = Ds18b20 {
            hw: fresh as Arc<dyn Hardware>,
            slave_id: "28-aaa".into(),
        };
        assert!(matches!(
            gone.read(&ReadCtx::default()),
            Err(Error::Persistent(_))
        ));

        // The healthy driver still reads fine.
        assert!(driver.read(&ReadCtx::default()).is_ok());
    }
}
