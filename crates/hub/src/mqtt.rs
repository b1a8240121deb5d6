//! Optional MQTT publisher: latest calibrated measurements go out to
//! `<base>/<sensor-name>/reading` on a fixed cadence, with a retained
//! online/offline status topic as the last will. Publish-only — commands
//! never come in over the broker; the HTTP API is the sole mutation path.

use std::time::Duration;

use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::scheduler::Runtime;
use crate::store::Measurement;

fn default_port() -> u16 {
    1883
}

fn default_interval() -> u64 {
    10
}

fn default_base_topic() -> String {
    "tele".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MqttSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_interval")]
    pub publish_interval_secs: u64,
    #[serde(default = "default_base_topic")]
    pub base_topic: String,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            host: String::new(),
            port: default_port(),
            publish_interval_secs: default_interval(),
            base_topic: default_base_topic(),
        }
    }
}

pub const STATUS_TOPIC: &str = "status/aquahub";

pub fn reading_topic(base: &str, sensor_name: &str) -> String {
    format!("{base}/{sensor_name}/reading")
}

pub fn reading_payload(m: &Measurement) -> Vec<u8> {
    serde_json::json!({
        "ts": m.ts,
        "kind": m.kind.as_str(),
        "value": m.value,
        "unit": m.unit,
    })
    .to_string()
    .into_bytes()
}

/// Publisher loop; returns when `shutdown` flips. Broker loss is not an
/// error — rumqttc reconnects and we keep going.
pub async fn run(
    runtime: Arc<Runtime>,
    settings: MqttSettings,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut options = MqttOptions::new("aquahub", &settings.host, settings.port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_last_will(LastWill::new(
        STATUS_TOPIC,
        b"offline".to_vec(),
        QoS::AtLeastOnce,
        true,
    ));

    let (client, mut eventloop) = AsyncClient::new(options, 20);
    let mut ticker = tokio::time::interval(Duration::from_secs(settings.publish_interval_secs));

    loop {
        tokio::select! {
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt connected");
                        let _ = client
                            .publish(STATUS_TOPIC, QoS::AtLeastOnce, true, b"online".to_vec())
                            .await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("mqtt error: {e} — retrying");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }

            _ = ticker.tick() => {
                publish_latest(&runtime, &client, &settings.base_topic).await;
            }

            _ = shutdown.changed() => {
                let _ = client
                    .publish(STATUS_TOPIC, QoS::AtLeastOnce, true, b"offline".to_vec())
                    .await;
                return;
            }
        }
    }
}

async fn publish_latest(runtime: &Runtime, client: &AsyncClient, base_topic: &str) {
    let sensors = match runtime.db.list_sensors().await {
        Ok(sensors) => sensors,
        Err(e) => {
            warn!("mqtt publish: sensor list failed: {e}");
            return;
        }
    };
    for sensor in sensors.iter().filter(|s| s.enabled) {
        let Some(latest) = runtime.store.latest(sensor.id).await else {
            continue;
        };
        let topic = reading_topic(base_topic, &sensor.name);
        if let Err(e) = client
            .publish(
                topic,
                QoS::AtLeastOnce,
                false,
                reading_payload(&latest),
            )
            .await
        {
            warn!(sensor = %sensor.name, "mqtt publish failed: {e}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MeasurementKind;

    #[test]
    fn reading_topic_shape() {
        assert_eq!(reading_topic("tele", "tank-ph"), "tele/tank-ph/reading");
        assert_eq!(reading_topic("pool", "orp"), "pool/orp/reading");
    }

    #[test]
    fn reading_payload_serializes_measurement() {
        let m = Measurement {
            sensor_id: 1,
            ts: 1_700_000_000_000,
            kind: MeasurementKind::Ph,
            value: 6.5,
            unit: "pH".into(),
            raw: Some(1.2),
        };
        let json: serde_json::Value =
            serde_json::from_slice(&reading_payload(&m)).unwrap();
        assert_eq!(json["ts"], 1_700_000_000_000i64);
        assert_eq!(json["kind"], "ph");
        assert_eq!(json["value"], 6.5);
        assert_eq!(json["unit"], "pH");
        assert!(json.get("raw").is_none(), "raw values stay internal");
    }

    #[test]
    fn settings_default_disabled() {
        let settings = MqttSettings::default();
        assert!(!settings.enabled);
        assert_eq!(settings.port, 1883);
        assert_eq!(settings.base_topic, "tele");
    }

    #[test]
    fn settings_parse_from_toml_fragment() {
        let settings: MqttSettings = toml::from_str(
            r#"
enabled = true
host = "10.0.0.2"
publish_interval_secs = 30
"#,
        )
        .unwrap();
        assert!(settings.enabled);
        assert_eq!(settings.host, "10.0.0.2");
        assert_eq!(settings.publish_interval_secs, 30);
    }
}
