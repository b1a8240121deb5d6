//! Measurement store: per-sensor bounded in-memory series with a latest
//! cache, write-through to SQLite for the persistent window.
//!
//! Readers (controllers, API) are served from memory. The database keeps
//! the latest cache warm across restarts plus a shorter persistent window;
//! `warm_cache` replays that window at startup. Writers take the sensor's
//! series lock for the duration of one append (including the persistent
//! write); the outer registry lock is held only to look up the series.

use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::db::{now_ms, Db};
use crate::error::Result;

// ---------------------------------------------------------------------------
// Measurement model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementKind {
    Temperature,
    Humidity,
    Ph,
    Orp,
    Ec,
    Pressure,
    WaterLevel,
    Generic,
}

impl MeasurementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::Ph => "ph",
            Self::Orp => "orp",
            Self::Ec => "ec",
            Self::Pressure => "pressure",
            Self::WaterLevel => "water_level",
            Self::Generic => "generic",
        }
    }
}

impl FromStr for MeasurementKind {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        Ok(match s {
            "temperature" => Self::Temperature,
            "humidity" => Self::Humidity,
            "ph" => Self::Ph,
            "orp" => Self::Orp,
            "ec" => Self::Ec,
            "pressure" => Self::Pressure,
            "water_level" => Self::WaterLevel,
            "generic" => Self::Generic,
            _ => return Err(()),
        })
    }
}

impl std::fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One calibrated sample. `ts` is UTC unix milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    pub sensor_id: i64,
    pub ts: i64,
    pub kind: MeasurementKind,
    pub value: f64,
    pub unit: String,
    pub raw: Option<f64>,
}

// ---------------------------------------------------------------------------
// Retention
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    /// In-memory window per sensor.
    pub memory_window_ms: i64,
    /// Hard cap on in-memory points per sensor.
    pub memory_max_points: usize,
    /// Window kept in SQLite (survives restarts).
    pub persist_window_ms: i64,
    /// Action log window kept in SQLite.
    pub actions_window_ms: i64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            memory_window_ms: 24 * 3600 * 1000,
            memory_max_points: 100_000,
            persist_window_ms: 6 * 3600 * 1000,
            actions_window_ms: 7 * 24 * 3600 * 1000,
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Series {
    /// Insertion-ordered, trimmed to the retention policy.
    points: VecDeque<Measurement>,
    latest: Option<Measurement>,
}

pub struct MeasurementStore {
    db: Db,
    retention: RetentionPolicy,
    series: RwLock<HashMap<i64, Arc<RwLock<Series>>>>,
}

impl MeasurementStore {
    pub fn new(db: Db, retention: RetentionPolicy) -> Self {
        Self {
            db,
            retention,
            series: RwLock::new(HashMap::new()),
        }
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    /// Replay the persistent window into memory. Called once at startup,
    /// before the scheduler begins ticking.
    pub async fn warm_cache(&self) -> Result<usize> {
        let since = now_ms() - self.retention.persist_window_ms;
        let rows = self.db.measurements_since(since).await?;
        let count = rows.len();
        for m in rows {
            let series = self.series_for(m.sensor_id).await;
            let mut guard = series.write().await;
            push_trimmed(&mut guard, m, &self.retention);
        }
        Ok(count)
    }

    async fn series_for(&self, sensor_id: i64) -> Arc<RwLock<Series>> {
        {
            let map = self.series.read().await;
            if let Some(series) = map.get(&sensor_id) {
                return Arc::clone(series);
            }
        }
        let mut map = self.series.write().await;
        Arc::clone(map.entry(sensor_id).or_default())
    }

    /// Append one measurement: memory first, then the persistent store,
    /// all under the sensor's series write lock so readers never observe
    /// the two halves out of step.
    pub async fn append(&self, m: Measurement) -> Result<()> {
        let series = self.series_for(m.sensor_id).await;
        let mut guard = series.write().await;
        self.db.insert_measurement(&m).await?;
        push_trimmed(&mut guard, m, &self.retention);
        Ok(())
    }

    pub async fn latest(&self, sensor_id: i64) -> Option<Measurement> {
        let map = self.series.read().await;
        let series = map.get(&sensor_id)?;
        let guard = series.read().await;
        guard.latest.clone()
    }

    /// Measurements in `[t_start, t_end]` (inclusive), oldest first.
    pub async fn range(
        &self,
        sensor_id: i64,
        t_start: i64,
        t_end: i64,
        limit: Option<usize>,
    ) -> Vec<Measurement> {
        let map = self.series.read().await;
        let Some(series) = map.get(&sensor_id) else {
            return Vec::new();
        };
        let guard = series.read().await;
        let iter = guard
            .points
            .iter()
            .filter(|m| m.ts >= t_start && m.ts <= t_end)
            .cloned();
        match limit {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        }
    }

    /// Latest window across all sensors, oldest first.
    pub async fn recent_all(&self, since: i64) -> Vec<Measurement> {
        let map = self.series.read().await;
        let mut out = Vec::new();
        for series in map.values() {
            let guard = series.read().await;
            out.extend(guard.points.iter().filter(|m| m.ts >= since).cloned());
        }
        out.sort_by_key(|m| m.ts);
        out
    }

    /// Drop everything for a sensor, memory and persistent rows both.
    pub async fn purge(&self, sensor_id: i64) -> Result<u64> {
        self.series.write().await.remove(&sensor_id);
        self.db.purge_measurements(sensor_id).await
    }

    /// Trim memory to the retention window and prune the persistent store.
    /// Returns the number of persistent rows deleted.
    pub async fn prune(&self) -> Result<u64> {
        let now = now_ms();
        let mem_cutoff = now - self.retention.memory_window_ms;
        {
            let map = self.series.read().await;
            for series in map.values() {
                let mut guard = series.write().await;
                while guard.points.front().is_some_and(|m| m.ts < mem_cutoff) {
                    guard.points.pop_front();
                }
            }
        }
        let deleted = self
            .db
            .prune_measurements(now - self.retention.persist_window_ms)
            .await?;
        self.db
            .prune_actions(now - self.retention.actions_window_ms)
            .await?;
        Ok(deleted)
    }
}

fn push_trimmed(series: &mut Series, m: Measurement, retention: &RetentionPolicy) {
    let window_cutoff = m.ts - retention.memory_window_ms;
    series.points.push_back(m.clone());
    while series.points.len() > retention.memory_max_points
        || series
            .points
            .front()
            .is_some_and(|old| old.ts < window_cutoff)
    {
        series.points.pop_front();
    }
    if series.latest.as_ref().is_none_or(|old| old.ts <= m.ts) {
        series.latest = Some(m);
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SensorFields;

    async fn store_with_sensor() -> (MeasurementStore, i64) {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let s = db
            .create_sensor(&SensorFields {
                name: "probe".into(),
                driver: "cs1237_generic".into(),
                description: String::new(),
                enabled: true,
                update_interval: 10,
                config: "{}".into(),
                calibration: "[]".into(),
            })
            .await
            .unwrap();
        (
            MeasurementStore::new(db, RetentionPolicy::default()),
            s.id,
        )
    }

    fn m(sensor_id: i64, ts: i64, value: f64) -> Measurement {
        Measurement {
            sensor_id,
            ts,
            kind: MeasurementKind::Generic,
            value,
            unit: "mV".into(),
            raw: Some(value),
        }
    }

    // -- Kind parsing --------------------------------------------------------

    #[test]
    fn kind_round_trips_through_strings() {
        for kind in [
            MeasurementKind::Temperature,
            MeasurementKind::Humidity,
            MeasurementKind::Ph,
            MeasurementKind::Orp,
            MeasurementKind::Ec,
            MeasurementKind::Pressure,
            MeasurementKind::WaterLevel,
            MeasurementKind::Generic,
        ] {
            assert_eq!(MeasurementKind::from_str(kind.as_str()), Ok(kind));
        }
    }

    #[test]
    fn unknown_kind_fails_to_parse() {
        assert!(MeasurementKind::from_str("salinity").is_err());
    }

    // -- Append / latest / range --------------------------------------------

    #[tokio::test]
    async fn append_updates_latest_cache() {
        let (store, sid) = store_with_sensor().await;
        let now = now_ms();
        store.append(m(sid, now - 20, 1.0)).await.unwrap();
        store.append(m(sid, now - 10, 2.0)).await.unwrap();

        let latest = store.latest(sid).await.unwrap();
        assert_eq!(latest.value, 2.0);
    }

    #[tokio::test]
    async fn latest_of_unknown_sensor_is_none() {
        let (store, _) = store_with_sensor().await;
        assert!(store.latest(999).await.is_none());
    }

    #[tokio::test]
    async fn range_is_inclusive_and_insertion_ordered() {
        let (store, sid) = store_with_sensor().await;
        let base = now_ms();
        for (i, v) in [1.0, 2.0, 3.0, 4.0].iter().enumerate() {
            store.append(m(sid, base + i as i64 * 100, *v)).await.unwrap();
        }

        let hits = store.range(sid, base + 100, base + 200, None).await;
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].value, 2.0);
        assert_eq!(hits[1].value, 3.0);
    }

    #[tokio::test]
    async fn range_respects_limit() {
        let (store, sid) = store_with_sensor().await;
        let base = now_ms();
        for i in 0..5 {
            store.append(m(sid, base + i, 1.0)).await.unwrap();
        }
        let hits = store.range(sid, 0, i64::MAX, Some(2)).await;
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn memory_cap_trims_oldest() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let s = db
            .create_sensor(&SensorFields {
                name: "probe".into(),
                driver: "cs1237_generic".into(),
                description: String::new(),
                enabled: true,
                update_interval: 10,
                config: "{}".into(),
                calibration: "[]".into(),
            })
            .await
            .unwrap();
        let store = MeasurementStore::new(
            db,
            RetentionPolicy {
                memory_max_points: 3,
                ..RetentionPolicy::default()
            },
        );

        let base = now_ms();
        for i in 0..5 {
            store.append(m(s.id, base + i, i as f64)).await.unwrap();
        }

        let hits = store.range(s.id, 0, i64::MAX, None).await;
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].value, 2.0, "oldest two evicted");
    }

    #[tokio::test]
    async fn memory_window_trims_stale_points() {
        let (store, sid) = store_with_sensor().await;
        let now = now_ms();
        let day = 24 * 3600 * 1000;
        store.append(m(sid, now - day - 5000, 1.0)).await.unwrap();
        store.append(m(sid, now, 2.0)).await.unwrap();

        let hits = store.range(sid, 0, i64::MAX, None).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].value, 2.0);
    }

    #[tokio::test]
    async fn out_of_order_append_does_not_regress_latest() {
        let (store, sid) = store_with_sensor().await;
        let now = now_ms();
        store.append(m(sid, now, 2.0)).await.unwrap();
        store.append(m(sid, now - 1000, 1.0)).await.unwrap();
        assert_eq!(store.latest(sid).await.unwrap().value, 2.0);
    }

    // -- Purge / warm cache --------------------------------------------------

    #[tokio::test]
    async fn purge_empties_memory_and_db() {
        let (store, sid) = store_with_sensor().await;
        let now = now_ms();
        for i in 0..10 {
            store.append(m(sid, now + i, 1.0)).await.unwrap();
        }
        store.purge(sid).await.unwrap();

        assert!(store.range(sid, 0, i64::MAX, None).await.is_empty());
        assert!(store.latest(sid).await.is_none());
    }

    #[tokio::test]
    async fn warm_cache_replays_persistent_window() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let s = db
            .create_sensor(&SensorFields {
                name: "probe".into(),
                driver: "cs1237_generic".into(),
                description: String::new(),
                enabled: true,
                update_interval: 10,
                config: "{}".into(),
                calibration: "[]".into(),
            })
            .await
            .unwrap();
        let now = now_ms();
        db.insert_measurement(&m(s.id, now - 1000, 7.5)).await.unwrap();

        // Fresh store over the same database: memory starts cold.
        let store = MeasurementStore::new(db, RetentionPolicy::default());
        assert!(store.latest(s.id).await.is_none());

        let loaded = store.warm_cache().await.unwrap();
        assert_eq!(loaded, 1);
        assert_eq!(store.latest(s.id).await.unwrap().value, 7.5);
    }

    #[tokio::test]
    async fn recent_all_merges_sensors_in_time_order() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let mk = |name: &str| SensorFields {
            name: name.into(),
            driver: "cs1237_generic".into(),
            description: String::new(),
            enabled: true,
            update_interval: 10,
            config: "{}".into(),
            calibration: "[]".into(),
        };
        let a = db.create_sensor(&mk("a")).await.unwrap();
        let b = db.create_sensor(&mk("b")).await.unwrap();
        let store = MeasurementStore::new(db, RetentionPolicy::default());

        let now = now_ms();
        store.append(m(b.id, now + 2, 2.0)).await.unwrap();
        store.append(m(a.id, now + 1, 1.0)).await.unwrap();

        let all = store.recent_all(now).await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].value, 1.0);
        assert_eq!(all[1].value, 2.0);
    }
}
