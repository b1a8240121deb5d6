//! SQLite persistence layer (via sqlx): sensors, controllers, the
//! controller↔sensor binding table, measurements, and the action log.
//!
//! Queries are built at runtime (no compile-time database), foreign keys
//! are on, and deletes cascade — removing a sensor purges its measurements
//! and bindings in the same statement.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::store::{Measurement, MeasurementKind};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, serde::Serialize)]
pub struct SensorRecord {
    pub id: i64,
    pub name: String,
    pub driver: String,
    pub description: String,
    pub enabled: bool,
    /// Seconds between scheduled reads (>= 1).
    pub update_interval: i64,
    /// Driver-specific config, JSON object.
    pub config: String,
    /// Calibration point set, JSON array.
    pub calibration: String,
    /// Unix millis of the newest persisted measurement.
    pub last_measurement_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ControllerRecord {
    pub id: i64,
    pub name: String,
    pub controller_type: String,
    pub description: String,
    pub enabled: bool,
    pub update_interval: i64,
    pub config: String,
    pub last_run_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Fields settable on create/update (the identity column is not).
#[derive(Debug, Clone)]
pub struct SensorFields {
    pub name: String,
    pub driver: String,
    pub description: String,
    pub enabled: bool,
    pub update_interval: i64,
    pub config: String,
    pub calibration: String,
}

#[derive(Debug, Clone)]
pub struct ControllerFields {
    pub name: String,
    pub controller_type: String,
    pub description: String,
    pub enabled: bool,
    pub update_interval: i64,
    pub config: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ActionRecord {
    pub id: i64,
    pub controller_id: i64,
    pub ts: i64,
    pub action: String,
    pub details: String,
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Unique-constraint violations are configuration errors, not storage
/// faults; everything else keeps the default fatal mapping.
fn map_insert_err(e: sqlx::Error, field: &str) -> Error {
    if let sqlx::Error::Database(db_err) = &e {
        if db_err.message().contains("UNIQUE") {
            return Error::config(field, "value already in use");
        }
    }
    e.into()
}

fn sensor_from_row(row: &sqlx::sqlite::SqliteRow) -> SensorRecord {
    SensorRecord {
        id: row.get("id"),
        name: row.get("name"),
        driver: row.get("driver"),
        description: row.get("description"),
        enabled: row.get::<i64, _>("enabled") != 0,
        update_interval: row.get("update_interval"),
        config: row.get("config"),
        calibration: row.get("calibration"),
        last_measurement_at: row.get("last_measurement_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn controller_from_row(row: &sqlx::sqlite::SqliteRow) -> ControllerRecord {
    ControllerRecord {
        id: row.get("id"),
        name: row.get("name"),
        controller_type: row.get("controller_type"),
        description: row.get("description"),
        enabled: row.get::<i64, _>("enabled") != 0,
        update_interval: row.get("update_interval"),
        config: row.get("config"),
        last_run_at: row.get("last_run_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn measurement_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Measurement> {
    let kind: String = row.get("kind");
    Ok(Measurement {
        sensor_id: row.get("sensor_id"),
        ts: row.get("ts"),
        kind: MeasurementKind::from_str(&kind)
            .map_err(|_| Error::fatal(format!("unknown measurement kind '{kind}' in store")))?,
        value: row.get("value"),
        unit: row.get("unit"),
        raw: row.get("raw"),
    })
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/aquahub/aquahub.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .map_err(|e| Error::fatal(format!("invalid sqlite connection string: {e}")))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .map_err(|e| Error::fatal(format!("failed to connect to sqlite db: {e}")))?;

        Ok(Self { pool })
    }

    /// Runs sqlx migrations embedded from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::fatal(format!("migrations failed: {e}")))?;
        Ok(())
    }

    // ----------------------------
    // Sensors
    // ----------------------------

    pub async fn create_sensor(&self, f: &SensorFields) -> Result<SensorRecord> {
        let now = now_ms();
        let row = sqlx::query(
            r#"
            INSERT INTO sensors
              (name, driver, description, enabled, update_interval, config,
               calibration, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&f.name)
        .bind(&f.driver)
        .bind(&f.description)
        .bind(f.enabled as i64)
        .bind(f.update_interval)
        .bind(&f.config)
        .bind(&f.calibration)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_insert_err(e, "name"))?;
        Ok(sensor_from_row(&row))
    }

    pub async fn get_sensor(&self, id: i64) -> Result<Option<SensorRecord>> {
        let row = sqlx::query("SELECT * FROM sensors WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(sensor_from_row))
    }

    pub async fn get_sensor_by_name(&self, name: &str) -> Result<Option<SensorRecord>> {
        let row = sqlx::query("SELECT * FROM sensors WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(sensor_from_row))
    }

    pub async fn list_sensors(&self) -> Result<Vec<SensorRecord>> {
        let rows = sqlx::query("SELECT * FROM sensors ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(sensor_from_row).collect())
    }

    /// Atomic replace of every mutable sensor field.
    pub async fn update_sensor(&self, id: i64, f: &SensorFields) -> Result<Option<SensorRecord>> {
        let row = sqlx::query(
            r#"
            UPDATE sensors SET
              name = ?, driver = ?, description = ?, enabled = ?,
              update_interval = ?, config = ?, calibration = ?, updated_at = ?
            WHERE id = ?
            RETURNING *
            "#,
        )
        .bind(&f.name)
        .bind(&f.driver)
        .bind(&f.description)
        .bind(f.enabled as i64)
        .bind(f.update_interval)
        .bind(&f.config)
        .bind(&f.calibration)
        .bind(now_ms())
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_insert_err(e, "name"))?;
        Ok(row.as_ref().map(sensor_from_row))
    }

    /// Deletes the sensor; measurements and bindings cascade away with it.
    pub async fn delete_sensor(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sensors WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn touch_sensor_measurement(&self, id: i64, ts: i64) -> Result<()> {
        sqlx::query("UPDATE sensors SET last_measurement_at = ? WHERE id = ?")
            .bind(ts)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ----------------------------
    // Controllers
    // ----------------------------

    pub async fn create_controller(&self, f: &ControllerFields) -> Result<ControllerRecord> {
        let now = now_ms();
        let row = sqlx::query(
            r#"
            INSERT INTO controllers
              (name, controller_type, description, enabled, update_interval,
               config, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&f.name)
        .bind(&f.controller_type)
        .bind(&f.description)
        .bind(f.enabled as i64)
        .bind(f.update_interval)
        .bind(&f.config)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_insert_err(e, "name"))?;
        Ok(controller_from_row(&row))
    }

    pub async fn get_controller(&self, id: i64) -> Result<Option<ControllerRecord>> {
        let row = sqlx::query("SELECT * FROM controllers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(controller_from_row))
    }

    pub async fn get_controller_by_name(&self, name: &str) -> Result<Option<ControllerRecord>> {
        let row = sqlx::query("SELECT * FROM controllers WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(controller_from_row))
    }

    pub async fn list_controllers(&self) -> Result<Vec<ControllerRecord>> {
        let rows = sqlx::query("SELECT * FROM controllers ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(controller_from_row).collect())
    }

    pub async fn update_controller(
        &self,
        id: i64,
        f: &ControllerFields,
    ) -> Result<Option<ControllerRecord>> {
        let row = sqlx::query(
            r#"
            UPDATE controllers SET
              name = ?, controller_type = ?, description = ?, enabled = ?,
              update_interval = ?, config = ?, updated_at = ?
            WHERE id = ?
            RETURNING *
            "#,
        )
        .bind(&f.name)
        .bind(&f.controller_type)
        .bind(&f.description)
        .bind(f.enabled as i64)
        .bind(f.update_interval)
        .bind(&f.config)
        .bind(now_ms())
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_insert_err(e, "name"))?;
        Ok(row.as_ref().map(controller_from_row))
    }

    pub async fn delete_controller(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM controllers WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn touch_controller_run(&self, id: i64, ts: i64) -> Result<()> {
        sqlx::query("UPDATE controllers SET last_run_at = ? WHERE id = ?")
            .bind(ts)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ----------------------------
    // Controller <-> sensor bindings
    // ----------------------------

    pub async fn bind_sensor(&self, controller_id: i64, sensor_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO controller_sensors (controller_id, sensor_id)
            VALUES (?, ?)
            ON CONFLICT (controller_id, sensor_id) DO NOTHING
            "#,
        )
        .bind(controller_id)
        .bind(sensor_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn unbind_sensor(&self, controller_id: i64, sensor_id: i64) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM controller_sensors WHERE controller_id = ? AND sensor_id = ?")
                .bind(controller_id)
                .bind(sensor_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn bound_sensors(&self, controller_id: i64) -> Result<Vec<SensorRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT s.* FROM sensors s
            JOIN controller_sensors cs ON cs.sensor_id = s.id
            WHERE cs.controller_id = ?
            ORDER BY s.id
            "#,
        )
        .bind(controller_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(sensor_from_row).collect())
    }

    // ----------------------------
    // Measurements
    // ----------------------------

    pub async fn insert_measurement(&self, m: &Measurement) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO measurements (sensor_id, ts, kind, value, unit, raw)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(m.sensor_id)
        .bind(m.ts)
        .bind(m.kind.as_str())
        .bind(m.value)
        .bind(&m.unit)
        .bind(m.raw)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn latest_measurement(&self, sensor_id: i64) -> Result<Option<Measurement>> {
        let row = sqlx::query(
            r#"
            SELECT sensor_id, ts, kind, value, unit, raw FROM measurements
            WHERE sensor_id = ?
            ORDER BY ts DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(sensor_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(measurement_from_row).transpose()
    }

    pub async fn measurements_in_range(
        &self,
        sensor_id: i64,
        t_start: i64,
        t_end: i64,
        limit: Option<i64>,
    ) -> Result<Vec<Measurement>> {
        let rows = sqlx::query(
            r#"
            SELECT sensor_id, ts, kind, value, unit, raw FROM measurements
            WHERE sensor_id = ? AND ts >= ? AND ts <= ?
            ORDER BY ts ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(sensor_id)
        .bind(t_start)
        .bind(t_end)
        .bind(limit.unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(measurement_from_row).collect()
    }

    /// All measurements newer than `since`, across sensors.
    pub async fn measurements_since(&self, since: i64) -> Result<Vec<Measurement>> {
        let rows = sqlx::query(
            r#"
            SELECT sensor_id, ts, kind, value, unit, raw FROM measurements
            WHERE ts >= ?
            ORDER BY ts ASC, id ASC
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(measurement_from_row).collect()
    }

    pub async fn purge_measurements(&self, sensor_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM measurements WHERE sensor_id = ?")
            .bind(sensor_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Delete measurements older than `cutoff` (unix millis) and reclaim
    /// freed pages without locking the whole database.
    pub async fn prune_measurements(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM measurements WHERE ts < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA incremental_vacuum(100)")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ----------------------------
    // Controller actions
    // ----------------------------

    pub async fn insert_action(
        &self,
        controller_id: i64,
        ts: i64,
        action: &str,
        details: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO controller_actions (controller_id, ts, action, details)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(controller_id)
        .bind(ts)
        .bind(action)
        .bind(details)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent_actions(&self, controller_id: i64, limit: i64) -> Result<Vec<ActionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, controller_id, ts, action, details FROM controller_actions
            WHERE controller_id = ?
            ORDER BY ts DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(controller_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| ActionRecord {
                id: row.get("id"),
                controller_id: row.get("controller_id"),
                ts: row.get("ts"),
                action: row.get("action"),
                details: row.get("details"),
            })
            .collect())
    }

    pub async fn prune_actions(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM controller_actions WHERE ts < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Quick connectivity check — runs a trivial query.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn mem_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn ph_sensor_fields() -> SensorFields {
        SensorFields {
            name: "tank-ph".into(),
            driver: "cs1237_ph".into(),
            description: "main tank pH probe".into(),
            enabled: true,
            update_interval: 30,
            config: r#"{"sck_pin":11,"dout_pin":18,"din_pin":13}"#.into(),
            calibration: "[]".into(),
        }
    }

    fn dosing_controller_fields() -> ControllerFields {
        ControllerFields {
            name: "ph-dosing".into(),
            controller_type: "ph_dosing".into(),
            description: String::new(),
            enabled: false,
            update_interval: 60,
            config: "{}".into(),
        }
    }

    fn sample(sensor_id: i64, ts: i64, value: f64) -> Measurement {
        Measurement {
            sensor_id,
            ts,
            kind: MeasurementKind::Ph,
            value,
            unit: "pH".into(),
            raw: Some(value / 2.0),
        }
    }

    // -- Sensor CRUD --------------------------------------------------------

    #[tokio::test]
    async fn create_and_get_sensor() {
        let db = mem_db().await;
        let created = db.create_sensor(&ph_sensor_fields()).await.unwrap();
        assert!(created.id > 0);

        let fetched = db.get_sensor(created.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "tank-ph");
        assert_eq!(fetched.driver, "cs1237_ph");
        assert!(fetched.enabled);
        assert!(fetched.last_measurement_at.is_none());
    }

    #[tokio::test]
    async fn duplicate_sensor_name_is_config_error() {
        let db = mem_db().await;
        db.create_sensor(&ph_sensor_fields()).await.unwrap();
        let err = db.create_sensor(&ph_sensor_fields()).await.unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[tokio::test]
    async fn update_sensor_replaces_fields() {
        let db = mem_db().await;
        let created = db.create_sensor(&ph_sensor_fields()).await.unwrap();

        let mut fields = ph_sensor_fields();
        fields.description = "moved to reservoir".into();
        fields.update_interval = 120;
        fields.enabled = false;

        let updated = db.update_sensor(created.id, &fields).await.unwrap().unwrap();
        assert_eq!(updated.description, "moved to reservoir");
        assert_eq!(updated.update_interval, 120);
        assert!(!updated.enabled);
    }

    #[tokio::test]
    async fn update_missing_sensor_returns_none() {
        let db = mem_db().await;
        let result = db.update_sensor(999, &ph_sensor_fields()).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn delete_sensor_purges_measurements() {
        let db = mem_db().await;
        let s = db.create_sensor(&ph_sensor_fields()).await.unwrap();
        for i in 0..100 {
            db.insert_measurement(&sample(s.id, 1000 + i, 6.0))
                .await
                .unwrap();
        }

        assert!(db.delete_sensor(s.id).await.unwrap());

        let remaining = db
            .measurements_in_range(s.id, 0, i64::MAX, None)
            .await
            .unwrap();
        assert!(remaining.is_empty(), "no dangling measurement rows");
    }

    #[tokio::test]
    async fn delete_sensor_removes_bindings() {
        let db = mem_db().await;
        let s = db.create_sensor(&ph_sensor_fields()).await.unwrap();
        let c = db
            .create_controller(&dosing_controller_fields())
            .await
            .unwrap();
        db.bind_sensor(c.id, s.id).await.unwrap();

        db.delete_sensor(s.id).await.unwrap();
        assert!(db.bound_sensors(c.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn touch_sensor_sets_last_measurement() {
        let db = mem_db().await;
        let s = db.create_sensor(&ph_sensor_fields()).await.unwrap();
        db.touch_sensor_measurement(s.id, 12345).await.unwrap();
        let fetched = db.get_sensor(s.id).await.unwrap().unwrap();
        assert_eq!(fetched.last_measurement_at, Some(12345));
    }

    // -- Controller CRUD + bindings -----------------------------------------

    #[tokio::test]
    async fn controller_crud_round_trip() {
        let db = mem_db().await;
        let c = db
            .create_controller(&dosing_controller_fields())
            .await
            .unwrap();
        assert_eq!(c.controller_type, "ph_dosing");

        let mut fields = dosing_controller_fields();
        fields.enabled = true;
        let updated = db.update_controller(c.id, &fields).await.unwrap().unwrap();
        assert!(updated.enabled);

        assert!(db.delete_controller(c.id).await.unwrap());
        assert!(db.get_controller(c.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bind_is_idempotent() {
        let db = mem_db().await;
        let s = db.create_sensor(&ph_sensor_fields()).await.unwrap();
        let c = db
            .create_controller(&dosing_controller_fields())
            .await
            .unwrap();

        db.bind_sensor(c.id, s.id).await.unwrap();
        db.bind_sensor(c.id, s.id).await.unwrap();

        assert_eq!(db.bound_sensors(c.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unbind_reports_whether_bound() {
        let db = mem_db().await;
        let s = db.create_sensor(&ph_sensor_fields()).await.unwrap();
        let c = db
            .create_controller(&dosing_controller_fields())
            .await
            .unwrap();

        assert!(!db.unbind_sensor(c.id, s.id).await.unwrap());
        db.bind_sensor(c.id, s.id).await.unwrap();
        assert!(db.unbind_sensor(c.id, s.id).await.unwrap());
    }

    // -- Measurements --------------------------------------------------------

    #[tokio::test]
    async fn latest_measurement_wins_by_timestamp() {
        let db = mem_db().await;
        let s = db.create_sensor(&ph_sensor_fields()).await.unwrap();
        db.insert_measurement(&sample(s.id, 100, 6.1)).await.unwrap();
        db.insert_measurement(&sample(s.id, 300, 6.3)).await.unwrap();
        db.insert_measurement(&sample(s.id, 200, 6.2)).await.unwrap();

        let latest = db.latest_measurement(s.id).await.unwrap().unwrap();
        assert_eq!(latest.ts, 300);
        assert_eq!(latest.value, 6.3);
    }

    #[tokio::test]
    async fn range_query_is_inclusive_and_ordered() {
        let db = mem_db().await;
        let s = db.create_sensor(&ph_sensor_fields()).await.unwrap();
        for ts in [100, 200, 300, 400] {
            db.insert_measurement(&sample(s.id, ts, 6.0)).await.unwrap();
        }

        let hits = db.measurements_in_range(s.id, 200, 300, None).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].ts, 200);
        assert_eq!(hits[1].ts, 300);
    }

    #[tokio::test]
    async fn range_query_respects_limit() {
        let db = mem_db().await;
        let s = db.create_sensor(&ph_sensor_fields()).await.unwrap();
        for ts in 0..10 {
            db.insert_measurement(&sample(s.id, ts, 6.0)).await.unwrap();
        }
        let hits = db
            .measurements_in_range(s.id, 0, i64::MAX, Some(3))
            .await
            .unwrap();
        assert_eq!(hits.len(), 3);
    }

    #[tokio::test]
    async fn prune_measurements_removes_old_rows() {
        let db = mem_db().await;
        let s = db.create_sensor(&ph_sensor_fields()).await.unwrap();
        db.insert_measurement(&sample(s.id, 100, 6.0)).await.unwrap();
        db.insert_measurement(&sample(s.id, 900, 6.0)).await.unwrap();

        let deleted = db.prune_measurements(500).await.unwrap();
        assert_eq!(deleted, 1);

        let remaining = db
            .measurements_in_range(s.id, 0, i64::MAX, None)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].ts, 900);
    }

    // -- Action log ----------------------------------------------------------

    #[tokio::test]
    async fn actions_append_and_list_newest_first() {
        let db = mem_db().await;
        let c = db
            .create_controller(&dosing_controller_fields())
            .await
            .unwrap();
        db.insert_action(c.id, 100, "dose_up", "{}").await.unwrap();
        db.insert_action(c.id, 200, "dose_up", "{}").await.unwrap();

        let actions = db.recent_actions(c.id, 10).await.unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].ts, 200);
    }

    #[tokio::test]
    async fn prune_actions_respects_cutoff() {
        let db = mem_db().await;
        let c = db
            .create_controller(&dosing_controller_fields())
            .await
            .unwrap();
        db.insert_action(c.id, 100, "dose_up", "{}").await.unwrap();
        db.insert_action(c.id, 900, "dose_down", "{}").await.unwrap();

        assert_eq!(db.prune_actions(500).await.unwrap(), 1);
        let actions = db.recent_actions(c.id, 10).await.unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action, "dose_down");
    }

    #[tokio::test]
    async fn health_check_succeeds() {
        let db = mem_db().await;
        db.health_check().await.unwrap();
    }
}
