use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, QueryBuilder, Sqlite};
use std::str::FromStr;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};
use unitboard_protocol::SensorPacket;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
    /// Offset of the controllers' wall clock. Stored timestamps and the
    /// retention cutoff are both in that clock.
    clock: UtcOffset,
}

/// One point of a chart series.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct RangePoint {
    pub time: String,
    pub value: f64,
    pub sensor_id: i64,
}

/// One CSV export row. `stage`/`status` are empty when the packet carried
/// no state entry for the reading's tank.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ExportRow {
    pub time: String,
    pub tank_id: i64,
    pub sensor_id: i64,
    pub value: f64,
    pub stage: Option<i64>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageSummary {
    pub packets: i64,
    pub readings: i64,
    pub states: i64,
    pub first: Option<String>,
    pub last: Option<String>,
    pub sensor_ids: Vec<i64>,
    pub size_bytes: i64,
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Render a timestamp the way packets are stored: `YYYY-MM-DD HH:MM:SS`.
pub fn format_timestamp(at: PrimitiveDateTime) -> Result<String> {
    at.format(format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second]"
    ))
    .context("failed to format timestamp")
}

pub fn parse_timestamp(s: &str) -> Option<PrimitiveDateTime> {
    PrimitiveDateTime::parse(
        s.trim(),
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
    )
    .ok()
}

/// Storage timestamp for a packet: the controller's own DATE + TIME when
/// they form a valid timestamp, otherwise `now`.
pub fn packet_timestamp(date: &str, time: &str, now: OffsetDateTime) -> Result<String> {
    let at = parse_timestamp(&format!("{} {}", date.trim(), time.trim()))
        .unwrap_or_else(|| PrimitiveDateTime::new(now.date(), now.time()));
    format_timestamp(at)
}

fn parse_reading(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/unitboard/unitboard.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self {
            pool,
            clock: UtcOffset::UTC,
        })
    }

    pub fn with_clock_offset(mut self, clock: UtcOffset) -> Self {
        self.clock = clock;
        self
    }

    /// Current time on the controllers' clock.
    pub fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc().to_offset(self.clock)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Ingest
    // ----------------------------

    /// Store one telemetry packet with all of its readings and states, or
    /// nothing at all. Returns the new packet row id.
    pub async fn persist(&self, packet: &SensorPacket) -> Result<i64> {
        let created_at = packet_timestamp(&packet.date, &packet.time, self.now())?;
        let order = i64::try_from(packet.order)
            .with_context(|| format!("persist: ORDER {} out of range", packet.order))?;

        let mut tx = self.pool.begin().await.context("persist: begin failed")?;

        let packet_id = sqlx::query("INSERT INTO packets (order_num, created_at) VALUES (?, ?)")
            .bind(order)
            .bind(&created_at)
            .execute(&mut *tx)
            .await
            .context("persist: insert packet failed")?
            .last_insert_rowid();

        for r in &packet.values {
            let value = parse_reading(&r.value).with_context(|| {
                format!(
                    "persist: non-numeric reading {:?} (tank {}, sensor {})",
                    r.value, r.tank_id, r.sensor_id
                )
            })?;
            sqlx::query(
                "INSERT INTO readings (packet_id, tank_id, sensor_id, value) VALUES (?, ?, ?, ?)",
            )
            .bind(packet_id)
            .bind(i64::from(r.tank_id))
            .bind(i64::from(r.sensor_id))
            .bind(value)
            .execute(&mut *tx)
            .await
            .context("persist: insert reading failed")?;
        }

        for s in &packet.state {
            sqlx::query(
                "INSERT INTO states (packet_id, tank_id, stage, status) VALUES (?, ?, ?, ?)",
            )
            .bind(packet_id)
            .bind(i64::from(s.tank_id))
            .bind(i64::from(s.stage))
            .bind(&s.status)
            .execute(&mut *tx)
            .await
            .context("persist: insert state failed")?;
        }

        tx.commit().await.context("persist: commit failed")?;
        Ok(packet_id)
    }

    // ----------------------------
    // Queries
    // ----------------------------

    /// Readings between `start` and `end` (inclusive), oldest first.
    /// An empty `sensor_ids` slice means every sensor.
    pub async fn query_range(
        &self,
        start: &str,
        end: &str,
        tank_id: Option<u32>,
        sensor_ids: &[u32],
    ) -> Result<Vec<RangePoint>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT p.created_at AS time, r.value AS value, r.sensor_id AS sensor_id \
             FROM readings r JOIN packets p ON p.id = r.packet_id \
             WHERE p.created_at BETWEEN ",
        );
        qb.push_bind(start).push(" AND ").push_bind(end);

        if let Some(tank_id) = tank_id {
            qb.push(" AND r.tank_id = ").push_bind(i64::from(tank_id));
        }
        if !sensor_ids.is_empty() {
            qb.push(" AND r.sensor_id IN (");
            let mut ids = qb.separated(", ");
            for id in sensor_ids {
                ids.push_bind(i64::from(*id));
            }
            ids.push_unseparated(")");
        }
        qb.push(" ORDER BY p.created_at, r.id");

        qb.build_query_as::<RangePoint>()
            .fetch_all(&self.pool)
            .await
            .context("query_range failed")
    }

    /// Every reading in the range joined with its tank's state row from the
    /// same packet, ordered by time, tank, sensor.
    pub async fn query_export(&self, start: &str, end: &str) -> Result<Vec<ExportRow>> {
        sqlx::query_as::<_, ExportRow>(
            r#"
            SELECT p.created_at AS time,
                   r.tank_id    AS tank_id,
                   r.sensor_id  AS sensor_id,
                   r.value      AS value,
                   s.stage      AS stage,
                   s.status     AS status
            FROM readings r
            JOIN packets p ON p.id = r.packet_id
            LEFT JOIN states s ON s.packet_id = r.packet_id AND s.tank_id = r.tank_id
            WHERE p.created_at BETWEEN ? AND ?
            ORDER BY p.created_at, r.tank_id, r.sensor_id
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .context("query_export failed")
    }

    pub async fn summary(&self) -> Result<StorageSummary> {
        let (packets, first, last): (i64, Option<String>, Option<String>) =
            sqlx::query_as("SELECT COUNT(*), MIN(created_at), MAX(created_at) FROM packets")
                .fetch_one(&self.pool)
                .await
                .context("summary: packets failed")?;

        let readings: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM readings")
            .fetch_one(&self.pool)
            .await
            .context("summary: readings failed")?;

        let states: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM states")
            .fetch_one(&self.pool)
            .await
            .context("summary: states failed")?;

        let sensor_ids: Vec<i64> =
            sqlx::query_scalar("SELECT DISTINCT sensor_id FROM readings ORDER BY sensor_id")
                .fetch_all(&self.pool)
                .await
                .context("summary: sensor ids failed")?;

        Ok(StorageSummary {
            packets,
            readings,
            states,
            first,
            last,
            sensor_ids,
            size_bytes: self.size_bytes().await?,
        })
    }

    // ----------------------------
    // Retention
    // ----------------------------

    /// Logical database size (`page_count * page_size`).
    pub async fn size_bytes(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()")
            .fetch_one(&self.pool)
            .await
            .context("size_bytes failed")
    }

    /// Delete every packet stamped before `cutoff`. Readings and states
    /// cascade.
    pub async fn delete_older_than(&self, cutoff: &str) -> Result<u64> {
        let res = sqlx::query("DELETE FROM packets WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("delete_older_than failed")?;
        Ok(res.rows_affected())
    }

    pub async fn delete_oldest(&self, count: i64) -> Result<u64> {
        let res = sqlx::query(
            "DELETE FROM packets WHERE id IN \
             (SELECT id FROM packets ORDER BY created_at, id LIMIT ?)",
        )
        .bind(count)
        .execute(&self.pool)
        .await
        .context("delete_oldest failed")?;
        Ok(res.rows_affected())
    }

    /// Rebuild the file so freed pages go back to the filesystem.
    pub async fn vacuum(&self) -> Result<()> {
        sqlx::query("VACUUM")
            .execute(&self.pool)
            .await
            .context("vacuum failed")?;
        Ok(())
    }

    pub async fn packet_count(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM packets")
            .fetch_one(&self.pool)
            .await
            .context("packet_count failed")
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;
    use unitboard_protocol::{SensorValue, TankState};

    async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn reading(tank_id: u32, sensor_id: u32, value: &str) -> SensorValue {
        SensorValue {
            tank_id,
            sensor_id,
            value: value.into(),
        }
    }

    fn packet(order: u64, date: &str, time: &str, values: Vec<SensorValue>) -> SensorPacket {
        SensorPacket {
            order,
            date: date.into(),
            time: time.into(),
            values,
            state: vec![TankState {
                tank_id: 101,
                stage: 2,
                status: "Run".into(),
            }],
        }
    }

    async fn count(db: &Db, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&db.pool)
            .await
            .unwrap()
    }

    // -- Timestamps ---------------------------------------------------------

    #[test]
    fn packet_timestamp_uses_controller_clock() {
        let now = datetime!(2030-06-01 08:00:00 UTC);
        assert_eq!(
            packet_timestamp("2024-01-01", "00:00:00", now).unwrap(),
            "2024-01-01 00:00:00"
        );
    }

    #[test]
    fn packet_timestamp_falls_back_to_now() {
        let now = datetime!(2030-06-01 08:00:05 UTC);
        assert_eq!(packet_timestamp("", "", now).unwrap(), "2030-06-01 08:00:05");
        assert_eq!(
            packet_timestamp("01/02/2024", "10:00", now).unwrap(),
            "2030-06-01 08:00:05"
        );
    }

    // -- Persist ------------------------------------------------------------

    #[tokio::test]
    async fn persist_writes_packet_readings_and_states() {
        let db = test_db().await;
        let p = packet(
            1,
            "2024-01-01",
            "00:00:00",
            vec![reading(101, 1, "23.5"), reading(101, 2, "-1")],
        );

        db.persist(&p).await.unwrap();

        assert_eq!(count(&db, "packets").await, 1);
        assert_eq!(count(&db, "readings").await, 2);
        assert_eq!(count(&db, "states").await, 1);

        let (order, created_at): (i64, String) =
            sqlx::query_as("SELECT order_num, created_at FROM packets")
                .fetch_one(&db.pool)
                .await
                .unwrap();
        assert_eq!(order, 1);
        assert_eq!(created_at, "2024-01-01 00:00:00");
    }

    #[tokio::test]
    async fn persist_is_all_or_nothing() {
        let db = test_db().await;
        // Second reading fails to parse after the packet row and the first
        // reading were already written inside the transaction.
        let p = packet(
            7,
            "2024-01-01",
            "00:00:00",
            vec![reading(101, 1, "23.5"), reading(101, 2, "n/a")],
        );

        let err = db.persist(&p).await.unwrap_err();
        assert!(format!("{err:#}").contains("non-numeric reading"), "{err:#}");

        assert_eq!(count(&db, "packets").await, 0);
        assert_eq!(count(&db, "readings").await, 0);
        assert_eq!(count(&db, "states").await, 0);
    }

    #[tokio::test]
    async fn persist_rejects_order_past_column_range() {
        let db = test_db().await;
        let p = packet(u64::MAX, "2024-01-01", "00:00:00", vec![reading(101, 1, "1")]);

        let err = db.persist(&p).await.unwrap_err();
        assert!(format!("{err:#}").contains("out of range"), "{err:#}");
        assert_eq!(count(&db, "packets").await, 0);

        let p = packet(i64::MAX as u64, "2024-01-01", "00:00:00", vec![]);
        db.persist(&p).await.unwrap();
        let order: i64 = sqlx::query_scalar("SELECT order_num FROM packets")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(order, i64::MAX);
    }

    #[tokio::test]
    async fn fallback_stamp_follows_controller_clock() {
        let offset = UtcOffset::from_hms(9, 0, 0).unwrap();
        let db = test_db().await.with_clock_offset(offset);
        assert_eq!(db.now().offset(), offset);

        db.persist(&packet(1, "", "", vec![])).await.unwrap();
        let created_at: String = sqlx::query_scalar("SELECT created_at FROM packets")
            .fetch_one(&db.pool)
            .await
            .unwrap();

        let local = OffsetDateTime::now_utc().to_offset(offset);
        let expected = PrimitiveDateTime::new(local.date(), local.time());
        let stored = parse_timestamp(&created_at).unwrap();
        assert!(
            (expected - stored).whole_seconds().abs() <= 5,
            "stored={created_at} expected~{expected}"
        );
    }

    // -- Queries ------------------------------------------------------------

    async fn seeded_db() -> Db {
        let db = test_db().await;
        for (i, time) in ["10:00:00", "10:00:01", "10:00:02"].iter().enumerate() {
            let mut p = packet(
                i as u64,
                "2024-02-01",
                time,
                vec![
                    reading(101, 1, &format!("{}.0", 20 + i)),
                    reading(101, 2, "5"),
                    reading(102, 1, "7"),
                ],
            );
            if i == 2 {
                p.state.clear();
            }
            db.persist(&p).await.unwrap();
        }
        db
    }

    #[tokio::test]
    async fn query_range_filters_and_orders() {
        let db = seeded_db().await;

        let pts = db
            .query_range("2024-02-01 10:00:00", "2024-02-01 10:00:01", Some(101), &[1])
            .await
            .unwrap();
        assert_eq!(pts.len(), 2);
        assert_eq!(pts[0].time, "2024-02-01 10:00:00");
        assert_eq!(pts[0].value, 20.0);
        assert_eq!(pts[1].value, 21.0);
        assert!(pts.iter().all(|p| p.sensor_id == 1));

        let all = db
            .query_range("2024-02-01 00:00:00", "2024-02-01 23:59:59", None, &[])
            .await
            .unwrap();
        assert_eq!(all.len(), 9);
    }

    #[tokio::test]
    async fn query_range_multiple_sensors() {
        let db = seeded_db().await;
        let pts = db
            .query_range("2024-02-01 00:00:00", "2024-02-01 23:59:59", Some(101), &[1, 2])
            .await
            .unwrap();
        assert_eq!(pts.len(), 6);
    }

    #[tokio::test]
    async fn query_export_keeps_readings_without_state() {
        let db = seeded_db().await;
        let rows = db
            .query_export("2024-02-01 00:00:00", "2024-02-01 23:59:59")
            .await
            .unwrap();
        assert_eq!(rows.len(), 9);

        // Tank 102 never has a state row.
        let t102: Vec<_> = rows.iter().filter(|r| r.tank_id == 102).collect();
        assert!(t102.iter().all(|r| r.stage.is_none() && r.status.is_none()));

        // Third packet has no states at all.
        let last = rows.iter().filter(|r| r.time == "2024-02-01 10:00:02");
        assert!(last.clone().all(|r| r.status.is_none()));

        let first = &rows[0];
        assert_eq!((first.tank_id, first.sensor_id), (101, 1));
        assert_eq!(first.stage, Some(2));
        assert_eq!(first.status.as_deref(), Some("Run"));
    }

    #[tokio::test]
    async fn summary_counts_rows() {
        let db = seeded_db().await;
        let s = db.summary().await.unwrap();
        assert_eq!(s.packets, 3);
        assert_eq!(s.readings, 9);
        assert_eq!(s.states, 2);
        assert_eq!(s.first.as_deref(), Some("2024-02-01 10:00:00"));
        assert_eq!(s.last.as_deref(), Some("2024-02-01 10:00:02"));
        assert_eq!(s.sensor_ids, vec![1, 2]);
        assert!(s.size_bytes > 0);
    }

    // -- Deletion -------------------------------------------------------------

    #[tokio::test]
    async fn delete_cascades_to_children() {
        let db = seeded_db().await;
        let removed = db.delete_older_than("2024-02-01 10:00:02").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(count(&db, "packets").await, 1);
        assert_eq!(count(&db, "readings").await, 3);
        assert_eq!(count(&db, "states").await, 0);
    }

    #[tokio::test]
    async fn delete_oldest_removes_in_time_order() {
        let db = seeded_db().await;
        assert_eq!(db.delete_oldest(2).await.unwrap(), 2);
        let s = db.summary().await.unwrap();
        assert_eq!(s.first.as_deref(), Some("2024-02-01 10:00:02"));
        assert_eq!(db.delete_oldest(100).await.unwrap(), 1);
        assert_eq!(db.delete_oldest(100).await.unwrap(), 0);
    }
}
