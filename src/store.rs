//! SQLite persistence for site records and aggregated statistics.
//!
//! Minute rows arrive from the stats collector, get merged by weighted
//! average when a period is written twice, and are rolled up into hour
//! and day rows. Rollups recompute the target row from its source rows,
//! so running them repeatedly for the same period is harmless.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::site::SiteRecord;

const SCHEMA_VERSION: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodType {
    Minute,
    Hour,
    Day,
}

impl PeriodType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodType::Minute => "minute",
            PeriodType::Hour => "hour",
            PeriodType::Day => "day",
        }
    }

    pub fn seconds(&self) -> i64 {
        match self {
            PeriodType::Minute => 60,
            PeriodType::Hour => 3600,
            PeriodType::Day => 86_400,
        }
    }
}

/// One aggregated row: totals for counters, weighted average for CPU,
/// maximum for memory.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PeriodStats {
    pub hits: u64,
    pub incoming_bytes: u64,
    pub outgoing_bytes: u64,
    pub avg_cpu_percent: f64,
    pub max_mem_mb: f64,
    pub sample_count: u64,
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open database")?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(store)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!(
                "Running migrations from v{} to v{}",
                current_version, SCHEMA_VERSION
            );
            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }
            if current_version < 2 {
                Self::migrate_v2(&conn)?;
            }
        }

        Ok(())
    }

    /// v1: site records as JSON blobs keyed by id
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: sites");
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sites (
                id TEXT PRIMARY KEY,
                record TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            INSERT INTO schema_migrations (version) VALUES (1);
            "#,
        )?;
        Ok(())
    }

    /// v2: per-period aggregated traffic and resource stats
    fn migrate_v2(conn: &Connection) -> Result<()> {
        debug!("Applying migration v2: aggregated_stats");
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS aggregated_stats (
                site_id TEXT NOT NULL,
                period_type TEXT NOT NULL,
                period_start INTEGER NOT NULL,
                hits INTEGER NOT NULL DEFAULT 0,
                incoming_bytes INTEGER NOT NULL DEFAULT 0,
                outgoing_bytes INTEGER NOT NULL DEFAULT 0,
                avg_cpu_percent REAL NOT NULL DEFAULT 0,
                max_mem_mb REAL NOT NULL DEFAULT 0,
                sample_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (site_id, period_type, period_start)
            );

            CREATE INDEX IF NOT EXISTS idx_stats_period
                ON aggregated_stats (period_type, period_start);

            INSERT INTO schema_migrations (version) VALUES (2);
            "#,
        )?;
        Ok(())
    }

    // ---- site records --------------------------------------------------

    /// Replace the full set of persisted site records.
    pub fn save_sites(&self, records: &[SiteRecord]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM sites", [])?;
        for record in records {
            let json = serde_json::to_string(record)?;
            tx.execute(
                "INSERT INTO sites (id, record) VALUES (?1, ?2)",
                params![record.id, json],
            )?;
        }
        tx.commit()?;
        debug!(count = records.len(), "site records saved");
        Ok(())
    }

    pub fn load_sites(&self) -> Result<Vec<SiteRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT record FROM sites ORDER BY rowid")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut records = Vec::new();
        for row in rows {
            let json = row?;
            records.push(serde_json::from_str(&json).context("Corrupt site record")?);
        }
        Ok(records)
    }

    // ---- aggregated stats ------------------------------------------------

    /// Write one aggregated period. An existing row for the same key is
    /// merged: counters add up, CPU averages are weighted by sample count,
    /// memory keeps the maximum.
    pub fn record_period(
        &self,
        site_id: &str,
        period: PeriodType,
        period_start: i64,
        stats: &PeriodStats,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO aggregated_stats
                (site_id, period_type, period_start, hits, incoming_bytes,
                 outgoing_bytes, avg_cpu_percent, max_mem_mb, sample_count)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT (site_id, period_type, period_start) DO UPDATE SET
                hits = hits + excluded.hits,
                incoming_bytes = incoming_bytes + excluded.incoming_bytes,
                outgoing_bytes = outgoing_bytes + excluded.outgoing_bytes,
                avg_cpu_percent =
                    (avg_cpu_percent * sample_count
                     + excluded.avg_cpu_percent * excluded.sample_count)
                    / (sample_count + excluded.sample_count),
                max_mem_mb = MAX(max_mem_mb, excluded.max_mem_mb),
                sample_count = sample_count + excluded.sample_count
            "#,
            params![
                site_id,
                period.as_str(),
                period_start,
                stats.hits as i64,
                stats.incoming_bytes as i64,
                stats.outgoing_bytes as i64,
                stats.avg_cpu_percent,
                stats.max_mem_mb,
                stats.sample_count as i64,
            ],
        )?;
        Ok(())
    }

    pub fn find_periods(
        &self,
        site_id: &str,
        period: PeriodType,
        from: i64,
        to: i64,
    ) -> Result<Vec<(i64, PeriodStats)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT period_start, hits, incoming_bytes, outgoing_bytes,
                    avg_cpu_percent, max_mem_mb, sample_count
             FROM aggregated_stats
             WHERE site_id = ?1 AND period_type = ?2
               AND period_start >= ?3 AND period_start < ?4
             ORDER BY period_start",
        )?;
        let rows = stmt.query_map(params![site_id, period.as_str(), from, to], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                PeriodStats {
                    hits: row.get::<_, i64>(1)? as u64,
                    incoming_bytes: row.get::<_, i64>(2)? as u64,
                    outgoing_bytes: row.get::<_, i64>(3)? as u64,
                    avg_cpu_percent: row.get(4)?,
                    max_mem_mb: row.get(5)?,
                    sample_count: row.get::<_, i64>(6)? as u64,
                },
            ))
        })?;

        let mut periods = Vec::new();
        for row in rows {
            periods.push(row?);
        }
        Ok(periods)
    }

    /// Drop every aggregated row for a site.
    pub fn remove_site_stats(&self, site_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM aggregated_stats WHERE site_id = ?1",
            params![site_id],
        )?;
        Ok(())
    }

    /// Recompute hour rows from minute rows and day rows from hour rows,
    /// covering the current and previous period so boundary crossings are
    /// picked up. Rows are replaced wholesale, making the rollup safe to
    /// rerun.
    pub fn rollup(&self, now: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        let hour_floor = now - now % 3600 - 3600;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO aggregated_stats
                (site_id, period_type, period_start, hits, incoming_bytes,
                 outgoing_bytes, avg_cpu_percent, max_mem_mb, sample_count)
            SELECT site_id, 'hour', (period_start / 3600) * 3600,
                   SUM(hits), SUM(incoming_bytes), SUM(outgoing_bytes),
                   SUM(avg_cpu_percent * sample_count) / SUM(sample_count),
                   MAX(max_mem_mb), SUM(sample_count)
            FROM aggregated_stats
            WHERE period_type = 'minute' AND period_start >= ?1
            GROUP BY site_id, (period_start / 3600) * 3600
            "#,
            params![hour_floor],
        )?;

        let day_floor = now - now % 86_400 - 86_400;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO aggregated_stats
                (site_id, period_type, period_start, hits, incoming_bytes,
                 outgoing_bytes, avg_cpu_percent, max_mem_mb, sample_count)
            SELECT site_id, 'day', (period_start / 86400) * 86400,
                   SUM(hits), SUM(incoming_bytes), SUM(outgoing_bytes),
                   SUM(avg_cpu_percent * sample_count) / SUM(sample_count),
                   MAX(max_mem_mb), SUM(sample_count)
            FROM aggregated_stats
            WHERE period_type = 'hour' AND period_start >= ?1
            GROUP BY site_id, (period_start / 86400) * 86400
            "#,
            params![day_floor],
        )?;

        Ok(())
    }

    /// Delete rows past their retention window.
    pub fn apply_retention(
        &self,
        now: i64,
        minute_days: u32,
        hour_days: u32,
        day_days: u32,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        for (period, days) in [
            (PeriodType::Minute, minute_days),
            (PeriodType::Hour, hour_days),
            (PeriodType::Day, day_days),
        ] {
            let cutoff = now - i64::from(days) * 86_400;
            let deleted = conn.execute(
                "DELETE FROM aggregated_stats WHERE period_type = ?1 AND period_start < ?2",
                params![period.as_str(), cutoff],
            )?;
            if deleted > 0 {
                debug!(period = period.as_str(), deleted, "expired stats removed");
            }
        }
        Ok(())
    }
}
