//! SQLite identity ledger.
//!
//! One row per contributor fingerprint holding strikes, timeouts and the
//! quota consumed in the current period. Banning deletes the row; permanent
//! bans are additionally remembered in the `banned` table.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension, params};

const SCHEMA_VERSION: i32 = 2;
const BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Durable per-identity counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRecord {
    pub fingerprint: String,
    pub strikes: u32,
    pub timeouts: u32,
    /// Whole megabytes admitted in the current period.
    pub daily_upload_mb: u64,
    /// Whole seconds of airtime admitted in the current period.
    pub daily_airtime_secs: u64,
    /// Unix seconds of the last admitted upload.
    pub last_upload_at: Option<i64>,
    /// Unix seconds at which the current quota period began.
    pub period_start: i64,
}

impl IdentityRecord {
    pub fn new(fingerprint: impl Into<String>, now: i64) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            strikes: 0,
            timeouts: 0,
            daily_upload_mb: 0,
            daily_airtime_secs: 0,
            last_upload_at: None,
            period_start: now,
        }
    }

    /// Reset the quota counters once the current period has elapsed.
    ///
    /// Periods are fixed windows anchored at `period_start`, so the new start
    /// advances by whole periods. A zero period never resets.
    pub fn roll_period(&mut self, now: i64, period_secs: i64) -> bool {
        if period_secs <= 0 || now < self.period_start.saturating_add(period_secs) {
            return false;
        }
        let elapsed_periods = (now - self.period_start) / period_secs;
        self.period_start += elapsed_periods * period_secs;
        self.daily_upload_mb = 0;
        self.daily_airtime_secs = 0;
        true
    }

    /// Account for an admitted upload.
    pub fn charge(&mut self, size_mb: u64, airtime_secs: u64, now: i64) {
        self.daily_upload_mb = self.daily_upload_mb.saturating_add(size_mb);
        self.daily_airtime_secs = self.daily_airtime_secs.saturating_add(airtime_secs);
        self.last_upload_at = Some(now);
    }
}

/// Failure modes of [`IdentityLedger::commit_admission`].
#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    /// The ledger failed before the file was touched.
    #[error("ledger: {0:#}")]
    Store(anyhow::Error),
    /// Promoting the file failed; nothing was written.
    #[error("promote: {0}")]
    Promote(#[source] std::io::Error),
    /// The file was promoted to `dest` but the ledger write failed.
    #[error("commit after promote to {}: {error:#}", dest.display())]
    Ledger { dest: PathBuf, error: anyhow::Error },
}

#[derive(Clone)]
pub struct IdentityLedger {
    pool: Pool<SqliteConnectionManager>,
}

fn map_identity_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IdentityRecord> {
    Ok(IdentityRecord {
        fingerprint: row.get(0)?,
        strikes: row.get::<_, i64>(1)?.max(0) as u32,
        timeouts: row.get::<_, i64>(2)?.max(0) as u32,
        daily_upload_mb: row.get::<_, i64>(3)?.max(0) as u64,
        daily_airtime_secs: row.get::<_, i64>(4)?.max(0) as u64,
        last_upload_at: row.get(5)?,
        period_start: row.get(6)?,
    })
}

const SELECT_IDENTITY: &str = r#"
    SELECT user, strikes, timeouts, daily_upload, daily_airtime, last_upload, period_start
    FROM user_stats
    WHERE user = ?1
"#;

impl IdentityLedger {
    /// Open (or create) the ledger database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create ledger dir {:?}", parent))?;
        }
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.busy_timeout(BUSY_TIMEOUT)?;
            Ok(())
        });
        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .context("create ledger pool")?;
        Self::bootstrap(pool)
    }

    /// Private in-memory ledger. Every pooled connection would be a separate
    /// database, so the pool holds exactly one.
    pub fn open_in_memory() -> Result<Self> {
        let pool = Pool::builder()
            .max_size(1)
            .build(SqliteConnectionManager::memory())
            .context("create in-memory ledger pool")?;
        Self::bootstrap(pool)
    }

    fn bootstrap(pool: Pool<SqliteConnectionManager>) -> Result<Self> {
        {
            let conn = pool.get().context("open ledger")?;
            init_schema(&conn)?;
        }
        Ok(Self { pool })
    }

    /// Lookup-or-insert: return the identity's row, creating a zeroed one on first sight.
    pub fn load_or_create(&self, fingerprint: &str, now: i64) -> Result<IdentityRecord> {
        let conn = self.pool.get().context("open ledger")?;
        if let Some(record) = select_identity(&conn, fingerprint)? {
            return Ok(record);
        }
        conn.execute(
            "INSERT OR IGNORE INTO user_stats (user, period_start) VALUES (?1, ?2)",
            params![fingerprint, now],
        )
        .context("insert identity")?;
        select_identity(&conn, fingerprint)?
            .ok_or_else(|| anyhow::anyhow!("identity {fingerprint} missing after insert"))
    }

    pub fn get(&self, fingerprint: &str) -> Result<Option<IdentityRecord>> {
        let conn = self.pool.get().context("open ledger")?;
        select_identity(&conn, fingerprint)
    }

    pub fn save(&self, record: &IdentityRecord) -> Result<()> {
        let conn = self.pool.get().context("open ledger")?;
        upsert_identity(&conn, record)
    }

    /// Persist an admission together with the file handoff.
    ///
    /// `promote` runs first, without holding a write lock, so a slow copy
    /// does not stall writes for other identities. The row is then written
    /// in a short transaction. If that fails the destination is returned so
    /// the caller can move the file back.
    pub fn commit_admission<F>(
        &self,
        record: &IdentityRecord,
        promote: F,
    ) -> std::result::Result<PathBuf, CommitError>
    where
        F: FnOnce() -> std::io::Result<PathBuf>,
    {
        let mut conn = self
            .pool
            .get()
            .context("open ledger")
            .map_err(CommitError::Store)?;
        let dest = promote().map_err(CommitError::Promote)?;
        let written = conn
            .transaction()
            .context("begin ledger tx")
            .and_then(|tx| {
                upsert_identity(&tx, record)?;
                tx.commit().context("commit ledger tx")
            });
        match written {
            Ok(()) => Ok(dest),
            Err(error) => Err(CommitError::Ledger { dest, error }),
        }
    }

    /// Remove the identity's row; with `permanent`, also blacklist the fingerprint.
    pub fn ban(&self, fingerprint: &str, now: i64, permanent: bool) -> Result<bool> {
        let mut conn = self.pool.get().context("open ledger")?;
        let tx = conn.transaction().context("begin ledger tx")?;
        let deleted = tx
            .execute("DELETE FROM user_stats WHERE user = ?1", params![fingerprint])
            .context("delete banned identity")?;
        if permanent {
            tx.execute(
                "INSERT OR REPLACE INTO banned (user, banned_at) VALUES (?1, ?2)",
                params![fingerprint, now],
            )
            .context("record ban")?;
        }
        tx.commit().context("commit ledger tx")?;
        Ok(deleted > 0)
    }

    pub fn is_banned(&self, fingerprint: &str) -> Result<bool> {
        let conn = self.pool.get().context("open ledger")?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT banned_at FROM banned WHERE user = ?1",
                params![fingerprint],
                |row| row.get(0),
            )
            .optional()
            .context("check ban list")?;
        Ok(found.is_some())
    }
}

fn select_identity(conn: &Connection, fingerprint: &str) -> Result<Option<IdentityRecord>> {
    conn.query_row(SELECT_IDENTITY, params![fingerprint], map_identity_row)
        .optional()
        .context("select identity")
}

fn upsert_identity(conn: &Connection, record: &IdentityRecord) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO user_stats (
            user, strikes, timeouts, daily_upload, daily_airtime, last_upload, period_start
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(user) DO UPDATE SET
            strikes = excluded.strikes,
            timeouts = excluded.timeouts,
            daily_upload = excluded.daily_upload,
            daily_airtime = excluded.daily_airtime,
            last_upload = excluded.last_upload,
            period_start = excluded.period_start
        "#,
        params![
            record.fingerprint,
            record.strikes as i64,
            record.timeouts as i64,
            record.daily_upload_mb as i64,
            record.daily_airtime_secs as i64,
            record.last_upload_at,
            record.period_start,
        ],
    )
    .context("upsert identity")?;
    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .context("inspect table")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .context("read table info")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("read table info")?;
    Ok(names.iter().any(|name| name == column))
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS user_stats (
            user TEXT PRIMARY KEY,
            strikes INTEGER NOT NULL DEFAULT 0,
            timeouts INTEGER NOT NULL DEFAULT 0,
            daily_upload INTEGER NOT NULL DEFAULT 0,
            daily_airtime INTEGER NOT NULL DEFAULT 0,
            last_upload INTEGER,
            period_start INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS banned (
            user TEXT PRIMARY KEY,
            banned_at INTEGER NOT NULL
        );
        "#,
    )
    .context("create ledger schema")?;

    let version = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get::<_, String>(0),
        )
        .optional()?
        .and_then(|value| value.parse::<i32>().ok())
        .unwrap_or(1);

    // Version 1 databases predate quota periods and stored timestamps as text.
    if version < 2 {
        if !has_column(conn, "user_stats", "period_start")? {
            conn.execute(
                "ALTER TABLE user_stats ADD COLUMN period_start INTEGER NOT NULL DEFAULT 0",
                [],
            )
            .context("migrate user_stats period_start")?;
        }
        // The zero time and unparseable stamps mean "never uploaded".
        conn.execute(
            r#"
            UPDATE user_stats
            SET last_upload = CASE
                WHEN CAST(strftime('%s', last_upload) AS INTEGER) > 0
                    THEN CAST(strftime('%s', last_upload) AS INTEGER)
                ELSE NULL
            END
            WHERE typeof(last_upload) = 'text'
            "#,
            [],
        )
        .context("migrate user_stats last_upload")?;
    }
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?1)",
        params![SCHEMA_VERSION.to_string()],
    )
    .context("update schema version")?;

    Ok(())
}
