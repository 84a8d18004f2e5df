//! SQLite storage layer -- schema, migrations and the ledger mirror.

pub mod schema;

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;

use crate::ledger::{Digest, Record, RecordMirror, RecordStatus};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)
        .with_context(|| format!("failed to open database: {}", path.display()))?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Ledger mirror backed by the `ledger_records` table.
#[derive(Clone)]
pub struct SqliteMirror {
    pool: Pool,
}

impl SqliteMirror {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        Ok(Self::new(open_pool(path)?))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

impl RecordMirror for SqliteMirror {
    fn persist(&self, record: &Record) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO ledger_records (idx, device_id, payload_hash, prev_hash, hash, created_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.index as i64,
                record.device_id,
                record.payload_hash.to_hex(),
                record.prev_hash.to_hex(),
                record.hash.to_hex(),
                record.created_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
                record.status.as_str(),
            ],
        )
        .with_context(|| format!("failed to persist record {}", record.index))?;
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<Record>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT idx, device_id, payload_hash, prev_hash, hash, created_at, status
             FROM ledger_records ORDER BY idx ASC",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(RawRecord {
                index: row.get(0)?,
                device_id: row.get(1)?,
                payload_hash: row.get(2)?,
                prev_hash: row.get(3)?,
                hash: row.get(4)?,
                created_at: row.get(5)?,
                status: row.get(6)?,
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }
}

struct RawRecord {
    index: i64,
    device_id: String,
    payload_hash: String,
    prev_hash: String,
    hash: String,
    created_at: String,
    status: String,
}

impl RawRecord {
    fn into_record(self) -> Result<Record> {
        let index = self.index;
        let digest = |field: &str, value: &str| {
            Digest::from_hex(value).with_context(|| format!("record {index}: invalid {field}"))
        };
        Ok(Record {
            index: u64::try_from(index).with_context(|| format!("negative record index {index}"))?,
            payload_hash: digest("payload_hash", &self.payload_hash)?,
            prev_hash: digest("prev_hash", &self.prev_hash)?,
            hash: digest("hash", &self.hash)?,
            created_at: DateTime::parse_from_rfc3339(&self.created_at)
                .with_context(|| format!("record {index}: invalid created_at"))?
                .with_timezone(&Utc),
            status: RecordStatus::parse(&self.status)
                .with_context(|| format!("record {index}: unknown status {}", self.status))?,
            device_id: self.device_id,
        })
    }
}
