use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub fn connect(path: &str) -> Result<Connection> {
    if let Some(dir) = Path::new(path).parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create database directory {:?}", dir))?;
    }
    let conn = Connection::open(path).with_context(|| format!("Failed to open {}", path))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- One row per fetch attempt that received a response. Never updated.
        CREATE TABLE IF NOT EXISTS source_data (
            id          INTEGER PRIMARY KEY,
            idno        TEXT NOT NULL,
            url         TEXT NOT NULL,
            raw_html    TEXT NOT NULL,
            status_code INTEGER NOT NULL,
            created_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_source_data_idno ON source_data(idno);

        -- Latest derived record per identifier.
        CREATE TABLE IF NOT EXISTS transformed_data (
            idno          TEXT PRIMARY KEY,
            company_name  TEXT,
            address       TEXT,
            legal_form    TEXT,
            registered_on TEXT,
            scraped_at    TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

// ── Rows ──

/// Raw page captured for one fetch attempt.
#[derive(Debug, Clone)]
pub struct SourceSnapshot {
    pub idno: String,
    pub url: String,
    pub raw_html: String,
    pub status_code: u16,
    pub fetched_at: DateTime<Utc>,
}

/// Structured view of a company page. Absent fields were not found in the markup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyRecord {
    pub idno: String,
    pub company_name: Option<String>,
    pub address: Option<String>,
    pub legal_form: Option<String>,
    pub registered_on: Option<String>,
    pub scraped_at: DateTime<Utc>,
}

// ── Snapshots ──

pub fn append_snapshot(conn: &Connection, s: &SourceSnapshot) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO source_data (idno, url, raw_html, status_code, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![s.idno, s.url, s.raw_html, s.status_code, s.fetched_at.to_rfc3339()],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn count_snapshots(conn: &Connection, idno: &str) -> rusqlite::Result<usize> {
    conn.query_row(
        "SELECT COUNT(*) FROM source_data WHERE idno = ?1",
        params![idno],
        |r| r.get(0),
    )
}

// ── Records ──

pub fn upsert_record(conn: &Connection, r: &CompanyRecord) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO transformed_data
         (idno, company_name, address, legal_form, registered_on, scraped_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(idno) DO UPDATE SET
            company_name  = excluded.company_name,
            address       = excluded.address,
            legal_form    = excluded.legal_form,
            registered_on = excluded.registered_on,
            scraped_at    = excluded.scraped_at",
        params![
            r.idno, r.company_name, r.address, r.legal_form, r.registered_on,
            r.scraped_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn fetch_record(conn: &Connection, idno: &str) -> rusqlite::Result<Option<CompanyRecord>> {
    conn.query_row(
        "SELECT idno, company_name, address, legal_form, registered_on, scraped_at
         FROM transformed_data WHERE idno = ?1",
        params![idno],
        |row| {
            let raw: String = row.get(5)?;
            let scraped_at = DateTime::parse_from_rfc3339(&raw)
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        5,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?
                .with_timezone(&Utc);
            Ok(CompanyRecord {
                idno: row.get(0)?,
                company_name: row.get(1)?,
                address: row.get(2)?,
                legal_form: row.get(3)?,
                registered_on: row.get(4)?,
                scraped_at,
            })
        },
    )
    .optional()
}

// ── Stats ──

pub struct Stats {
    pub snapshots: usize,
    pub non_success: usize,
    pub identifiers: usize,
    pub records: usize,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let snapshots: usize = conn.query_row("SELECT COUNT(*) FROM source_data", [], |r| r.get(0))?;
    let non_success: usize = conn.query_row(
        "SELECT COUNT(*) FROM source_data WHERE status_code NOT BETWEEN 200 AND 299",
        [],
        |r| r.get(0),
    )?;
    let identifiers: usize =
        conn.query_row("SELECT COUNT(DISTINCT idno) FROM source_data", [], |r| r.get(0))?;
    let records: usize =
        conn.query_row("SELECT COUNT(*) FROM transformed_data", [], |r| r.get(0))?;
    Ok(Stats {
        snapshots,
        non_success,
        identifiers,
        records,
    })
}

// ── Async store seams ──

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn append(&self, snapshot: SourceSnapshot) -> Result<i64, StoreError>;
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn upsert(&self, record: CompanyRecord) -> Result<(), StoreError>;
    async fn get(&self, idno: &str) -> Result<Option<CompanyRecord>, StoreError>;
}

/// Shared SQLite handle. Statements run on the blocking pool.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        let conn = connect(path)?;
        init_schema(&conn)?;
        Ok(Self::from_connection(conn))
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("database lock poisoned".into()))?;
            f(&guard).map_err(StoreError::from)
        })
        .await?
    }
}

#[async_trait]
impl SnapshotStore for Database {
    async fn append(&self, snapshot: SourceSnapshot) -> Result<i64, StoreError> {
        self.call(move |conn| append_snapshot(conn, &snapshot)).await
    }
}

#[async_trait]
impl RecordStore for Database {
    async fn upsert(&self, record: CompanyRecord) -> Result<(), StoreError> {
        self.call(move |conn| upsert_record(conn, &record)).await
    }

    async fn get(&self, idno: &str) -> Result<Option<CompanyRecord>, StoreError> {
        let idno = idno.to_string();
        self.call(move |conn| fetch_record(conn, &idno)).await
    }
}

// ── Tests ──
