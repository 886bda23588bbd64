//! Database module for SMS Backup
//!
//! SQLite persistence for the state the sync engine mutates:
//! - the certificate trust store, keyed by (host, port)
//! - the backup watermark (timestamp of the newest uploaded SMS) and last sync time
//! - a generic JSON settings table

use crate::mail::BackupConfig;
use crate::sync::source::BackupPosition;
use crate::sync::trust::CertificateRecord;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

// Connection pooling
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

const WATERMARK_DATE_KEY: &str = "watermark_date";
const WATERMARK_ID_KEY: &str = "watermark_id";
const LAST_SYNC_KEY: &str = "last_sync";
const BACKUP_CONFIG_KEY: &str = "backup_config";

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type DbResult<T> = Result<T, DbError>;

// ============================================================================
// Persistence contracts
// ============================================================================

/// Persisted (host, port) → accepted certificate map. Additive: entries are only
/// ever added or replaced for the same key.
pub trait TrustStore: Send + Sync {
    fn trusted_certificate(&self, host: &str, port: u16) -> DbResult<Option<CertificateRecord>>;

    fn add_trusted_certificate(&self, host: &str, port: u16, certificate: &CertificateRecord) -> DbResult<()>;
}

/// Persisted backup progress.
///
/// Every message at or below the watermark is backed up. Messages uploaded
/// out of order above it are kept in a separate set until the watermark
/// catches up with them.
pub trait BackupCursor: Send + Sync {
    /// `None` before the first sync
    fn watermark(&self) -> DbResult<Option<BackupPosition>>;

    /// Move the watermark forward to `to` and drop uploaded-ahead entries it
    /// now covers. Never moves it backwards.
    fn advance_watermark(&self, to: BackupPosition) -> DbResult<()>;

    /// Messages backed up above the watermark
    fn uploaded_ahead(&self) -> DbResult<Vec<BackupPosition>>;

    fn record_uploaded_ahead(&self, position: BackupPosition) -> DbResult<()>;

    fn last_sync(&self) -> DbResult<Option<DateTime<Utc>>>;

    fn set_last_sync(&self, at: DateTime<Utc>) -> DbResult<()>;
}

// ============================================================================
// SQLite implementation
// ============================================================================

/// Database manager for thread-safe SQLite access
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl Database {
    /// Open (or create) the database file at `db_path`
    pub fn new(db_path: PathBuf) -> DbResult<Self> {
        let manager = SqliteConnectionManager::file(&db_path);

        let pool = Pool::builder()
            .max_size(4)
            .connection_timeout(std::time::Duration::from_secs(10))
            .build(manager)?;

        let db = Self { pool: Arc::new(pool) };
        db.initialize()?;
        log::info!("Database opened at {}", db_path.display());
        Ok(db)
    }

    /// Private in-memory database. Pooled in-memory connections do not share
    /// data, so the pool holds a single connection.
    pub fn open_in_memory() -> DbResult<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager)?;

        let db = Self { pool: Arc::new(pool) };
        db.initialize()?;
        Ok(db)
    }

    fn get_conn(&self) -> DbResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    fn initialize(&self) -> DbResult<()> {
        let conn = self.get_conn()?;
        Self::create_schema(&conn)
    }

    fn create_schema(conn: &Connection) -> DbResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sync_state (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS uploaded_ahead (
                date INTEGER NOT NULL,
                id INTEGER NOT NULL,
                PRIMARY KEY (date, id)
            );

            CREATE TABLE IF NOT EXISTS trusted_certificates (
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                fingerprint TEXT NOT NULL,
                certificate TEXT NOT NULL,
                accepted_at TEXT NOT NULL,
                PRIMARY KEY (host, port)
            );
            "#,
        )?;
        Ok(())
    }

    // =========================================================================
    // SETTINGS
    // =========================================================================

    /// Get a setting value
    pub fn get_setting<T: serde::de::DeserializeOwned>(&self, key: &str) -> DbResult<Option<T>> {
        let conn = self.get_conn()?;
        let result: Result<String, _> = conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            [key],
            |row| row.get(0),
        );

        match result {
            Ok(json) => {
                let value: T = serde_json::from_str(&json)
                    .map_err(|e| DbError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Set a setting value
    pub fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> DbResult<()> {
        let conn = self.get_conn()?;
        let json = serde_json::to_string(value)
            .map_err(|e| DbError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, json],
        )?;

        Ok(())
    }

    pub fn load_backup_config(&self) -> DbResult<Option<BackupConfig>> {
        self.get_setting(BACKUP_CONFIG_KEY)
    }

    pub fn save_backup_config(&self, config: &BackupConfig) -> DbResult<()> {
        self.set_setting(BACKUP_CONFIG_KEY, config)
    }

    /// Forget backup progress, e.g. after the login changed. Trust entries are kept.
    pub fn reset_sync_state(&self) -> DbResult<()> {
        let conn = self.get_conn()?;
        conn.execute("DELETE FROM sync_state", [])?;
        conn.execute("DELETE FROM uploaded_ahead", [])?;
        conn.execute("DELETE FROM settings WHERE key = ?1", [LAST_SYNC_KEY])?;
        log::info!("Sync state reset");
        Ok(())
    }
}

impl TrustStore for Database {
    fn trusted_certificate(&self, host: &str, port: u16) -> DbResult<Option<CertificateRecord>> {
        let conn = self.get_conn()?;
        let result: Result<String, _> = conn.query_row(
            "SELECT certificate FROM trusted_certificates WHERE host = ?1 AND port = ?2",
            params![host.to_lowercase(), port],
            |row| row.get(0),
        );

        match result {
            Ok(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| DbError::Serialization(e.to_string())),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn add_trusted_certificate(&self, host: &str, port: u16, certificate: &CertificateRecord) -> DbResult<()> {
        let json = serde_json::to_string(certificate)
            .map_err(|e| DbError::Serialization(e.to_string()))?;

        let conn = self.get_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO trusted_certificates (host, port, fingerprint, certificate, accepted_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                host.to_lowercase(),
                port,
                certificate.sha1_fingerprint(),
                json,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }
}

impl BackupCursor for Database {
    fn watermark(&self) -> DbResult<Option<BackupPosition>> {
        let conn = self.get_conn()?;
        read_watermark(&conn)
    }

    fn advance_watermark(&self, to: BackupPosition) -> DbResult<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        if read_watermark(&tx)?.map_or(true, |current| to > current) {
            tx.execute(
                "INSERT OR REPLACE INTO sync_state (key, value) VALUES (?1, ?2), (?3, ?4)",
                params![WATERMARK_DATE_KEY, to.date, WATERMARK_ID_KEY, to.id],
            )?;
            tx.execute(
                "DELETE FROM uploaded_ahead WHERE date < ?1 OR (date = ?1 AND id <= ?2)",
                params![to.date, to.id],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn uploaded_ahead(&self) -> DbResult<Vec<BackupPosition>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT date, id FROM uploaded_ahead ORDER BY date, id")?;
        let rows = stmt.query_map([], |row| Ok(BackupPosition::new(row.get(0)?, row.get(1)?)))?;
        let positions = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(positions)
    }

    fn record_uploaded_ahead(&self, position: BackupPosition) -> DbResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO uploaded_ahead (date, id) VALUES (?1, ?2)",
            params![position.date, position.id],
        )?;
        Ok(())
    }

    fn last_sync(&self) -> DbResult<Option<DateTime<Utc>>> {
        self.get_setting(LAST_SYNC_KEY)
    }

    fn set_last_sync(&self, at: DateTime<Utc>) -> DbResult<()> {
        self.set_setting(LAST_SYNC_KEY, &at)
    }
}

fn read_watermark(conn: &Connection) -> DbResult<Option<BackupPosition>> {
    let mut stmt = conn.prepare("SELECT key, value FROM sync_state WHERE key IN (?1, ?2)")?;
    let mut date = None;
    let mut id = None;
    let mut rows = stmt.query(params![WATERMARK_DATE_KEY, WATERMARK_ID_KEY])?;
    while let Some(row) = rows.next()? {
        let key: String = row.get(0)?;
        let value: i64 = row.get(1)?;
        if key == WATERMARK_DATE_KEY {
            date = Some(value);
        } else {
            id = Some(value);
        }
    }

    Ok(date.zip(id).map(|(date, id)| BackupPosition::new(date, id)))
}
