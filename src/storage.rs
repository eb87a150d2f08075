//! Durable storage of poll records.
//!
//! Every server owns one table named after it, with the columns `id`,
//! `timestamp` and one `REAL` column per register.

use crate::descriptor::{Identifier, ServerDescriptor};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::*;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::time::Duration;

/// Row identifier assigned by the store when a record is created.
pub type RecordId = i64;

/// One persisted poll outcome of one server.
#[derive(Debug, Clone, PartialEq)]
pub struct PollRecord {
    pub id: RecordId,
    /// `None` only while the server's turn is still in progress.
    pub timestamp: Option<DateTime<Utc>>,
    /// Register name and value in register order, `None` if the read failed.
    pub values: Vec<(String, Option<f64>)>,
}

impl PollRecord {
    pub fn value(&self, register: &str) -> Option<f64> {
        self.values
            .iter()
            .find(|(name, _)| name == register)
            .and_then(|(_, value)| *value)
    }
}

/// Storage operations needed to record poll cycles.
#[async_trait]
pub trait Store: Send + Sync {
    /// Creates the server's table if absent and adds missing register columns.
    async fn ensure_schema(&self, server: &ServerDescriptor) -> Result<()>;

    /// Inserts a row with every value and the timestamp unset.
    async fn insert_pending(&self, table: &Identifier) -> Result<RecordId>;

    async fn update_column(
        &self,
        table: &Identifier,
        id: RecordId,
        column: &Identifier,
        value: f64,
    ) -> Result<()>;

    async fn set_timestamp(
        &self,
        table: &Identifier,
        id: RecordId,
        timestamp: DateTime<Utc>,
    ) -> Result<()>;
}

fn quote(identifier: &Identifier) -> String {
    // Identifiers never contain quotes, quoting only guards against keywords.
    format!("\"{identifier}\"")
}

/// Builds the `CREATE TABLE` statement for a server.
pub fn create_table_statement(server: &ServerDescriptor) -> String {
    let mut statement = format!(
        "CREATE TABLE IF NOT EXISTS {} (id INTEGER PRIMARY KEY, timestamp DATETIME",
        quote(&server.name)
    );
    for register in &server.registers {
        statement.push_str(&format!(", {} REAL", quote(&register.name)));
    }
    statement.push(')');
    statement
}

/// [`Store`] backed by an SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens the database file, creating it and its parent directory if missing.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        info!("SQLite database opened: {}", path.display());
        Ok(Self { pool })
    }

    /// Opens an existing database file for reading only.
    ///
    /// Neither the file nor its directory is created if missing.
    pub async fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let options = SqliteConnectOptions::new()
            .filename(path)
            .read_only(true)
            .create_if_missing(false);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        debug!("SQLite database opened read-only: {}", path.display());
        Ok(Self { pool })
    }

    /// Opens a private in-memory database.
    pub async fn in_memory() -> Result<Self> {
        // Every connection to `:memory:` is a separate database, so keep exactly one alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with("sqlite::memory:".parse::<SqliteConnectOptions>()?)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn existing_columns(&self, table: &Identifier) -> Result<Vec<String>> {
        Ok(
            sqlx::query_scalar::<_, String>("SELECT name FROM pragma_table_info(?)")
                .bind(table.as_str())
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// Loads the most recent `limit` records of a server, oldest first.
    pub async fn latest_records(
        &self,
        server: &ServerDescriptor,
        limit: u32,
    ) -> Result<Vec<PollRecord>> {
        let query = format!(
            "SELECT * FROM (SELECT * FROM {} ORDER BY id DESC LIMIT ?) ORDER BY id",
            quote(&server.name)
        );
        let rows = sqlx::query(&query)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<PollRecord> {
                let values = server
                    .registers
                    .iter()
                    .map(|register| -> Result<(String, Option<f64>)> {
                        let value: Option<f64> = row.try_get(register.name.as_str())?;
                        Ok((register.name.to_string(), value))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(PollRecord {
                    id: row.try_get("id")?,
                    timestamp: row.try_get("timestamp")?,
                    values,
                })
            })
            .collect()
    }

    /// Loads every record of a server, oldest first.
    pub async fn records(&self, server: &ServerDescriptor) -> Result<Vec<PollRecord>> {
        self.latest_records(server, u32::MAX).await
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn ensure_schema(&self, server: &ServerDescriptor) -> Result<()> {
        sqlx::query(&create_table_statement(server))
            .execute(&self.pool)
            .await?;

        let existing = self.existing_columns(&server.name).await?;
        for register in &server.registers {
            if existing
                .iter()
                .any(|column| column.eq_ignore_ascii_case(&register.name))
            {
                continue;
            }
            info!("Adding column {} to table {}", register.name, server.name);
            sqlx::query(&format!(
                "ALTER TABLE {} ADD COLUMN {} REAL",
                quote(&server.name),
                quote(&register.name)
            ))
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn insert_pending(&self, table: &Identifier) -> Result<RecordId> {
        let result = sqlx::query(&format!("INSERT INTO {} DEFAULT VALUES", quote(table)))
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    async fn update_column(
        &self,
        table: &Identifier,
        id: RecordId,
        column: &Identifier,
        value: f64,
    ) -> Result<()> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET {} = ? WHERE id = ?",
            quote(table),
            quote(column)
        ))
        .bind(value)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::UnknownTarget(format!("{table} row {id}")));
        }
        Ok(())
    }

    async fn set_timestamp(
        &self,
        table: &Identifier,
        id: RecordId,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET timestamp = ? WHERE id = ?",
            quote(table)
        ))
        .bind(timestamp)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::UnknownTarget(format!("{table} row {id}")));
        }
        Ok(())
    }
}
