use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, info};

/// Durable log of every command the service encoded, sent or not.
#[derive(Debug, Clone)]
pub struct JournalStore {
    pool: SqlitePool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    DryRun,
    Sent,
    Failed,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::DryRun => "dry_run",
            Outcome::Sent => "sent",
            Outcome::Failed => "failed",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = JournalError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "dry_run" => Ok(Outcome::DryRun),
            "sent" => Ok(Outcome::Sent),
            "failed" => Ok(Outcome::Failed),
            other => Err(JournalError::InvalidOutcome(other.to_string())),
        }
    }
}

/// A command about to be journaled.
#[derive(Debug, Clone)]
pub struct CommandRecord<'a> {
    pub action: &'a str,
    pub device_address: u8,
    pub frame_hex: &'a str,
    pub dry_run: bool,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JournalEntry {
    pub id: i64,
    pub action: String,
    pub device_address: u8,
    pub frame_hex: String,
    pub dry_run: bool,
    pub outcome: Outcome,
    /// Unix time in milliseconds.
    pub created_at: i64,
}

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("unknown outcome {0:?} in journal")]
    InvalidOutcome(String),
    #[error("device address {0} out of range in journal")]
    InvalidDeviceAddress(i64),
}

impl JournalStore {
    pub async fn new(path: &str) -> Result<Self, JournalError> {
        let options = SqliteConnectOptions::from_str(&sqlite_url(path))?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL;")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA synchronous = NORMAL;")
            .execute(&pool)
            .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS command_journal (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                action TEXT NOT NULL,\
                device_address INTEGER NOT NULL,\
                frame_hex TEXT NOT NULL,\
                dry_run INTEGER NOT NULL,\
                outcome TEXT NOT NULL,\
                created_at INTEGER NOT NULL\
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_command_journal_created_at ON command_journal(created_at)",
        )
        .execute(&pool)
        .await?;

        info!(path = %path, "command journal initialized");

        Ok(Self { pool })
    }

    /// Appends a record and returns its id.
    pub async fn record(&self, command: &CommandRecord<'_>) -> Result<i64, JournalError> {
        let result = sqlx::query(
            "INSERT INTO command_journal \
                (action, device_address, frame_hex, dry_run, outcome, created_at) \
                VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(command.action)
        .bind(i64::from(command.device_address))
        .bind(command.frame_hex)
        .bind(command.dry_run)
        .bind(command.outcome.as_str())
        .bind(unix_ms())
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!(
            id,
            action = command.action,
            outcome = %command.outcome,
            "journaled command"
        );
        Ok(id)
    }

    /// Newest entries first.
    pub async fn recent(&self, limit: i64) -> Result<Vec<JournalEntry>, JournalError> {
        let rows = sqlx::query(
            "SELECT id, action, device_address, frame_hex, dry_run, outcome, created_at \
                FROM command_journal ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let device_address = row.get::<i64, _>("device_address");
                Ok(JournalEntry {
                    id: row.get::<i64, _>("id"),
                    action: row.get::<String, _>("action"),
                    device_address: u8::try_from(device_address)
                        .map_err(|_| JournalError::InvalidDeviceAddress(device_address))?,
                    frame_hex: row.get::<String, _>("frame_hex"),
                    dry_run: row.get::<bool, _>("dry_run"),
                    outcome: row.get::<String, _>("outcome").parse()?,
                    created_at: row.get::<i64, _>("created_at"),
                })
            })
            .collect()
    }

    pub async fn count(&self) -> Result<i64, JournalError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM command_journal")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("count"))
    }

    /// Deletes all but the newest `keep` entries; returns how many were removed.
    pub async fn prune_keep_latest(&self, keep: i64) -> Result<u64, JournalError> {
        let result = sqlx::query(
            "DELETE FROM command_journal WHERE id NOT IN \
                (SELECT id FROM command_journal ORDER BY id DESC LIMIT ?)",
        )
        .bind(keep.max(0))
        .execute(&self.pool)
        .await?;

        let removed = result.rows_affected();
        if removed > 0 {
            info!(removed, keep, "pruned command journal");
        }
        Ok(removed)
    }
}

fn sqlite_url(path: &str) -> String {
    if path.starts_with("sqlite:") {
        path.to_string()
    } else {
        format!("sqlite://{path}")
    }
}

fn unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
