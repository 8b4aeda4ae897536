//! SQLite ledger.
//!
//! Records are stored as JSON payloads keyed by offer / participant id.
//! Consuming transitions use `DELETE ... RETURNING` inside a transaction so
//! the read and the delete cannot be split by a concurrent notification.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::debug;

use super::Ledger;
use crate::types::{LedgerError, Participant, PendingOffer, PollData, QueueEntry, WinningOffer};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS pending_offers (
        offer_id TEXT PRIMARY KEY,
        participant_id TEXT NOT NULL,
        payload TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS winning_offers (
        offer_id TEXT PRIMARY KEY,
        winner_id TEXT NOT NULL,
        payload TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        trade_id TEXT NOT NULL DEFAULT '',
        protection_code TEXT NOT NULL DEFAULT '',
        error INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS queue (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        key TEXT NOT NULL UNIQUE,
        offer_id TEXT NOT NULL,
        payload TEXT NOT NULL,
        queued_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS poll_data (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        payload TEXT NOT NULL
    )",
];

pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    /// Connect and create the schema if needed.
    pub async fn connect(url: &str) -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);

        // Each connection to `:memory:` is its own database, so pin to one.
        let in_memory = url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 4 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let ledger = Self { pool };
        ledger.migrate().await?;
        Ok(ledger)
    }

    /// A private in-memory database (tests).
    pub async fn in_memory() -> Result<Self, LedgerError> {
        Self::connect("sqlite::memory:").await
    }

    async fn migrate(&self) -> Result<(), LedgerError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Ledger schema ready");
        Ok(())
    }
}

fn decode<T: serde::de::DeserializeOwned>(row: &sqlx::sqlite::SqliteRow) -> Result<T, LedgerError> {
    let payload: String = row.try_get("payload")?;
    Ok(serde_json::from_str(&payload)?)
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn record_deposit(
        &self,
        offer: &PendingOffer,
        protection_code: &str,
    ) -> Result<(), LedgerError> {
        let payload = serde_json::to_string(offer)?;
        let mut tx = self.pool.begin().await?;

        let clash = sqlx::query("SELECT 1 FROM winning_offers WHERE offer_id = ?")
            .bind(&offer.offer_id)
            .fetch_optional(&mut *tx)
            .await?;
        if clash.is_some() {
            return Err(LedgerError::Conflict(offer.offer_id.clone()));
        }

        sqlx::query(
            "INSERT INTO pending_offers (offer_id, participant_id, payload, created_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(offer_id) DO UPDATE SET
                participant_id = excluded.participant_id,
                payload = excluded.payload",
        )
        .bind(&offer.offer_id)
        .bind(&offer.participant_id)
        .bind(&payload)
        .bind(offer.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO users (id, trade_id, protection_code) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                trade_id = excluded.trade_id,
                protection_code = excluded.protection_code",
        )
        .bind(&offer.participant_id)
        .bind(&offer.offer_id)
        .bind(protection_code)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_pending(&self, offer_id: &str) -> Result<Option<PendingOffer>, LedgerError> {
        let row = sqlx::query("SELECT payload FROM pending_offers WHERE offer_id = ?")
            .bind(offer_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode).transpose()
    }

    async fn promote_pending(&self, offer_id: &str) -> Result<Option<QueueEntry>, LedgerError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("DELETE FROM pending_offers WHERE offer_id = ? RETURNING payload")
            .bind(offer_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let pending: PendingOffer = decode(&row)?;
        let entry = QueueEntry::from_pending(pending);

        sqlx::query("INSERT INTO queue (key, offer_id, payload, queued_at) VALUES (?, ?, ?, ?)")
            .bind(&entry.key)
            .bind(offer_id)
            .bind(serde_json::to_string(&entry)?)
            .bind(entry.queued_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(entry))
    }

    async fn cancel_pending(&self, offer_id: &str) -> Result<Option<PendingOffer>, LedgerError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("DELETE FROM pending_offers WHERE offer_id = ? RETURNING payload")
            .bind(offer_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let pending: PendingOffer = decode(&row)?;

        if !pending.participant_id.is_empty() {
            sqlx::query(
                "UPDATE users SET trade_id = '', protection_code = ''
                 WHERE id = ? AND trade_id = ?",
            )
            .bind(&pending.participant_id)
            .bind(offer_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(Some(pending))
    }

    async fn insert_winning(&self, offer: &WinningOffer) -> Result<(), LedgerError> {
        let payload = serde_json::to_string(offer)?;
        let mut tx = self.pool.begin().await?;

        let clash = sqlx::query("SELECT 1 FROM pending_offers WHERE offer_id = ?")
            .bind(&offer.offer_id)
            .fetch_optional(&mut *tx)
            .await?;
        if clash.is_some() {
            return Err(LedgerError::Conflict(offer.offer_id.clone()));
        }

        sqlx::query(
            "INSERT INTO winning_offers (offer_id, winner_id, payload, created_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(offer_id) DO UPDATE SET
                winner_id = excluded.winner_id,
                payload = excluded.payload",
        )
        .bind(&offer.offer_id)
        .bind(&offer.request.winner.id)
        .bind(&payload)
        .bind(offer.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_winning(&self, offer_id: &str) -> Result<Option<WinningOffer>, LedgerError> {
        let row = sqlx::query("SELECT payload FROM winning_offers WHERE offer_id = ?")
            .bind(offer_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode).transpose()
    }

    async fn take_winning(&self, offer_id: &str) -> Result<Option<WinningOffer>, LedgerError> {
        let row = sqlx::query("DELETE FROM winning_offers WHERE offer_id = ? RETURNING payload")
            .bind(offer_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode).transpose()
    }

    async fn get_participant(&self, id: &str) -> Result<Option<Participant>, LedgerError> {
        let row = sqlx::query("SELECT id, trade_id, protection_code, error FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(Participant {
            id: row.try_get("id")?,
            trade_id: row.try_get("trade_id")?,
            protection_code: row.try_get("protection_code")?,
            error: row.try_get("error")?,
        }))
    }

    async fn set_error_flag(&self, id: &str, error: bool) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO users (id, error) VALUES (?, ?)
             ON CONFLICT(id) DO UPDATE SET error = excluded.error",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn queue(&self) -> Result<Vec<QueueEntry>, LedgerError> {
        let rows = sqlx::query("SELECT payload FROM queue ORDER BY seq")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode).collect()
    }

    async fn save_poll_data(&self, data: &PollData) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO poll_data (id, payload) VALUES (1, ?)
             ON CONFLICT(id) DO UPDATE SET payload = excluded.payload",
        )
        .bind(serde_json::to_string(data)?)
        .execute(&self.pool)
        .await?;
        debug!(cutoff = data.cutoff, at = %Utc::now(), "Poll data saved");
        Ok(())
    }

    async fn load_poll_data(&self) -> Result<Option<PollData>, LedgerError> {
        let row = sqlx::query("SELECT payload FROM poll_data WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode).transpose()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
