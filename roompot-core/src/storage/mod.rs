pub mod outbox_store;
pub mod participant_store;
pub mod room_store;
pub mod transaction_store;
pub mod wallet_store;

pub use outbox_store::{OutboxEntry, OutboxStore};
pub use participant_store::ParticipantStore;
pub use room_store::RoomStore;
pub use transaction_store::TransactionStore;
pub use wallet_store::WalletStore;

use crate::error::{RoomError, Result};
use crate::types::Amount;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use tokio::sync::Mutex;

pub struct Storage {
    conn: Mutex<Connection>,
}

impl Storage {
    pub async fn new(db_path: &Path) -> Result<Self> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RoomError::internal(format!("Failed to create directory: {}", e)))?;
        }

        let conn = Connection::open(db_path)?;
        let storage = Self {
            conn: Mutex::new(conn),
        };

        storage.init_schema().await?;
        Ok(storage)
    }

    async fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().await;

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        // Rooms table
        conn.execute(
            "CREATE TABLE IF NOT EXISTS rooms (
                id TEXT PRIMARY KEY,
                ledger_room_id TEXT,
                name TEXT NOT NULL,
                game_id TEXT NOT NULL,
                creator_id TEXT NOT NULL,
                entry_fee INTEGER NOT NULL,
                currency TEXT NOT NULL,
                capacity INTEGER NOT NULL,
                min_players INTEGER NOT NULL,
                current_players INTEGER NOT NULL DEFAULT 0,
                is_private INTEGER NOT NULL,
                join_code TEXT,
                is_sponsored INTEGER NOT NULL,
                sponsor_amount INTEGER NOT NULL,
                split_rule TEXT NOT NULL,
                start_time INTEGER NOT NULL,
                end_time INTEGER NOT NULL,
                actual_start_time INTEGER,
                actual_end_time INTEGER,
                status TEXT NOT NULL,
                prize_pool INTEGER NOT NULL DEFAULT 0,
                platform_fee_collected INTEGER NOT NULL DEFAULT 0,
                needs_reconciliation INTEGER NOT NULL DEFAULT 0,
                reconciliation_reason TEXT,
                created_at INTEGER NOT NULL,
                CHECK (current_players <= capacity)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_rooms_status_end ON rooms (status, end_time)",
            [],
        )?;

        // Participants table, append-only per membership
        conn.execute(
            "CREATE TABLE IF NOT EXISTS participants (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                room_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                payment_currency TEXT NOT NULL,
                payment_amount INTEGER NOT NULL,
                score INTEGER NOT NULL DEFAULT 0,
                final_rank INTEGER,
                earnings INTEGER NOT NULL DEFAULT 0,
                active INTEGER NOT NULL DEFAULT 1,
                joined_at INTEGER NOT NULL,
                left_at INTEGER,
                settled_at INTEGER,
                FOREIGN KEY (room_id) REFERENCES rooms(id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS ux_participants_active
             ON participants (room_id, user_id) WHERE active = 1",
            [],
        )?;

        // Wallets table
        conn.execute(
            "CREATE TABLE IF NOT EXISTS wallets (
                user_id TEXT NOT NULL,
                currency TEXT NOT NULL,
                balance INTEGER NOT NULL CHECK (balance >= 0),
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, currency)
            )",
            [],
        )?;

        // Tx table
        conn.execute(
            "CREATE TABLE IF NOT EXISTS transactions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                room_id TEXT,
                tx_type TEXT NOT NULL,
                amount INTEGER NOT NULL,
                currency TEXT NOT NULL,
                status TEXT NOT NULL,
                ledger_digest TEXT,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_transactions_user ON transactions (user_id, created_at)",
            [],
        )?;

        // Read-model recompute queue
        conn.execute(
            "CREATE TABLE IF NOT EXISTS read_model_outbox (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                room_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                delivered_at INTEGER,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT
            )",
            [],
        )?;

        // Escrow operations for the local ledger
        conn.execute(
            "CREATE TABLE IF NOT EXISTS local_escrows (
                idempotency_key TEXT PRIMARY KEY,
                op TEXT NOT NULL,
                ledger_room_id TEXT NOT NULL,
                target TEXT,
                amount INTEGER NOT NULL,
                digest TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    pub async fn get_connection(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

/// Amounts are checked against [`Amount::MAX`] where they enter the engine.
pub(crate) fn amount_to_sql(amount: Amount) -> i64 {
    i64::try_from(amount.to_units()).unwrap_or(i64::MAX)
}

pub(crate) fn amount_from_sql(units: i64) -> Amount {
    Amount::from_units(units.max(0) as u64)
}

/// Map a text column through `FromStr`, surfacing parse failures as column errors.
pub(crate) fn parse_column<T: std::str::FromStr>(
    raw: &str,
    index: usize,
    name: &str,
) -> rusqlite::Result<T> {
    raw.parse::<T>().map_err(|_| {
        rusqlite::Error::InvalidColumnType(index, name.to_string(), rusqlite::types::Type::Text)
    })
}

#[cfg(test)]
pub(crate) async fn temp_storage() -> (tempfile::TempDir, std::sync::Arc<Storage>) {
    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::new(&dir.path().join("roompot.db")).await.unwrap();
    (dir, std::sync::Arc::new(storage))
}
