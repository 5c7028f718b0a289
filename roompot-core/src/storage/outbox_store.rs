use crate::error::Result;
use crate::storage::{from_millis, to_millis, Storage};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub id: i64,
    pub user_id: String,
    pub room_id: String,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

pub struct OutboxStore<'a> {
    storage: &'a Storage,
}

impl<'a> OutboxStore<'a> {
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    /// Undelivered entries that still have attempts left, oldest first.
    pub async fn fetch_pending(&self, limit: usize, max_attempts: u32) -> Result<Vec<OutboxEntry>> {
        let conn = self.storage.get_connection().await;

        let mut stmt = conn.prepare(
            "SELECT id, user_id, room_id, created_at, attempts, last_error
             FROM read_model_outbox
             WHERE delivered_at IS NULL AND attempts < ?1
             ORDER BY id ASC LIMIT ?2",
        )?;

        let entries = stmt
            .query_map(params![max_attempts, limit as i64], |row| {
                Ok(OutboxEntry {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    room_id: row.get(2)?,
                    created_at: from_millis(row.get(3)?),
                    attempts: row.get(4)?,
                    last_error: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub async fn mark_delivered(&self, entry_id: i64, now: DateTime<Utc>) -> Result<()> {
        let conn = self.storage.get_connection().await;

        conn.execute(
            "UPDATE read_model_outbox SET delivered_at = ?1, attempts = attempts + 1, last_error = NULL
             WHERE id = ?2",
            params![to_millis(now), entry_id],
        )?;
        Ok(())
    }

    pub async fn mark_failed(&self, entry_id: i64, error: &str) -> Result<()> {
        let conn = self.storage.get_connection().await;

        conn.execute(
            "UPDATE read_model_outbox SET attempts = attempts + 1, last_error = ?1 WHERE id = ?2",
            params![error, entry_id],
        )?;
        Ok(())
    }

    pub async fn pending_count(&self) -> Result<u64> {
        let conn = self.storage.get_connection().await;

        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM read_model_outbox WHERE delivered_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}

pub(crate) fn enqueue(
    conn: &Connection,
    user_id: &str,
    room_id: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO read_model_outbox (user_id, room_id, created_at) VALUES (?1, ?2, ?3)",
        params![user_id, room_id, to_millis(now)],
    )?;
    Ok(())
}
