use crate::error::Result;
use crate::storage::{amount_from_sql, amount_to_sql, from_millis, parse_column, to_millis, Storage};
use crate::types::{TransactionRecord, TransactionStatus};
use rusqlite::{params, Connection, Row};

const TRANSACTION_COLUMNS: &str =
    "id, user_id, room_id, tx_type, amount, currency, status, ledger_digest, created_at";

pub struct TransactionStore<'a> {
    storage: &'a Storage,
}

impl<'a> TransactionStore<'a> {
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<TransactionRecord>> {
        let conn = self.storage.get_connection().await;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM transactions WHERE user_id = ?1 ORDER BY created_at DESC, rowid DESC",
            TRANSACTION_COLUMNS
        ))?;

        let records = stmt
            .query_map(params![user_id], transaction_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub async fn list_for_room(&self, room_id: &str) -> Result<Vec<TransactionRecord>> {
        let conn = self.storage.get_connection().await;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM transactions WHERE room_id = ?1 ORDER BY created_at ASC, rowid ASC",
            TRANSACTION_COLUMNS
        ))?;

        let records = stmt
            .query_map(params![room_id], transaction_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Resolve a pending record. Completed and failed records are immutable.
    pub async fn resolve(&self, tx_id: &str, status: TransactionStatus) -> Result<bool> {
        let conn = self.storage.get_connection().await;

        if status == TransactionStatus::Pending {
            return Ok(false);
        }

        let updated = conn.execute(
            "UPDATE transactions SET status = ?1 WHERE id = ?2 AND status = 'pending'",
            params![status.as_str(), tx_id],
        )?;
        Ok(updated > 0)
    }
}

pub(crate) fn insert_transaction(conn: &Connection, record: &TransactionRecord) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO transactions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            TRANSACTION_COLUMNS
        ),
        params![
            record.id,
            record.user_id,
            record.room_id,
            record.tx_type.as_str(),
            amount_to_sql(record.amount),
            record.currency,
            record.status.as_str(),
            record.ledger_digest,
            to_millis(record.created_at),
        ],
    )?;
    Ok(())
}

/// Move every pending record of a room to `status`.
pub(crate) fn resolve_room_pending(
    conn: &Connection,
    room_id: &str,
    status: TransactionStatus,
) -> Result<usize> {
    if status == TransactionStatus::Pending {
        return Ok(0);
    }

    let updated = conn.execute(
        "UPDATE transactions SET status = ?1 WHERE room_id = ?2 AND status = 'pending'",
        params![status.as_str(), room_id],
    )?;
    Ok(updated)
}

fn transaction_from_row(row: &Row) -> rusqlite::Result<TransactionRecord> {
    let tx_type: String = row.get(3)?;
    let status: String = row.get(6)?;

    Ok(TransactionRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        room_id: row.get(2)?,
        tx_type: parse_column(&tx_type, 3, "tx_type")?,
        amount: amount_from_sql(row.get(4)?),
        currency: row.get(5)?,
        status: parse_column(&status, 6, "status")?,
        ledger_digest: row.get(7)?,
        created_at: from_millis(row.get(8)?),
    })
}
