use crate::error::{Result, RoomError};
use crate::storage::{amount_from_sql, amount_to_sql, to_millis, Storage};
use crate::types::Amount;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

pub struct WalletStore<'a> {
    storage: &'a Storage,
}

impl<'a> WalletStore<'a> {
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    pub async fn balance(&self, user_id: &str, currency: &str) -> Result<Amount> {
        let conn = self.storage.get_connection().await;
        balance(&conn, user_id, currency)
    }
}

pub(crate) fn balance(conn: &Connection, user_id: &str, currency: &str) -> Result<Amount> {
    let units: Option<i64> = conn
        .query_row(
            "SELECT balance FROM wallets WHERE user_id = ?1 AND currency = ?2",
            params![user_id, currency],
            |row| row.get(0),
        )
        .optional()?;
    Ok(units.map(amount_from_sql).unwrap_or(Amount::ZERO))
}

/// Atomic increment relative to the stored balance.
pub(crate) fn credit(
    conn: &Connection,
    user_id: &str,
    currency: &str,
    amount: Amount,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO wallets (user_id, currency, balance, updated_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (user_id, currency)
         DO UPDATE SET balance = balance + excluded.balance, updated_at = excluded.updated_at",
        params![user_id, currency, amount_to_sql(amount), to_millis(now)],
    )?;
    Ok(())
}

/// Atomic conditional decrement; fails without touching the row when funds are short.
pub(crate) fn debit(
    conn: &Connection,
    user_id: &str,
    currency: &str,
    amount: Amount,
    now: DateTime<Utc>,
) -> Result<()> {
    if amount.is_zero() {
        return Ok(());
    }

    let updated = conn.execute(
        "UPDATE wallets SET balance = balance - ?1, updated_at = ?2
         WHERE user_id = ?3 AND currency = ?4 AND balance >= ?1",
        params![amount_to_sql(amount), to_millis(now), user_id, currency],
    )?;

    if updated == 0 {
        let available = balance(conn, user_id, currency)?;
        return Err(RoomError::InsufficientFunds {
            need: amount.to_units(),
            available: available.to_units(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::temp_storage;

    #[tokio::test]
    async fn test_credit_then_debit() {
        let (_dir, storage) = temp_storage().await;
        {
            let conn = storage.get_connection().await;
            let now = Utc::now();
            credit(&conn, "alice", "SUI", Amount::from_units(100), now).unwrap();
            credit(&conn, "alice", "SUI", Amount::from_units(50), now).unwrap();
            debit(&conn, "alice", "SUI", Amount::from_units(120), now).unwrap();
        }

        let store = WalletStore::new(&storage);
        assert_eq!(
            store.balance("alice", "SUI").await.unwrap(),
            Amount::from_units(30)
        );
        assert_eq!(store.balance("alice", "USDC").await.unwrap(), Amount::ZERO);
    }

    #[tokio::test]
    async fn test_debit_never_overdraws() {
        let (_dir, storage) = temp_storage().await;
        let conn = storage.get_connection().await;
        let now = Utc::now();
        credit(&conn, "bob", "SUI", Amount::from_units(10), now).unwrap();

        let err = debit(&conn, "bob", "SUI", Amount::from_units(11), now).unwrap_err();
        match err {
            RoomError::InsufficientFunds { need, available } => {
                assert_eq!(need, 11);
                assert_eq!(available, 10);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(balance(&conn, "bob", "SUI").unwrap(), Amount::from_units(10));

        let err = debit(&conn, "carol", "SUI", Amount::from_units(1), now).unwrap_err();
        assert!(matches!(err, RoomError::InsufficientFunds { available: 0, .. }));
    }
}
