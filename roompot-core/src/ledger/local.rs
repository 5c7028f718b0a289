use super::{
    digest_for, same_payout, EscrowCreated, EscrowRoomParams, IdempotencyKey, LedgerError,
    LedgerGateway, LedgerOp, LedgerReceipt, RefundTarget, SettlementWinner,
};
use crate::storage::{amount_from_sql, amount_to_sql, to_millis, Storage};
use crate::types::Amount;
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use uuid::Uuid;

/// Escrow ledger kept in the engine's own database.
///
/// Used when no remote ledger is configured. Every operation is one row in
/// `local_escrows` keyed by its idempotency key, so replays return the
/// recorded digest. Outstanding contributions are derived from the rows.
pub struct LocalLedger {
    storage: Arc<Storage>,
}

impl LocalLedger {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Funds still locked in the escrow.
    pub async fn locked(&self, ledger_room_id: &str) -> Result<Amount, LedgerError> {
        let conn = self.storage.get_connection().await;
        let locked: i64 = conn
            .query_row(
                "SELECT COALESCE(SUM(CASE WHEN op IN ('create', 'join') THEN amount
                                          WHEN op = 'refund' THEN -amount
                                          ELSE 0 END), 0)
                 FROM local_escrows WHERE ledger_room_id = ?1",
                params![ledger_room_id],
                |row| row.get(0),
            )
            .map_err(store_error)?;
        Ok(amount_from_sql(locked))
    }
}

fn store_error(err: rusqlite::Error) -> LedgerError {
    LedgerError::Unreachable(format!("local escrow store: {}", err))
}

fn recorded(
    conn: &Connection,
    key: &IdempotencyKey,
    op: LedgerOp,
) -> Result<Option<(String, String)>, LedgerError> {
    let row: Option<(String, String, String)> = conn
        .query_row(
            "SELECT op, ledger_room_id, digest FROM local_escrows WHERE idempotency_key = ?1",
            params![key.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .map_err(store_error)?;

    match row {
        Some((recorded_op, _, _)) if recorded_op != op.as_str() => Err(LedgerError::Rejected(
            format!("key {} was used for {}", key, recorded_op),
        )),
        Some((_, ledger_room_id, digest)) => Ok(Some((ledger_room_id, digest))),
        None => Ok(None),
    }
}

fn settled_winners(
    conn: &Connection,
    key: &IdempotencyKey,
) -> Result<Vec<SettlementWinner>, LedgerError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT target FROM local_escrows WHERE idempotency_key = ?1",
            params![key.as_str()],
            |row| row.get(0),
        )
        .map_err(store_error)?;
    match raw {
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|e| LedgerError::Rejected(format!("unreadable winners for {}: {}", key, e))),
        None => Ok(Vec::new()),
    }
}

fn ensure_open(conn: &Connection, ledger_room_id: &str) -> Result<(), LedgerError> {
    let (created, settled): (i64, i64) = conn
        .query_row(
            "SELECT COALESCE(SUM(op = 'create'), 0), COALESCE(SUM(op = 'settle'), 0)
             FROM local_escrows WHERE ledger_room_id = ?1",
            params![ledger_room_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(store_error)?;

    if created == 0 {
        return Err(LedgerError::Rejected(format!(
            "unknown escrow {}",
            ledger_room_id
        )));
    }
    if settled > 0 {
        return Err(LedgerError::Rejected("escrow already settled".to_string()));
    }
    Ok(())
}

fn outstanding(
    conn: &Connection,
    ledger_room_id: &str,
    target: &str,
) -> Result<Amount, LedgerError> {
    let units: i64 = conn
        .query_row(
            "SELECT COALESCE(SUM(CASE WHEN op = 'refund' THEN -amount ELSE amount END), 0)
             FROM local_escrows
             WHERE ledger_room_id = ?1 AND target = ?2 AND op IN ('create', 'join', 'refund')",
            params![ledger_room_id, target],
            |row| row.get(0),
        )
        .map_err(store_error)?;
    Ok(amount_from_sql(units))
}

fn record(
    conn: &Connection,
    key: &IdempotencyKey,
    op: LedgerOp,
    ledger_room_id: &str,
    target: Option<&str>,
    amount: Amount,
) -> Result<String, LedgerError> {
    let digest = digest_for(key, op.as_str());
    conn.execute(
        "INSERT INTO local_escrows (idempotency_key, op, ledger_room_id, target, amount, digest, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            key.as_str(),
            op.as_str(),
            ledger_room_id,
            target,
            amount_to_sql(amount),
            digest,
            to_millis(Utc::now()),
        ],
    )
    .map_err(store_error)?;

    tracing::debug!("Local escrow {} recorded for {}", op, ledger_room_id);
    Ok(digest)
}

#[async_trait]
impl LedgerGateway for LocalLedger {
    async fn escrow_create(
        &self,
        key: &IdempotencyKey,
        params: &EscrowRoomParams,
        payment: Amount,
    ) -> Result<EscrowCreated, LedgerError> {
        let conn = self.storage.get_connection().await;

        if let Some((ledger_room_id, digest)) = recorded(&conn, key, LedgerOp::Create)? {
            return Ok(EscrowCreated {
                ledger_room_id,
                digest,
            });
        }

        let target = if params.is_sponsored {
            RefundTarget::Sponsor(params.creator.clone())
        } else {
            RefundTarget::Participant(params.creator.clone())
        };
        let ledger_room_id = format!("escrow_{}", Uuid::new_v4());
        let digest = record(
            &conn,
            key,
            LedgerOp::Create,
            &ledger_room_id,
            Some(&target.key_suffix()),
            payment,
        )?;

        Ok(EscrowCreated {
            ledger_room_id,
            digest,
        })
    }

    async fn escrow_join(
        &self,
        key: &IdempotencyKey,
        ledger_room_id: &str,
        payer: &str,
        payment: Amount,
    ) -> Result<LedgerReceipt, LedgerError> {
        let conn = self.storage.get_connection().await;

        if let Some((_, digest)) = recorded(&conn, key, LedgerOp::Join)? {
            return Ok(LedgerReceipt { digest });
        }
        ensure_open(&conn, ledger_room_id)?;

        let target = RefundTarget::Participant(payer.to_string()).key_suffix();
        if !outstanding(&conn, ledger_room_id, &target)?.is_zero() {
            return Err(LedgerError::Rejected(format!("{} already joined", payer)));
        }

        let digest = record(
            &conn,
            key,
            LedgerOp::Join,
            ledger_room_id,
            Some(&target),
            payment,
        )?;
        Ok(LedgerReceipt { digest })
    }

    async fn escrow_refund(
        &self,
        key: &IdempotencyKey,
        ledger_room_id: &str,
        target: &RefundTarget,
    ) -> Result<LedgerReceipt, LedgerError> {
        let conn = self.storage.get_connection().await;

        if let Some((_, digest)) = recorded(&conn, key, LedgerOp::Refund)? {
            return Ok(LedgerReceipt { digest });
        }
        ensure_open(&conn, ledger_room_id)?;

        let suffix = target.key_suffix();
        let amount = outstanding(&conn, ledger_room_id, &suffix)?;
        if amount.is_zero() {
            return Err(LedgerError::Rejected(format!(
                "nothing escrowed for {}",
                suffix
            )));
        }

        let digest = record(
            &conn,
            key,
            LedgerOp::Refund,
            ledger_room_id,
            Some(&suffix),
            amount,
        )?;
        Ok(LedgerReceipt { digest })
    }

    async fn escrow_settle(
        &self,
        key: &IdempotencyKey,
        ledger_room_id: &str,
        winners: &[SettlementWinner],
    ) -> Result<LedgerReceipt, LedgerError> {
        let conn = self.storage.get_connection().await;

        if let Some((_, digest)) = recorded(&conn, key, LedgerOp::Settle)? {
            let previous = settled_winners(&conn, key)?;
            if !same_payout(&previous, winners) {
                return Err(LedgerError::Rejected(format!(
                    "settle {} replayed with different winners",
                    key
                )));
            }
            return Ok(LedgerReceipt { digest });
        }
        ensure_open(&conn, ledger_room_id)?;

        let winners = serde_json::to_string(winners)
            .map_err(|e| LedgerError::Rejected(format!("unencodable winners: {}", e)))?;
        let digest = record(
            &conn,
            key,
            LedgerOp::Settle,
            ledger_room_id,
            Some(&winners),
            Amount::ZERO,
        )?;
        Ok(LedgerReceipt { digest })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::temp_storage;

    fn params(sponsored: bool) -> EscrowRoomParams {
        EscrowRoomParams {
            room_id: "room-1".to_string(),
            creator: "alice".to_string(),
            entry_fee: Amount::from_units(10),
            currency: "SUI".to_string(),
            capacity: 4,
            is_sponsored: sponsored,
            sponsor_amount: if sponsored {
                Amount::from_units(50)
            } else {
                Amount::ZERO
            },
            split_rule: "top_2".to_string(),
            fee_bps: 700,
            end_time: 0,
        }
    }

    #[tokio::test]
    async fn test_join_refund_and_rejoin() {
        let (_dir, storage) = temp_storage().await;
        let ledger = LocalLedger::new(storage);

        let created = ledger
            .escrow_create(
                &IdempotencyKey::new("room-1", LedgerOp::Create, None),
                &params(false),
                Amount::from_units(10),
            )
            .await
            .unwrap();
        let escrow = created.ledger_room_id.as_str();

        let join = IdempotencyKey::new("room-1", LedgerOp::Join, Some("bob:0"));
        let first = ledger
            .escrow_join(&join, escrow, "bob", Amount::from_units(10))
            .await
            .unwrap();
        let replay = ledger
            .escrow_join(&join, escrow, "bob", Amount::from_units(10))
            .await
            .unwrap();
        assert_eq!(first, replay);
        assert_eq!(ledger.locked(escrow).await.unwrap(), Amount::from_units(20));

        let second_join = IdempotencyKey::new("room-1", LedgerOp::Join, Some("bob:1"));
        let dup = ledger
            .escrow_join(&second_join, escrow, "bob", Amount::from_units(10))
            .await;
        assert!(matches!(dup, Err(LedgerError::Rejected(_))));

        let refund = IdempotencyKey::new("room-1", LedgerOp::Refund, Some("participant:bob:0"));
        ledger
            .escrow_refund(&refund, escrow, &RefundTarget::Participant("bob".to_string()))
            .await
            .unwrap();
        assert_eq!(ledger.locked(escrow).await.unwrap(), Amount::from_units(10));

        ledger
            .escrow_join(&second_join, escrow, "bob", Amount::from_units(10))
            .await
            .unwrap();
        assert_eq!(ledger.locked(escrow).await.unwrap(), Amount::from_units(20));
    }

    #[tokio::test]
    async fn test_settled_escrow_is_closed() {
        let (_dir, storage) = temp_storage().await;
        let ledger = LocalLedger::new(storage);

        let created = ledger
            .escrow_create(
                &IdempotencyKey::new("room-1", LedgerOp::Create, None),
                &params(true),
                Amount::from_units(50),
            )
            .await
            .unwrap();
        let escrow = created.ledger_room_id.as_str();

        let settle = IdempotencyKey::new("room-1", LedgerOp::Settle, None);
        let receipt = ledger.escrow_settle(&settle, escrow, &[]).await.unwrap();
        assert_eq!(
            ledger.escrow_settle(&settle, escrow, &[]).await.unwrap(),
            receipt
        );

        let refund = IdempotencyKey::new("room-1", LedgerOp::Refund, Some("sponsor:alice"));
        let err = ledger
            .escrow_refund(&refund, escrow, &RefundTarget::Sponsor("alice".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_settle_replay_with_other_winners_is_rejected() {
        let (_dir, storage) = temp_storage().await;
        let ledger = LocalLedger::new(storage);

        let created = ledger
            .escrow_create(
                &IdempotencyKey::new("room-1", LedgerOp::Create, None),
                &params(false),
                Amount::from_units(10),
            )
            .await
            .unwrap();
        let escrow = created.ledger_room_id.as_str();
        let winners = |user: &str| {
            vec![SettlementWinner {
                user_id: user.to_string(),
                rank: 1,
                score: 4,
            }]
        };

        let settle = IdempotencyKey::new("room-1", LedgerOp::Settle, None);
        let receipt = ledger
            .escrow_settle(&settle, escrow, &winners("alice"))
            .await
            .unwrap();
        assert_eq!(
            ledger
                .escrow_settle(&settle, escrow, &winners("alice"))
                .await
                .unwrap(),
            receipt
        );

        let err = ledger
            .escrow_settle(&settle, escrow, &winners("bob"))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Rejected(_)));
    }
}
