use super::decision::{DecisionKind, SettlementDecision};
use crate::error::{Result, RoomError};
use crate::storage::{
    outbox_store, participant_store, room_store, transaction_store, wallet_store, Storage,
};
use crate::types::{
    Amount, Participant, Room, RoomStatus, TransactionRecord, TransactionStatus, TransactionType,
};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

/// Result of applying a decision to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied { affected_users: Vec<String> },
    /// The terminal claim found the room already closed; nothing was written.
    AlreadySettled,
}

/// Sole writer of wallet balances and transaction history.
///
/// Every method runs in one SQLite transaction. Settlement methods begin
/// with the conditional terminal claim, so a room is settled at most once
/// no matter how many callers race.
pub struct SettlementWriter {
    storage: Arc<Storage>,
}

impl SettlementWriter {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Fund a wallet from outside the engine.
    pub async fn deposit(
        &self,
        user_id: &str,
        currency: &str,
        amount: Amount,
    ) -> Result<TransactionRecord> {
        if amount.is_zero() {
            return Err(RoomError::validation("Deposit amount must be positive"));
        }
        if amount > Amount::MAX {
            return Err(RoomError::validation(format!(
                "Deposit of {} exceeds the largest supported amount",
                amount
            )));
        }

        let conn = self.storage.get_connection().await;
        let tx = conn.unchecked_transaction()?;
        let record = credit(
            &tx,
            user_id,
            None,
            currency,
            TransactionType::Deposit,
            amount,
            None,
            Utc::now(),
        )?;
        tx.commit()?;

        tracing::info!("Deposited {} {} for {}", amount, currency, user_id);
        Ok(record)
    }

    /// Apply a cancellation: refund every contribution and the sponsorship.
    pub async fn apply_refund(
        &self,
        room: &Room,
        decision: &SettlementDecision,
        ledger_digest: Option<&str>,
    ) -> Result<WriteOutcome> {
        if decision.kind != DecisionKind::Cancellation {
            return Err(RoomError::internal("refund path needs a cancellation decision"));
        }
        self.apply(room, decision, RoomStatus::Cancelled, ledger_digest)
            .await
    }

    /// Apply a completion: credit winners, mark every other participant
    /// settled and close the room.
    pub async fn apply_prize(
        &self,
        room: &Room,
        decision: &SettlementDecision,
        ledger_digest: Option<&str>,
    ) -> Result<WriteOutcome> {
        if decision.kind == DecisionKind::Cancellation {
            return Err(RoomError::internal("prize path got a cancellation decision"));
        }
        self.apply(room, decision, RoomStatus::Completed, ledger_digest)
            .await
    }

    async fn apply(
        &self,
        room: &Room,
        decision: &SettlementDecision,
        to: RoomStatus,
        ledger_digest: Option<&str>,
    ) -> Result<WriteOutcome> {
        if !decision.is_balanced() {
            return Err(RoomError::internal(format!(
                "settlement for {} does not add up to its pool of {}",
                room.id, decision.total_pool
            )));
        }

        let now = Utc::now();
        let conn = self.storage.get_connection().await;
        let tx = conn.unchecked_transaction()?;

        let claimed = room_store::claim_terminal(
            &tx,
            &room.id,
            to,
            now,
            decision.retained_pool(),
            decision.platform_fee,
        )?;
        if !claimed {
            // Dropping the transaction rolls back; nothing was written
            return Ok(WriteOutcome::AlreadySettled);
        }

        // A join that slipped in after the decision was taken changes the pool
        let participants = participant_store::active_participants(&tx, &room.id)?;
        let contributed = participants
            .iter()
            .fold(Amount::ZERO, |acc, p| acc.saturating_add(p.payment_amount));
        let pool_now = if room.is_sponsored {
            contributed.saturating_add(room.sponsor_amount)
        } else {
            contributed
        };
        if pool_now != decision.total_pool {
            return Err(RoomError::inconsistency(format!(
                "pool of {} moved from {} to {} during settlement",
                room.id, decision.total_pool, pool_now
            )));
        }

        let mut affected: BTreeSet<String> = BTreeSet::new();
        affected.insert(room.creator_id.clone());

        for payout in &decision.payouts {
            if !participants.iter().any(|p| p.id == payout.participant_id) {
                return Err(RoomError::inconsistency(format!(
                    "winner {} is no longer active in {}",
                    payout.user_id, room.id
                )));
            }
            credit(
                &tx,
                &payout.user_id,
                Some(&room.id),
                &room.currency,
                TransactionType::Win,
                payout.amount,
                ledger_digest,
                now,
            )?;
        }

        for refund in &decision.refunds {
            credit(
                &tx,
                &refund.user_id,
                Some(&room.id),
                &room.currency,
                TransactionType::Refund,
                refund.amount,
                ledger_digest,
                now,
            )?;
        }

        for participant in &participants {
            let (rank, earnings) = match decision.payout_for(participant.id) {
                Some(payout) => (Some(payout.rank), payout.amount),
                None => (None, Amount::ZERO),
            };
            participant_store::settle_participant(&tx, participant.id, rank, earnings, now)?;
            if to == RoomStatus::Cancelled {
                participant_store::deactivate(&tx, participant.id, now)?;
            }
            affected.insert(participant.user_id.clone());
        }

        for user_id in &affected {
            outbox_store::enqueue(&tx, user_id, &room.id, now)?;
        }

        tx.commit()?;

        tracing::info!(
            "Room {} {}: pool {}, fee {}, {} payouts, {} refunds",
            room.id,
            to,
            decision.total_pool,
            decision.platform_fee,
            decision.payouts.len(),
            decision.refunds.len()
        );
        Ok(WriteOutcome::Applied {
            affected_users: affected.into_iter().collect(),
        })
    }

    /// Persist a new room with its creator seated and the creator's stake debited.
    ///
    /// `status` is `Pending` when the escrow call did not confirm.
    pub(crate) async fn open_room(
        &self,
        room: &Room,
        status: TransactionStatus,
        ledger_digest: Option<&str>,
    ) -> Result<Participant> {
        let conn = self.storage.get_connection().await;
        let tx = conn.unchecked_transaction()?;

        room_store::insert_room(&tx, room)?;

        let entry = room.join_payment();
        let participant_id = participant_store::insert_participant(
            &tx,
            &room.id,
            &room.creator_id,
            &room.currency,
            entry,
            room.created_at,
        )?;

        let (stake_type, stake) = if room.is_sponsored {
            (TransactionType::Sponsorship, room.sponsor_amount)
        } else {
            (TransactionType::EntryFee, entry)
        };
        debit(
            &tx,
            &room.creator_id,
            Some(&room.id),
            &room.currency,
            stake_type,
            stake,
            status,
            ledger_digest,
            room.created_at,
        )?;
        room_store::add_to_pool(&tx, &room.id, stake)?;

        let creator = participant_store::find_active(&tx, &room.id, &room.creator_id)?
            .ok_or_else(|| RoomError::internal(format!("creator row {} vanished", participant_id)))?;
        tx.commit()?;
        Ok(creator)
    }

    /// Seat a joiner whose seat is reserved and whose escrow join succeeded.
    pub(crate) async fn record_entry(
        &self,
        room: &Room,
        user_id: &str,
        ledger_digest: &str,
    ) -> Result<Participant> {
        let now = Utc::now();
        let payment = room.join_payment();
        let conn = self.storage.get_connection().await;
        let tx = conn.unchecked_transaction()?;

        let current = room_store::load_room(&tx, &room.id)?;
        if current.status != RoomStatus::Waiting {
            return Err(RoomError::inconsistency(format!(
                "room {} became {} while {} was joining",
                room.id, current.status, user_id
            )));
        }

        participant_store::insert_participant(
            &tx,
            &room.id,
            user_id,
            &room.currency,
            payment,
            now,
        )?;
        debit(
            &tx,
            user_id,
            Some(&room.id),
            &room.currency,
            TransactionType::EntryFee,
            payment,
            TransactionStatus::Completed,
            Some(ledger_digest),
            now,
        )?;
        room_store::add_to_pool(&tx, &room.id, payment)?;

        let participant = participant_store::find_active(&tx, &room.id, user_id)?
            .ok_or_else(|| RoomError::internal(format!("{} not seated in {}", user_id, room.id)))?;
        tx.commit()?;
        Ok(participant)
    }

    /// Undo one membership after the escrow refunded it.
    ///
    /// Returns false when the membership was already inactive; in that case
    /// no credit is written. A room that left `waiting` in the meantime is
    /// an inconsistency: its settlement already accounted for the member.
    pub(crate) async fn record_leave(
        &self,
        room: &Room,
        participant: &Participant,
        ledger_digest: Option<&str>,
    ) -> Result<bool> {
        let now = Utc::now();
        let conn = self.storage.get_connection().await;
        let tx = conn.unchecked_transaction()?;

        let current = room_store::load_room(&tx, &room.id)?;
        if current.status != RoomStatus::Waiting {
            let still_seated =
                participant_store::find_active(&tx, &room.id, &participant.user_id)?
                    .map_or(false, |p| p.id == participant.id);
            if !still_seated {
                return Ok(false);
            }
            return Err(RoomError::inconsistency(format!(
                "room {} became {} while {} was leaving",
                room.id, current.status, participant.user_id
            )));
        }

        if !participant_store::deactivate(&tx, participant.id, now)? {
            return Ok(false);
        }
        credit(
            &tx,
            &participant.user_id,
            Some(&room.id),
            &participant.payment_currency,
            TransactionType::Refund,
            participant.payment_amount,
            ledger_digest,
            now,
        )?;
        room_store::remove_from_pool(&tx, &room.id, participant.payment_amount)?;
        room_store::release_seat(&tx, &room.id)?;

        tx.commit()?;
        Ok(true)
    }

    /// Settle the pending stake records of a room once an operator resolved it.
    pub(crate) async fn resolve_pending(
        &self,
        room_id: &str,
        status: TransactionStatus,
    ) -> Result<usize> {
        let conn = self.storage.get_connection().await;
        transaction_store::resolve_room_pending(&conn, room_id, status)
    }

    pub async fn balance(&self, user_id: &str, currency: &str) -> Result<Amount> {
        let conn = self.storage.get_connection().await;
        wallet_store::balance(&conn, user_id, currency)
    }
}

#[allow(clippy::too_many_arguments)]
fn credit(
    conn: &Connection,
    user_id: &str,
    room_id: Option<&str>,
    currency: &str,
    tx_type: TransactionType,
    amount: Amount,
    ledger_digest: Option<&str>,
    now: DateTime<Utc>,
) -> Result<TransactionRecord> {
    wallet_store::credit(conn, user_id, currency, amount, now)?;
    record(
        conn,
        user_id,
        room_id,
        currency,
        tx_type,
        amount,
        TransactionStatus::Completed,
        ledger_digest,
        now,
    )
}

#[allow(clippy::too_many_arguments)]
fn debit(
    conn: &Connection,
    user_id: &str,
    room_id: Option<&str>,
    currency: &str,
    tx_type: TransactionType,
    amount: Amount,
    status: TransactionStatus,
    ledger_digest: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Option<TransactionRecord>> {
    if amount.is_zero() {
        return Ok(None);
    }
    wallet_store::debit(conn, user_id, currency, amount, now)?;
    record(
        conn,
        user_id,
        room_id,
        currency,
        tx_type,
        amount,
        status,
        ledger_digest,
        now,
    )
    .map(Some)
}

#[allow(clippy::too_many_arguments)]
fn record(
    conn: &Connection,
    user_id: &str,
    room_id: Option<&str>,
    currency: &str,
    tx_type: TransactionType,
    amount: Amount,
    status: TransactionStatus,
    ledger_digest: Option<&str>,
    now: DateTime<Utc>,
) -> Result<TransactionRecord> {
    let record = TransactionRecord {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        room_id: room_id.map(str::to_string),
        tx_type,
        amount,
        currency: currency.to_string(),
        status,
        ledger_digest: ledger_digest.map(str::to_string),
        created_at: now,
    };
    transaction_store::insert_transaction(conn, &record)?;
    Ok(record)
}
