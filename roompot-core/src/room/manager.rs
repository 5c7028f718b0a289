use crate::config::EngineConfig;
use crate::error::{Result, RoomError};
use crate::ledger::{
    call_ledger, EscrowRoomParams, IdempotencyKey, LedgerError, LedgerGateway, LedgerOp,
    RefundTarget,
};
use crate::readmodel::{AggregateSink, ReadModelOutbox};
use crate::settlement::{
    select_winners, RankedWinner, RefundKind, SettlementDecision, SettlementOutcome,
    SettlementWriter, SplitRule, WriteOutcome,
};
use crate::storage::{ParticipantStore, RoomStore, Storage, TransactionStore};
use crate::types::{
    Amount, CreateRoomParams, OperationStatus, Participant, Room, RoomStatus, TransactionRecord,
    TransactionStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomReceipt {
    pub room: Room,
    pub status: OperationStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinReceipt {
    pub room_id: String,
    pub user_id: String,
    pub payment: Amount,
    pub status: OperationStatus,
}

/// Owns the room state machine and coordinates the escrow ledger with the
/// store. Manual calls and the expiry scanner go through the same methods.
pub struct RoomManager {
    storage: Arc<Storage>,
    ledger: Arc<dyn LedgerGateway>,
    writer: SettlementWriter,
    outbox: ReadModelOutbox,
    config: EngineConfig,
}

impl RoomManager {
    pub fn new(
        storage: Arc<Storage>,
        ledger: Arc<dyn LedgerGateway>,
        sink: Arc<dyn AggregateSink>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;

        let writer = SettlementWriter::new(storage.clone());
        let outbox = ReadModelOutbox::new(
            storage.clone(),
            sink,
            config.outbox_batch,
            config.outbox_max_attempts,
        );

        Ok(Self {
            storage,
            ledger,
            writer,
            outbox,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn outbox(&self) -> &ReadModelOutbox {
        &self.outbox
    }

    pub async fn create_room(&self, params: CreateRoomParams) -> Result<RoomReceipt> {
        let now = Utc::now();
        self.validate_create(&params, now)?;

        // The creator's stake is the sponsorship or their own entry fee
        let stake = if params.is_sponsored {
            params.sponsor_amount
        } else {
            params.entry_fee
        };
        self.ensure_funds(&params.creator_id, &params.currency, stake)
            .await?;

        let room_id = Uuid::new_v4().to_string();
        let escrow_params = EscrowRoomParams {
            room_id: room_id.clone(),
            creator: params.creator_id.clone(),
            entry_fee: params.entry_fee,
            currency: params.currency.clone(),
            capacity: params.capacity,
            is_sponsored: params.is_sponsored,
            sponsor_amount: params.sponsor_amount,
            split_rule: params.split_rule.clone(),
            fee_bps: self.config.fee_bps,
            end_time: params.end_time.timestamp(),
        };
        let key = IdempotencyKey::new(&room_id, LedgerOp::Create, None);

        let created = call_ledger(
            &self.config.retry,
            self.config.ledger_timeout,
            LedgerOp::Create,
            || self.ledger.escrow_create(&key, &escrow_params, stake),
        )
        .await;

        let mut room = Room {
            id: room_id.clone(),
            ledger_room_id: None,
            name: params.name,
            game_id: params.game_id,
            creator_id: params.creator_id,
            entry_fee: params.entry_fee,
            currency: params.currency,
            capacity: params.capacity,
            min_players: params.min_players,
            current_players: 1,
            is_private: params.is_private,
            join_code: if params.is_private {
                params.join_code
            } else {
                None
            },
            is_sponsored: params.is_sponsored,
            sponsor_amount: params.sponsor_amount,
            split_rule: params.split_rule,
            start_time: params.start_time,
            end_time: params.end_time,
            actual_start_time: None,
            actual_end_time: None,
            status: RoomStatus::Waiting,
            prize_pool: Amount::ZERO,
            platform_fee_collected: Amount::ZERO,
            needs_reconciliation: false,
            reconciliation_reason: None,
            created_at: now,
        };

        let (tx_status, digest, status) = match created {
            Ok(created) => {
                room.ledger_room_id = Some(created.ledger_room_id);
                (
                    TransactionStatus::Completed,
                    Some(created.digest),
                    OperationStatus::Applied,
                )
            }
            Err(LedgerError::Rejected(msg)) => return Err(RoomError::LedgerRejected(msg)),
            Err(e) => {
                // Escrow may or may not exist; keep the room and let an operator resolve it
                let reason = format!("escrow create unconfirmed: {}", e);
                tracing::error!("Room {} created without escrow: {}", room_id, e);
                room.needs_reconciliation = true;
                room.reconciliation_reason = Some(reason.clone());
                (
                    TransactionStatus::Pending,
                    None,
                    OperationStatus::SettlementPending { reason },
                )
            }
        };

        if let Err(e) = self
            .writer
            .open_room(&room, tx_status, digest.as_deref())
            .await
        {
            tracing::error!(
                "Escrow {:?} opened for room {} but the store write failed: {}",
                room.ledger_room_id,
                room_id,
                e
            );
            return Err(RoomError::inconsistency(format!(
                "room {} escrowed as {:?} but not stored: {}",
                room_id, room.ledger_room_id, e
            )));
        }

        let room = self.room(&room_id).await?;
        tracing::info!(
            "Created room {} ({}) by {}, capacity {}",
            room.id,
            room.split_rule,
            room.creator_id,
            room.capacity
        );
        Ok(RoomReceipt { room, status })
    }

    pub async fn join_room(
        &self,
        room_id: &str,
        user_id: &str,
        join_code: Option<&str>,
    ) -> Result<JoinReceipt> {
        let room = self.room(room_id).await?;

        if room.status != RoomStatus::Waiting {
            return Err(RoomError::validation(format!(
                "Room {} is {} and no longer accepts players",
                room.id, room.status
            )));
        }
        let ledger_room_id = match (&room.ledger_room_id, room.needs_reconciliation) {
            (Some(id), false) => id.clone(),
            _ => {
                return Err(RoomError::validation(format!(
                    "Room {} is awaiting reconciliation",
                    room.id
                )))
            }
        };
        if room.is_private && room.join_code.as_deref() != join_code {
            return Err(RoomError::forbidden("Invalid join code"));
        }
        self.require_currency(&room.currency)?;

        let participants = ParticipantStore::new(&self.storage);
        if participants.find_active(room_id, user_id).await?.is_some() {
            return Err(RoomError::validation(format!(
                "{} is already in room {}",
                user_id, room_id
            )));
        }

        let payment = room.join_payment();
        self.ensure_funds(user_id, &room.currency, payment).await?;

        // Claim the seat before touching the ledger so two joins cannot overfill
        let rooms = RoomStore::new(&self.storage);
        if !rooms.reserve_seat(room_id).await? {
            return Err(RoomError::validation(format!("Room {} is full", room_id)));
        }

        let membership = participants.membership_count(room_id, user_id).await?;
        let key = IdempotencyKey::new(
            room_id,
            LedgerOp::Join,
            Some(&format!("{}:{}", user_id, membership)),
        );

        let joined = call_ledger(
            &self.config.retry,
            self.config.ledger_timeout,
            LedgerOp::Join,
            || {
                self.ledger
                    .escrow_join(&key, &ledger_room_id, user_id, payment)
            },
        )
        .await;

        let receipt = match joined {
            Ok(receipt) => receipt,
            Err(e) => {
                rooms.release_seat(room_id).await?;
                if !matches!(e, LedgerError::Rejected(_)) {
                    self.flag(room_id, &format!("escrow join for {} unconfirmed: {}", user_id, e))
                        .await;
                }
                return Err(e.into());
            }
        };

        let status = match self
            .writer
            .record_entry(&room, user_id, &receipt.digest)
            .await
        {
            Ok(_) => {
                tracing::info!("{} joined room {} paying {}", user_id, room_id, payment);
                OperationStatus::Applied
            }
            Err(e) => {
                // The entry rolled back as a whole, so the reserved seat is free again
                if let Err(release) = rooms.release_seat(room_id).await {
                    tracing::error!("Could not release seat in {}: {}", room_id, release);
                }
                let reason = format!("{} escrowed but not seated: {}", user_id, e);
                self.flag(room_id, &reason).await;
                OperationStatus::SettlementPending { reason }
            }
        };

        Ok(JoinReceipt {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            payment,
            status,
        })
    }

    pub async fn leave_room(&self, room_id: &str, user_id: &str) -> Result<OperationStatus> {
        let room = self.room(room_id).await?;

        if room.status != RoomStatus::Waiting {
            return Err(RoomError::validation(format!(
                "Room {} is {}; players can only leave while it is waiting",
                room.id, room.status
            )));
        }
        if room.creator_id == user_id {
            return Err(RoomError::forbidden(
                "The creator cannot leave; cancel the room instead",
            ));
        }

        let participant = ParticipantStore::new(&self.storage)
            .find_active(room_id, user_id)
            .await?
            .ok_or_else(|| RoomError::ParticipantNotFound {
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
            })?;

        // Sponsored rooms hold nothing for joiners, so there is nothing to unlock
        let digest = if participant.payment_amount.is_zero() {
            None
        } else {
            let ledger_room_id = room.ledger_room_id.as_deref().ok_or_else(|| {
                RoomError::validation(format!("Room {} is awaiting reconciliation", room.id))
            })?;
            let target = RefundTarget::Participant(user_id.to_string());
            let receipt = self
                .refund(&room, ledger_room_id, &target, Some(&participant))
                .await?;
            Some(receipt)
        };

        match self
            .writer
            .record_leave(&room, &participant, digest.as_deref())
            .await
        {
            Ok(true) => {
                tracing::info!("{} left room {}", user_id, room_id);
                Ok(OperationStatus::Applied)
            }
            // A concurrent leave already replayed the same refund and credited it
            Ok(false) => Ok(OperationStatus::Applied),
            Err(e) => {
                let reason = format!("{} refunded but still seated: {}", user_id, e);
                self.flag(room_id, &reason).await;
                Ok(OperationStatus::SettlementPending { reason })
            }
        }
    }

    /// Creator-only full refund of a waiting room. No fee is charged.
    pub async fn cancel_room(&self, room_id: &str, requester: &str) -> Result<SettlementOutcome> {
        let room = self.room(room_id).await?;

        if room.creator_id != requester {
            return Err(RoomError::forbidden("Only the room creator can cancel it"));
        }
        if room.status.is_terminal() {
            return Ok(SettlementOutcome::AlreadySettled);
        }
        if room.status != RoomStatus::Waiting {
            return Err(RoomError::validation(format!(
                "Room {} is {} and can no longer be cancelled",
                room.id, room.status
            )));
        }

        let participants = ParticipantStore::new(&self.storage)
            .active_participants(room_id)
            .await?;
        let decision = SettlementDecision::cancellation(&room, &participants);

        let Some(ledger_room_id) = room.ledger_room_id.clone() else {
            let reason = "cancel requested before escrow was confirmed".to_string();
            self.flag(room_id, &reason).await;
            return Ok(SettlementOutcome::Pending { reason });
        };

        // Unlock every contribution; replays are harmless thanks to per-target keys
        let mut digest = None;
        for (i, refund) in decision.refunds.iter().enumerate() {
            let (target, participant) = match refund.kind {
                RefundKind::Contribution => (
                    RefundTarget::Participant(refund.user_id.clone()),
                    participants
                        .iter()
                        .find(|p| Some(p.id) == refund.participant_id),
                ),
                RefundKind::Sponsorship => (RefundTarget::Sponsor(refund.user_id.clone()), None),
            };

            match self
                .refund(&room, &ledger_room_id, &target, participant)
                .await
            {
                Ok(receipt) => digest = Some(receipt),
                Err(e) if i > 0 => {
                    let reason = format!(
                        "cancel refunded {} of {}: {}",
                        i,
                        decision.refunds.len(),
                        e
                    );
                    self.flag(room_id, &reason).await;
                    return Ok(SettlementOutcome::Pending { reason });
                }
                Err(e) => return Err(e),
            }
        }

        let written = self
            .writer
            .apply_refund(&room, &decision, digest.as_deref())
            .await;
        self.finish(&room, decision, written).await
    }

    /// Settle a room. Without `winners` the current scores decide the ranking.
    ///
    /// Supplied winners must be distinct eligible participants; they are
    /// ranked in the order given and cut to the rule's payable ranks.
    pub async fn complete_room(
        &self,
        room_id: &str,
        winners: Option<Vec<String>>,
    ) -> Result<SettlementOutcome> {
        let room = self.room(room_id).await?;
        if room.status.is_terminal() {
            return Ok(SettlementOutcome::AlreadySettled);
        }

        let participants = ParticipantStore::new(&self.storage)
            .active_participants(room_id)
            .await?;
        let eligible = eligible_winners(&room, &participants);
        let rule = SplitRule::resolve(&room.split_rule);

        let ranked = match winners {
            None => select_winners(&eligible, rule),
            Some(user_ids) => rank_supplied(&room, &eligible, &user_ids, rule)?,
        };
        let decision =
            SettlementDecision::prize(&room, &participants, &ranked, rule, self.config.fee_bps);

        let Some(ledger_room_id) = room.ledger_room_id.clone() else {
            let reason = "completion requested before escrow was confirmed".to_string();
            self.flag(room_id, &reason).await;
            return Ok(SettlementOutcome::Pending { reason });
        };

        let key = IdempotencyKey::new(room_id, LedgerOp::Settle, None);
        let ledger_winners = decision.ledger_winners();
        let settled = call_ledger(
            &self.config.retry,
            self.config.ledger_timeout,
            LedgerOp::Settle,
            || {
                self.ledger
                    .escrow_settle(&key, &ledger_room_id, &ledger_winners)
            },
        )
        .await;

        let receipt = match settled {
            Ok(receipt) => receipt,
            Err(LedgerError::Rejected(msg)) => {
                // The escrow may already hold another payout for this room
                self.flag(room_id, &format!("escrow settle rejected: {}", msg))
                    .await;
                return Err(RoomError::LedgerRejected(msg));
            }
            Err(e) => {
                // A payout may have gone through; never re-issue it blindly
                let reason = format!("escrow settle unconfirmed: {}", e);
                self.flag(room_id, &reason).await;
                return Ok(SettlementOutcome::Pending { reason });
            }
        };

        let written = self
            .writer
            .apply_prize(&room, &decision, Some(&receipt.digest))
            .await;
        self.finish(&room, decision, written).await
    }

    pub async fn record_score(&self, room_id: &str, user_id: &str, score: i64) -> Result<()> {
        let room = self.room(room_id).await?;
        if room.status.is_terminal() {
            return Err(RoomError::validation(format!(
                "Room {} is {}; scores are final",
                room.id, room.status
            )));
        }

        let updated = ParticipantStore::new(&self.storage)
            .update_score(room_id, user_id, score)
            .await?;
        if !updated {
            return Err(RoomError::ParticipantNotFound {
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
            });
        }

        tracing::debug!("Score {} recorded for {} in {}", score, user_id, room_id);
        Ok(())
    }

    /// Flip `waiting -> ongoing` once started and full enough. No funds move.
    pub async fn transition_to_ongoing(&self, room_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let started = RoomStore::new(&self.storage)
            .mark_ongoing(room_id, now)
            .await?;
        if started {
            tracing::info!("Room {} is now ongoing", room_id);
        }
        Ok(started)
    }

    pub async fn start_due_rooms(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let due = RoomStore::new(&self.storage).list_due_to_start(now).await?;

        let mut started = Vec::new();
        for room_id in due {
            if self.transition_to_ongoing(&room_id, now).await? {
                started.push(room_id);
            }
        }
        Ok(started)
    }

    pub async fn deposit(
        &self,
        user_id: &str,
        currency: &str,
        amount: Amount,
    ) -> Result<TransactionRecord> {
        self.require_currency(currency)?;
        self.writer.deposit(user_id, currency, amount).await
    }

    /// Close out an operator-resolved divergence.
    ///
    /// Optionally records the escrow id found on the ledger, moves the room's
    /// pending stake records to `tx_status` and clears the flag.
    pub async fn resolve_reconciliation(
        &self,
        room_id: &str,
        ledger_room_id: Option<&str>,
        tx_status: TransactionStatus,
    ) -> Result<bool> {
        let rooms = RoomStore::new(&self.storage);
        rooms.load_room(room_id).await?;

        if let Some(ledger_room_id) = ledger_room_id {
            rooms.set_ledger_room_id(room_id, ledger_room_id).await?;
        }
        let resolved = self.writer.resolve_pending(room_id, tx_status).await?;
        let cleared = rooms.clear_reconciliation(room_id).await?;

        tracing::info!(
            "Reconciled room {}: {} pending records marked {}",
            room_id,
            resolved,
            tx_status.as_str()
        );
        Ok(cleared)
    }

    pub async fn room(&self, room_id: &str) -> Result<Room> {
        RoomStore::new(&self.storage).load_room(room_id).await
    }

    pub async fn list_rooms(&self, status: Option<RoomStatus>) -> Result<Vec<Room>> {
        RoomStore::new(&self.storage).list_rooms(status).await
    }

    pub async fn expired_rooms(&self, now: DateTime<Utc>) -> Result<Vec<Room>> {
        RoomStore::new(&self.storage).list_expired(now).await
    }

    /// Every membership of the room, departed ones included.
    pub async fn participants(&self, room_id: &str) -> Result<Vec<Participant>> {
        ParticipantStore::new(&self.storage)
            .all_participants(room_id)
            .await
    }

    pub async fn balance(&self, user_id: &str, currency: &str) -> Result<Amount> {
        self.writer.balance(user_id, currency).await
    }

    pub async fn transactions(&self, user_id: &str) -> Result<Vec<TransactionRecord>> {
        TransactionStore::new(&self.storage)
            .list_for_user(user_id)
            .await
    }

    pub async fn pending_reconciliation(&self) -> Result<Vec<Room>> {
        RoomStore::new(&self.storage)
            .list_pending_reconciliation()
            .await
    }

    async fn finish(
        &self,
        room: &Room,
        decision: SettlementDecision,
        written: Result<WriteOutcome>,
    ) -> Result<SettlementOutcome> {
        match written {
            Ok(WriteOutcome::Applied { .. }) => {
                if let Err(e) = self.outbox.publish_pending().await {
                    tracing::warn!("Read model publish after {} failed: {}", room.id, e);
                }
                Ok(SettlementOutcome::Settled(decision))
            }
            Ok(WriteOutcome::AlreadySettled) => {
                tracing::info!("Room {} was settled concurrently", room.id);
                Ok(SettlementOutcome::AlreadySettled)
            }
            Err(e) => {
                let reason = format!("ledger settled but store write failed: {}", e);
                self.flag(&room.id, &reason).await;
                Ok(SettlementOutcome::Pending { reason })
            }
        }
    }

    async fn refund(
        &self,
        room: &Room,
        ledger_room_id: &str,
        target: &RefundTarget,
        participant: Option<&Participant>,
    ) -> Result<String> {
        // Leave and cancel share the key of a membership so they never double-refund it
        let suffix = match participant {
            Some(p) => {
                let memberships = ParticipantStore::new(&self.storage)
                    .membership_count(&room.id, &p.user_id)
                    .await?;
                format!("{}:{}", target.key_suffix(), memberships.saturating_sub(1))
            }
            None => target.key_suffix(),
        };
        let key = IdempotencyKey::new(&room.id, LedgerOp::Refund, Some(&suffix));

        let refunded = call_ledger(
            &self.config.retry,
            self.config.ledger_timeout,
            LedgerOp::Refund,
            || self.ledger.escrow_refund(&key, ledger_room_id, target),
        )
        .await;

        match refunded {
            Ok(receipt) => Ok(receipt.digest),
            Err(e) => {
                if !matches!(e, LedgerError::Rejected(_)) {
                    self.flag(
                        &room.id,
                        &format!("escrow refund for {} unconfirmed: {}", target.user_id(), e),
                    )
                    .await;
                }
                Err(e.into())
            }
        }
    }

    async fn flag(&self, room_id: &str, reason: &str) {
        tracing::error!("Room {} needs reconciliation: {}", room_id, reason);
        if let Err(e) = RoomStore::new(&self.storage)
            .flag_reconciliation(room_id, reason)
            .await
        {
            tracing::error!("Could not flag room {}: {}", room_id, e);
        }
    }

    async fn ensure_funds(&self, user_id: &str, currency: &str, need: Amount) -> Result<()> {
        if need.is_zero() {
            return Ok(());
        }
        let available = self.writer.balance(user_id, currency).await?;
        if available < need {
            return Err(RoomError::InsufficientFunds {
                need: need.to_units(),
                available: available.to_units(),
            });
        }
        Ok(())
    }

    fn require_currency(&self, currency: &str) -> Result<()> {
        self.config
            .currency(currency)
            .map(|_| ())
            .ok_or_else(|| RoomError::validation(format!("Unsupported currency {}", currency)))
    }

    fn validate_create(&self, params: &CreateRoomParams, now: DateTime<Utc>) -> Result<()> {
        if params.name.trim().is_empty() {
            return Err(RoomError::validation("Room name cannot be empty"));
        }
        if params.creator_id.trim().is_empty() {
            return Err(RoomError::validation("Creator cannot be empty"));
        }
        self.require_currency(&params.currency)?;

        if params.capacity < 2 {
            return Err(RoomError::validation("Capacity must be greater than 1"));
        }
        if params.capacity > self.config.max_capacity {
            return Err(RoomError::validation(format!(
                "Capacity cannot exceed {}",
                self.config.max_capacity
            )));
        }
        if params.min_players < 2 || params.min_players > params.capacity {
            return Err(RoomError::validation(format!(
                "Minimum players must be between 2 and {}",
                params.capacity
            )));
        }

        if params.start_time >= params.end_time {
            return Err(RoomError::validation("Start time must be before end time"));
        }
        if params.end_time <= now {
            return Err(RoomError::validation("End time must be in the future"));
        }

        params
            .split_rule
            .parse::<SplitRule>()
            .map_err(RoomError::validation)?;

        if params.is_private
            && params
                .join_code
                .as_deref()
                .map_or(true, |c| c.trim().is_empty())
        {
            return Err(RoomError::validation("Private rooms need a join code"));
        }

        if params.entry_fee > Amount::MAX || params.sponsor_amount > Amount::MAX {
            return Err(RoomError::validation(
                "Amount exceeds the largest supported amount",
            ));
        }

        if params.is_sponsored {
            if params.sponsor_amount.is_zero() {
                return Err(RoomError::validation(
                    "Sponsored rooms need a positive sponsor amount",
                ));
            }
            if !params.entry_fee.is_zero() {
                return Err(RoomError::validation("Sponsored rooms are free to enter"));
            }
        } else if !params.sponsor_amount.is_zero() {
            return Err(RoomError::validation(
                "Sponsor amount is only valid for sponsored rooms",
            ));
        }

        Ok(())
    }
}

/// A sponsor cannot win back their own sponsorship.
fn eligible_winners(room: &Room, participants: &[Participant]) -> Vec<Participant> {
    participants
        .iter()
        .filter(|p| !(room.is_sponsored && p.user_id == room.creator_id))
        .cloned()
        .collect()
}

fn rank_supplied(
    room: &Room,
    eligible: &[Participant],
    user_ids: &[String],
    rule: SplitRule,
) -> Result<Vec<RankedWinner>> {
    let mut seen = HashSet::new();
    let mut ranked = Vec::new();

    for user_id in user_ids {
        if !seen.insert(user_id.as_str()) {
            return Err(RoomError::validation(format!(
                "{} is listed as a winner twice",
                user_id
            )));
        }
        let participant = eligible
            .iter()
            .find(|p| &p.user_id == user_id)
            .ok_or_else(|| {
                RoomError::validation(format!(
                    "{} is not an eligible participant of room {}",
                    user_id, room.id
                ))
            })?;
        ranked.push(RankedWinner {
            participant_id: participant.id,
            user_id: participant.user_id.clone(),
            rank: ranked.len() as u32 + 1,
            score: participant.score,
        });
    }

    ranked.truncate(rule.payable_ranks(ranked.len()));
    Ok(ranked)
}
