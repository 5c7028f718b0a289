use super::{
    digest_for, same_payout, EscrowCreated, EscrowRoomParams, IdempotencyKey, LedgerError,
    LedgerGateway, LedgerOp, LedgerReceipt, RefundTarget, SettlementWinner,
};
use crate::types::Amount;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct EscrowAccount {
    pub creator: String,
    pub contributions: HashMap<String, Amount>,
    pub sponsor: Option<(String, Amount)>,
    pub settled_winners: Option<Vec<SettlementWinner>>,
}

impl EscrowAccount {
    pub fn locked(&self) -> Amount {
        let contributed = self
            .contributions
            .values()
            .fold(Amount::ZERO, |acc, a| acc.checked_add(*a).unwrap_or(acc));
        match &self.sponsor {
            Some((_, amount)) => contributed.checked_add(*amount).unwrap_or(contributed),
            None => contributed,
        }
    }
}

#[derive(Debug, Clone)]
enum Recorded {
    Created(EscrowCreated),
    Receipt(LedgerReceipt),
}

#[derive(Default)]
struct State {
    escrows: HashMap<String, EscrowAccount>,
    replies: HashMap<IdempotencyKey, Recorded>,
    failures: HashMap<LedgerOp, VecDeque<LedgerError>>,
    applied: HashMap<LedgerOp, u32>,
    calls: HashMap<LedgerOp, u32>,
}

/// In-process escrow with fault injection.
#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<State>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `op` fail with `err` before it reaches the escrow.
    pub fn fail_next(&self, op: LedgerOp, err: LedgerError) {
        self.state
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// Number of calls received for `op`, including failed and replayed ones.
    pub fn calls(&self, op: LedgerOp) -> u32 {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Number of distinct operations that actually moved escrow state.
    pub fn applied(&self, op: LedgerOp) -> u32 {
        self.state.lock().applied.get(&op).copied().unwrap_or(0)
    }

    pub fn escrow(&self, ledger_room_id: &str) -> Option<EscrowAccount> {
        self.state.lock().escrows.get(ledger_room_id).cloned()
    }

    fn begin(state: &mut State, op: LedgerOp) -> Result<(), LedgerError> {
        *state.calls.entry(op).or_default() += 1;
        if let Some(err) = state.failures.get_mut(&op).and_then(|q| q.pop_front()) {
            return Err(err);
        }
        Ok(())
    }

    fn receipt(state: &mut State, op: LedgerOp, key: &IdempotencyKey) -> LedgerReceipt {
        *state.applied.entry(op).or_default() += 1;
        let receipt = LedgerReceipt {
            digest: digest_for(key, op.as_str()),
        };
        state
            .replies
            .insert(key.clone(), Recorded::Receipt(receipt.clone()));
        receipt
    }

    fn replay(state: &State, key: &IdempotencyKey) -> Option<LedgerReceipt> {
        match state.replies.get(key) {
            Some(Recorded::Receipt(receipt)) => Some(receipt.clone()),
            _ => None,
        }
    }
}

#[async_trait]
impl LedgerGateway for InMemoryLedger {
    async fn escrow_create(
        &self,
        key: &IdempotencyKey,
        params: &EscrowRoomParams,
        payment: Amount,
    ) -> Result<EscrowCreated, LedgerError> {
        let mut state = self.state.lock();
        Self::begin(&mut state, LedgerOp::Create)?;

        if let Some(Recorded::Created(created)) = state.replies.get(key) {
            return Ok(created.clone());
        }

        let mut account = EscrowAccount {
            creator: params.creator.clone(),
            ..Default::default()
        };
        if params.is_sponsored {
            account.sponsor = Some((params.creator.clone(), params.sponsor_amount));
        } else {
            account
                .contributions
                .insert(params.creator.clone(), payment);
        }

        let ledger_room_id = format!("escrow_{}", Uuid::new_v4());
        state.escrows.insert(ledger_room_id.clone(), account);
        *state.applied.entry(LedgerOp::Create).or_default() += 1;

        let created = EscrowCreated {
            ledger_room_id,
            digest: digest_for(key, LedgerOp::Create.as_str()),
        };
        state
            .replies
            .insert(key.clone(), Recorded::Created(created.clone()));
        Ok(created)
    }

    async fn escrow_join(
        &self,
        key: &IdempotencyKey,
        ledger_room_id: &str,
        payer: &str,
        payment: Amount,
    ) -> Result<LedgerReceipt, LedgerError> {
        let mut state = self.state.lock();
        Self::begin(&mut state, LedgerOp::Join)?;

        if let Some(receipt) = Self::replay(&state, key) {
            return Ok(receipt);
        }

        let account = state
            .escrows
            .get_mut(ledger_room_id)
            .ok_or_else(|| LedgerError::Rejected(format!("unknown escrow {}", ledger_room_id)))?;
        if account.settled_winners.is_some() {
            return Err(LedgerError::Rejected("escrow already settled".to_string()));
        }
        if account.contributions.contains_key(payer) {
            return Err(LedgerError::Rejected(format!("{} already joined", payer)));
        }
        account.contributions.insert(payer.to_string(), payment);

        Ok(Self::receipt(&mut state, LedgerOp::Join, key))
    }

    async fn escrow_refund(
        &self,
        key: &IdempotencyKey,
        ledger_room_id: &str,
        target: &RefundTarget,
    ) -> Result<LedgerReceipt, LedgerError> {
        let mut state = self.state.lock();
        Self::begin(&mut state, LedgerOp::Refund)?;

        if let Some(receipt) = Self::replay(&state, key) {
            return Ok(receipt);
        }

        let account = state
            .escrows
            .get_mut(ledger_room_id)
            .ok_or_else(|| LedgerError::Rejected(format!("unknown escrow {}", ledger_room_id)))?;
        if account.settled_winners.is_some() {
            return Err(LedgerError::Rejected("escrow already settled".to_string()));
        }

        let released = match target {
            RefundTarget::Participant(user) => account.contributions.remove(user).is_some(),
            RefundTarget::Sponsor(user) => {
                let matches = account.sponsor.as_ref().map_or(false, |(s, _)| s == user);
                if matches {
                    account.sponsor = None;
                }
                matches
            }
        };
        if !released {
            return Err(LedgerError::Rejected(format!(
                "nothing escrowed for {}",
                target.key_suffix()
            )));
        }

        Ok(Self::receipt(&mut state, LedgerOp::Refund, key))
    }

    async fn escrow_settle(
        &self,
        key: &IdempotencyKey,
        ledger_room_id: &str,
        winners: &[SettlementWinner],
    ) -> Result<LedgerReceipt, LedgerError> {
        let mut state = self.state.lock();
        Self::begin(&mut state, LedgerOp::Settle)?;

        if let Some(receipt) = Self::replay(&state, key) {
            let settled = state
                .escrows
                .get(ledger_room_id)
                .and_then(|account| account.settled_winners.as_deref());
            return match settled {
                Some(previous) if !same_payout(previous, winners) => Err(LedgerError::Rejected(
                    format!("settle {} replayed with different winners", key),
                )),
                _ => Ok(receipt),
            };
        }

        let account = state
            .escrows
            .get_mut(ledger_room_id)
            .ok_or_else(|| LedgerError::Rejected(format!("unknown escrow {}", ledger_room_id)))?;
        if account.settled_winners.is_some() {
            return Err(LedgerError::Rejected("escrow already settled".to_string()));
        }
        account.settled_winners = Some(winners.to_vec());

        Ok(Self::receipt(&mut state, LedgerOp::Settle, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(creator: &str) -> EscrowRoomParams {
        EscrowRoomParams {
            room_id: "room-1".to_string(),
            creator: creator.to_string(),
            entry_fee: Amount::from_units(10),
            currency: "SUI".to_string(),
            capacity: 4,
            is_sponsored: false,
            sponsor_amount: Amount::ZERO,
            split_rule: "winner_takes_all".to_string(),
            fee_bps: 700,
            end_time: 0,
        }
    }

    #[tokio::test]
    async fn test_replayed_key_moves_funds_once() {
        let ledger = InMemoryLedger::new();
        let create_key = IdempotencyKey::new("room-1", LedgerOp::Create, None);
        let created = ledger
            .escrow_create(&create_key, &params("alice"), Amount::from_units(10))
            .await
            .unwrap();

        let join_key = IdempotencyKey::new("room-1", LedgerOp::Join, Some("bob"));
        let first = ledger
            .escrow_join(&join_key, &created.ledger_room_id, "bob", Amount::from_units(10))
            .await
            .unwrap();
        let second = ledger
            .escrow_join(&join_key, &created.ledger_room_id, "bob", Amount::from_units(10))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(ledger.calls(LedgerOp::Join), 2);
        assert_eq!(ledger.applied(LedgerOp::Join), 1);
        let escrow = ledger.escrow(&created.ledger_room_id).unwrap();
        assert_eq!(escrow.locked(), Amount::from_units(20));
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed() {
        let ledger = InMemoryLedger::new();
        ledger.fail_next(
            LedgerOp::Create,
            LedgerError::Unreachable("offline".to_string()),
        );
        let key = IdempotencyKey::new("room-1", LedgerOp::Create, None);

        let first = ledger
            .escrow_create(&key, &params("alice"), Amount::from_units(10))
            .await;
        assert!(matches!(first, Err(LedgerError::Unreachable(_))));

        let second = ledger
            .escrow_create(&key, &params("alice"), Amount::from_units(10))
            .await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_settled_escrow_rejects_new_settlement() {
        let ledger = InMemoryLedger::new();
        let created = ledger
            .escrow_create(
                &IdempotencyKey::new("room-1", LedgerOp::Create, None),
                &params("alice"),
                Amount::from_units(10),
            )
            .await
            .unwrap();

        let key = IdempotencyKey::new("room-1", LedgerOp::Settle, None);
        ledger
            .escrow_settle(&key, &created.ledger_room_id, &[])
            .await
            .unwrap();
        // Same logical settlement replays; a different key is refused
        assert!(ledger
            .escrow_settle(&key, &created.ledger_room_id, &[])
            .await
            .is_ok());
        let other = IdempotencyKey::new("room-1", LedgerOp::Refund, Some("participant:alice"));
        let refund = ledger
            .escrow_refund(
                &other,
                &created.ledger_room_id,
                &RefundTarget::Participant("alice".to_string()),
            )
            .await;
        assert!(matches!(refund, Err(LedgerError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_settle_replay_must_name_the_same_winners() {
        let ledger = InMemoryLedger::new();
        let created = ledger
            .escrow_create(
                &IdempotencyKey::new("room-1", LedgerOp::Create, None),
                &params("alice"),
                Amount::from_units(10),
            )
            .await
            .unwrap();
        let winner = |user: &str, score: i64| SettlementWinner {
            user_id: user.to_string(),
            rank: 1,
            score,
        };

        let key = IdempotencyKey::new("room-1", LedgerOp::Settle, None);
        let first = ledger
            .escrow_settle(&key, &created.ledger_room_id, &[winner("alice", 3)])
            .await
            .unwrap();
        let replay = ledger
            .escrow_settle(&key, &created.ledger_room_id, &[winner("alice", 5)])
            .await
            .unwrap();
        assert_eq!(first, replay);

        let other = ledger
            .escrow_settle(&key, &created.ledger_room_id, &[winner("bob", 9)])
            .await;
        assert!(matches!(other, Err(LedgerError::Rejected(_))));
        assert_eq!(ledger.applied(LedgerOp::Settle), 1);
    }
}
