//! Boundary to the external escrow ledger.
//!
//! The ledger holds escrowed funds and is the source of truth for fund
//! movement. Every call carries an [`IdempotencyKey`] derived from the room
//! and the logical operation, so re-issuing the same call is safe while a
//! different logical operation always gets a different key. The gateway
//! itself never retries; see [`retry::call_ledger`].

pub mod http;
pub mod local;
pub mod memory;
pub mod retry;

pub use http::HttpLedgerGateway;
pub use local::LocalLedger;
pub use memory::InMemoryLedger;
pub use retry::call_ledger;

use crate::types::Amount;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("ledger unreachable: {0}")]
    Unreachable(String),

    #[error("ledger rejected: {0}")]
    Rejected(String),

    #[error("ledger timeout: {0}")]
    Timeout(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerOp {
    Create,
    Join,
    Refund,
    Settle,
}

impl LedgerOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerOp::Create => "create",
            LedgerOp::Join => "join",
            LedgerOp::Refund => "refund",
            LedgerOp::Settle => "settle",
        }
    }

    /// Payout-moving calls are not re-issued after a timeout.
    pub fn is_payout(&self) -> bool {
        matches!(self, LedgerOp::Settle)
    }
}

impl fmt::Display for LedgerOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic key identifying one logical ledger operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(room_id: &str, op: LedgerOp, target: Option<&str>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(room_id.as_bytes());
        hasher.update(b":");
        hasher.update(op.as_str().as_bytes());
        if let Some(target) = target {
            hasher.update(b":");
            hasher.update(target.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Room parameters the escrow contract enforces on its side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowRoomParams {
    pub room_id: String,
    pub creator: String,
    pub entry_fee: Amount,
    pub currency: String,
    pub capacity: u32,
    pub is_sponsored: bool,
    pub sponsor_amount: Amount,
    pub split_rule: String,
    pub fee_bps: u32,
    pub end_time: i64,
}

/// Who gets their contribution back on a refund.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "user_id", rename_all = "snake_case")]
pub enum RefundTarget {
    Participant(String),
    Sponsor(String),
}

impl RefundTarget {
    pub fn user_id(&self) -> &str {
        match self {
            RefundTarget::Participant(user) | RefundTarget::Sponsor(user) => user,
        }
    }

    pub fn key_suffix(&self) -> String {
        match self {
            RefundTarget::Participant(user) => format!("participant:{}", user),
            RefundTarget::Sponsor(user) => format!("sponsor:{}", user),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerReceipt {
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowCreated {
    pub ledger_room_id: String,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementWinner {
    pub user_id: String,
    pub rank: u32,
    pub score: i64,
}

/// Whether two winner lists pay the same users at the same ranks.
///
/// Scores are informational and may move between attempts.
pub fn same_payout(a: &[SettlementWinner], b: &[SettlementWinner]) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .zip(b)
            .all(|(x, y)| x.user_id == y.user_id && x.rank == y.rank)
}

#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// Lock `payment` from the creator or sponsor and open the escrow.
    async fn escrow_create(
        &self,
        key: &IdempotencyKey,
        params: &EscrowRoomParams,
        payment: Amount,
    ) -> Result<EscrowCreated, LedgerError>;

    async fn escrow_join(
        &self,
        key: &IdempotencyKey,
        ledger_room_id: &str,
        payer: &str,
        payment: Amount,
    ) -> Result<LedgerReceipt, LedgerError>;

    async fn escrow_refund(
        &self,
        key: &IdempotencyKey,
        ledger_room_id: &str,
        target: &RefundTarget,
    ) -> Result<LedgerReceipt, LedgerError>;

    /// Ledger-side payout; the ledger recomputes fee and split itself.
    ///
    /// Replaying `key` with a different winner list is `Rejected`.
    async fn escrow_settle(
        &self,
        key: &IdempotencyKey,
        ledger_room_id: &str,
        winners: &[SettlementWinner],
    ) -> Result<LedgerReceipt, LedgerError>;
}

pub(crate) fn digest_for(key: &IdempotencyKey, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_str().as_bytes());
    hasher.update(salt.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotency_key_is_deterministic() {
        let a = IdempotencyKey::new("room-1", LedgerOp::Settle, None);
        let b = IdempotencyKey::new("room-1", LedgerOp::Settle, None);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_idempotency_key_separates_operations() {
        let settle = IdempotencyKey::new("room-1", LedgerOp::Settle, None);
        let refund = IdempotencyKey::new("room-1", LedgerOp::Refund, Some("alice"));
        let refund_other = IdempotencyKey::new("room-1", LedgerOp::Refund, Some("bob"));
        let other_room = IdempotencyKey::new("room-2", LedgerOp::Settle, None);

        assert_ne!(settle, refund);
        assert_ne!(refund, refund_other);
        assert_ne!(settle, other_room);
    }
}
