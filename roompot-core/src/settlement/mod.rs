//! Settlement math and the store-side writer.
//!
//! [`split`] and [`winners`] are pure; [`decision`] turns a room into a
//! balanced [`SettlementDecision`]; [`writer`] applies it exactly once.

pub mod decision;
pub mod split;
pub mod winners;
pub mod writer;

pub use decision::{
    distributable, platform_fee, DecisionKind, Payout, Refund, RefundKind, SettlementDecision,
};
pub use split::{RankShare, SplitRule};
pub use winners::{select_winners, RankedWinner};
pub use writer::{SettlementWriter, WriteOutcome};

use serde::{Deserialize, Serialize};

/// What a caller sees after asking for a room to be settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettlementOutcome {
    Settled(SettlementDecision),
    /// Someone else settled the room first. Treated as success.
    AlreadySettled,
    /// Funds may have moved on the ledger but the store has not caught up;
    /// the room is flagged for reconciliation.
    Pending { reason: String },
}

impl SettlementOutcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, SettlementOutcome::Pending { .. })
    }
}
