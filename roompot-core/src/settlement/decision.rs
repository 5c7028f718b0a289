use super::split::SplitRule;
use super::winners::RankedWinner;
use crate::ledger::SettlementWinner;
use crate::types::{Amount, Participant, Room};
use serde::{Deserialize, Serialize};

const BPS_DENOMINATOR: u128 = 10_000;

/// `floor(pool * fee_bps / 10_000)`, never more than the pool.
pub fn platform_fee(pool: Amount, fee_bps: u32) -> Amount {
    let fee = pool.to_units() as u128 * fee_bps.min(10_000) as u128 / BPS_DENOMINATOR;
    Amount::from_units(fee as u64)
}

/// What is left for winners once the fee is taken. `fee + distributable == pool`.
pub fn distributable(pool: Amount, fee_bps: u32) -> Amount {
    pool.saturating_sub(platform_fee(pool, fee_bps))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Prize,
    NoWinners,
    Cancellation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub participant_id: i64,
    pub user_id: String,
    pub rank: u32,
    pub score: i64,
    pub percentage: u32,
    pub amount: Amount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundKind {
    Contribution,
    Sponsorship,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refund {
    pub participant_id: Option<i64>,
    pub user_id: String,
    pub amount: Amount,
    pub kind: RefundKind,
}

/// Transient result of settling one room, consumed once by the writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementDecision {
    pub room_id: String,
    pub kind: DecisionKind,
    pub total_pool: Amount,
    pub platform_fee: Amount,
    pub payouts: Vec<Payout>,
    pub refunds: Vec<Refund>,
}

impl SettlementDecision {
    /// Fee-adjusted prize distribution over `winners`.
    ///
    /// Shares of ranks nobody reached and every rounding remainder land on
    /// rank 1. With no winners the pool is refunded without a fee.
    pub fn prize(
        room: &Room,
        participants: &[Participant],
        winners: &[RankedWinner],
        rule: SplitRule,
        fee_bps: u32,
    ) -> Self {
        if winners.is_empty() {
            let mut decision = Self::refund_all(room, participants);
            decision.kind = DecisionKind::NoWinners;
            return decision;
        }

        let total_pool = pool_of(room, participants);
        let platform_fee = platform_fee(total_pool, fee_bps);
        let distributable = total_pool.saturating_sub(platform_fee);
        let shares = rule.shares(winners.len());

        let mut payouts: Vec<Payout> = winners
            .iter()
            .zip(shares.iter())
            .map(|(winner, share)| Payout {
                participant_id: winner.participant_id,
                user_id: winner.user_id.clone(),
                rank: winner.rank,
                score: winner.score,
                percentage: share.percentage,
                amount: share_of(distributable, share.percentage, rule, winners.len()),
            })
            .collect();

        let paid_below_first = payouts
            .iter()
            .skip(1)
            .fold(Amount::ZERO, |acc, p| acc.saturating_add(p.amount));
        let pct_below_first: u32 = payouts.iter().skip(1).map(|p| p.percentage).sum();
        if let Some(first) = payouts.first_mut() {
            first.amount = distributable.saturating_sub(paid_below_first);
            first.percentage = 100 - pct_below_first;
        }

        Self {
            room_id: room.id.clone(),
            kind: DecisionKind::Prize,
            total_pool,
            platform_fee,
            payouts,
            refunds: Vec::new(),
        }
    }

    /// Full refund of every contribution and the sponsorship. No fee.
    pub fn cancellation(room: &Room, participants: &[Participant]) -> Self {
        Self::refund_all(room, participants)
    }

    fn refund_all(room: &Room, participants: &[Participant]) -> Self {
        let mut refunds: Vec<Refund> = participants
            .iter()
            .filter(|p| !p.payment_amount.is_zero())
            .map(|p| Refund {
                participant_id: Some(p.id),
                user_id: p.user_id.clone(),
                amount: p.payment_amount,
                kind: RefundKind::Contribution,
            })
            .collect();

        if room.is_sponsored && !room.sponsor_amount.is_zero() {
            refunds.push(Refund {
                participant_id: None,
                user_id: room.creator_id.clone(),
                amount: room.sponsor_amount,
                kind: RefundKind::Sponsorship,
            });
        }

        Self {
            room_id: room.id.clone(),
            kind: DecisionKind::Cancellation,
            total_pool: pool_of(room, participants),
            platform_fee: Amount::ZERO,
            payouts: Vec::new(),
            refunds,
        }
    }

    /// Everything paid out, refunded or kept as fee adds back up to the pool.
    pub fn is_balanced(&self) -> bool {
        let settled = self
            .payouts
            .iter()
            .map(|p| p.amount)
            .chain(self.refunds.iter().map(|r| r.amount))
            .fold(self.platform_fee, |acc, a| acc.saturating_add(a));
        settled == self.total_pool
    }

    /// Pool left recorded on the room after refunds went back out.
    pub fn retained_pool(&self) -> Amount {
        self.refunds
            .iter()
            .fold(self.total_pool, |acc, r| acc.saturating_sub(r.amount))
    }

    pub fn ledger_winners(&self) -> Vec<SettlementWinner> {
        self.payouts
            .iter()
            .map(|p| SettlementWinner {
                user_id: p.user_id.clone(),
                rank: p.rank,
                score: p.score,
            })
            .collect()
    }

    pub fn payout_for(&self, participant_id: i64) -> Option<&Payout> {
        self.payouts
            .iter()
            .find(|p| p.participant_id == participant_id)
    }
}

fn pool_of(room: &Room, participants: &[Participant]) -> Amount {
    let contributions = participants
        .iter()
        .fold(Amount::ZERO, |acc, p| acc.saturating_add(p.payment_amount));
    if room.is_sponsored {
        contributions.saturating_add(room.sponsor_amount)
    } else {
        contributions
    }
}

fn share_of(distributable: Amount, percentage: u32, rule: SplitRule, winners: usize) -> Amount {
    let units = distributable.to_units() as u128;
    let amount = match rule {
        SplitRule::Equal => units / winners.max(1) as u128,
        _ => units * percentage as u128 / 100,
    };
    Amount::from_units(amount as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RoomStatus;
    use chrono::{Duration, Utc};

    const CENT_SUI: u64 = 10_000_000;

    fn room(sponsored: bool, sponsor: u64) -> Room {
        let now = Utc::now();
        Room {
            id: "room-1".to_string(),
            ledger_room_id: Some("escrow_1".to_string()),
            name: "cup".to_string(),
            game_id: "snake".to_string(),
            creator_id: "alice".to_string(),
            entry_fee: Amount::from_units(if sponsored { 0 } else { CENT_SUI }),
            currency: "SUI".to_string(),
            capacity: 10,
            min_players: 2,
            current_players: 2,
            is_private: false,
            join_code: None,
            is_sponsored: sponsored,
            sponsor_amount: Amount::from_units(sponsor),
            split_rule: "top_2".to_string(),
            start_time: now,
            end_time: now + Duration::hours(1),
            actual_start_time: None,
            actual_end_time: None,
            status: RoomStatus::Ongoing,
            prize_pool: Amount::ZERO,
            platform_fee_collected: Amount::ZERO,
            needs_reconciliation: false,
            reconciliation_reason: None,
            created_at: now,
        }
    }

    fn participant(id: i64, user: &str, paid: u64) -> Participant {
        Participant {
            id,
            room_id: "room-1".to_string(),
            user_id: user.to_string(),
            payment_currency: "SUI".to_string(),
            payment_amount: Amount::from_units(paid),
            score: 0,
            final_rank: None,
            earnings: Amount::ZERO,
            active: true,
            joined_at: Utc::now(),
            left_at: None,
            settled_at: None,
        }
    }

    fn winner(id: i64, user: &str, rank: u32) -> RankedWinner {
        RankedWinner {
            participant_id: id,
            user_id: user.to_string(),
            rank,
            score: 0,
        }
    }

    #[test]
    fn test_fee_and_distributable_cover_pool() {
        for pool in [0u64, 1, 99, 14_285, 20_000_000, u64::MAX] {
            for bps in [0u32, 1, 700, 1000, 9_999, 10_000] {
                let pool = Amount::from_units(pool);
                let sum = platform_fee(pool, bps)
                    .checked_add(distributable(pool, bps))
                    .unwrap();
                assert_eq!(sum, pool);
            }
        }
    }

    #[test]
    fn test_winner_takes_all_two_players() {
        let players = vec![participant(1, "alice", CENT_SUI), participant(2, "bob", CENT_SUI)];
        let decision = SettlementDecision::prize(
            &room(false, 0),
            &players,
            &[winner(2, "bob", 1)],
            SplitRule::WinnerTakesAll,
            700,
        );

        assert_eq!(decision.total_pool, Amount::from_units(20_000_000));
        assert_eq!(decision.platform_fee, Amount::from_units(1_400_000));
        assert_eq!(decision.payouts.len(), 1);
        assert_eq!(decision.payouts[0].amount, Amount::from_units(18_600_000));
        assert!(decision.payout_for(1).is_none());
        assert!(decision.is_balanced());
    }

    #[test]
    fn test_top_2_two_players() {
        let players = vec![participant(1, "alice", CENT_SUI), participant(2, "bob", CENT_SUI)];
        let decision = SettlementDecision::prize(
            &room(false, 0),
            &players,
            &[winner(1, "alice", 1), winner(2, "bob", 2)],
            SplitRule::Top2,
            700,
        );

        assert_eq!(decision.payouts[0].amount, Amount::from_units(11_160_000));
        assert_eq!(decision.payouts[1].amount, Amount::from_units(7_440_000));
        assert_eq!(decision.payouts[0].percentage, 60);
        assert!(decision.is_balanced());
    }

    #[test]
    fn test_unreached_ranks_and_remainder_go_to_first() {
        let players = vec![participant(1, "alice", 7), participant(2, "bob", 7)];
        let decision = SettlementDecision::prize(
            &room(false, 0),
            &players,
            &[winner(1, "alice", 1), winner(2, "bob", 2)],
            SplitRule::Top3,
            700,
        );

        // pool 14, fee 0, rank 2 gets floor(14 * 30%) = 4
        assert_eq!(decision.platform_fee, Amount::ZERO);
        assert_eq!(decision.payouts[1].amount, Amount::from_units(4));
        assert_eq!(decision.payouts[0].amount, Amount::from_units(10));
        assert_eq!(decision.payouts[0].percentage, 70);
        assert!(decision.is_balanced());
    }

    #[test]
    fn test_equal_split_rounds_into_first() {
        let players = vec![
            participant(1, "alice", 100),
            participant(2, "bob", 100),
            participant(3, "carol", 100),
        ];
        let winners = vec![
            winner(1, "alice", 1),
            winner(2, "bob", 2),
            winner(3, "carol", 3),
        ];
        let decision =
            SettlementDecision::prize(&room(false, 0), &players, &winners, SplitRule::Equal, 700);

        // pool 300, fee 21, distributable 279 = 93 * 3
        let amounts: Vec<u64> = decision.payouts.iter().map(|p| p.amount.to_units()).collect();
        assert_eq!(amounts, vec![93, 93, 93]);
        assert!(decision.is_balanced());
    }

    #[test]
    fn test_sponsored_room_without_winners_refunds_sponsor() {
        let players = vec![participant(1, "alice", 0)];
        let decision =
            SettlementDecision::prize(&room(true, CENT_SUI), &players, &[], SplitRule::Top2, 700);

        assert_eq!(decision.kind, DecisionKind::NoWinners);
        assert_eq!(decision.platform_fee, Amount::ZERO);
        assert_eq!(decision.refunds.len(), 1);
        assert_eq!(decision.refunds[0].user_id, "alice");
        assert_eq!(decision.refunds[0].amount, Amount::from_units(CENT_SUI));
        assert_eq!(decision.refunds[0].kind, RefundKind::Sponsorship);
        assert_eq!(decision.retained_pool(), Amount::ZERO);
        assert!(decision.is_balanced());
    }

    #[test]
    fn test_cancellation_refunds_every_payment() {
        let players = vec![participant(1, "alice", CENT_SUI), participant(2, "bob", CENT_SUI)];
        let decision = SettlementDecision::cancellation(&room(false, 0), &players);

        assert_eq!(decision.kind, DecisionKind::Cancellation);
        assert_eq!(decision.refunds.len(), 2);
        assert_eq!(decision.platform_fee, Amount::ZERO);
        assert!(decision.payouts.is_empty());
        assert!(decision.is_balanced());
    }
}
