use super::split::SplitRule;
use crate::types::Participant;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedWinner {
    pub participant_id: i64,
    pub user_id: String,
    pub rank: u32,
    pub score: i64,
}

/// Rank eligible participants by score and keep the payable ranks.
///
/// Ties fall back to earliest join, then to the participant id, so the
/// ranking is a pure function of the input.
pub fn select_winners(participants: &[Participant], rule: SplitRule) -> Vec<RankedWinner> {
    let mut ranked: Vec<&Participant> = participants.iter().collect();
    ranked.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then(a.joined_at.cmp(&b.joined_at))
            .then(a.id.cmp(&b.id))
    });

    let payable = rule.payable_ranks(ranked.len());
    ranked
        .into_iter()
        .take(payable)
        .enumerate()
        .map(|(i, p)| RankedWinner {
            participant_id: p.id,
            user_id: p.user_id.clone(),
            rank: i as u32 + 1,
            score: p.score,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Amount;
    use chrono::{Duration, TimeZone, Utc};

    fn player(id: i64, user: &str, score: i64, joined_offset_ms: i64) -> Participant {
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        Participant {
            id,
            room_id: "room-1".to_string(),
            user_id: user.to_string(),
            payment_currency: "SUI".to_string(),
            payment_amount: Amount::from_units(10),
            score,
            final_rank: None,
            earnings: Amount::ZERO,
            active: true,
            joined_at: base + Duration::milliseconds(joined_offset_ms),
            left_at: None,
            settled_at: None,
        }
    }

    #[test]
    fn test_highest_score_wins() {
        let players = vec![
            player(1, "alice", 10, 0),
            player(2, "bob", 30, 1),
            player(3, "carol", 20, 2),
        ];

        let winners = select_winners(&players, SplitRule::Top2);
        let order: Vec<&str> = winners.iter().map(|w| w.user_id.as_str()).collect();
        assert_eq!(order, vec!["bob", "carol"]);
        assert_eq!(winners[0].rank, 1);
        assert_eq!(winners[1].rank, 2);
    }

    #[test]
    fn test_ties_go_to_earliest_join() {
        let players = vec![
            player(3, "carol", 5, 20),
            player(2, "bob", 5, 10),
            player(4, "dave", 5, 10),
        ];

        let first = select_winners(&players, SplitRule::Top3);
        let second = select_winners(&players, SplitRule::Top3);
        assert_eq!(first, second);

        let order: Vec<&str> = first.iter().map(|w| w.user_id.as_str()).collect();
        assert_eq!(order, vec!["bob", "dave", "carol"]);
    }

    #[test]
    fn test_single_participant_takes_rank_one() {
        let players = vec![player(1, "alice", 0, 0)];
        for rule in SplitRule::ALL {
            let winners = select_winners(&players, rule);
            assert_eq!(winners.len(), 1);
            assert_eq!(winners[0].rank, 1);
        }
    }

    #[test]
    fn test_no_participants_no_winners() {
        assert!(select_winners(&[], SplitRule::Top5).is_empty());
        assert!(select_winners(&[], SplitRule::Equal).is_empty());
    }
}
