use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Named policy mapping finishing rank to a share of the distributable pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitRule {
    WinnerTakesAll,
    Top2,
    Top3,
    Top4,
    Top5,
    Top10,
    Equal,
}

/// One payable rank and its share in whole percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankShare {
    pub rank: u32,
    pub percentage: u32,
}

const WINNER_TAKES_ALL: &[u32] = &[100];
const TOP_2: &[u32] = &[60, 40];
const TOP_3: &[u32] = &[50, 30, 20];
const TOP_4: &[u32] = &[40, 30, 20, 10];
const TOP_5: &[u32] = &[30, 25, 20, 15, 10];
const TOP_10: &[u32] = &[25, 18, 14, 11, 9, 7, 6, 5, 3, 2];

impl SplitRule {
    pub const ALL: [SplitRule; 7] = [
        SplitRule::WinnerTakesAll,
        SplitRule::Top2,
        SplitRule::Top3,
        SplitRule::Top4,
        SplitRule::Top5,
        SplitRule::Top10,
        SplitRule::Equal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SplitRule::WinnerTakesAll => "winner_takes_all",
            SplitRule::Top2 => "top_2",
            SplitRule::Top3 => "top_3",
            SplitRule::Top4 => "top_4",
            SplitRule::Top5 => "top_5",
            SplitRule::Top10 => "top_10",
            SplitRule::Equal => "equal",
        }
    }

    /// Resolve a stored rule identifier, falling back to `winner_takes_all`
    /// so settlement never stalls on a malformed room.
    pub fn resolve(id: &str) -> Self {
        match id.parse() {
            Ok(rule) => rule,
            Err(_) => {
                tracing::warn!(
                    "Unknown split rule '{}', settling as winner_takes_all",
                    id
                );
                SplitRule::WinnerTakesAll
            }
        }
    }

    /// Number of ranks that receive a share when `participants` are eligible.
    pub fn payable_ranks(&self, participants: usize) -> usize {
        match self.fixed_table() {
            Some(table) => table.len().min(participants),
            None => participants,
        }
    }

    /// Ordered shares summing to exactly 100.
    ///
    /// `equal` spreads 100 across `participants` with the integer remainder
    /// on rank 1; fixed-table rules ignore `participants`.
    pub fn shares(&self, participants: usize) -> Vec<RankShare> {
        let percentages: Vec<u32> = match self.fixed_table() {
            Some(table) => table.to_vec(),
            None if participants == 0 => return Vec::new(),
            None => {
                let n = participants as u32;
                let each = 100 / n;
                let mut split = vec![each; participants];
                split[0] += 100 - each * n;
                split
            }
        };

        percentages
            .into_iter()
            .enumerate()
            .map(|(i, percentage)| RankShare {
                rank: i as u32 + 1,
                percentage,
            })
            .collect()
    }

    fn fixed_table(&self) -> Option<&'static [u32]> {
        match self {
            SplitRule::WinnerTakesAll => Some(WINNER_TAKES_ALL),
            SplitRule::Top2 => Some(TOP_2),
            SplitRule::Top3 => Some(TOP_3),
            SplitRule::Top4 => Some(TOP_4),
            SplitRule::Top5 => Some(TOP_5),
            SplitRule::Top10 => Some(TOP_10),
            SplitRule::Equal => None,
        }
    }
}

impl fmt::Display for SplitRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SplitRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SplitRule::ALL
            .iter()
            .copied()
            .find(|rule| rule.as_str() == s)
            .ok_or_else(|| format!("unknown split rule: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_rule_sums_to_100() {
        for rule in SplitRule::ALL {
            for n in 1..=100 {
                let total: u32 = rule.shares(n).iter().map(|s| s.percentage).sum();
                assert_eq!(total, 100, "{} with {} participants", rule, n);
            }
        }
    }

    #[test]
    fn test_ranks_are_one_based_and_ordered() {
        let shares = SplitRule::Top3.shares(10);
        let ranks: Vec<u32> = shares.iter().map(|s| s.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3]);
        assert_eq!(shares[0].percentage, 50);
    }

    #[test]
    fn test_equal_split_gives_remainder_to_first() {
        let shares = SplitRule::Equal.shares(3);
        let split: Vec<u32> = shares.iter().map(|s| s.percentage).collect();
        assert_eq!(split, vec![34, 33, 33]);
        assert_eq!(SplitRule::Equal.payable_ranks(7), 7);
        assert!(SplitRule::Equal.shares(0).is_empty());
    }

    #[test]
    fn test_payable_ranks_capped_by_participants() {
        assert_eq!(SplitRule::Top10.payable_ranks(4), 4);
        assert_eq!(SplitRule::Top2.payable_ranks(5), 2);
        assert_eq!(SplitRule::WinnerTakesAll.payable_ranks(0), 0);
    }

    #[test]
    fn test_unknown_rule_falls_back() {
        assert_eq!(SplitRule::resolve("top_7"), SplitRule::WinnerTakesAll);
        assert_eq!(SplitRule::resolve("top_5"), SplitRule::Top5);
        assert!("nonsense".parse::<SplitRule>().is_err());
    }
}
