use crate::error::{Result, RoomError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Monetary amount in the currency's smallest unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);
    /// Largest amount the store can hold in a signed 64-bit column.
    pub const MAX: Amount = Amount(i64::MAX as u64);

    pub const fn from_units(units: u64) -> Self {
        Self(units)
    }

    pub const fn to_units(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    pub fn saturating_add(self, other: Amount) -> Amount {
        Amount(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Amount) -> Amount {
        Amount(self.0.saturating_sub(other.0))
    }

    /// Parse a user-facing decimal string ("0.01") into smallest units.
    pub fn parse_decimal(input: &str, decimals: u8) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() || input.starts_with('-') {
            return Err(RoomError::validation(format!("Invalid amount '{}'", input)));
        }

        let (whole, frac) = match input.split_once('.') {
            Some((w, f)) => (w, f),
            None => (input, ""),
        };

        if frac.len() > decimals as usize {
            return Err(RoomError::validation(format!(
                "Amount '{}' has more than {} decimal places",
                input, decimals
            )));
        }

        let digits_ok = |s: &str| s.chars().all(|c| c.is_ascii_digit());
        if !digits_ok(whole) || !digits_ok(frac) || (whole.is_empty() && frac.is_empty()) {
            return Err(RoomError::validation(format!("Invalid amount '{}'", input)));
        }

        let scale = 10u64
            .checked_pow(decimals as u32)
            .ok_or_else(|| RoomError::validation("Too many decimal places"))?;
        let whole_units = if whole.is_empty() {
            0
        } else {
            whole
                .parse::<u64>()
                .map_err(|e| RoomError::validation(format!("Invalid amount '{}': {}", input, e)))?
        };

        let mut frac_padded = frac.to_string();
        while frac_padded.len() < decimals as usize {
            frac_padded.push('0');
        }
        let frac_units = if frac_padded.is_empty() {
            0
        } else {
            frac_padded
                .parse::<u64>()
                .map_err(|e| RoomError::validation(format!("Invalid amount '{}': {}", input, e)))?
        };

        whole_units
            .checked_mul(scale)
            .and_then(|w| w.checked_add(frac_units))
            .map(Amount)
            .filter(|amount| *amount <= Amount::MAX)
            .ok_or_else(|| RoomError::validation(format!("Amount '{}' overflows", input)))
    }

    pub fn format_decimal(self, decimals: u8) -> String {
        if decimals == 0 {
            return self.0.to_string();
        }
        let scale = 10u64.pow(decimals as u32);
        let whole = self.0 / scale;
        let frac = self.0 % scale;
        let frac = format!("{:0width$}", frac, width = decimals as usize);
        let frac = frac.trim_end_matches('0');
        if frac.is_empty() {
            whole.to_string()
        } else {
            format!("{}.{}", whole, frac)
        }
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    Waiting,
    Ongoing,
    Completed,
    Cancelled,
}

impl RoomStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomStatus::Waiting => "waiting",
            RoomStatus::Ongoing => "ongoing",
            RoomStatus::Completed => "completed",
            RoomStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RoomStatus::Completed | RoomStatus::Cancelled)
    }
}

impl fmt::Display for RoomStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoomStatus {
    type Err = RoomError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "waiting" => Ok(RoomStatus::Waiting),
            "ongoing" => Ok(RoomStatus::Ongoing),
            "completed" => Ok(RoomStatus::Completed),
            "cancelled" => Ok(RoomStatus::Cancelled),
            other => Err(RoomError::validation(format!("Unknown room status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub ledger_room_id: Option<String>,
    pub name: String,
    pub game_id: String,
    pub creator_id: String,
    pub entry_fee: Amount,
    pub currency: String,
    pub capacity: u32,
    pub min_players: u32,
    pub current_players: u32,
    pub is_private: bool,
    pub join_code: Option<String>,
    pub is_sponsored: bool,
    pub sponsor_amount: Amount,
    pub split_rule: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub actual_start_time: Option<DateTime<Utc>>,
    pub actual_end_time: Option<DateTime<Utc>>,
    pub status: RoomStatus,
    pub prize_pool: Amount,
    pub platform_fee_collected: Amount,
    pub needs_reconciliation: bool,
    pub reconciliation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Room {
    pub fn is_full(&self) -> bool {
        self.current_players >= self.capacity
    }

    /// Amount a joiner pays into the pool.
    pub fn join_payment(&self) -> Amount {
        if self.is_sponsored {
            Amount::ZERO
        } else {
            self.entry_fee
        }
    }

    /// Rooms with an unresolved ledger/store divergence read as "settlement pending".
    pub fn display_status(&self) -> String {
        if self.needs_reconciliation && !self.status.is_terminal() {
            "settlement pending".to_string()
        } else {
            self.status.to_string()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: i64,
    pub room_id: String,
    pub user_id: String,
    pub payment_currency: String,
    pub payment_amount: Amount,
    pub score: i64,
    pub final_rank: Option<u32>,
    pub earnings: Amount,
    pub active: bool,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Deposit,
    EntryFee,
    Sponsorship,
    Refund,
    Win,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Deposit => "deposit",
            TransactionType::EntryFee => "entry_fee",
            TransactionType::Sponsorship => "sponsorship",
            TransactionType::Refund => "refund",
            TransactionType::Win => "win",
        }
    }

    /// Debits move funds out of the wallet.
    pub fn is_debit(&self) -> bool {
        matches!(self, TransactionType::EntryFee | TransactionType::Sponsorship)
    }
}

impl FromStr for TransactionType {
    type Err = RoomError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "deposit" => Ok(TransactionType::Deposit),
            "entry_fee" => Ok(TransactionType::EntryFee),
            "sponsorship" => Ok(TransactionType::Sponsorship),
            "refund" => Ok(TransactionType::Refund),
            "win" => Ok(TransactionType::Win),
            other => Err(RoomError::validation(format!(
                "Unknown transaction type '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
        }
    }
}

impl FromStr for TransactionStatus {
    type Err = RoomError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "completed" => Ok(TransactionStatus::Completed),
            "failed" => Ok(TransactionStatus::Failed),
            other => Err(RoomError::validation(format!(
                "Unknown transaction status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: String,
    pub user_id: String,
    pub room_id: Option<String>,
    pub tx_type: TransactionType,
    pub amount: Amount,
    pub currency: String,
    pub status: TransactionStatus,
    pub ledger_digest: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Input to room creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRoomParams {
    pub name: String,
    pub game_id: String,
    pub creator_id: String,
    pub entry_fee: Amount,
    pub currency: String,
    pub capacity: u32,
    pub min_players: u32,
    pub is_private: bool,
    pub join_code: Option<String>,
    pub is_sponsored: bool,
    pub sponsor_amount: Amount,
    pub split_rule: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Whether a lifecycle mutation landed in both ledgers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    Applied,
    /// Funds may have moved on the ledger but the store has not caught up.
    SettlementPending { reason: String },
}

impl OperationStatus {
    pub fn is_applied(&self) -> bool {
        matches!(self, OperationStatus::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_decimal() {
        assert_eq!(
            Amount::parse_decimal("0.01", 9).unwrap(),
            Amount::from_units(10_000_000)
        );
        assert_eq!(
            Amount::parse_decimal("12", 2).unwrap(),
            Amount::from_units(1_200)
        );
        assert_eq!(Amount::parse_decimal(".5", 1).unwrap(), Amount::from_units(5));
        assert!(Amount::parse_decimal("0.001", 2).is_err());
        assert!(Amount::parse_decimal("-1", 9).is_err());
        assert!(Amount::parse_decimal("1.2.3", 9).is_err());
        assert!(Amount::parse_decimal("", 9).is_err());
    }

    #[test]
    fn test_parse_decimal_stops_at_storable_max() {
        assert_eq!(
            Amount::parse_decimal("9223372036854775807", 0).unwrap(),
            Amount::MAX
        );
        assert!(Amount::parse_decimal("9223372036854775808", 0).is_err());
        assert!(Amount::parse_decimal("18446744073", 9).is_err());
    }

    #[test]
    fn test_format_decimal() {
        assert_eq!(Amount::from_units(18_600_000).format_decimal(9), "0.0186");
        assert_eq!(Amount::from_units(2_000_000_000).format_decimal(9), "2");
        assert_eq!(Amount::from_units(42).format_decimal(0), "42");
    }

    #[test]
    fn test_status_terminal() {
        assert!(!RoomStatus::Waiting.is_terminal());
        assert!(!RoomStatus::Ongoing.is_terminal());
        assert!(RoomStatus::Completed.is_terminal());
        assert!(RoomStatus::Cancelled.is_terminal());
        assert_eq!("ongoing".parse::<RoomStatus>().unwrap(), RoomStatus::Ongoing);
    }
}
