//! Roompot core - settlement engine for staked game rooms
//!
//! Players stake an entry fee (or a sponsor funds the pool) into an external
//! escrow ledger. When a room ends its pool is split between the ranked
//! winners minus a platform fee, or refunded in full on cancellation. Every
//! ledger call carries an idempotency key and every terminal store write is
//! conditional, so a room settles at most once no matter how many callers
//! race to settle it.

pub mod config;
pub mod error;
pub mod ledger;
pub mod readmodel;
pub mod room;
pub mod scanner;
pub mod settlement;
pub mod storage;
pub mod types;

pub use config::{CurrencyConfig, EngineConfig, RetryPolicy};
pub use error::{Result, RoomError};
pub use ledger::{
    HttpLedgerGateway, InMemoryLedger, LedgerError, LedgerGateway, LocalLedger,
};
pub use readmodel::{AggregateSink, HttpAggregateSink, LoggingAggregateSink, ReadModelOutbox};
pub use room::{JoinReceipt, RoomManager, RoomReceipt};
pub use scanner::{ExpiryScanner, ScanReport};
pub use settlement::{SettlementDecision, SettlementOutcome, SplitRule};
pub use storage::Storage;
pub use types::{
    Amount, CreateRoomParams, OperationStatus, Participant, Room, RoomStatus, TransactionRecord,
    TransactionStatus, TransactionType,
};
