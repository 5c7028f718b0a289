pub mod reconcile;
pub mod room;
pub mod scan;
pub mod wallet;

pub use reconcile::{handle_reconcile_command, ReconcileCommands};
pub use room::{handle_room_command, RoomCommands};
pub use scan::handle_scan;
pub use wallet::{handle_wallet_command, WalletCommands};

use roompot_core::{Amount, Result, RoomError, RoomManager};

fn decimals(manager: &RoomManager, currency: &str) -> Result<u8> {
    manager
        .config()
        .currency(currency)
        .map(|c| c.decimals)
        .ok_or_else(|| RoomError::validation(format!("Unsupported currency {}", currency)))
}

/// Parse a decimal amount like "0.01" in the currency's precision.
pub(crate) fn parse_amount(manager: &RoomManager, input: &str, currency: &str) -> Result<Amount> {
    Amount::parse_decimal(input, decimals(manager, currency)?)
}

pub(crate) fn format_amount(manager: &RoomManager, amount: Amount, currency: &str) -> String {
    match decimals(manager, currency) {
        Ok(d) => format!("{} {}", amount.format_decimal(d), currency),
        Err(_) => format!("{} units {}", amount, currency),
    }
}
