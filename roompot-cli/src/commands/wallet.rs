use super::{format_amount, parse_amount};
use clap::Subcommand;
use comfy_table::{presets::UTF8_FULL, Table};
use roompot_core::{Result, RoomManager};

#[derive(Subcommand)]
pub enum WalletCommands {
    /// Credit a user's wallet
    Deposit {
        /// User id
        user: String,
        /// Amount in whole currency units (e.g. 0.5)
        amount: String,
        #[arg(long, default_value = "SUI")]
        currency: String,
    },
    /// Show a user's balance
    Balance {
        /// User id
        user: String,
        #[arg(long, default_value = "SUI")]
        currency: String,
    },
    /// Show a user's transaction history
    History {
        /// User id
        user: String,
    },
}

pub async fn handle_wallet_command(cmd: WalletCommands, manager: &RoomManager) -> Result<()> {
    match cmd {
        WalletCommands::Deposit {
            user,
            amount,
            currency,
        } => {
            let amount = parse_amount(manager, &amount, &currency)?;
            let record = manager.deposit(&user, &currency, amount).await?;
            let balance = manager.balance(&user, &currency).await?;

            println!("Deposit recorded: {}", record.id);
            println!("  Amount: {}", format_amount(manager, amount, &currency));
            println!("  Balance: {}", format_amount(manager, balance, &currency));
        }

        WalletCommands::Balance { user, currency } => {
            let balance = manager.balance(&user, &currency).await?;
            println!(
                "Balance for '{}': {}",
                user,
                format_amount(manager, balance, &currency)
            );
        }

        WalletCommands::History { user } => {
            let records = manager.transactions(&user).await?;

            if records.is_empty() {
                println!("No transactions for '{}'.", user);
                return Ok(());
            }

            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["Time", "Type", "Amount", "Status", "Room", "Ledger digest"]);

            for record in records {
                table.add_row(vec![
                    record.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                    record.tx_type.as_str().to_string(),
                    format_amount(manager, record.amount, &record.currency),
                    record.status.as_str().to_string(),
                    record.room_id.unwrap_or_else(|| "-".to_string()),
                    record.ledger_digest.unwrap_or_else(|| "-".to_string()),
                ]);
            }

            println!("{}", table);
        }
    }

    Ok(())
}
