use clap::Subcommand;
use comfy_table::{presets::UTF8_FULL, Table};
use roompot_core::{Result, RoomManager, TransactionStatus};

#[derive(Subcommand)]
pub enum ReconcileCommands {
    /// List rooms flagged for reconciliation
    List,
    /// Mark a flagged room as resolved after checking the ledger
    Clear {
        room_id: String,
        /// Escrow id found on the ledger, if the store never learned it
        #[arg(long)]
        ledger_room_id: Option<String>,
        /// Final status for the room's pending stake records (completed or failed)
        #[arg(long, default_value = "completed")]
        tx_status: String,
    },
}

pub async fn handle_reconcile_command(cmd: ReconcileCommands, manager: &RoomManager) -> Result<()> {
    match cmd {
        ReconcileCommands::List => {
            let rooms = manager.pending_reconciliation().await?;

            if rooms.is_empty() {
                println!("Nothing to reconcile.");
                return Ok(());
            }

            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["ID", "Name", "Status", "Ledger room", "Reason"]);

            for room in rooms {
                table.add_row(vec![
                    room.id.clone(),
                    room.name.clone(),
                    room.status.to_string(),
                    room.ledger_room_id.clone().unwrap_or_else(|| "-".to_string()),
                    room.reconciliation_reason.clone().unwrap_or_default(),
                ]);
            }

            println!("{}", table);
        }

        ReconcileCommands::Clear {
            room_id,
            ledger_room_id,
            tx_status,
        } => {
            let tx_status: TransactionStatus = tx_status.parse()?;
            let cleared = manager
                .resolve_reconciliation(&room_id, ledger_room_id.as_deref(), tx_status)
                .await?;

            if cleared {
                println!("Room {} reconciled", room_id);
            } else {
                println!("Room {} was not flagged", room_id);
            }
        }
    }

    Ok(())
}
