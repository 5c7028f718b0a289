use super::{format_amount, parse_amount};
use chrono::{Duration, Utc};
use clap::Subcommand;
use comfy_table::{presets::UTF8_FULL, Table};
use dialoguer::Confirm;
use roompot_core::settlement::RefundKind;
use roompot_core::{
    Amount, CreateRoomParams, OperationStatus, Result, RoomError, RoomManager, RoomStatus,
    SettlementOutcome,
};

#[derive(Subcommand)]
pub enum RoomCommands {
    /// Create a room; the creator joins it immediately
    Create {
        /// Creator user id
        creator: String,
        /// Room name
        name: String,
        #[arg(short, long, default_value = "default")]
        game: String,
        /// Entry fee in whole currency units
        #[arg(short, long, default_value = "0")]
        entry_fee: String,
        #[arg(long, default_value = "SUI")]
        currency: String,
        #[arg(long, default_value_t = 10)]
        capacity: u32,
        #[arg(long, default_value_t = 2)]
        min_players: u32,
        /// winner_takes_all, top_2, top_3, top_4, top_5, top_10 or equal
        #[arg(short, long, default_value = "winner_takes_all")]
        split_rule: String,
        /// Make the room private with this join code
        #[arg(long)]
        join_code: Option<String>,
        /// Sponsor the pool with this amount; players join for free
        #[arg(long)]
        sponsor: Option<String>,
        /// Minutes until the room starts
        #[arg(long, default_value_t = 0)]
        starts_in: i64,
        /// Minutes the room runs for
        #[arg(long, default_value_t = 60)]
        duration: i64,
    },
    /// Join a waiting room
    Join {
        room_id: String,
        user: String,
        #[arg(long)]
        code: Option<String>,
    },
    /// Leave a waiting room and get the entry fee back
    Leave { room_id: String, user: String },
    /// Cancel a waiting room and refund everyone
    Cancel {
        room_id: String,
        /// Must be the room creator
        requester: String,
        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
    /// Settle a room now
    Complete {
        room_id: String,
        /// Ranked winner user ids, best first; defaults to current scores
        #[arg(short, long, value_delimiter = ',')]
        winners: Option<Vec<String>>,
    },
    /// Record a player's score
    Score {
        room_id: String,
        user: String,
        #[arg(allow_hyphen_values = true)]
        score: i64,
    },
    /// Move a waiting room to ongoing
    Start { room_id: String },
    /// Show room details and participants
    Show {
        room_id: String,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// List rooms
    List {
        /// waiting, ongoing, completed or cancelled
        #[arg(short, long)]
        status: Option<String>,
    },
}

pub async fn handle_room_command(cmd: RoomCommands, manager: &RoomManager) -> Result<()> {
    match cmd {
        RoomCommands::Create {
            creator,
            name,
            game,
            entry_fee,
            currency,
            capacity,
            min_players,
            split_rule,
            join_code,
            sponsor,
            starts_in,
            duration,
        } => {
            let entry_fee = parse_amount(manager, &entry_fee, &currency)?;
            let sponsor_amount = match &sponsor {
                Some(amount) => parse_amount(manager, amount, &currency)?,
                None => Amount::ZERO,
            };
            let start_time = Utc::now() + Duration::minutes(starts_in);

            let receipt = manager
                .create_room(CreateRoomParams {
                    name,
                    game_id: game,
                    creator_id: creator,
                    entry_fee,
                    currency,
                    capacity,
                    min_players,
                    is_private: join_code.is_some(),
                    join_code,
                    is_sponsored: sponsor.is_some(),
                    sponsor_amount,
                    split_rule,
                    start_time,
                    end_time: start_time + Duration::minutes(duration),
                })
                .await?;

            let room = &receipt.room;
            println!("Room created: {}", room.id);
            println!("  Name: {}", room.name);
            println!(
                "  Ledger room: {}",
                room.ledger_room_id.as_deref().unwrap_or("unconfirmed")
            );
            println!(
                "  Pool: {}",
                format_amount(manager, room.prize_pool, &room.currency)
            );
            println!("  Ends: {}", room.end_time.format("%Y-%m-%d %H:%M:%S"));
            print_status(&receipt.status);
        }

        RoomCommands::Join {
            room_id,
            user,
            code,
        } => {
            let receipt = manager.join_room(&room_id, &user, code.as_deref()).await?;
            let room = manager.room(&room_id).await?;
            println!(
                "{} joined room {} paying {}",
                user,
                room_id,
                format_amount(manager, receipt.payment, &room.currency)
            );
            print_status(&receipt.status);
        }

        RoomCommands::Leave { room_id, user } => {
            let status = manager.leave_room(&room_id, &user).await?;
            println!("{} left room {}", user, room_id);
            print_status(&status);
        }

        RoomCommands::Cancel {
            room_id,
            requester,
            force,
        } => {
            if !force {
                let confirm = Confirm::new()
                    .with_prompt(format!(
                        "Cancel room '{}' and refund every participant?",
                        room_id
                    ))
                    .default(false)
                    .interact()
                    .map_err(|e| RoomError::internal(e.to_string()))?;

                if !confirm {
                    println!("Cancellation aborted.");
                    return Ok(());
                }
            }

            let outcome = manager.cancel_room(&room_id, &requester).await?;
            print_outcome(manager, &room_id, &outcome).await?;
        }

        RoomCommands::Complete { room_id, winners } => {
            let outcome = manager.complete_room(&room_id, winners).await?;
            print_outcome(manager, &room_id, &outcome).await?;
        }

        RoomCommands::Score {
            room_id,
            user,
            score,
        } => {
            manager.record_score(&room_id, &user, score).await?;
            println!("Score {} recorded for {}", score, user);
        }

        RoomCommands::Start { room_id } => {
            if manager.transition_to_ongoing(&room_id, Utc::now()).await? {
                println!("Room {} is now ongoing", room_id);
            } else {
                let room = manager.room(&room_id).await?;
                println!(
                    "Room {} not started: status {}, {} of {} required players, starts {}",
                    room_id,
                    room.display_status(),
                    room.current_players,
                    room.min_players,
                    room.start_time.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }

        RoomCommands::Show { room_id, json } => {
            let room = manager.room(&room_id).await?;
            let participants = manager.participants(&room_id).await?;

            if json {
                let view = serde_json::json!({
                    "room": room,
                    "participants": participants,
                });
                println!("{}", serde_json::to_string_pretty(&view)?);
                return Ok(());
            }

            println!("Room Information:");
            println!("  ID: {}", room.id);
            println!("  Name: {}", room.name);
            println!("  Game: {}", room.game_id);
            println!("  Creator: {}", room.creator_id);
            println!("  Status: {}", room.display_status());
            println!(
                "  Ledger room: {}",
                room.ledger_room_id.as_deref().unwrap_or("unconfirmed")
            );
            println!("  Split rule: {}", room.split_rule);
            println!(
                "  Players: {}/{} (min {})",
                room.current_players, room.capacity, room.min_players
            );
            if room.is_sponsored {
                println!(
                    "  Sponsored: {}",
                    format_amount(manager, room.sponsor_amount, &room.currency)
                );
            } else {
                println!(
                    "  Entry fee: {}",
                    format_amount(manager, room.entry_fee, &room.currency)
                );
            }
            println!(
                "  Prize pool: {}",
                format_amount(manager, room.prize_pool, &room.currency)
            );
            if room.status == RoomStatus::Completed {
                println!(
                    "  Platform fee: {}",
                    format_amount(manager, room.platform_fee_collected, &room.currency)
                );
            }
            if let Some(reason) = &room.reconciliation_reason {
                println!("  Reconciliation: {}", reason);
            }
            println!();

            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["User", "Paid", "Score", "Rank", "Earnings", "State"]);

            for p in participants {
                let state = if p.active {
                    "active"
                } else if p.left_at.is_some() && p.settled_at.is_none() {
                    "left"
                } else {
                    "refunded"
                };
                table.add_row(vec![
                    p.user_id.clone(),
                    format_amount(manager, p.payment_amount, &p.payment_currency),
                    p.score.to_string(),
                    p.final_rank.map_or_else(|| "-".to_string(), |r| r.to_string()),
                    format_amount(manager, p.earnings, &p.payment_currency),
                    state.to_string(),
                ]);
            }

            println!("{}", table);
        }

        RoomCommands::List { status } => {
            let status = status.map(|s| s.parse::<RoomStatus>()).transpose()?;
            let rooms = manager.list_rooms(status).await?;

            if rooms.is_empty() {
                println!("No rooms found.");
                println!("Create one with: roompot room create <creator> <name>");
                return Ok(());
            }

            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["ID", "Name", "Status", "Players", "Pool", "Ends"]);

            for room in rooms {
                table.add_row(vec![
                    room.id.clone(),
                    room.name.clone(),
                    room.display_status(),
                    format!("{}/{}", room.current_players, room.capacity),
                    format_amount(manager, room.prize_pool, &room.currency),
                    room.end_time.format("%Y-%m-%d %H:%M").to_string(),
                ]);
            }

            println!("{}", table);
        }
    }

    Ok(())
}

fn print_status(status: &OperationStatus) {
    if let OperationStatus::SettlementPending { reason } = status {
        println!("  Status: settlement pending ({})", reason);
        println!("  Use 'roompot reconcile list' once the ledger is checked");
    }
}

async fn print_outcome(
    manager: &RoomManager,
    room_id: &str,
    outcome: &SettlementOutcome,
) -> Result<()> {
    match outcome {
        SettlementOutcome::Settled(decision) => {
            let currency = manager.room(room_id).await?.currency;

            println!("Room {} settled", room_id);
            println!(
                "  Pool: {}",
                format_amount(manager, decision.total_pool, &currency)
            );
            println!(
                "  Platform fee: {}",
                format_amount(manager, decision.platform_fee, &currency)
            );

            if !decision.payouts.is_empty() {
                let mut table = Table::new();
                table.load_preset(UTF8_FULL);
                table.set_header(vec!["Rank", "User", "Score", "Share", "Payout"]);
                for payout in &decision.payouts {
                    table.add_row(vec![
                        payout.rank.to_string(),
                        payout.user_id.clone(),
                        payout.score.to_string(),
                        format!("{}%", payout.percentage),
                        format_amount(manager, payout.amount, &currency),
                    ]);
                }
                println!("{}", table);
            }

            for refund in &decision.refunds {
                let kind = match refund.kind {
                    RefundKind::Contribution => "entry fee",
                    RefundKind::Sponsorship => "sponsorship",
                };
                println!(
                    "  Refunded {} {} to {}",
                    kind,
                    format_amount(manager, refund.amount, &currency),
                    refund.user_id
                );
            }
        }
        SettlementOutcome::AlreadySettled => {
            println!("Room {} was already settled; nothing to do", room_id);
        }
        SettlementOutcome::Pending { reason } => {
            println!("Room {} is settlement pending: {}", room_id, reason);
            println!("Use 'roompot reconcile list' once the ledger is checked");
        }
    }
    Ok(())
}
