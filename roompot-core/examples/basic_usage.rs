use chrono::{Duration, Utc};
use roompot_core::{
    Amount, CreateRoomParams, EngineConfig, LocalLedger, LoggingAggregateSink, RoomManager,
    SettlementOutcome, Storage,
};
use std::sync::Arc;
use tempfile::tempdir;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // Create temp dir
    let temp_dir = tempdir()?;
    println!("Using temporary directory: {:?}", temp_dir.path());

    let storage = Arc::new(Storage::new(&temp_dir.path().join("roompot.db")).await?);
    let ledger = Arc::new(LocalLedger::new(storage.clone()));
    let manager = RoomManager::new(
        storage,
        ledger,
        Arc::new(LoggingAggregateSink),
        EngineConfig::default(),
    )?;

    // 1 SUI each
    for user in ["alice", "bob"] {
        manager
            .deposit(user, "SUI", Amount::from_units(1_000_000_000))
            .await?;
    }

    let now = Utc::now();
    let receipt = manager
        .create_room(CreateRoomParams {
            name: "example-room".to_string(),
            game_id: "snake".to_string(),
            creator_id: "alice".to_string(),
            entry_fee: Amount::parse_decimal("0.01", 9)?,
            currency: "SUI".to_string(),
            capacity: 2,
            min_players: 2,
            is_private: false,
            join_code: None,
            is_sponsored: false,
            sponsor_amount: Amount::ZERO,
            split_rule: "winner_takes_all".to_string(),
            start_time: now,
            end_time: now + Duration::minutes(5),
        })
        .await?;
    let room_id = receipt.room.id;
    println!("Room created: {}", room_id);

    manager.join_room(&room_id, "bob", None).await?;
    manager.record_score(&room_id, "bob", 120).await?;
    manager.record_score(&room_id, "alice", 80).await?;

    if let SettlementOutcome::Settled(decision) = manager.complete_room(&room_id, None).await? {
        println!("\nSettlement:");
        println!("Pool: {} SUI", decision.total_pool.format_decimal(9));
        println!("Fee: {} SUI", decision.platform_fee.format_decimal(9));
        for payout in &decision.payouts {
            println!(
                "Rank {}: {} wins {} SUI",
                payout.rank,
                payout.user_id,
                payout.amount.format_decimal(9)
            );
        }
    }

    println!("\nBalances:");
    for user in ["alice", "bob"] {
        let balance = manager.balance(user, "SUI").await?;
        println!("{}: {} SUI", user, balance.format_decimal(9));
    }

    println!("\nExample completed successfully!");

    Ok(())
}
