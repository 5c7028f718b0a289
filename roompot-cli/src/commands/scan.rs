use chrono::Utc;
use roompot_core::{ExpiryScanner, Result, RoomError, RoomManager};
use std::sync::Arc;
use tokio::sync::oneshot;

pub async fn handle_scan(once: bool, manager: Arc<RoomManager>) -> Result<()> {
    let interval = manager.config().scan_interval;
    let scanner = ExpiryScanner::new(manager, interval);

    if once {
        let report = scanner.scan_once(Utc::now()).await?;
        println!("Scan complete:");
        println!("  Started: {}", report.started);
        println!("  Settled: {}", report.settled);
        println!("  Already settled: {}", report.already_settled);
        println!("  Settlement pending: {}", report.pending);
        println!("  Failed: {}", report.failed);
        println!("  Read model updates: {}", report.published);
        return Ok(());
    }

    println!(
        "Scanning every {}s; press Ctrl-C to stop",
        interval.as_secs_f64()
    );
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle = scanner.spawn(shutdown_rx);

    tokio::signal::ctrl_c().await?;
    let _ = shutdown_tx.send(());
    handle
        .await
        .map_err(|e| RoomError::internal(format!("scanner task failed: {}", e)))?;

    println!("Scanner stopped.");
    Ok(())
}
