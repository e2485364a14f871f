// System status display: post states, delivery counts, per-account polling.

use anyhow::Result;
use colored::Colorize;
use std::path::Path;
use std::sync::Arc;

use crate::db::models::PostState;
use crate::db::Database;

const RECENT_FAILURES: u32 = 5;

/// Display system status to the terminal.
pub async fn show(db: &Arc<dyn Database>, db_display_path: &str) -> Result<()> {
    if !Path::new(db_display_path).exists() {
        println!("Database: not initialized");
        println!("\nRun `tweetwatch init` to set up the database.");
        return Ok(());
    }

    let file_size = std::fs::metadata(db_display_path)
        .map(|m| format_bytes(m.len()))
        .unwrap_or_else(|_| "unknown".to_string());
    println!("Database: {} ({})", db_display_path, file_size);

    // Posts per lifecycle state
    let states = db.count_posts_by_state().await?;
    let total: i64 = states.iter().map(|(_, n)| n).sum();
    if total == 0 {
        println!("Posts: none ingested yet");
    } else {
        println!("Posts: {total} total");
        for (state, count) in &states {
            let label = match state.parse::<PostState>() {
                Ok(PostState::Delivered) => state.green().to_string(),
                Ok(PostState::DeliveryFailed) => state.red().to_string(),
                Ok(PostState::EnrichmentFailed) => state.yellow().to_string(),
                _ => state.to_string(),
            };
            println!("  {:<18} {:>6}", label, count);
        }
    }

    let deliveries = db.count_deliveries_by_status().await?;
    if !deliveries.is_empty() {
        let summary: Vec<String> = deliveries
            .iter()
            .map(|(status, n)| format!("{status}: {n}"))
            .collect();
        println!("Deliveries: {}", summary.join(", "));
    }

    // Polling watermarks, keyed last_poll:{account}
    let polls: Vec<(String, String)> = db
        .get_all_scan_state()
        .await?
        .into_iter()
        .filter_map(|(k, v)| k.strip_prefix("last_poll:").map(|a| (a.to_string(), v)))
        .collect();
    if polls.is_empty() {
        println!("Last poll: never");
    } else {
        println!("Last poll:");
        for (account, at) in &polls {
            println!("  @{:<20} {}", account, at);
        }
    }

    let failures = db.recent_delivery_failures(RECENT_FAILURES).await?;
    if !failures.is_empty() {
        println!("{}", "Recent delivery failures:".red().bold());
        for record in &failures {
            println!(
                "  {} after {} attempt(s): {}",
                record.post_id,
                record.attempts,
                record.last_error.as_deref().unwrap_or("unknown error").dimmed()
            );
        }
    }

    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
