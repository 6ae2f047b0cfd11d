use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ape_metrics::config::Config;
use ape_metrics::services::{run_metrics_job, run_price_job, run_token_job, run_trade_job, PartitionReport};
use ape_metrics::sources::ape::ApeStoreClient;
use ape_metrics::sources::LaunchpadSource;

fn has_flag(args: &[String], long: &str, short: &str) -> bool {
    args.iter().any(|a| a == long || a == short)
}

fn print_reports(reports: &[PartitionReport]) {
    println!("\n   {:8} {:>10} {:>10} {:>8}  {}", "Worker", "Processed", "Rows", "Failed", "Output");
    println!("   ──────── ────────── ────────── ────────  ─────────────");
    for r in reports {
        println!("   {:8} {:>10} {:>10} {:>8}  {}",
            format!("Worker{}", r.worker + 1), r.processed, r.rows, r.failed, r.output.display());
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ape_metrics=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match args.iter().position(|a| a == "--config").and_then(|i| args.get(i + 1)) {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    if has_flag(&args, "--eth-price", "-p") {
        println!("\n💱 ETH/USD Price Download Mode\n");
        let series = run_price_job(&config.prices).await?;
        if let (Some(first), Some(last)) = (series.first_minute(), series.last_minute()) {
            println!("✓ {} minutes ({} → {})", series.len(), first, last);
        }
        return Ok(());
    }

    if has_flag(&args, "--tokens", "-t") || has_flag(&args, "--trades", "-T") {
        let source: Arc<dyn LaunchpadSource> = Arc::new(ApeStoreClient::new(&config.collector)?);

        let reports = if has_flag(&args, "--tokens", "-t") {
            println!("\n📥 ape.store Token Listing Mode\n");
            run_token_job(source, &config.collector).await
        } else {
            println!("\n📥 ape.store Trade History Mode\n");
            run_trade_job(source, &config.collector).await
        };

        print_reports(&reports);
        let rows: usize = reports.iter().map(|r| r.rows).sum();
        let failed: usize = reports.iter().map(|r| r.failed).sum();
        println!("\n✓ {} rows written, {} failures\n", rows, failed);
        return Ok(());
    }

    // --metrics / -M is the default mode
    println!("\n📊 Per-Token Metrics Mode\n");
    let summary = run_metrics_job(&config.metrics)?;
    println!("✓ {} trades across {} tokens", summary.trades, summary.tokens);
    if summary.missing_last_price > 0 {
        println!("   {} trades without a last price", summary.missing_last_price);
    }
    if summary.missing_eth_usd_price > 0 {
        println!("   {} trades without an ETH/USD price", summary.missing_eth_usd_price);
    }

    Ok(())
}
