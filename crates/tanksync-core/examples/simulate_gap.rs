//! Example: Repairing a Gap in the Live Feed
//!
//! This example feeds a sensor with a live stream that skips a few
//! sequence numbers, lets the coordinator backfill them from a mock history
//! backend, and prints the aggregated series once the data is complete.
//!
//! Run with: `cargo run --example simulate_gap -- [SKIPPED_COUNT]`

use std::env;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tanksync_core::mock::{MockFeed, MockHistory, StaticIdentity};
use tanksync_core::{
    FeedEvent, Reading, Sources, SyncConfig, SyncCoordinator, SyncEvent, TimeRange, Timestamp,
};

const SENSOR: &str = "tank-1/temperature";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let skipped: u64 = env::args().nth(1).map(|s| s.parse::<u64>()).transpose()?.unwrap_or(5).max(1);
    let total = 30 + skipped;

    // One reading per minute, slowly warming up
    let readings: Vec<Reading> = (1..=total)
        .map(|seq| {
            let ts = Timestamp::from_millis(seq as i64 * 60_000);
            Reading::new(SENSOR, seq, ts, 24.0 + seq as f64 * 0.05)
        })
        .collect();

    let history = Arc::new(MockHistory::new().page_size(4));
    history.extend(readings.iter().cloned());
    history.set_latency(Duration::from_millis(200));

    // The live feed drops sequences 11..=10+skipped
    let feed = Arc::new(MockFeed::new());
    feed.push_events_then_hang(
        readings
            .iter()
            .filter(|r| r.sequence <= 10 || r.sequence > 10 + skipped)
            .cloned()
            .map(FeedEvent::Reading)
            .collect(),
    );

    let sources = Sources::new(feed, history, Arc::new(StaticIdentity::new("demo")));
    let coordinator = SyncCoordinator::new(sources, SyncConfig::default())?;
    let mut events = coordinator.events();
    coordinator.subscribe(SENSOR).await?;

    let mut states = coordinator.observe(SENSOR).await?;
    tokio::spawn(async move {
        while let Some(state) = states.next().await {
            println!("state: {}", state);
        }
    });

    loop {
        match events.recv().await? {
            SyncEvent::GapDetected { missing, .. } => println!("gap detected: {}", missing),
            SyncEvent::GapClosed { range, .. } => {
                println!("gap closed: {}", range);
                break;
            }
            SyncEvent::GapUnresolved { missing, error, .. } => {
                println!("gap unresolved: {} ({})", missing, error);
                break;
            }
            _ => {}
        }
    }

    // Whole ten-minute buckets inside the synced minutes
    let width = 10 * 60_000;
    let range = TimeRange::from_millis(width, total as i64 * 60_000 / width * width)?;
    let series = coordinator.query(SENSOR, range, width).await?;

    println!();
    println!("Series ({:?}):", series.health);
    for bucket in &series.buckets {
        println!(
            "  {}  n={:<3} min={:>6.2} max={:>6.2} avg={:>6.2}",
            bucket.start,
            bucket.count,
            bucket.min.unwrap_or(f64::NAN),
            bucket.max.unwrap_or(f64::NAN),
            bucket.avg().unwrap_or(f64::NAN),
        );
    }

    coordinator.shutdown().await;
    Ok(())
}
