use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use keylog::{Config, KeylogClient, MemoryStore, RawQueryOptions, SortOrder};
use serde_json::json;
use std::{path::Path, time::Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

// Function to initialize tracing
fn setup_logging() {
    let filter = EnvFilter::from_default_env()
        .add_directive("keylog_example=info".parse().unwrap())
        .add_directive("keylog=info".parse().unwrap());

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config() -> Result<Config> {
    match std::env::args().nth(1) {
        Some(path) => Config::from_path(Path::new(&path))
            .with_context(|| format!("loading configuration from {}", path)),
        None => {
            warn!("No configuration file given, using localhost defaults.");
            Ok(Config::new("localhost", 8091, "default"))
        }
    }
}

fn show(time: i64) -> String {
    Utc.timestamp_millis_opt(time)
        .single()
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| time.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();
    let config = load_config()?;
    let client = KeylogClient::new(MemoryStore::new(), config)?;
    info!(
        bucket = %client.config().bucket,
        default_limit = client.config().defaults.limit,
        "Client ready"
    );

    // Two interleaved sensor streams, a few milliseconds apart
    for reading in 0..10 {
        client
            .insert("sensor-a", &json!({ "reading": reading, "temp": 20.0 + reading as f64 / 2.0 }))
            .await?;
        client
            .insert("sensor-b", &json!({ "reading": reading, "temp": 30.0 - reading as f64 }))
            .await?;
        tokio::time::sleep(Duration::from_millis(3)).await;
    }

    let latest = client
        .get("sensor-a", RawQueryOptions::new().limit(3))
        .await?;
    info!("Latest {} readings of sensor-a:", latest.hits.len());
    for hit in &latest.hits {
        info!("  {} {} {}", show(hit.time), hit.id, hit.data);
    }

    let all = client
        .get(
            "sensor-b",
            RawQueryOptions::new().sort(SortOrder::Ascending).limit(10),
        )
        .await?;
    let time_of = |n: usize| {
        all.hits
            .get(n)
            .map(|hit| hit.time)
            .with_context(|| format!("sensor-b has no reading #{}", n))
    };
    let (from, to) = (time_of(2)?, time_of(6)?);
    let window = client
        .get(
            "sensor-b",
            RawQueryOptions::new()
                .sort(SortOrder::Ascending)
                .after_in(from)
                .before_ex(to),
        )
        .await?;
    info!(
        "sensor-b between {} and {} (exclusive): {} readings",
        show(from),
        show(to),
        window.hits.len()
    );

    let removed = client
        .remove("sensor-b", RawQueryOptions::new().before_ex(from))
        .await?;
    info!("Removed {} early sensor-b readings", removed.nb_removals);

    let remaining = client.get("sensor-b", RawQueryOptions::new()).await?;
    info!(
        "sensor-b now holds {} readings, query {}",
        remaining.hits.len(),
        serde_json::to_string(&remaining.query)?
    );

    info!("Main function finished.");
    Ok(())
}
