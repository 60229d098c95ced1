use anyhow::Context;
use stamps_data::config::loader::load_config;
use stamps_data::{DataAccess, init_metrics, init_tracing_with_level, render_metrics};
use stamps_db::health::PROBE_QUERY;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before anything else)
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound) {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    let config = load_config()
        .map_err(anyhow::Error::msg)
        .context("invalid configuration")?;
    init_tracing_with_level(&config.log_level);
    init_metrics();
    tracing::info!(config = ?config, "Configuration loaded");

    // Any arguments form the query to run; default is the health probe.
    let args: Vec<String> = std::env::args().skip(1).collect();
    let query = if args.is_empty() {
        PROBE_QUERY.to_string()
    } else {
        args.join(" ")
    };

    let data = DataAccess::connect(&config)
        .await
        .context("starting data access layer")?;

    let outcome = data.execute(&query, &[]).await;
    match &outcome {
        Ok(rows) => println!("{}", serde_json::to_string_pretty(rows)?),
        Err(e) => tracing::error!(error = %e, query = %query, "Query failed"),
    }

    println!("{}", serde_json::to_string_pretty(&data.stats())?);
    if let Some(rendered) = render_metrics() {
        println!("{rendered}");
    }

    data.shutdown().await;
    outcome.map(|_| ()).context("query failed")
}
