//! Run one extraction session and print the result as JSON.
//!
//! Usage: inspect_competitor <page id | profile url | ad library url> [country] [--headful]

use adlib_winners::competitor::{resolve_competitor, ResolveOptions};
use adlib_winners::extraction::{extract, ExtractOptions};
use adlib_winners::scoring::score_winners;
use anyhow::{bail, Result};
use dotenv::dotenv;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let headful = args.iter().any(|a| a == "--headful");
    let positional: Vec<&String> = args.iter().filter(|a| !a.starts_with("--")).collect();

    let Some(input) = positional.first() else {
        bail!("usage: inspect_competitor <competitor> [country] [--headful]");
    };
    let options = ResolveOptions {
        country: positional.get(1).map(|c| c.to_uppercase()).unwrap_or_else(|| "ALL".to_string()),
    };

    let competitor = resolve_competitor(input, &options)?;
    info!("Resolved via {}: {}", competitor.reason, competitor.canonical_url);

    let extract_options = ExtractOptions {
        headful,
        pause_on_login_wall: headful,
        ..Default::default()
    };
    let result = extract(&competitor, &extract_options).await?;
    let winners = score_winners(&result.ads, extract_options.now);

    let report = serde_json::json!({
        "competitor": competitor,
        "result": result,
        "winners": winners.iter().take(10).collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
