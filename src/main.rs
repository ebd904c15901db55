use adlib_winners::config::Config;
use adlib_winners::worker;
use dotenv::dotenv;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let local = std::env::args().any(|arg| arg == "--local");
    let config = match Config::from_env(local) {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    };

    info!("[startup] WEBHOOK_URL ends with /exec: {}", config.webhook_url.ends_with("/exec"));
    info!("[startup] WEBHOOK_TOKEN length: {}", config.webhook_token.len());
    info!(
        "[startup] {} competitor input(s), {} seed keyword(s), countries {:?}",
        config.competitor_inputs.len(),
        config.seed_keywords.len(),
        config.countries
    );

    worker::run(&config).await?;
    Ok(())
}
