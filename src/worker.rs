use std::collections::HashSet;

use anyhow::Result;
use chrono::Utc;
use tracing::{error, info, warn};

use crate::browser::BrowserSession;
use crate::cache::DiscoveryCache;
use crate::competitor::{resolve_competitor, ResolveOptions, ResolvedCompetitor};
use crate::config::Config;
use crate::delivery::{DeliveryRow, WebhookClient};
use crate::discovery::{self, DiscoverOptions};
use crate::extraction::{self, ExtractOptions};
use crate::landing;
use crate::scoring::{score_winners, ScoredAd};

#[derive(Debug, Default, Clone)]
pub struct RunSummary {
    pub competitors: usize,
    pub failed: usize,
    pub winners: usize,
    pub batches_accepted: usize,
}

/// Row category from the shape of the competitor URL.
pub fn infer_category(url: &str) -> &'static str {
    if url.contains("view_all_page_id=") {
        "Competitor page"
    } else if url.contains("/ads/library/?id=") {
        "Specific ad reference"
    } else if url.contains("q=") || url.contains("search_term=") {
        "Keyword search"
    } else {
        "Ad library"
    }
}

async fn discover_into_cache(config: &Config, cache: &mut DiscoveryCache) {
    if config.seed_keywords.is_empty() {
        return;
    }

    info!(
        "Discovering competitors from {} keyword(s) across {} country setting(s)",
        config.seed_keywords.len(),
        config.countries.len()
    );
    let options = DiscoverOptions {
        headful: config.headful,
        ..Default::default()
    };

    for country in &config.countries {
        for keyword in &config.seed_keywords {
            match discovery::discover(keyword, country, &options).await {
                Ok(pages) => {
                    let now = Utc::now();
                    for page in pages {
                        cache.merge(page, now);
                    }
                }
                Err(e) => error!("Discovery failed for \"{}\" ({}): {:#}", keyword, country, e),
            }
        }
    }
}

/// Resolve inputs in order, dropping rejects and repeated canonical URLs.
pub fn resolve_all(inputs: &[String], country: &str) -> Vec<ResolvedCompetitor> {
    let options = ResolveOptions {
        country: country.to_string(),
    };
    let mut seen = HashSet::new();
    let mut resolved = Vec::new();

    for input in inputs {
        match resolve_competitor(input, &options) {
            Ok(competitor) => {
                if seen.insert(competitor.canonical_url.clone()) {
                    resolved.push(competitor);
                }
            }
            Err(e) => warn!("Skipping competitor '{}': {}", input, e),
        }
    }
    resolved
}

/// Landing link per winner. Winners that already carry one keep it; the rest
/// are resolved through one auxiliary browser that is dropped afterwards.
async fn resolve_landings(winners: &[ScoredAd]) -> Vec<String> {
    let mut landings: Vec<String> = winners
        .iter()
        .map(|w| w.ad.landing_link.clone().unwrap_or_default())
        .collect();

    if landings.iter().all(|l| !l.is_empty()) {
        return landings;
    }

    let session = match BrowserSession::launch(false) {
        Ok(session) => session,
        Err(e) => {
            warn!("Snapshot browser unavailable, skipping landing enrichment: {:#}", e);
            return landings;
        }
    };

    for (winner, landing) in winners.iter().zip(landings.iter_mut()) {
        if landing.is_empty() {
            *landing = landing::resolve_landing(&session, &winner.ad.snapshot_url).await;
        }
    }
    landings
}

async fn process_competitor(
    competitor: &ResolvedCompetitor,
    config: &Config,
    client: &WebhookClient,
    label: &str,
) -> Result<(usize, usize)> {
    let options = ExtractOptions {
        headful: config.headful,
        max_ads: config.max_ads_per_competitor,
        pause_on_login_wall: config.pause_on_login_wall,
        now: Utc::now(),
        ..Default::default()
    };
    let result = extraction::extract(competitor, &options).await?;

    info!("{} Final URL: {}", label, result.final_url);
    info!("{} Ads parsed: {}", label, result.ads.len());
    if result.ads.is_empty() {
        return Ok((0, 0));
    }

    let scored = score_winners(&result.ads, options.now);
    let winners: Vec<ScoredAd> = scored
        .into_iter()
        .take(config.winners_per_competitor)
        .collect();
    info!("{} Winners selected: {}", label, winners.len());

    let landings = resolve_landings(&winners).await;
    let category = infer_category(&competitor.canonical_url);
    let rows: Vec<DeliveryRow> = winners
        .iter()
        .zip(landings)
        .map(|(winner, landing)| DeliveryRow {
            landing_link: landing,
            ..DeliveryRow::from_scored(winner, &competitor.canonical_url, category)
        })
        .collect();

    let accepted = client.deliver(&rows, label).await;
    Ok((winners.len(), accepted))
}

/// Discovery, extraction, scoring, enrichment and delivery for every competitor.
/// Per-competitor failures are logged and never stop the run.
pub async fn run(config: &Config) -> Result<RunSummary> {
    let client = WebhookClient::new(&config.webhook_url, &config.webhook_token)?;

    let mut cache = DiscoveryCache::load(&config.discovery_cache);
    discover_into_cache(config, &mut cache).await;

    let mut inputs = config.competitor_inputs.clone();
    inputs.extend(
        cache
            .ranked(config.discovery_limit)
            .into_iter()
            .map(|page| page.id.clone()),
    );

    if let Err(e) = cache.save(&config.discovery_cache, Utc::now()) {
        warn!("Could not save discovery cache: {:#}", e);
    }

    let competitors = resolve_all(&inputs, config.primary_country());
    info!("Competitors: {}", competitors.len());

    let mut summary = RunSummary {
        competitors: competitors.len(),
        ..Default::default()
    };

    for (i, competitor) in competitors.iter().enumerate() {
        let label = format!("[{}/{}]", i + 1, competitors.len());
        info!("{} Scraping {} ({})", label, competitor.canonical_url, competitor.reason);

        match process_competitor(competitor, config, &client, &label).await {
            Ok((winners, accepted)) => {
                summary.winners += winners;
                summary.batches_accepted += accepted;
            }
            Err(e) => {
                summary.failed += 1;
                error!("{} Failed: {:#}", label, e);
            }
        }
    }

    info!(
        "Run complete: {} competitor(s), {} failed, {} winner(s), {} batch(es) delivered",
        summary.competitors, summary.failed, summary.winners, summary.batches_accepted
    );
    Ok(summary)
}
