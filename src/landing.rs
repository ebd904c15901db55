//! Landing link recovery from an ad's snapshot view.

use std::time::Duration;

use once_cell::sync::Lazy;
use reqwest::Url;
use scraper::{Html, Selector};
use tokio::time::sleep;
use tracing::debug;

use crate::browser::{self, with_retries, BrowserSession};

static ANCHORS: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").expect("valid selector"));

/// Platform-owned domains that never count as a landing page.
const PLATFORM_DOMAINS: &[&str] = &["facebook.com", "messenger.com", "instagram.com"];

fn is_http(link: &str) -> bool {
    link.starts_with("http://") || link.starts_with("https://")
}

fn host_matches(host: &str, domain: &str) -> bool {
    host == domain || host.ends_with(&format!(".{}", domain))
}

/// Recover the wrapped target of a `l.php?u=` outbound redirect.
/// Anything else comes back unchanged.
pub fn unwrap_redirect(link: &str) -> String {
    let Ok(url) = Url::parse(link) else {
        return link.to_string();
    };

    let is_wrapper = url
        .host_str()
        .map(|h| host_matches(&h.to_lowercase(), "facebook.com"))
        .unwrap_or(false)
        && url.path().contains("/l.php");
    if !is_wrapper {
        return link.to_string();
    }

    match url.query_pairs().find(|(k, _)| k == "u") {
        Some((_, target)) if !target.is_empty() => {
            // Some wrappers double-encode the target.
            if !is_http(&target) {
                if let Ok(decoded) = urlencoding::decode(&target) {
                    return decoded.into_owned();
                }
            }
            target.into_owned()
        }
        _ => link.to_string(),
    }
}

pub fn is_external_link(link: &str) -> bool {
    let Ok(url) = Url::parse(link) else {
        return false;
    };
    match url.host_str() {
        Some(host) => {
            let host = host.to_lowercase();
            !PLATFORM_DOMAINS.iter().any(|d| host_matches(&host, d))
        }
        None => false,
    }
}

fn has_dotted_host(link: &str) -> bool {
    Url::parse(link)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.contains('.')))
        .unwrap_or(false)
}

/// Best external destination among raw outbound links, or empty.
pub fn pick_best_external_link(links: &[String]) -> String {
    let candidates: Vec<String> = links
        .iter()
        .filter(|l| is_http(l))
        .map(|l| unwrap_redirect(l))
        .filter(|l| is_http(l) && is_external_link(l))
        .collect();

    candidates
        .iter()
        .find(|l| has_dotted_host(l))
        .or_else(|| candidates.first())
        .cloned()
        .unwrap_or_default()
}

/// Absolute href of every anchor in the document.
pub fn collect_outbound_links(html: &str, base: &Url) -> Vec<String> {
    let document = Html::parse_document(html);
    document
        .select(&ANCHORS)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| base.join(href.trim()).ok())
        .map(|url| url.to_string())
        .collect()
}

async fn load_snapshot_links(session: &BrowserSession, snapshot_url: &str) -> anyhow::Result<Vec<String>> {
    let tab = session.new_aux_tab()?;
    let outcome = async {
        with_retries("navigate", || browser::navigate(&tab, snapshot_url)).await?;
        sleep(Duration::from_millis(1500)).await;
        let html = with_retries("get_content", || browser::page_content(&tab)).await?;
        let base = Url::parse(&tab.get_url()).or_else(|_| Url::parse(snapshot_url))?;
        anyhow::Ok(collect_outbound_links(&html, &base))
    }
    .await;

    if let Err(e) = tab.close(true) {
        debug!("closing snapshot tab failed: {}", e);
    }
    outcome
}

/// Open the snapshot in an auxiliary tab and return the best landing link.
/// Any failure yields an empty string.
pub async fn resolve_landing(session: &BrowserSession, snapshot_url: &str) -> String {
    if snapshot_url.trim().is_empty() {
        return String::new();
    }

    match load_snapshot_links(session, snapshot_url).await {
        Ok(links) => {
            let best = pick_best_external_link(&links);
            debug!("snapshot {} -> {} link(s), landing '{}'", snapshot_url, links.len(), best);
            best
        }
        Err(e) => {
            debug!("landing resolution failed for {}: {:#}", snapshot_url, e);
            String::new()
        }
    }
}
