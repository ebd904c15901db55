//! Keyword search discovery of competitor pages.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info};

use crate::browser::{self, with_retries, BrowserSession};
use crate::competitor::{LIBRARY_BASE, PAGE_ID_PARAM};
use crate::extraction::page::accept_consent;

static PAGE_LINKS: Lazy<Selector> =
    Lazy::new(|| Selector::parse("a[href*='view_all_page_id=']").expect("valid selector"));

/// A page seen in keyword search results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredPage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Distinct anchors referencing the page, summed across sessions.
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub first_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct DiscoverOptions {
    pub headful: bool,
    pub max_scrolls: usize,
}

impl Default for DiscoverOptions {
    fn default() -> Self {
        Self {
            headful: false,
            max_scrolls: 6,
        }
    }
}

/// Keyword search URL for active ads in one country.
pub fn build_search_url(keyword: &str, country: &str) -> String {
    let country = if country.trim().is_empty() { "ALL" } else { country.trim() };
    format!(
        "{}?active_status=active&ad_type=all&country={}&q={}&search_type=keyword_unordered",
        LIBRARY_BASE,
        urlencoding::encode(country),
        urlencoding::encode(keyword)
    )
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn page_id_of(href: &str, base: &Url) -> Option<String> {
    let url = base.join(href).ok()?;
    url.query_pairs()
        .find(|(k, _)| k == PAGE_ID_PARAM)
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Anchor text, then aria-label, then the nearest enclosing div's first segment.
fn pick_name(anchor: ElementRef<'_>) -> String {
    let text = collapse_whitespace(&anchor.text().collect::<String>());
    if !text.is_empty() {
        return text;
    }

    if let Some(aria) = anchor.value().attr("aria-label") {
        let aria = aria.trim();
        if !aria.is_empty() {
            return aria.to_string();
        }
    }

    anchor
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|el| el.value().name() == "div")
        .map(|div| {
            let text = collapse_whitespace(&div.text().collect::<String>());
            text.split(" · ").next().unwrap_or("").trim().to_string()
        })
        .unwrap_or_default()
}

/// Group page-id anchors in a search results document.
///
/// One entry per distinct id in first-seen order; `count` is the number of
/// anchors referencing that id.
pub fn collect_pages(html: &str, base: &Url, now: DateTime<Utc>) -> Vec<DiscoveredPage> {
    let document = Html::parse_document(html);
    let mut pages: Vec<DiscoveredPage> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for anchor in document.select(&PAGE_LINKS) {
        let Some(id) = anchor.value().attr("href").and_then(|href| page_id_of(href, base)) else {
            continue;
        };

        let i = *index.entry(id.clone()).or_insert_with(|| {
            pages.push(DiscoveredPage {
                id,
                name: String::new(),
                count: 0,
                first_seen: Some(now),
                last_seen: Some(now),
            });
            pages.len() - 1
        });

        let page = &mut pages[i];
        page.count += 1;
        if page.name.is_empty() {
            page.name = pick_name(anchor);
        }
    }

    pages
}

/// Run one keyword search session and return the pages it surfaced.
pub async fn discover(keyword: &str, country: &str, options: &DiscoverOptions) -> Result<Vec<DiscoveredPage>> {
    let url = build_search_url(keyword, country);
    let session = BrowserSession::launch(options.headful)?;
    let tab = session.tab.clone();

    info!("Discovering pages for \"{}\" ({})", keyword, country);
    with_retries("navigate", || browser::navigate(&tab, &url)).await?;
    sleep(Duration::from_millis(1500)).await;

    if let Ok(Some(label)) = accept_consent(&tab) {
        debug!("Consent accepted via \"{}\"", label);
        sleep(Duration::from_secs(2)).await;
    }

    for _ in 0..options.max_scrolls {
        with_retries("scroll", || browser::scroll_by_viewport(&tab, 0.9)).await?;
        sleep(Duration::from_millis(1200)).await;
    }

    let html = with_retries("get_content", || browser::page_content(&tab)).await?;
    let base = Url::parse(&tab.get_url()).or_else(|_| Url::parse(&url))?;
    let pages = collect_pages(&html, &base, Utc::now());

    info!("Discovered {} page(s) for \"{}\" ({})", pages.len(), keyword, country);
    Ok(pages)
}
