//! Competitor identifier normalization.
//!
//! Inputs arrive as page ids, profile URLs, ad library URLs or keyword search
//! URLs. Everything is reduced to a canonical ad library URL or rejected; the
//! resolver never guesses.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use serde::Serialize;

use crate::error::BadCompetitorUrl;

pub const LIBRARY_BASE: &str = "https://www.facebook.com/ads/library/";
pub const PORTAL_DOMAIN: &str = "facebook.com";
const LIBRARY_PATH_MARKER: &str = "facebook.com/ads/library";

pub const PAGE_ID_PARAM: &str = "view_all_page_id";
pub const SEARCH_TERM_PARAMS: [&str; 2] = ["search_term", "q"];

static NUMERIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+$").expect("valid regex"));

/// Which classification rule produced a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionKind {
    AdLibraryUrl,
    SearchTermUrl,
    PageId,
    ProfileIdParam,
    NumericSlug,
}

impl fmt::Display for ResolutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResolutionKind::AdLibraryUrl => "ad library url",
            ResolutionKind::SearchTermUrl => "search term url",
            ResolutionKind::PageId => "page id",
            ResolutionKind::ProfileIdParam => "profile.php?id",
            ResolutionKind::NumericSlug => "numeric slug",
        };
        f.write_str(s)
    }
}

/// A competitor input reduced to its canonical ad library URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedCompetitor {
    pub raw: String,
    pub canonical_url: String,
    pub page_id: Option<String>,
    pub reason: ResolutionKind,
}

#[derive(Debug, Clone)]
pub struct ResolveOptions {
    pub country: String,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            country: "ALL".to_string(),
        }
    }
}

/// Split raw competitor config into trimmed, non-empty identifiers.
///
/// Accepts a JSON array of strings, or free text separated by newlines
/// (real or literal `\n`) and commas. Order and duplicates are preserved.
pub fn normalize_competitor_inputs(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    if trimmed.starts_with('[') {
        if let Ok(serde_json::Value::Array(items)) = serde_json::from_str(trimmed) {
            return items
                .iter()
                .map(|item| match item {
                    serde_json::Value::String(s) => s.trim().to_string(),
                    other => other.to_string().trim().to_string(),
                })
                .filter(|s| !s.is_empty())
                .collect();
        }
    }

    trimmed
        .replace("\\n", "\n")
        .split(|c| c == '\n' || c == ',')
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .map(String::from)
        .collect()
}

/// Stable page URL carrying only the page id and fixed filters.
pub fn build_page_url(page_id: &str, country: &str) -> String {
    let country = if country.trim().is_empty() { "ALL" } else { country.trim() };
    format!(
        "{}?active_status=all&ad_type=all&country={}&media_type=all&search_type=page&{}={}",
        LIBRARY_BASE, country, PAGE_ID_PARAM, page_id
    )
}

/// True when the URL carries a page id or a search term, the only shapes
/// an extraction session can work with.
pub fn has_library_target(url: &str) -> bool {
    match Url::parse(url) {
        Ok(parsed) => parsed.query_pairs().any(|(k, v)| {
            !v.trim().is_empty()
                && (k == PAGE_ID_PARAM || SEARCH_TERM_PARAMS.iter().any(|p| k == *p))
        }),
        Err(_) => false,
    }
}

fn query_value(url: &Url, key: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn is_numeric(s: &str) -> bool {
    NUMERIC.is_match(s)
}

/// Classify and canonicalize one competitor identifier. First matching rule wins.
pub fn resolve_competitor(
    input: &str,
    options: &ResolveOptions,
) -> Result<ResolvedCompetitor, BadCompetitorUrl> {
    let raw = input.trim();
    if raw.is_empty() {
        return Err(BadCompetitorUrl::new("empty input"));
    }

    let resolved = |canonical_url: String, page_id: Option<String>, reason| ResolvedCompetitor {
        raw: raw.to_string(),
        canonical_url,
        page_id,
        reason,
    };

    if raw.contains(LIBRARY_PATH_MARKER) {
        let url = Url::parse(raw).map_err(|_| BadCompetitorUrl::new("invalid ad library url"))?;

        if let Some(page_id) = query_value(&url, PAGE_ID_PARAM) {
            if !is_numeric(&page_id) {
                return Err(BadCompetitorUrl::new(format!(
                    "non-numeric {} '{}'",
                    PAGE_ID_PARAM, page_id
                )));
            }
            return Ok(resolved(
                build_page_url(&page_id, &options.country),
                Some(page_id),
                ResolutionKind::AdLibraryUrl,
            ));
        }

        if SEARCH_TERM_PARAMS.iter().any(|p| query_value(&url, p).is_some()) {
            return Ok(resolved(url.to_string(), None, ResolutionKind::SearchTermUrl));
        }

        return Err(BadCompetitorUrl::new(format!(
            "ad library url missing {} or search_term",
            PAGE_ID_PARAM
        )));
    }

    if is_numeric(raw) {
        return Ok(resolved(
            build_page_url(raw, &options.country),
            Some(raw.to_string()),
            ResolutionKind::PageId,
        ));
    }

    if let Ok(url) = Url::parse(raw) {
        let on_portal = url
            .host_str()
            .map(|h| h.to_lowercase())
            .map(|h| h == PORTAL_DOMAIN || h.ends_with(&format!(".{}", PORTAL_DOMAIN)))
            .unwrap_or(false);

        if on_portal {
            if let Some(id) = query_value(&url, "id").filter(|id| is_numeric(id)) {
                return Ok(resolved(
                    build_page_url(&id, &options.country),
                    Some(id),
                    ResolutionKind::ProfileIdParam,
                ));
            }

            let slug = url
                .path_segments()
                .and_then(|mut segments| segments.find(|s| !s.is_empty()))
                .unwrap_or("")
                .to_string();
            if is_numeric(&slug) {
                return Ok(resolved(
                    build_page_url(&slug, &options.country),
                    Some(slug),
                    ResolutionKind::NumericSlug,
                ));
            }

            return Err(BadCompetitorUrl::new("cannot resolve page id from slug"));
        }
    }

    Err(BadCompetitorUrl::new("unsupported competitor input"))
}
