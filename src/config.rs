//! Run configuration read from the environment.

use std::path::PathBuf;

use anyhow::{bail, Result};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::competitor::normalize_competitor_inputs;

static LINE_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\r?\n|\\n").expect("valid regex"));
static COUNTRY_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[,\s]+").expect("valid regex"));

#[derive(Debug, Clone)]
pub struct Config {
    pub webhook_url: String,
    pub webhook_token: String,
    pub competitor_inputs: Vec<String>,
    pub seed_keywords: Vec<String>,
    pub countries: Vec<String>,
    pub discovery_limit: usize,
    pub max_ads_per_competitor: usize,
    pub winners_per_competitor: usize,
    pub headful: bool,
    pub pause_on_login_wall: bool,
    pub discovery_cache: PathBuf,
}

pub fn parse_yes(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_lowercase()).as_deref(),
        Some("y" | "yes" | "true" | "1")
    )
}

/// One entry per line; a literal `\n` also separates.
pub fn parse_lines(raw: &str) -> Vec<String> {
    LINE_SPLIT
        .split(raw)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Upper-cased country codes, `["ALL"]` when none are given.
pub fn parse_countries(raw: Option<&str>) -> Vec<String> {
    let parts: Vec<String> = COUNTRY_SPLIT
        .split(raw.unwrap_or(""))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_uppercase)
        .collect();
    if parts.is_empty() {
        vec!["ALL".to_string()]
    } else {
        parts
    }
}

fn parse_count(raw: Option<&str>, default: usize) -> usize {
    raw.and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(default)
}

impl Config {
    pub fn from_env(local: bool) -> Result<Self> {
        Self::from_lookup(local, |key| std::env::var(key).ok())
    }

    /// Build from any key lookup. `local` makes the login-wall pause default on.
    pub fn from_lookup<F>(local: bool, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let (Some(webhook_url), Some(webhook_token)) = (get("WEBHOOK_URL"), get("WEBHOOK_TOKEN")) else {
            bail!("Missing required env vars. Ensure WEBHOOK_URL and WEBHOOK_TOKEN are set.");
        };

        let competitor_inputs = get("COMPETITOR_URLS")
            .map(|raw| normalize_competitor_inputs(&raw))
            .unwrap_or_default();
        let seed_keywords = get("SEED_KEYWORDS").map(|raw| parse_lines(&raw)).unwrap_or_default();
        if competitor_inputs.is_empty() && seed_keywords.is_empty() {
            bail!("No competitor URLs or seed keywords provided.");
        }

        let pause_raw = get("PAUSE_ON_LOGIN_WALL");
        let pause_on_login_wall = match pause_raw.as_deref() {
            None => local,
            raw => parse_yes(raw),
        };

        Ok(Self {
            webhook_url: webhook_url.trim().to_string(),
            webhook_token: webhook_token.trim().to_string(),
            competitor_inputs,
            seed_keywords,
            countries: parse_countries(get("COUNTRIES").as_deref()),
            discovery_limit: parse_count(get("DISCOVERY_LIMIT").as_deref(), 30),
            max_ads_per_competitor: parse_count(get("MAX_ADS_PER_COMPETITOR").as_deref(), 30),
            winners_per_competitor: parse_count(get("WINNERS_PER_COMPETITOR").as_deref(), 10),
            headful: parse_yes(get("RUN_HEADFUL").as_deref()),
            pause_on_login_wall,
            discovery_cache: get("DISCOVERY_CACHE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("discovered_pages.json")),
        })
    }

    pub fn primary_country(&self) -> &str {
        self.countries.first().map(String::as_str).unwrap_or("ALL")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_lines("shoes\\nboots\n\n sandals "), vec!["shoes", "boots", "sandals"]);
        assert_eq!(parse_countries(Some("us, gb\nde")), vec!["US", "GB", "DE"]);
        assert_eq!(parse_countries(None), vec!["ALL"]);
        assert!(parse_yes(Some(" Yes ")));
        assert!(!parse_yes(Some("no")));
        assert!(!parse_yes(None));
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(
            false,
            lookup(&[("WEBHOOK_URL", "https://hook.example/exec"), ("WEBHOOK_TOKEN", "t"), ("COMPETITOR_URLS", "123\n456")]),
        )
        .unwrap();
        assert_eq!(config.competitor_inputs, vec!["123", "456"]);
        assert_eq!(config.countries, vec!["ALL"]);
        assert_eq!(config.discovery_limit, 30);
        assert_eq!(config.max_ads_per_competitor, 30);
        assert_eq!(config.winners_per_competitor, 10);
        assert!(!config.pause_on_login_wall);
        assert_eq!(config.discovery_cache, PathBuf::from("discovered_pages.json"));
    }

    #[test]
    fn test_local_pause_default_and_override() {
        let base = [("WEBHOOK_URL", "u"), ("WEBHOOK_TOKEN", "t"), ("SEED_KEYWORDS", "shoes")];
        assert!(Config::from_lookup(true, lookup(&base)).unwrap().pause_on_login_wall);

        let mut overridden = base.to_vec();
        overridden.push(("PAUSE_ON_LOGIN_WALL", "false"));
        assert!(!Config::from_lookup(true, lookup(&overridden)).unwrap().pause_on_login_wall);
    }

    #[test]
    fn test_missing_credentials_or_inputs_are_fatal() {
        let err = Config::from_lookup(false, lookup(&[("WEBHOOK_URL", "u"), ("SEED_KEYWORDS", "x")])).unwrap_err();
        assert!(err.to_string().contains("WEBHOOK_TOKEN"));

        let err = Config::from_lookup(false, lookup(&[("WEBHOOK_URL", "u"), ("WEBHOOK_TOKEN", "t")])).unwrap_err();
        assert!(err.to_string().contains("No competitor"));
    }
}
