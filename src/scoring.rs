//! Winner scoring: collapse re-runs of the same creative and rank by durability.
//!
//! The weights (0.6 runtime, 0.4 duplicates, x10 duplicate multiplier) are
//! fixed business tuning and must not drift.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::ads::RawAdRecord;

const PRIMARY_TEXT_KEY_CHARS: usize = 120;
const RUNTIME_WEIGHT: f64 = 0.6;
const DUPLICATE_WEIGHT: f64 = 0.4;
const DUPLICATE_MULTIPLIER: f64 = 10.0;

const START_PREFIXES: &[&str] = &[
    "started running on",
    "started running",
    "running since",
    "started on",
    "ran from",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%b %d, %Y", "%B %d, %Y", "%d %b %Y", "%d %B %Y", "%b %d %Y"];

/// A deduplicated, scored ad. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredAd {
    #[serde(flatten)]
    pub ad: RawAdRecord,
    pub duplicate_count: usize,
    pub runtime_days: i64,
    pub winning_score: f64,
}

/// Lowercase, collapse whitespace, keep ASCII alphanumerics and spaces.
pub fn normalize_text(text: &str) -> String {
    let lowered = text.to_lowercase();
    let collapsed = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == ' ')
        .collect::<String>()
        .trim()
        .to_string()
}

/// Parse a start instant from the library's phrasing ("Started running on Mar 4, 2024",
/// "Started running on 4 Mar 2024 · Total active time 3 hrs", "2024-03-04", ...).
///
/// RFC 3339 timestamps keep their time of day; bare dates count from midnight UTC.
pub fn parse_started_at(value: &str) -> Option<DateTime<Utc>> {
    let trimmed = value.trim();
    let rest = START_PREFIXES
        .iter()
        .find_map(|prefix| {
            let head = trimmed.get(..prefix.len())?;
            head.eq_ignore_ascii_case(prefix)
                .then(|| &trimmed[prefix.len()..])
        })
        .unwrap_or(trimmed);

    let cleaned = rest
        .split('·')
        .next()
        .unwrap_or("")
        .split(" to ")
        .next()
        .unwrap_or("")
        .split(" - ")
        .next()
        .unwrap_or("")
        .trim()
        .trim_start_matches(':')
        .trim();

    if cleaned.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(cleaned) {
        return Some(dt.with_timezone(&Utc));
    }

    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(cleaned, fmt).ok())
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc())
}

/// Whole elapsed days between the start and `now`, or None when the phrasing
/// does not parse or the start lies in the future.
pub fn resolved_runtime_days(started: Option<&str>, now: DateTime<Utc>) -> Option<i64> {
    let start = parse_started_at(started?)?;
    if start > now {
        return None;
    }
    Some((now - start).num_days())
}

/// Runtime used for scoring: unparseable or future dates count as 0.
pub fn runtime_days(started: Option<&str>, now: DateTime<Utc>) -> i64 {
    resolved_runtime_days(started, now).unwrap_or(0)
}

pub fn winning_score(runtime_days: i64, duplicate_count: usize) -> f64 {
    let duplicates = duplicate_count as f64 * DUPLICATE_MULTIPLIER;
    if runtime_days == 0 {
        duplicates
    } else {
        RUNTIME_WEIGHT * runtime_days as f64 + DUPLICATE_WEIGHT * duplicates
    }
}

/// Grouping key: creative preview + normalized primary text.
///
/// Records with neither (id-only stubs) key on their archive id so unrelated
/// stubs never collapse into one group.
fn group_key(ad: &RawAdRecord) -> String {
    let creative = ad.creative_preview_url.trim().to_lowercase();
    let head: String = ad.primary_text.chars().take(PRIMARY_TEXT_KEY_CHARS).collect();
    let primary = normalize_text(&head);
    if creative.is_empty() && primary.is_empty() {
        format!("id::{}", ad.archive_id)
    } else {
        format!("{}::{}", creative, primary)
    }
}

/// Deduplicate and rank. Output is non-increasing by score; ties keep encounter order.
pub fn score_winners(raw_ads: &[RawAdRecord], now: DateTime<Utc>) -> Vec<ScoredAd> {
    let mut groups: Vec<(&RawAdRecord, usize)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for ad in raw_ads {
        let key = group_key(ad);
        match index.get(&key) {
            Some(&i) => groups[i].1 += 1,
            None => {
                index.insert(key, groups.len());
                groups.push((ad, 1));
            }
        }
    }

    let mut scored: Vec<ScoredAd> = groups
        .into_iter()
        .map(|(representative, duplicate_count)| {
            let runtime_days = runtime_days(representative.started_running_on.as_deref(), now);
            ScoredAd {
                ad: representative.clone(),
                duplicate_count,
                runtime_days,
                winning_score: winning_score(runtime_days, duplicate_count),
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.winning_score
            .partial_cmp(&a.winning_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    scored
}
