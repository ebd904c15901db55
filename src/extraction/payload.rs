//! Parsing and walking the library's internal data responses.
//!
//! The response schema is undocumented and moves around, so nothing here
//! assumes a fixed shape. Payloads are walked as a generic JSON tree: any
//! object the terminal predicate accepts is collected and not descended into;
//! every other object/array is recursed; strings are mined for embedded
//! archive ids as a last resort.

use std::collections::HashSet;

use chrono::DateTime;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::Html;
use serde_json::{Map, Value};

use crate::ads::{snapshot_url_for, RawAdRecord};

const ARCHIVE_ID_KEYS: &[&str] = &["adArchiveID", "ad_archive_id", "adArchiveId"];

const DATA_ENDPOINT_MARKERS: &[&str] = &["/api/graphql", "graph.facebook.com", "graphql?"];

static SECURITY_PREFIXES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"^for\s*\(\s*;\s*;\s*\)\s*;?\s*",
        r"^\)\]\}',?\s*",
        r"^while\s*\(\s*1\s*\)\s*;?\s*",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid prefix regex"))
    .collect()
});

static EMBEDDED_ID_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r#"ad_archive_id[="\s:\\]+(\d{10,20})"#,
        r"/ads/library/\?id=(\d{10,20})",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid id regex"))
    .collect()
});

/// Whether a response URL belongs to the library's internal data endpoint.
pub fn is_data_endpoint(url: &str) -> bool {
    DATA_ENDPOINT_MARKERS.iter().any(|m| url.contains(m))
}

/// Remove anti-hijack guards the site prepends to JSON bodies.
pub fn strip_security_prefix(body: &str) -> &str {
    let mut rest = body.trim_start();
    for re in SECURITY_PREFIXES.iter() {
        if let Some(m) = re.find(rest) {
            rest = &rest[m.end()..];
        }
    }
    rest.trim()
}

/// Parse a response body into one or more JSON frames.
///
/// The endpoint sometimes streams several JSON documents separated by
/// newlines; each line is then parsed on its own. Returns the frames that
/// parsed and the raw lines that did not.
pub fn parse_frames(body: &str) -> (Vec<Value>, Vec<&str>) {
    let clean = strip_security_prefix(body);
    if clean.is_empty() {
        return (Vec::new(), Vec::new());
    }
    if let Ok(value) = serde_json::from_str::<Value>(clean) {
        return (vec![value], Vec::new());
    }

    let mut frames = Vec::new();
    let mut unparsed = Vec::new();
    for line in clean.lines().map(strip_security_prefix).filter(|l| !l.is_empty()) {
        match serde_json::from_str::<Value>(line) {
            Ok(v) => frames.push(v),
            Err(_) => unparsed.push(line),
        }
    }
    (frames, unparsed)
}

/// Archive ids embedded anywhere in free text, in first-seen order.
pub fn extract_ids_from_text(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    for re in EMBEDDED_ID_PATTERNS.iter() {
        for cap in re.captures_iter(text) {
            let id = cap[1].to_string();
            if seen.insert(id.clone()) {
                ids.push(id);
            }
        }
    }
    ids
}

/// Default terminal predicate: the object carries an archive identifier.
pub fn is_ad_node(node: &Map<String, Value>) -> bool {
    archive_id_of(node).is_some()
}

/// Everything one walk over a payload turned up.
#[derive(Debug, Default)]
pub struct PayloadScan<'v> {
    pub terminals: Vec<&'v Map<String, Value>>,
    pub embedded_ids: Vec<String>,
}

/// Tree walker with a pluggable terminal-node predicate.
pub struct PayloadWalker<P>
where
    P: Fn(&Map<String, Value>) -> bool,
{
    is_terminal: P,
}

impl PayloadWalker<fn(&Map<String, Value>) -> bool> {
    /// Walker that stops at ad nodes.
    pub fn for_ads() -> Self {
        PayloadWalker::new(is_ad_node as fn(&Map<String, Value>) -> bool)
    }
}

impl<P> PayloadWalker<P>
where
    P: Fn(&Map<String, Value>) -> bool,
{
    pub fn new(is_terminal: P) -> Self {
        Self { is_terminal }
    }

    pub fn scan<'v>(&self, root: &'v Value) -> PayloadScan<'v> {
        let mut scan = PayloadScan::default();
        let mut seen_ids = HashSet::new();
        self.visit(root, &mut scan, &mut seen_ids);
        scan
    }

    fn visit<'v>(&self, value: &'v Value, scan: &mut PayloadScan<'v>, seen_ids: &mut HashSet<String>) {
        match value {
            Value::Object(map) => {
                if (self.is_terminal)(map) {
                    scan.terminals.push(map);
                    return;
                }

                // Connection shapes: { edges: [ { node: {...}, cursor } ] }
                if let Some(Value::Array(edges)) = map.get("edges") {
                    for edge in edges {
                        match edge.get("node") {
                            Some(node) => self.visit(node, scan, seen_ids),
                            None => self.visit(edge, scan, seen_ids),
                        }
                    }
                }

                for (key, child) in map {
                    if key != "edges" {
                        self.visit(child, scan, seen_ids);
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.visit(item, scan, seen_ids);
                }
            }
            Value::String(s) => {
                if s.contains("ad_archive_id") || s.contains("/ads/library/?id=") {
                    for id in extract_ids_from_text(s) {
                        if seen_ids.insert(id.clone()) {
                            scan.embedded_ids.push(id);
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

// ============================================================================
// Ad node -> RawAdRecord
// ============================================================================

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn first_field(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| map.get(*k).and_then(scalar_string))
}

fn first_object<'v>(map: &'v Map<String, Value>, keys: &[&str]) -> Option<&'v Map<String, Value>> {
    keys.iter().find_map(|k| map.get(*k).and_then(Value::as_object))
}

fn first_item<'v>(map: &'v Map<String, Value>, key: &str) -> Option<&'v Map<String, Value>> {
    map.get(key)
        .and_then(Value::as_array)
        .and_then(|items| items.first())
        .and_then(Value::as_object)
}

fn archive_id_of(node: &Map<String, Value>) -> Option<String> {
    first_field(node, ARCHIVE_ID_KEYS)
}

fn is_http(link: &str) -> bool {
    link.starts_with("http://") || link.starts_with("https://")
}

fn html_to_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let text = fragment.root_element().text().collect::<Vec<_>>().join(" ");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Start date as text. Epoch seconds become an RFC 3339 timestamp so the
/// time of day survives; other text is kept as-is.
fn start_date_of(node: &Map<String, Value>) -> Option<String> {
    let raw = node
        .get("startDate")
        .or_else(|| node.get("start_date"))
        .and_then(scalar_string)?;

    match raw.parse::<i64>() {
        Ok(0) => None,
        Ok(secs) => DateTime::from_timestamp(secs, 0).map(|dt| dt.to_rfc3339()),
        Err(_) => Some(raw),
    }
}

fn primary_text_of(snapshot: &Map<String, Value>) -> String {
    let body = match snapshot.get("body") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Object(body)) => first_field(body, &["text"]).or_else(|| {
            first_object(body, &["markup"])
                .and_then(|m| first_field(m, &["__html"]))
                .map(|html| html_to_text(&html))
        }),
        _ => None,
    };

    body.or_else(|| first_item(snapshot, "cards").and_then(|c| first_field(c, &["body"])))
        .unwrap_or_default()
}

fn creative_preview_of(snapshot: &Map<String, Value>) -> String {
    if let Some(card) = first_item(snapshot, "cards") {
        if let Some(url) = first_field(
            card,
            &[
                "resized_image_url",
                "resizedImageUrl",
                "original_image_url",
                "originalImageUrl",
                "video_hd_url",
                "videoHdUrl",
                "video_preview_image_url",
            ],
        ) {
            return url;
        }
    }
    if let Some(image) = first_item(snapshot, "images") {
        if let Some(url) = first_field(
            image,
            &["resized_image_url", "resizedImageUrl", "original_image_url", "originalImageUrl"],
        ) {
            return url;
        }
    }
    first_item(snapshot, "videos")
        .and_then(|v| {
            first_field(
                v,
                &["video_hd_url", "videoHdUrl", "video_sd_url", "videoSdUrl", "video_preview_image_url"],
            )
        })
        .unwrap_or_default()
}

fn landing_link_of(snapshot: &Map<String, Value>) -> Option<String> {
    let direct = first_field(snapshot, &["link_url", "linkUrl"])
        .or_else(|| first_item(snapshot, "cards").and_then(|c| first_field(c, &["link_url", "linkUrl"])));
    if let Some(link) = direct {
        return Some(link);
    }

    let cta = first_field(snapshot, &["call_to_action_link", "callToActionLink"]).or_else(|| {
        first_object(snapshot, &["callToAction", "call_to_action"]).and_then(|c| first_field(c, &["value"]))
    })?;
    is_http(&cta).then_some(cta)
}

/// Convert a terminal ad node. Nested fields are read, never walked further.
pub fn parse_ad_node(node: &Map<String, Value>) -> Option<RawAdRecord> {
    let archive_id = archive_id_of(node)?;
    let empty = Map::new();
    let snapshot = first_object(node, &["snapshot", "ad_snapshot"]).unwrap_or(&empty);

    let snapshot_url = first_field(node, &["adSnapshotURL", "ad_snapshot_url"])
        .unwrap_or_else(|| snapshot_url_for(&archive_id));

    Some(RawAdRecord {
        started_running_on: start_date_of(node),
        primary_text: primary_text_of(snapshot),
        creative_preview_url: creative_preview_of(snapshot),
        landing_link: landing_link_of(snapshot),
        snapshot_url,
        archive_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strip_security_prefixes() {
        assert_eq!(strip_security_prefix("for (;;);{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_security_prefix(")]}',\n{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_security_prefix("while(1); {\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_security_prefix("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn test_parse_frames_handles_streamed_lines() {
        let body = "for (;;);{\"data\":1}\n{\"data\":2}\nnot json";
        let (frames, unparsed) = parse_frames(body);
        assert_eq!(frames.len(), 2);
        assert_eq!(unparsed, vec!["not json"]);

        let (frames, unparsed) = parse_frames("{\"a\":1}");
        assert_eq!(frames.len(), 1);
        assert!(unparsed.is_empty());
    }

    #[test]
    fn test_extract_ids_from_text() {
        let text = r#"{"ad_archive_id":"1234567890123"} /ads/library/?id=9876543210987 ad_archive_id=1234567890123"#;
        assert_eq!(extract_ids_from_text(text), vec!["1234567890123", "9876543210987"]);
        assert!(extract_ids_from_text("id=123").is_empty());
    }

    #[test]
    fn test_walker_stops_at_terminal_nodes() {
        let payload = json!({
            "data": {
                "ad_library_main": {
                    "search_results_connection": {
                        "edges": [
                            { "node": { "collated_results": [
                                { "ad_archive_id": "1111111111", "snapshot": {
                                    "extra": { "ad_archive_id": "2222222222" }
                                } }
                            ] } },
                            { "node": { "adArchiveID": 3333333333u64 } }
                        ]
                    }
                }
            }
        });

        let scan = PayloadWalker::for_ads().scan(&payload);
        let ids: Vec<_> = scan.terminals.iter().filter_map(|n| archive_id_of(n)).collect();
        assert_eq!(ids, vec!["1111111111", "3333333333"]);
    }

    #[test]
    fn test_walker_mines_strings_and_accepts_custom_predicate() {
        let payload = json!({
            "items": [ { "kind": "promo", "ref": "see /ads/library/?id=5555555555555" } ],
            "markup": "<a href=\"/ads/library/?id=5555555555555\">"
        });
        let scan = PayloadWalker::for_ads().scan(&payload);
        assert!(scan.terminals.is_empty());
        assert_eq!(scan.embedded_ids, vec!["5555555555555"]);

        let custom = PayloadWalker::new(|m: &Map<String, Value>| m.get("kind").is_some());
        let scan = custom.scan(&payload);
        assert_eq!(scan.terminals.len(), 1);
    }

    #[test]
    fn test_parse_ad_node_fields() {
        let node = json!({
            "ad_archive_id": "1234567890",
            "start_date": 1704067200,
            "snapshot": {
                "body": { "text": "Shop the summer sale" },
                "cards": [ { "resized_image_url": "https://scontent.example/img.jpg", "link_url": "https://shop.example.com/sale" } ]
            }
        });
        let ad = parse_ad_node(node.as_object().unwrap()).unwrap();
        assert_eq!(ad.archive_id, "1234567890");
        assert_eq!(ad.started_running_on.as_deref(), Some("2024-01-01T00:00:00+00:00"));
        assert_eq!(ad.primary_text, "Shop the summer sale");
        assert_eq!(ad.creative_preview_url, "https://scontent.example/img.jpg");
        assert_eq!(ad.landing_link.as_deref(), Some("https://shop.example.com/sale"));
        assert_eq!(ad.snapshot_url, snapshot_url_for("1234567890"));
    }

    #[test]
    fn test_parse_ad_node_markup_and_cta() {
        let node = json!({
            "adArchiveID": 42424242424u64,
            "snapshot": {
                "body": { "markup": { "__html": "<p>Free <b>shipping</b></p>" } },
                "videos": [ { "video_sd_url": "https://video.example/v.mp4" } ],
                "callToAction": { "value": "https://brand.example/" }
            }
        });
        let ad = parse_ad_node(node.as_object().unwrap()).unwrap();
        assert_eq!(ad.primary_text, "Free shipping");
        assert_eq!(ad.creative_preview_url, "https://video.example/v.mp4");
        assert_eq!(ad.landing_link.as_deref(), Some("https://brand.example/"));
        assert!(ad.started_running_on.is_none());
    }

    #[test]
    fn test_is_data_endpoint() {
        assert!(is_data_endpoint("https://www.facebook.com/api/graphql/"));
        assert!(!is_data_endpoint("https://static.xx.fbcdn.net/rsrc.php/app.js"));
    }
}
