//! Per-session ad map and the record sources merged into it.
//!
//! Network capture, id-only stubs and the DOM fallback are separate
//! `RecordSource`s composed in priority order. Merging is first-seen-wins by
//! archive id, so a later source never overwrites an earlier record.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::payload::{self, PayloadWalker};
use crate::ads::RawAdRecord;
use crate::scoring::resolved_runtime_days;

/// Runtime that marks an ad as durable.
pub const DURABLE_RUNTIME_DAYS: i64 = 30;

/// Everything captured from the data endpoint during one session.
#[derive(Debug, Default)]
pub struct SessionCapture {
    pub responses_seen: usize,
    pub responses_parsed: usize,
    records: Vec<RawAdRecord>,
    record_ids: HashSet<String>,
    embedded_ids: Vec<String>,
    embedded_seen: HashSet<String>,
    parse_failure_logged: bool,
    first_response_logged: bool,
}

impl SessionCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one intercepted response body. Never fails: bodies that do not
    /// parse are mined for ids instead.
    pub fn ingest_body(&mut self, url: &str, content_type: &str, body: &str) {
        self.responses_seen += 1;

        if !self.first_response_logged {
            self.first_response_logged = true;
            let head: String = body.chars().take(200).collect();
            debug!("first data response {} content-type={} first200={}", url, content_type, head);
        }

        let (frames, unparsed) = payload::parse_frames(body);
        if !unparsed.is_empty() {
            if !self.parse_failure_logged {
                self.parse_failure_logged = true;
                warn!(
                    "{} frame(s) of a data response from {} did not parse as JSON; mining raw text instead",
                    unparsed.len(),
                    url
                );
            }
            for line in &unparsed {
                for id in payload::extract_ids_from_text(line) {
                    self.push_embedded_id(id);
                }
            }
        }
        if frames.is_empty() {
            return;
        }
        self.responses_parsed += 1;

        let walker = PayloadWalker::for_ads();
        for frame in &frames {
            let scan = walker.scan(frame);
            for node in scan.terminals {
                if let Some(record) = payload::parse_ad_node(node) {
                    self.insert_record(record);
                }
            }
            for id in scan.embedded_ids {
                self.push_embedded_id(id);
            }
        }
    }

    /// First-seen-wins insert. Returns false if the id was already captured.
    pub fn insert_record(&mut self, record: RawAdRecord) -> bool {
        if record.archive_id.is_empty() || !self.record_ids.insert(record.archive_id.clone()) {
            return false;
        }
        self.records.push(record);
        true
    }

    fn push_embedded_id(&mut self, id: String) {
        if self.embedded_seen.insert(id.clone()) {
            self.embedded_ids.push(id);
        }
    }

    pub fn records(&self) -> &[RawAdRecord] {
        &self.records
    }

    pub fn embedded_ids(&self) -> &[String] {
        &self.embedded_ids
    }

    /// Unique ids seen through the network, structured or mined.
    pub fn network_id_count(&self) -> usize {
        self.record_ids.len()
            + self
                .embedded_ids
                .iter()
                .filter(|id| !self.record_ids.contains(*id))
                .count()
    }
}

/// Inputs available to the record sources at the end of a session.
pub struct Evidence<'a> {
    pub capture: &'a SessionCapture,
    pub dom_ids: &'a [String],
}

pub trait RecordSource {
    fn name(&self) -> &'static str;
    fn records(&self, evidence: &Evidence<'_>) -> Vec<RawAdRecord>;
}

/// Full records parsed from intercepted data responses.
pub struct NetworkRecords;

impl RecordSource for NetworkRecords {
    fn name(&self) -> &'static str {
        "network"
    }

    fn records(&self, evidence: &Evidence<'_>) -> Vec<RawAdRecord> {
        evidence.capture.records().to_vec()
    }
}

/// Id-only stubs for ids the network mentioned without node data.
pub struct EmbeddedIdStubs;

impl RecordSource for EmbeddedIdStubs {
    fn name(&self) -> &'static str {
        "network-stub"
    }

    fn records(&self, evidence: &Evidence<'_>) -> Vec<RawAdRecord> {
        evidence
            .capture
            .embedded_ids()
            .iter()
            .map(|id| RawAdRecord::stub(id))
            .collect()
    }
}

/// Id-only stubs from DOM links, used only when the network yielded nothing.
pub struct DomFallback;

impl RecordSource for DomFallback {
    fn name(&self) -> &'static str {
        "dom"
    }

    fn records(&self, evidence: &Evidence<'_>) -> Vec<RawAdRecord> {
        if evidence.capture.network_id_count() > 0 {
            return Vec::new();
        }
        evidence.dom_ids.iter().map(|id| RawAdRecord::stub(id)).collect()
    }
}

pub fn default_sources() -> Vec<Box<dyn RecordSource>> {
    vec![Box::new(NetworkRecords), Box::new(EmbeddedIdStubs), Box::new(DomFallback)]
}

/// Merge every source in order, first record per archive id wins.
pub fn assemble(sources: &[Box<dyn RecordSource>], evidence: &Evidence<'_>) -> Vec<RawAdRecord> {
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for source in sources {
        let (mut added, mut stubs) = (0, 0);
        for record in source.records(evidence) {
            if seen.insert(record.archive_id.clone()) {
                if record.is_stub() {
                    stubs += 1;
                }
                merged.push(record);
                added += 1;
            }
        }
        debug!("record source {} contributed {} ads ({} id-only)", source.name(), added, stubs);
    }
    merged
}

/// Keep durable ads when dates are known, then cap.
///
/// If any ad has a resolvable runtime, only ads running at least
/// `DURABLE_RUNTIME_DAYS` survive. With no date data at all everything passes
/// through for the scorer to rank.
pub fn shape_results(ads: Vec<RawAdRecord>, now: DateTime<Utc>, max_ads: usize) -> Vec<RawAdRecord> {
    let runtimes: Vec<Option<i64>> = ads
        .iter()
        .map(|ad| resolved_runtime_days(ad.started_running_on.as_deref(), now))
        .collect();

    let shaped: Vec<RawAdRecord> = if runtimes.iter().any(Option::is_some) {
        ads.into_iter()
            .zip(runtimes)
            .filter(|(_, days)| days.map_or(false, |d| d >= DURABLE_RUNTIME_DAYS))
            .map(|(ad, _)| ad)
            .collect()
    } else {
        ads
    };

    shaped.into_iter().take(max_ads).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn body(id: &str, text: &str) -> String {
        format!(
            r#"for (;;);{{"data":{{"results":[{{"ad_archive_id":"{}","snapshot":{{"body":{{"text":"{}"}}}}}}]}}}}"#,
            id, text
        )
    }

    fn dated(id: &str, date: Option<&str>) -> RawAdRecord {
        RawAdRecord {
            started_running_on: date.map(String::from),
            ..RawAdRecord::stub(id)
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_first_seen_record_wins() {
        let mut capture = SessionCapture::new();
        capture.ingest_body("https://www.facebook.com/api/graphql/", "text/html", &body("1234567890", "first"));
        capture.ingest_body("https://www.facebook.com/api/graphql/", "text/html", &body("1234567890", "second"));

        assert_eq!(capture.responses_seen, 2);
        assert_eq!(capture.responses_parsed, 2);
        assert_eq!(capture.records().len(), 1);
        assert_eq!(capture.records()[0].primary_text, "first");
    }

    #[test]
    fn test_unparseable_body_is_mined_not_fatal() {
        let mut capture = SessionCapture::new();
        capture.ingest_body("u", "text/html", "<html>ad_archive_id=1234567890123</html>");
        assert_eq!(capture.responses_seen, 1);
        assert_eq!(capture.responses_parsed, 0);
        assert_eq!(capture.embedded_ids(), &["1234567890123".to_string()]);
        assert_eq!(capture.network_id_count(), 1);
    }

    #[test]
    fn test_partially_parsed_body_mines_failed_lines() {
        let mut capture = SessionCapture::new();
        capture.ingest_body("u", "text/html", "{\"a\":1}\nnot json ad_archive_id=1234567890123");
        assert_eq!(capture.responses_parsed, 1);
        assert!(capture.parse_failure_logged);
        assert_eq!(capture.embedded_ids(), &["1234567890123".to_string()]);

        capture.ingest_body("u", "text/html", &body("5555555555", "ok"));
        assert_eq!(capture.network_id_count(), 2);
    }

    #[test]
    fn test_dom_fallback_only_when_network_empty() {
        let dom_ids = vec!["9999999999".to_string()];
        let empty = SessionCapture::new();
        let ads = assemble(&default_sources(), &Evidence { capture: &empty, dom_ids: &dom_ids });
        assert_eq!(ads.len(), 1);
        assert!(ads[0].creative_preview_url.is_empty());
        assert!(ads[0].landing_link.is_none());

        let mut capture = SessionCapture::new();
        capture.ingest_body("u", "application/json", &body("1234567890", "hi"));
        let ads = assemble(&default_sources(), &Evidence { capture: &capture, dom_ids: &dom_ids });
        let ids: Vec<_> = ads.iter().map(|a| a.archive_id.as_str()).collect();
        assert_eq!(ids, vec!["1234567890"]);
    }

    #[test]
    fn test_embedded_stub_does_not_shadow_full_record() {
        let mut capture = SessionCapture::new();
        capture.ingest_body("u", "application/json", &body("1234567890", "full"));
        capture.ingest_body("u", "text/html", "ad_archive_id=1234567890 ad_archive_id=5555555555");
        let ads = assemble(&default_sources(), &Evidence { capture: &capture, dom_ids: &[] });
        assert_eq!(ads.len(), 2);
        assert_eq!(ads[0].primary_text, "full");
        assert!(ads[1].is_stub());
        assert_eq!(capture.network_id_count(), 2);
    }

    #[test]
    fn test_shape_filters_to_durable_when_dates_known() {
        let ads = vec![
            dated("1", Some("2024-05-20")),
            dated("2", Some("2024-01-01")),
            dated("3", None),
        ];
        let shaped = shape_results(ads, now(), 30);
        let ids: Vec<_> = shaped.iter().map(|a| a.archive_id.as_str()).collect();
        assert_eq!(ids, vec!["2"]);
    }

    #[test]
    fn test_epoch_start_short_of_thirty_elapsed_days_is_dropped() {
        let mut capture = SessionCapture::new();
        capture.ingest_body(
            "u",
            "application/json",
            r#"{"results":[{"ad_archive_id":"1111111111","start_date":1714690800},{"ad_archive_id":"2222222222","start_date":1711929600}]}"#,
        );
        let ads = assemble(&default_sources(), &Evidence { capture: &capture, dom_ids: &[] });
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 1, 0, 0).unwrap();
        let shaped = shape_results(ads, now, 30);
        let ids: Vec<_> = shaped.iter().map(|a| a.archive_id.as_str()).collect();
        assert_eq!(ids, vec!["2222222222"]);
    }

    #[test]
    fn test_shape_passes_through_without_dates_and_caps() {
        let ads: Vec<_> = (0..5).map(|i| dated(&format!("{i}"), None)).collect();
        let shaped = shape_results(ads, now(), 3);
        assert_eq!(shaped.len(), 3);
        assert_eq!(shaped[0].archive_id, "0");
    }
}
