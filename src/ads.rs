use serde::{Deserialize, Serialize};

use crate::competitor::LIBRARY_BASE;

/// One ad as recovered from a single extraction session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RawAdRecord {
    /// Unique within one session.
    pub archive_id: String,
    /// Start-date phrasing or ISO date, when the source exposed one.
    pub started_running_on: Option<String>,
    pub primary_text: String,
    pub creative_preview_url: String,
    pub snapshot_url: String,
    pub landing_link: Option<String>,
}

impl RawAdRecord {
    /// Minimal record for an id seen without node data.
    pub fn stub(archive_id: &str) -> Self {
        Self {
            archive_id: archive_id.to_string(),
            snapshot_url: snapshot_url_for(archive_id),
            ..Default::default()
        }
    }

    pub fn is_stub(&self) -> bool {
        self.creative_preview_url.is_empty()
            && self.primary_text.is_empty()
            && self.started_running_on.is_none()
            && self.landing_link.as_deref().unwrap_or("").is_empty()
    }

    /// Public ad library link for this ad.
    pub fn ad_library_link(&self) -> String {
        snapshot_url_for(&self.archive_id)
    }
}

/// Static single-ad view for an archive id.
pub fn snapshot_url_for(archive_id: &str) -> String {
    format!("{}?id={}", LIBRARY_BASE, archive_id)
}
