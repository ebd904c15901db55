//! Discovered-page cache persisted between runs.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::discovery::DiscoveredPage;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryCache {
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pages: Vec<DiscoveredPage>,
}

impl DiscoveryCache {
    /// Read the cache file. A missing or unreadable file starts fresh.
    pub fn load(path: &Path) -> Self {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(_) => return Self::default(),
        };

        match serde_json::from_str::<DiscoveryCache>(&raw) {
            Ok(mut cache) => {
                cache.pages.retain(|p| !p.id.trim().is_empty());
                info!("Loaded {} cached page(s) from {}", cache.pages.len(), path.display());
                cache
            }
            Err(e) => {
                warn!("Failed to parse {}: {}. Starting fresh.", path.display(), e);
                Self::default()
            }
        }
    }

    /// Fold one discovery result into the cache.
    ///
    /// Known ids get their count summed, an empty name backfilled and
    /// `last_seen` refreshed. `first_seen` never moves.
    pub fn merge(&mut self, page: DiscoveredPage, now: DateTime<Utc>) {
        if page.id.trim().is_empty() {
            return;
        }

        match self.pages.iter_mut().find(|p| p.id == page.id) {
            Some(existing) => {
                existing.count += page.count;
                if existing.name.is_empty() && !page.name.is_empty() {
                    existing.name = page.name;
                }
                existing.first_seen.get_or_insert(now);
                existing.last_seen = Some(now);
            }
            None => self.pages.push(DiscoveredPage {
                first_seen: Some(now),
                last_seen: Some(now),
                ..page
            }),
        }
    }

    /// Top pages by count; equal counts keep cache order.
    pub fn ranked(&self, limit: usize) -> Vec<&DiscoveredPage> {
        let mut ranked: Vec<&DiscoveredPage> = self.pages.iter().collect();
        ranked.sort_by(|a, b| b.count.cmp(&a.count));
        ranked.truncate(limit);
        ranked
    }

    pub fn save(&mut self, path: &Path, now: DateTime<Utc>) -> Result<()> {
        self.updated_at = Some(now);
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}
