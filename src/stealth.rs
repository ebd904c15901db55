//! Browser hardening applied to every tab before it loads the ad library.
//!
//! The library serves a reduced page (or none at all) to obvious automation,
//! so each tab gets an init script that hides the usual headless tells and a
//! consistent en-US identity.

use std::sync::Arc;

use anyhow::Result;
use headless_chrome::protocol::cdp::Emulation::{SetLocaleOverride, SetTimezoneOverride};
use headless_chrome::protocol::cdp::Page::AddScriptToEvaluateOnNewDocument;
use headless_chrome::Tab;
use rand::seq::SliceRandom;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36";

const USER_AGENTS: &[&str] = &[
    DEFAULT_USER_AGENT,
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
];

pub const ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";

/// Pick a desktop Chrome user agent for this session.
pub fn pick_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(DEFAULT_USER_AGENT)
}

/// Script evaluated before any page script on every new document.
pub fn get_init_script() -> String {
    r#"
        // webdriver flag
        Object.defineProperty(navigator, 'webdriver', {
            get: () => undefined,
            configurable: true
        });

        Object.defineProperty(navigator, 'languages', {
            get: () => ['en-US', 'en'],
        });

        // Headless Chrome reports an empty plugin list
        Object.defineProperty(navigator, 'plugins', {
            get: () => {
                const pdf = {
                    0: { type: "application/x-google-chrome-pdf", suffixes: "pdf", description: "Portable Document Format" },
                    description: "Portable Document Format",
                    filename: "internal-pdf-viewer",
                    length: 1,
                    name: "Chrome PDF Plugin"
                };
                const p = [pdf, pdf, pdf];
                Object.setPrototypeOf(p, PluginArray.prototype);
                return p;
            }
        });

        if (!window.chrome) {
            window.chrome = {
                runtime: {
                    sendMessage: function() {},
                    onMessage: { addListener: function() {}, removeListener: function() {} }
                },
                csi: function() {},
                loadTimes: function() { return {}; }
            };
        }

        const originalQuery = window.navigator.permissions && window.navigator.permissions.query;
        if (originalQuery) {
            window.navigator.permissions.query = (parameters) => (
                parameters.name === 'notifications'
                    ? Promise.resolve({ state: Notification.permission })
                    : originalQuery(parameters)
            );
        }
    "#
    .to_string()
}

/// Install the init script plus user agent, locale and timezone overrides.
pub fn harden_tab(tab: &Arc<Tab>, user_agent: &str) -> Result<()> {
    tab.call_method(AddScriptToEvaluateOnNewDocument {
        source: get_init_script(),
        world_name: None,
        include_command_line_api: None,
        run_immediately: None,
    })?;

    tab.set_user_agent(user_agent, Some(ACCEPT_LANGUAGE), None)?;

    tab.call_method(SetLocaleOverride {
        locale: Some("en-US".to_string()),
    })?;

    // Timezone is cosmetic; some builds reject the override
    if let Err(e) = tab.call_method(SetTimezoneOverride {
        timezone_id: "America/New_York".to_string(),
    }) {
        tracing::debug!("timezone override rejected: {}", e);
    }

    Ok(())
}
