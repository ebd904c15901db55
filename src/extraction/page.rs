//! DOM-side checks run against the live library page: consent banner,
//! login wall and ad-link scanning.

use std::collections::HashSet;

use headless_chrome::Tab;
use once_cell::sync::Lazy;
use reqwest::Url;
use scraper::{Html, Selector};

use super::payload::extract_ids_from_text;
use crate::browser::evaluate_json;
use crate::error::SessionFault;

/// Consent control labels, most specific first.
pub const CONSENT_LABELS: &[&str] = &[
    "Allow all cookies",
    "Accept all",
    "Allow essential and optional cookies",
    "Allow all",
    "Agree",
    "OK",
    "Accept",
];

const LOGIN_WALL_MARKERS: &[&str] = &[
    "you must log in",
    "log in to continue",
    "log into facebook",
    "log in to see",
    "login_form",
];

/// Links that encode an archive id.
pub const AD_LINK_SELECTOR: &str = "a[href*='ad_archive_id'], a[href*='/ads/library/?id=']";

static AD_LINKS: Lazy<Selector> = Lazy::new(|| Selector::parse(AD_LINK_SELECTOR).expect("valid selector"));

/// Script that clicks the first visible consent control, searching the main
/// document first and then every same-origin frame. Returns the matched
/// label (prefixed with the frame index for frames) or null.
pub fn consent_script(labels: &[&str]) -> String {
    let labels_json = serde_json::to_string(labels).unwrap_or_else(|_| "[]".to_string());
    format!(
        r#"
        (() => {{
            const labels = {labels}.map(l => l.toLowerCase());
            const matches = (text, label) => label.length <= 3 ? text === label : text.includes(label);
            const visible = (el) => el.offsetParent !== null || el.getClientRects().length > 0;

            const docs = [document];
            for (const frame of Array.from(document.querySelectorAll('iframe'))) {{
                try {{
                    if (frame.contentDocument) docs.push(frame.contentDocument);
                }} catch (e) {{}}
            }}

            for (let d = 0; d < docs.length; d++) {{
                const controls = Array.from(docs[d].querySelectorAll('button, [role="button"], input[type="submit"]'));
                for (const label of labels) {{
                    for (const el of controls) {{
                        const text = ((el.innerText || el.value || '') + '').replace(/\s+/g, ' ').trim().toLowerCase();
                        const aria = (el.getAttribute('aria-label') || '').trim().toLowerCase();
                        if ((matches(text, label) || matches(aria, label)) && visible(el)) {{
                            el.click();
                            return d === 0 ? label : ('frame' + d + ':' + label);
                        }}
                    }}
                }}
            }}
            return null;
        }})()
        "#,
        labels = labels_json
    )
}

/// Try to accept the consent banner. Returns the matched label, if any.
pub fn accept_consent(tab: &Tab) -> Result<Option<String>, SessionFault> {
    let value = evaluate_json(tab, &consent_script(CONSENT_LABELS), false)?;
    Ok(value.as_str().map(String::from))
}

/// Whether the rendered page asks the visitor to log in before showing ads.
pub fn looks_like_login_wall(html: &str) -> bool {
    let lower = html.to_lowercase();
    LOGIN_WALL_MARKERS.iter().any(|m| lower.contains(m))
}

/// Absolute, deduplicated ad links found in the DOM.
pub fn collect_archive_links(html: &str, base: &Url) -> Vec<String> {
    let document = Html::parse_document(html);
    let mut seen = HashSet::new();
    document
        .select(&AD_LINKS)
        .filter_map(|el| el.value().attr("href"))
        .filter_map(|href| base.join(href).ok())
        .map(|url| url.to_string())
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

/// Archive ids referenced by a set of links, first-seen order.
pub fn archive_ids_from_links(links: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    links
        .iter()
        .flat_map(|link| extract_ids_from_text(link))
        .filter(|id| seen.insert(id.clone()))
        .collect()
}
