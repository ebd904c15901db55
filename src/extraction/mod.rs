//! Extraction engine: one browser session per competitor.
//!
//! Stages run in a fixed order:
//! Navigate -> ConsentCheck -> LoginWallCheck -> AwaitAdSignal ->
//! ScrollExtract -> (FallbackReload) -> DomFallback -> Finalize.
//!
//! Intercepted data responses are the primary source; the DOM scan is a
//! diagnostic and the last-resort source of id-only stubs. The browser is
//! torn down when the session value drops, on every exit path.

pub mod page;
pub mod payload;
pub mod sources;

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use headless_chrome::Tab;
use reqwest::Url;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::ads::RawAdRecord;
use crate::browser::{self, with_retries, BrowserSession};
use crate::competitor::{has_library_target, ResolvedCompetitor};
use crate::error::SessionFault;
use sources::{Evidence, SessionCapture};

const CAPTURE_HANDLER: &str = "ad-library-capture";
const MAX_LOGIN_ROUNDS: u32 = 3;
const AD_SIGNAL_TIMEOUT: Duration = Duration::from_secs(15);
const SCROLL_PAUSE: Duration = Duration::from_millis(1200);

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub headful: bool,
    pub max_ads: usize,
    pub pause_on_login_wall: bool,
    pub max_scrolls: usize,
    pub now: DateTime<Utc>,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            headful: false,
            max_ads: 30,
            pause_on_login_wall: false,
            max_scrolls: 6,
            now: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub responses_seen: usize,
    pub responses_parsed: usize,
    pub network_ids: usize,
    pub dom_ids: usize,
    pub dom_links: usize,
    pub consent_accepted: bool,
    pub login_wall_encountered: bool,
    pub login_wall_resolved: bool,
    pub reloaded: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    pub ads: Vec<RawAdRecord>,
    pub final_url: String,
    pub consent_accepted: bool,
    pub login_wall_encountered: bool,
    pub diagnostics: Diagnostics,
    /// Set when the session was skipped before any browser work.
    pub skipped_reason: Option<String>,
}

impl ExtractionResult {
    fn skipped(url: &str, reason: &str) -> Self {
        Self {
            ads: Vec::new(),
            final_url: url.to_string(),
            consent_accepted: false,
            login_wall_encountered: false,
            diagnostics: Diagnostics::default(),
            skipped_reason: Some(reason.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Navigate,
    ConsentCheck,
    LoginWallCheck,
    AwaitAdSignal,
    ScrollExtract,
    FallbackReload,
    DomFallback,
    Finalize,
}

fn enter(stage: Stage, url: &str) {
    debug!("[{}] stage {:?}", url, stage);
}

/// Install the response listener. Must run before the first navigation.
fn attach_capture(tab: &Arc<Tab>, capture: Arc<Mutex<SessionCapture>>) -> Result<()> {
    tab.register_response_handling(
        CAPTURE_HANDLER,
        Box::new(move |event, fetch_body| {
            let response = &event.response;
            if !payload::is_data_endpoint(&response.url) {
                return;
            }

            // Body is not always retrievable the instant the event fires
            std::thread::sleep(Duration::from_millis(100));
            let body = match fetch_body() {
                Ok(body) if !body.base_64_encoded => body.body,
                Ok(_) => String::new(),
                Err(e) => {
                    debug!("could not read data response body: {}", e);
                    String::new()
                }
            };

            if let Ok(mut capture) = capture.lock() {
                capture.ingest_body(&response.url, &response.mime_type, &body);
            }
        }),
    )?;
    Ok(())
}

/// Block until the operator presses Enter.
async fn wait_for_operator() -> Result<()> {
    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    Ok(())
}

/// Run a blocking browser call on tokio's blocking pool.
async fn off_runtime<S, T, F>(target: &Arc<S>, op: F) -> Result<T>
where
    S: Send + Sync + 'static,
    T: Send + 'static,
    F: FnOnce(&S) -> Result<T> + Send + 'static,
{
    let target = Arc::clone(target);
    tokio::task::spawn_blocking(move || op(&target)).await?
}

async fn current_content(tab: &Tab) -> Result<String, SessionFault> {
    with_retries("get_content", || browser::page_content(tab)).await
}

async fn scroll_pass(tab: &Tab, scrolls: usize, capture: &Arc<Mutex<SessionCapture>>) -> Result<()> {
    for i in 0..scrolls {
        with_retries("scroll", || browser::scroll_by_viewport(tab, 0.9)).await?;
        sleep(SCROLL_PAUSE).await;
        let seen = capture.lock().map(|c| c.network_id_count()).unwrap_or(0);
        debug!("scroll {}/{}: {} network ids so far", i + 1, scrolls, seen);
    }
    Ok(())
}

async fn dom_scan(tab: &Tab, base: &Url) -> Result<(Vec<String>, Vec<String>)> {
    let html = current_content(tab).await?;
    let links = page::collect_archive_links(&html, base);
    let ids = page::archive_ids_from_links(&links);
    Ok((links, ids))
}

/// Handle the login wall. Returns (encountered, resolved).
///
/// `walled` reports whether the page shows the wall right now; `operator`
/// resolves once the operator has acted. Only an interactive session pauses,
/// for at most `MAX_LOGIN_ROUNDS` rounds.
async fn check_login_wall<C, CF, W, WF>(interactive: bool, mut walled: C, mut operator: W) -> Result<(bool, bool)>
where
    C: FnMut() -> CF,
    CF: Future<Output = Result<bool>>,
    W: FnMut() -> WF,
    WF: Future<Output = Result<()>>,
{
    if !walled().await? {
        return Ok((false, false));
    }

    if !interactive {
        warn!("Login wall detected; continuing without pausing");
        return Ok((true, false));
    }

    for round in 1..=MAX_LOGIN_ROUNDS {
        warn!(
            "Login wall detected (round {}/{}). Log in in the browser window, then press Enter.",
            round, MAX_LOGIN_ROUNDS
        );
        operator().await?;
        sleep(Duration::from_secs(2)).await;

        if !walled().await? {
            info!("Login wall cleared after {} round(s)", round);
            return Ok((true, true));
        }
    }

    warn!("Login wall still present after {} rounds; continuing", MAX_LOGIN_ROUNDS);
    Ok((true, false))
}

/// Run one extraction session for a resolved competitor.
pub async fn extract(competitor: &ResolvedCompetitor, options: &ExtractOptions) -> Result<ExtractionResult> {
    let url = competitor.canonical_url.as_str();
    if !has_library_target(url) {
        warn!("Skipping {}: no page id or search term", url);
        return Ok(ExtractionResult::skipped(url, "bad_final_url"));
    }

    let session = BrowserSession::launch(options.headful)?;
    let tab = session.tab.clone();
    let capture = Arc::new(Mutex::new(SessionCapture::new()));
    attach_capture(&tab, capture.clone())?;

    enter(Stage::Navigate, url);
    with_retries("navigate", || {
        tab.navigate_to(url)
            .map(|_| ())
            .map_err(|e| SessionFault::from_browser("navigate", e))
    })
    .await?;
    if let Err(e) = off_runtime(&tab, |tab: &Tab| tab.wait_until_navigated().map(|_| ())).await {
        warn!("[{}] navigation did not settle: {:#}", url, e);
    }
    let final_url = tab.get_url();
    sleep(Duration::from_millis(1500)).await;

    enter(Stage::ConsentCheck, url);
    let consent_accepted = match with_retries("consent", || page::accept_consent(&tab)).await {
        Ok(Some(label)) => {
            info!("Consent accepted via \"{}\"", label);
            true
        }
        Ok(None) => false,
        Err(e) => {
            warn!("Consent check failed: {}", e);
            false
        }
    };
    sleep(Duration::from_millis(if consent_accepted { 5000 } else { 3000 })).await;

    enter(Stage::LoginWallCheck, url);
    let page_tab: &Tab = &tab;
    let (login_wall_encountered, login_wall_resolved) = check_login_wall(
        options.pause_on_login_wall && session.headful,
        move || async move { anyhow::Ok(page::looks_like_login_wall(&current_content(page_tab).await?)) },
        wait_for_operator,
    )
    .await?;

    enter(Stage::AwaitAdSignal, url);
    let ad_signal = off_runtime(&tab, |tab: &Tab| {
        tab.wait_for_element_with_custom_timeout(page::AD_LINK_SELECTOR, AD_SIGNAL_TIMEOUT)
            .map(|_| ())
    })
    .await;
    if let Err(e) = ad_signal {
        debug!("No ad link appeared within {:?}: {:#}", AD_SIGNAL_TIMEOUT, e);
    }

    enter(Stage::ScrollExtract, url);
    scroll_pass(&tab, options.max_scrolls, &capture).await?;

    let base = Url::parse(&final_url).or_else(|_| Url::parse(url))?;
    enter(Stage::DomFallback, url);
    let (mut dom_links, mut dom_ids) = dom_scan(&tab, &base).await?;

    let network_ids = capture.lock().map(|c| c.network_id_count()).unwrap_or(0);
    let mut reloaded = false;
    if network_ids == 0 && dom_ids.is_empty() {
        enter(Stage::FallbackReload, url);
        info!("No ads after first pass, reloading {}", url);
        with_retries("reload", || {
            tab.reload(false, None)
                .map(|_| ())
                .map_err(|e| SessionFault::from_browser("reload", e))
        })
        .await?;
        reloaded = true;
        sleep(Duration::from_secs(3)).await;
        scroll_pass(&tab, options.max_scrolls.div_ceil(2), &capture).await?;

        enter(Stage::DomFallback, url);
        (dom_links, dom_ids) = dom_scan(&tab, &base).await?;
    }

    enter(Stage::Finalize, url);
    if let Err(e) = tab.deregister_response_handling(CAPTURE_HANDLER) {
        debug!("deregistering capture handler failed: {}", e);
    }

    let capture = capture
        .lock()
        .map_err(|_| anyhow::anyhow!("capture state poisoned"))?;
    let evidence = Evidence {
        capture: &capture,
        dom_ids: &dom_ids,
    };
    let assembled = sources::assemble(&sources::default_sources(), &evidence);
    let ads = sources::shape_results(assembled, options.now, options.max_ads);

    let diagnostics = Diagnostics {
        responses_seen: capture.responses_seen,
        responses_parsed: capture.responses_parsed,
        network_ids: capture.network_id_count(),
        dom_ids: dom_ids.len(),
        dom_links: dom_links.len(),
        consent_accepted,
        login_wall_encountered,
        login_wall_resolved,
        reloaded,
    };

    info!(
        "[{}] summary launch={:?} responsesSeen={} parsed={} networkIds={} domIds={} consentAccepted={} loginWall={} ads={}",
        url,
        session.strategy,
        diagnostics.responses_seen,
        diagnostics.responses_parsed,
        diagnostics.network_ids,
        diagnostics.dom_ids,
        if consent_accepted { "yes" } else { "no" },
        if login_wall_encountered { "yes" } else { "no" },
        ads.len()
    );

    Ok(ExtractionResult {
        ads,
        final_url,
        consent_accepted,
        login_wall_encountered,
        diagnostics,
        skipped_reason: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::competitor::ResolutionKind;
    use std::cell::Cell;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_rejected_url_short_circuits_before_browser() {
        let competitor = ResolvedCompetitor {
            raw: "https://www.facebook.com/ads/library/?id=1234567890".to_string(),
            canonical_url: "https://www.facebook.com/ads/library/?id=1234567890".to_string(),
            page_id: None,
            reason: ResolutionKind::AdLibraryUrl,
        };
        let result = extract(&competitor, &ExtractOptions::default()).await.unwrap();
        assert!(result.ads.is_empty());
        assert_eq!(result.skipped_reason.as_deref(), Some("bad_final_url"));
        assert_eq!(result.diagnostics.responses_seen, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_wall_pauses_at_most_three_rounds() {
        let waits = Cell::new(0);
        let result = check_login_wall(
            true,
            || async { anyhow::Ok(true) },
            || {
                waits.set(waits.get() + 1);
                async { anyhow::Ok(()) }
            },
        )
        .await
        .unwrap();
        assert_eq!(result, (true, false));
        assert_eq!(waits.get(), MAX_LOGIN_ROUNDS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_wall_cleared_on_second_round() {
        let checks = Cell::new(0);
        let waits = Cell::new(0);
        let result = check_login_wall(
            true,
            || {
                checks.set(checks.get() + 1);
                let walled = checks.get() <= 2;
                async move { anyhow::Ok(walled) }
            },
            || {
                waits.set(waits.get() + 1);
                async { anyhow::Ok(()) }
            },
        )
        .await
        .unwrap();
        assert_eq!(result, (true, true));
        assert_eq!(waits.get(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_wall_without_interactive_session_never_waits() {
        let waits = Cell::new(0);
        let operator = || {
            waits.set(waits.get() + 1);
            async { anyhow::Ok(()) }
        };
        let result = check_login_wall(false, || async { anyhow::Ok(true) }, operator).await.unwrap();
        assert_eq!(result, (true, false));
        assert_eq!(waits.get(), 0);

        let result = check_login_wall(true, || async { anyhow::Ok(false) }, || async { anyhow::Ok(()) }).await.unwrap();
        assert_eq!(result, (false, false));
    }

    #[tokio::test]
    async fn test_blocking_call_leaves_runtime_free() {
        let flag = Arc::new(AtomicBool::new(false));
        let setter = flag.clone();
        tokio::spawn(async move { setter.store(true, Ordering::SeqCst) });

        let seen = off_runtime(&flag, |flag: &AtomicBool| {
            std::thread::sleep(Duration::from_millis(200));
            Ok(flag.load(Ordering::SeqCst))
        })
        .await
        .unwrap();
        assert!(seen);

        let failed = off_runtime(&flag, |_: &AtomicBool| -> Result<()> { anyhow::bail!("timed out") }).await;
        assert!(failed.is_err());
    }
}
