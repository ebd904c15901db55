//! Browser launch and the retry wrapper shared by every browser-driven stage.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use headless_chrome::{Browser, LaunchOptions, Tab};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::{FaultKind, SessionFault};
use crate::stealth;

pub const MAX_ATTEMPTS: u32 = 3;

/// Upper bound on any single browser operation.
pub const OPERATION_TIMEOUT: Duration = Duration::from_secs(45);

const WINDOW_SIZE: (u32, u32) = (1365, 900);

/// Ways of getting a Chromium process up, tried in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStrategy {
    /// `CHROME_EXECUTABLE` or a well-known system install.
    PreferredChannel,
    /// Whatever headless_chrome finds on its own.
    BundledRuntime,
    /// Last resort: forced headless, no sandbox, no GPU.
    HeadlessNoSandbox,
}

impl LaunchStrategy {
    pub const ORDER: [LaunchStrategy; 3] = [
        LaunchStrategy::PreferredChannel,
        LaunchStrategy::BundledRuntime,
        LaunchStrategy::HeadlessNoSandbox,
    ];

    /// Whether a browser launched this way can show a window.
    pub fn can_show_window(self) -> bool {
        self != LaunchStrategy::HeadlessNoSandbox
    }

    fn launch(self, headful: bool, user_agent: &str) -> Result<Browser> {
        let ua_arg = format!("--user-agent={}", user_agent);
        let mut args = vec![
            OsStr::new("--disable-blink-features=AutomationControlled"),
            OsStr::new("--disable-dev-shm-usage"),
            OsStr::new("--disable-infobars"),
            OsStr::new("--lang=en-US"),
            OsStr::new(&ua_arg),
        ];

        let mut options = LaunchOptions {
            headless: !headful,
            window_size: Some(WINDOW_SIZE),
            idle_browser_timeout: Duration::from_secs(300),
            ..Default::default()
        };

        match self {
            LaunchStrategy::PreferredChannel => {
                let path = find_preferred_executable()
                    .ok_or_else(|| anyhow!("no preferred Chrome executable found"))?;
                options.path = Some(path);
                options.sandbox = false;
            }
            LaunchStrategy::BundledRuntime => {
                options.sandbox = false;
            }
            LaunchStrategy::HeadlessNoSandbox => {
                options.headless = true;
                options.sandbox = false;
                args.push(OsStr::new("--no-sandbox"));
                args.push(OsStr::new("--disable-gpu"));
            }
        }
        options.args = args;

        Browser::new(options)
    }
}

/// Resolve the preferred browser binary: env override first, then known paths.
pub fn find_preferred_executable() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("CHROME_EXECUTABLE") {
        if Path::new(&p).exists() {
            return Some(PathBuf::from(p));
        }
    }

    let candidates: &[&str] = if cfg!(target_os = "macos") {
        &[
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
        ]
    } else if cfg!(target_os = "windows") {
        &[
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
        ]
    } else {
        &[
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/usr/local/bin/chromium",
        ]
    };

    candidates
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}

/// One browser process and its main tab. Dropping it kills the process.
pub struct BrowserSession {
    pub browser: Browser,
    pub tab: Arc<Tab>,
    pub strategy: LaunchStrategy,
    pub headful: bool,
}

impl BrowserSession {
    /// Try each launch strategy in order; first success wins.
    pub fn launch(headful: bool) -> Result<Self> {
        let user_agent = stealth::pick_user_agent();
        let mut failures = Vec::new();

        for strategy in LaunchStrategy::ORDER {
            match strategy.launch(headful, user_agent) {
                Ok(browser) => {
                    let tab = browser.new_tab()?;
                    tab.set_default_timeout(OPERATION_TIMEOUT);
                    stealth::harden_tab(&tab, user_agent)?;
                    info!("Browser launched via {:?} (headful: {})", strategy, headful);
                    let headful = headful && strategy.can_show_window();
                    return Ok(Self {
                        browser,
                        tab,
                        strategy,
                        headful,
                    });
                }
                Err(e) => {
                    warn!("Launch strategy {:?} failed: {:#}", strategy, e);
                    failures.push(format!("{:?}: {}", strategy, e));
                }
            }
        }

        Err(anyhow!(
            "all browser launch strategies failed: {}",
            failures.join("; ")
        ))
    }

    /// Open an auxiliary, hardened tab in the same browser.
    pub fn new_aux_tab(&self) -> Result<Arc<Tab>> {
        let tab = self.browser.new_tab()?;
        tab.set_default_timeout(OPERATION_TIMEOUT);
        stealth::harden_tab(&tab, stealth::pick_user_agent())?;
        Ok(tab)
    }
}

/// Whether a failure of the given kind on the given attempt (1-based) gets another try.
pub fn should_retry(kind: FaultKind, attempt: u32) -> bool {
    kind.is_transient() && attempt < MAX_ATTEMPTS
}

/// Run a browser operation, retrying only transient faults.
pub async fn with_retries<T, F>(op: &'static str, mut f: F) -> Result<T, SessionFault>
where
    F: FnMut() -> Result<T, SessionFault>,
{
    let mut attempt = 1;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(fault) if should_retry(fault.kind, attempt) => {
                warn!(
                    "{} attempt {}/{} hit {:?}, retrying",
                    op, attempt, MAX_ATTEMPTS, fault.kind
                );
                sleep(Duration::from_millis(400 * attempt as u64)).await;
                attempt += 1;
            }
            Err(fault) => return Err(fault),
        }
    }
}

// ============================================================================
// Page primitives (classified at the failing call)
// ============================================================================

/// Rendered HTML of the current document.
pub fn page_content(tab: &Tab) -> Result<String, SessionFault> {
    tab.get_content()
        .map_err(|e| SessionFault::from_browser("get_content", e))
}

/// Evaluate a script and return its JSON value (Null if none).
pub fn evaluate_json(tab: &Tab, script: &str, await_promise: bool) -> Result<serde_json::Value, SessionFault> {
    tab.evaluate(script, await_promise)
        .map(|remote| remote.value.unwrap_or(serde_json::Value::Null))
        .map_err(|e| SessionFault::from_browser("evaluate", e))
}

/// Scroll the viewport down by a fraction of its height.
pub fn scroll_by_viewport(tab: &Tab, fraction: f64) -> Result<(), SessionFault> {
    let script = format!(
        "window.scrollBy(0, Math.floor(window.innerHeight * {:.2}))",
        fraction
    );
    evaluate_json(tab, &script, false).map(|_| ())
}

/// Load a URL and wait for the navigation to settle.
pub fn navigate(tab: &Tab, url: &str) -> Result<(), SessionFault> {
    tab.navigate_to(url)
        .map_err(|e| SessionFault::from_browser("navigate", e))?;
    tab.wait_until_navigated()
        .map_err(|e| SessionFault::from_browser("wait_until_navigated", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_retry_policy_bounds() {
        assert!(should_retry(FaultKind::ContextLost, 1));
        assert!(should_retry(FaultKind::NavigationInterrupted, 2));
        assert!(!should_retry(FaultKind::TargetClosed, 3));
        assert!(!should_retry(FaultKind::Other, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retries_recovers_from_transient_faults() {
        let calls = Cell::new(0);
        let result = with_retries("scroll", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(SessionFault::new("scroll", FaultKind::ContextLost, "context destroyed"))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retries_gives_up_after_three_attempts() {
        let calls = Cell::new(0);
        let result: Result<(), _> = with_retries("evaluate", || {
            calls.set(calls.get() + 1);
            Err(SessionFault::new("evaluate", FaultKind::TargetClosed, "Target closed"))
        })
        .await;

        assert_eq!(result.unwrap_err().kind, FaultKind::TargetClosed);
        assert_eq!(calls.get(), MAX_ATTEMPTS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retries_does_not_retry_other_faults() {
        let calls = Cell::new(0);
        let result: Result<(), _> = with_retries("evaluate", || {
            calls.set(calls.get() + 1);
            Err(SessionFault::new("evaluate", FaultKind::Other, "SyntaxError"))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_launch_order_starts_with_preferred_channel() {
        assert_eq!(LaunchStrategy::ORDER[0], LaunchStrategy::PreferredChannel);
        assert_eq!(LaunchStrategy::ORDER[2], LaunchStrategy::HeadlessNoSandbox);
    }

    #[test]
    fn test_only_headless_fallback_hides_window() {
        assert!(LaunchStrategy::PreferredChannel.can_show_window());
        assert!(LaunchStrategy::BundledRuntime.can_show_window());
        assert!(!LaunchStrategy::HeadlessNoSandbox.can_show_window());
    }
}
