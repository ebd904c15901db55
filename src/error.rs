//! Typed errors for the seams where callers branch on the failure.
//!
//! Everything else flows through `anyhow::Result`.

use thiserror::Error;

/// A competitor identifier that could not be turned into a canonical URL.
///
/// Display always starts with `BAD URL:` so the reason can be logged as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("BAD URL: {0}")]
pub struct BadCompetitorUrl(pub String);

impl BadCompetitorUrl {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }

    /// Full reason string, including the `BAD URL:` prefix.
    pub fn reason(&self) -> String {
        self.to_string()
    }
}

/// What went wrong when a browser operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// A navigation replaced the document while we were talking to it.
    NavigationInterrupted,
    /// The JS execution context was destroyed or could not be found.
    ContextLost,
    /// The tab, target or browser went away.
    TargetClosed,
    Other,
}

impl FaultKind {
    const NAVIGATION_MARKERS: &'static [&'static str] = &[
        "navigation interrupted",
        "interrupted by another navigation",
        "net::err_aborted",
        "inspected target navigated",
        "navigating frame was detached",
    ];

    const CONTEXT_MARKERS: &'static [&'static str] = &[
        "execution context was destroyed",
        "cannot find context with specified id",
        "cannot find default execution context",
        "context was destroyed",
    ];

    const TARGET_MARKERS: &'static [&'static str] = &[
        "target closed",
        "no target with given id",
        "session with given id not found",
        "has been closed",
        "connection is closed",
    ];

    /// Classify a browser error message. Called once, at the failing call site.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if Self::CONTEXT_MARKERS.iter().any(|m| lower.contains(m)) {
            FaultKind::ContextLost
        } else if Self::NAVIGATION_MARKERS.iter().any(|m| lower.contains(m)) {
            FaultKind::NavigationInterrupted
        } else if Self::TARGET_MARKERS.iter().any(|m| lower.contains(m)) {
            FaultKind::TargetClosed
        } else {
            FaultKind::Other
        }
    }

    pub fn is_transient(self) -> bool {
        !matches!(self, FaultKind::Other)
    }
}

/// A failed browser operation, classified at the point of failure.
#[derive(Debug, Error)]
#[error("{op} failed ({kind:?}): {message}")]
pub struct SessionFault {
    pub op: &'static str,
    pub kind: FaultKind,
    pub message: String,
}

impl SessionFault {
    pub fn new(op: &'static str, kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            op,
            kind,
            message: message.into(),
        }
    }

    /// Wrap an error coming back from headless_chrome.
    pub fn from_browser(op: &'static str, err: anyhow::Error) -> Self {
        let message = format!("{:#}", err);
        Self {
            op,
            kind: FaultKind::classify(&message),
            message,
        }
    }
}

/// Failures posting a batch to the delivery webhook.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("webhook returned status {status}: {preview}")]
    Status { status: u16, preview: String },

    #[error("webhook returned non-JSON (status {status}): {preview}")]
    NonJson { status: u16, preview: String },

    #[error("webhook misconfigured: {0}")]
    Config(String),
}

impl DeliveryError {
    /// Body preview carried by the error, if any.
    pub fn preview(&self) -> Option<&str> {
        match self {
            DeliveryError::Status { preview, .. } | DeliveryError::NonJson { preview, .. } => {
                Some(preview)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_url_prefix() {
        let err = BadCompetitorUrl::new("empty input");
        assert_eq!(err.reason(), "BAD URL: empty input");
    }

    #[test]
    fn test_classify_transient_faults() {
        assert_eq!(
            FaultKind::classify("Execution context was destroyed, most likely because of a navigation"),
            FaultKind::ContextLost
        );
        assert_eq!(
            FaultKind::classify("Method call error -32000: Cannot find context with specified id"),
            FaultKind::ContextLost
        );
        assert_eq!(
            FaultKind::classify("Inspected target navigated or closed"),
            FaultKind::NavigationInterrupted
        );
        assert_eq!(FaultKind::classify("Target closed"), FaultKind::TargetClosed);
    }

    #[test]
    fn test_other_faults_are_not_transient() {
        let kind = FaultKind::classify("Unable to make method calls because underlying connection is broken: timeout");
        assert_eq!(kind, FaultKind::Other);
        assert!(!kind.is_transient());
        assert!(FaultKind::TargetClosed.is_transient());
    }
}
