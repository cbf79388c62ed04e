//! Source adapter contracts plus the two alert sources: the CAS postback portal
//! and the GOV.UK listing.

use std::sync::Arc;
use std::time::Duration;

use alertwatch_core::{AlertDraft, SourceKind};
use alertwatch_storage::{BackoffPolicy, FetchError, PageArchive, Url};
use async_trait::async_trait;
use chrono::Utc;
use scraper::{ElementRef, Selector};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

mod cas;
pub mod detail;
mod govuk;
pub mod navigator;
#[cfg(test)]
mod test_support;

pub use cas::{alert_type_for_originator, CasPortalAdapter};
pub use detail::{dmrc_reference, parse_cas_detail, parse_govuk_detail, DetailPage};
pub use govuk::{GovUkAdapter, GovUkSite};
pub use navigator::{
    parse_postback_href, HiddenTokens, PostbackAction, PostbackNavigator, PostbackPager,
    PostbackSite, RawCell, RawRow, SearchParameters, SessionState, RECOGNIZED_SEARCH_OPTIONS,
};

pub const CRATE_NAME: &str = "alertwatch-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    /// Transient transport failure, already retried by the HTTP client.
    #[error("network failure: {0}")]
    Network(#[from] FetchError),
    /// The page no longer has the shape the extractor expects.
    #[error("structural failure at {url}: {reason}")]
    Structural { url: String, reason: String },
    #[error("invalid search parameters: {0}")]
    InvalidSearch(String),
    #[error("run deadline reached before the next request")]
    DeadlineExceeded,
}

impl AdapterError {
    pub fn is_structural(&self) -> bool {
        matches!(self, AdapterError::Structural { .. })
    }
}

/// Whole-run cutoff. Checked before a request is started, never while one is in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunDeadline {
    at: Option<Instant>,
}

impl RunDeadline {
    pub fn unbounded() -> Self {
        Self { at: None }
    }

    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Some(Instant::now() + timeout),
        }
    }

    pub fn is_past(&self) -> bool {
        self.at.map(|at| Instant::now() >= at).unwrap_or(false)
    }

    pub fn check(&self) -> Result<(), AdapterError> {
        if self.is_past() {
            Err(AdapterError::DeadlineExceeded)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub deadline: RunDeadline,
    pub archive: Option<Arc<PageArchive>>,
}

impl AdapterContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            deadline: RunDeadline::unbounded(),
            archive: None,
        }
    }

    pub fn with_deadline(mut self, deadline: RunDeadline) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_archive(mut self, archive: Arc<PageArchive>) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Archive failures are logged; they never fail a page.
    pub(crate) async fn archive_page(&self, source_id: &str, label: &str, body: &[u8]) {
        let Some(archive) = &self.archive else {
            return;
        };
        if let Err(err) = archive.store_page(Utc::now(), source_id, label, body).await {
            warn!(run_id = %self.run_id, source_id, label, error = %err, "failed to archive raw page");
        }
    }
}

/// Pagination limits shared by both adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagingPolicy {
    /// Minimum gap between two consecutive requests of one adapter.
    pub request_delay: Duration,
    /// Hard ceiling on pages read per run, whatever the site claims.
    pub max_pages: u32,
    pub backoff: BackoffPolicy,
    /// Also read each alert's own page. Those requests share the same pacing.
    pub fetch_details: bool,
}

impl Default for PagingPolicy {
    fn default() -> Self {
        Self {
            request_delay: Duration::from_secs(2),
            max_pages: 200,
            backoff: BackoffPolicy::default(),
            fetch_details: false,
        }
    }
}

#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    last_request: Option<Instant>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: None,
        }
    }

    /// Blocks until `min_interval` has passed since the previous turn.
    pub async fn wait_turn(&mut self) {
        if let Some(last) = self.last_request {
            let ready_at = last + self.min_interval;
            if Instant::now() < ready_at {
                debug!(wait_ms = (ready_at - Instant::now()).as_millis() as u64, "pacing request");
                tokio::time::sleep_until(ready_at).await;
            }
        }
        self.last_request = Some(Instant::now());
    }
}

/// Produces raw field sets lazily, one listing page per batch.
#[async_trait]
pub trait SourceAdapter: Send {
    fn source(&self) -> SourceKind;

    /// `Ok(None)` once the source is exhausted or has failed; it stays that way.
    async fn next_batch(&mut self) -> Result<Option<Vec<AlertDraft>>, AdapterError>;
}

pub(crate) fn selector(css: &str) -> Result<Selector, String> {
    Selector::parse(css).map_err(|e| format!("invalid selector {css:?}: {e}"))
}

pub(crate) fn text_or_none(value: impl AsRef<str>) -> Option<String> {
    let collapsed = value.as_ref().split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

pub(crate) fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Absolute http(s) form of `href` relative to `base`.
pub(crate) fn resolve_url(base: &str, href: &str) -> Option<String> {
    let base = Url::parse(base).ok()?;
    let joined = base.join(href.trim()).ok()?;
    match joined.scheme() {
        "http" | "https" => Some(joined.into()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_links_resolve_against_the_listing() {
        assert_eq!(
            resolve_url(
                "https://www.cas.mhra.gov.uk/SearchAlerts.aspx",
                "ViewandAcknowledgment/ViewAlert.aspx?AlertID=103"
            )
            .as_deref(),
            Some("https://www.cas.mhra.gov.uk/ViewandAcknowledgment/ViewAlert.aspx?AlertID=103")
        );
        assert_eq!(
            resolve_url("https://www.gov.uk/drug-device-alerts?page=2", "/drug-device-alerts/pump").as_deref(),
            Some("https://www.gov.uk/drug-device-alerts/pump")
        );
        assert_eq!(
            resolve_url("https://www.gov.uk/", "javascript:__doPostBack('x','')"),
            None
        );
    }

    #[test]
    fn text_is_collapsed_and_blank_becomes_none() {
        assert_eq!(text_or_none("  Active \n "), Some("Active".to_string()));
        assert_eq!(text_or_none(" \t "), None);
    }

    #[tokio::test(start_paused = true)]
    async fn pacer_spaces_consecutive_turns() {
        let mut pacer = RequestPacer::new(Duration::from_secs(2));
        let start = Instant::now();
        pacer.wait_turn().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        pacer.wait_turn().await;
        pacer.wait_turn().await;
        assert!(start.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_trips_once_elapsed() {
        let deadline = RunDeadline::after(Duration::from_secs(5));
        assert!(deadline.check().is_ok());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(matches!(deadline.check(), Err(AdapterError::DeadlineExceeded)));
        assert!(RunDeadline::unbounded().check().is_ok());
    }
}
