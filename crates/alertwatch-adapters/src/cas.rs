use std::sync::Arc;

use alertwatch_core::{AlertDraft, SourceKind};
use alertwatch_storage::PageTransport;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::detail::parse_cas_detail;
use crate::navigator::{PostbackNavigator, PostbackPager, PostbackSite, RawRow, SearchParameters};
use crate::{resolve_url, text_or_none, AdapterContext, AdapterError, PagingPolicy, SourceAdapter};

const COL_REFERENCE: usize = 0;
const COL_TITLE: usize = 1;
const COL_ORIGINATOR: usize = 2;
const COL_ISSUE_DATE: usize = 3;
const COL_STATUS: usize = 4;

/// The CAS grid has no type column; the type follows from who issued the alert.
pub fn alert_type_for_originator(originator: &str) -> &'static str {
    let lowered = originator.to_ascii_lowercase();
    if lowered.contains("national patient safety alert") {
        "National Patient Safety Alert"
    } else if lowered.contains("cmo messaging") {
        "CMO Messaging"
    } else {
        "Unknown"
    }
}

pub struct CasPortalAdapter {
    pager: PostbackPager,
    listing_url: String,
    fetch_details: bool,
}

impl CasPortalAdapter {
    pub fn new(
        transport: Arc<dyn PageTransport>,
        site: PostbackSite,
        params: SearchParameters,
        ctx: AdapterContext,
        policy: &PagingPolicy,
    ) -> Self {
        let listing_url = site.search_url.clone();
        let navigator = PostbackNavigator::new(transport, site, ctx, policy);
        Self {
            pager: PostbackPager::new(navigator, params, policy.max_pages),
            listing_url,
            fetch_details: policy.fetch_details,
        }
    }

    async fn enrich(&mut self, draft: &mut AlertDraft) {
        let Some(url) = draft.url.clone() else {
            return;
        };
        let Some(body) = self.pager.navigator_mut().fetch_detail(&url).await else {
            return;
        };
        match parse_cas_detail(&body, &url) {
            Ok(page) => {
                page.apply_to(draft);
                draft.alert_type = draft
                    .originator
                    .as_deref()
                    .map(|originator| alert_type_for_originator(originator).to_string());
            }
            Err(reason) => warn!(%url, %reason, "unreadable cas detail page"),
        }
    }

    fn row_to_draft(&self, row: &RawRow, fetched_at: DateTime<Utc>) -> AlertDraft {
        let mut draft = AlertDraft::new(SourceKind::CasPortal, self.listing_url.clone(), fetched_at);
        draft.reference = row.text(COL_REFERENCE).and_then(text_or_none);
        draft.title = row.text(COL_TITLE).and_then(text_or_none);
        draft.originator = row.text(COL_ORIGINATOR).and_then(text_or_none);
        draft.issue_date = row.text(COL_ISSUE_DATE).and_then(text_or_none);
        draft.status = row.text(COL_STATUS).and_then(text_or_none);
        draft.alert_type = draft
            .originator
            .as_deref()
            .map(|originator| alert_type_for_originator(originator).to_string());
        draft.url = row
            .href(COL_TITLE)
            .and_then(|href| resolve_url(&self.listing_url, href));
        draft
    }
}

#[async_trait]
impl SourceAdapter for CasPortalAdapter {
    fn source(&self) -> SourceKind {
        SourceKind::CasPortal
    }

    async fn next_batch(&mut self) -> Result<Option<Vec<AlertDraft>>, AdapterError> {
        let Some(rows) = self.pager.next_page().await? else {
            return Ok(None);
        };
        let fetched_at = Utc::now();
        let mut drafts = rows
            .iter()
            .map(|row| self.row_to_draft(row, fetched_at))
            .collect::<Vec<_>>();
        if self.fetch_details {
            for draft in &mut drafts {
                self.enrich(draft).await;
            }
        }
        debug!(page = self.pager.pages_read(), drafts = drafts.len(), "cas page extracted");
        Ok(Some(drafts))
    }
}
