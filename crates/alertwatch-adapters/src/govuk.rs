use std::sync::Arc;

use alertwatch_core::{AlertDraft, SourceKind};
use alertwatch_storage::{PageTransport, Url};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scraper::Html;
use tracing::{debug, info, warn};

use crate::detail::{fetch_detail_body, parse_govuk_detail};
use crate::{
    element_text, resolve_url, selector, text_or_none, AdapterContext, AdapterError,
    PagingPolicy, RequestPacer, SourceAdapter,
};

const ORIGINATOR: &str = "MHRA/GOV.UK";
const STATUS: &str = "Issued";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GovUkSite {
    pub listing_url: String,
    pub list_selector: String,
    pub item_selector: String,
    pub title_selector: String,
    pub metadata_selector: String,
}

impl Default for GovUkSite {
    fn default() -> Self {
        Self {
            listing_url: "https://www.gov.uk/drug-device-alerts".to_string(),
            list_selector: ".gem-c-document-list".to_string(),
            item_selector: ".gem-c-document-list__item".to_string(),
            title_selector: ".gem-c-document-list__item-title a".to_string(),
            metadata_selector: ".gem-c-document-list__item-metadata dd".to_string(),
        }
    }
}

impl GovUkSite {
    pub fn with_listing_url(mut self, listing_url: impl Into<String>) -> Self {
        self.listing_url = listing_url.into();
        self
    }

    pub fn page_url(&self, page: u32) -> Result<String, AdapterError> {
        let mut url = Url::parse(&self.listing_url).map_err(|err| AdapterError::Structural {
            url: self.listing_url.clone(),
            reason: format!("listing url does not parse: {err}"),
        })?;
        url.query_pairs_mut().append_pair("page", &page.to_string());
        Ok(url.into())
    }

    /// Items of one listing page. `Ok(None)` when the page has no list at all.
    /// Metadata is positional: first value is the alert type, last the issue
    /// date, and a middle value, when present, the specialty.
    fn parse_listing(
        &self,
        html: &str,
        page_url: &str,
        fetched_at: DateTime<Utc>,
    ) -> Result<Option<Vec<AlertDraft>>, String> {
        let document = Html::parse_document(html);
        let list = selector(&self.list_selector)?;
        if document.select(&list).next().is_none() {
            return Ok(None);
        }
        let item_sel = selector(&self.item_selector)?;
        let title_sel = selector(&self.title_selector)?;
        let meta_sel = selector(&self.metadata_selector)?;

        let drafts = document
            .select(&item_sel)
            .map(|item| {
                let mut draft = AlertDraft::new(SourceKind::GovUk, page_url, fetched_at);
                let link = item.select(&title_sel).next();
                draft.title = link.map(element_text).and_then(text_or_none);
                draft.url = link
                    .and_then(|a| a.value().attr("href"))
                    .and_then(|href| resolve_url(page_url, href));

                let metadata = item
                    .select(&meta_sel)
                    .map(element_text)
                    .collect::<Vec<_>>();
                draft.alert_type = metadata.first().and_then(text_or_none);
                if metadata.len() > 1 {
                    draft.issue_date = metadata.last().and_then(text_or_none);
                }
                if metadata.len() > 2 {
                    draft.medical_specialty = metadata.get(1).and_then(text_or_none);
                }
                draft.originator = Some(ORIGINATOR.to_string());
                draft.status = Some(STATUS.to_string());
                draft
            })
            .collect();
        Ok(Some(drafts))
    }
}

/// Reads `?page=1`, `?page=2`, ... until a page yields no items.
pub struct GovUkAdapter {
    transport: Arc<dyn PageTransport>,
    site: GovUkSite,
    ctx: AdapterContext,
    pacer: RequestPacer,
    next_page: u32,
    max_pages: u32,
    fetch_details: bool,
    finished: bool,
}

impl GovUkAdapter {
    pub fn new(
        transport: Arc<dyn PageTransport>,
        site: GovUkSite,
        ctx: AdapterContext,
        policy: &PagingPolicy,
    ) -> Self {
        Self {
            transport,
            site,
            ctx,
            pacer: RequestPacer::new(policy.request_delay),
            next_page: 1,
            max_pages: policy.max_pages,
            fetch_details: policy.fetch_details,
            finished: false,
        }
    }

    async fn enrich(&mut self, draft: &mut AlertDraft) {
        let Some(url) = draft.url.clone() else {
            return;
        };
        let source_id = SourceKind::GovUk.as_str();
        let Some(body) =
            fetch_detail_body(&*self.transport, &mut self.pacer, &self.ctx, source_id, &url).await
        else {
            return;
        };
        match parse_govuk_detail(&body, &url) {
            Ok(page) => page.apply_to(draft),
            Err(reason) => warn!(%url, %reason, "unreadable gov.uk detail page"),
        }
    }

    async fn fetch_next(&mut self) -> Result<Option<Vec<AlertDraft>>, AdapterError> {
        let page = self.next_page;
        if page > self.max_pages {
            warn!(max_pages = self.max_pages, "page ceiling reached; stopping pagination");
            return Ok(None);
        }
        self.pacer.wait_turn().await;
        self.ctx.deadline.check()?;

        let url = self.site.page_url(page)?;
        let source_id = SourceKind::GovUk.as_str();
        let response = self.transport.get(source_id, &url).await?;
        self.ctx
            .archive_page(source_id, &format!("page-{page}"), &response.body)
            .await;

        let parsed = self
            .site
            .parse_listing(&response.text(), &url, Utc::now())
            .map_err(|reason| AdapterError::Structural {
                url: url.clone(),
                reason,
            })?;
        self.next_page += 1;

        match parsed {
            None if page == 1 => Err(AdapterError::Structural {
                url,
                reason: format!("document list `{}` not found", self.site.list_selector),
            }),
            None => {
                info!(page, "listing page has no document list; stopping");
                Ok(None)
            }
            Some(drafts) if drafts.is_empty() => {
                info!(page, "listing page is empty; stopping");
                Ok(None)
            }
            Some(mut drafts) => {
                debug!(page, drafts = drafts.len(), "gov.uk page extracted");
                if self.fetch_details {
                    for draft in &mut drafts {
                        self.enrich(draft).await;
                    }
                }
                Ok(Some(drafts))
            }
        }
    }
}

#[async_trait]
impl SourceAdapter for GovUkAdapter {
    fn source(&self) -> SourceKind {
        SourceKind::GovUk
    }

    async fn next_batch(&mut self) -> Result<Option<Vec<AlertDraft>>, AdapterError> {
        if self.finished {
            return Ok(None);
        }
        let result = self.fetch_next().await;
        if !matches!(result, Ok(Some(_))) {
            self.finished = true;
        }
        result
    }
}
