//! Stateful navigation of ASP.NET WebForms listings.
//!
//! Every page request carries the hidden tokens returned by the previous
//! response, so pages can only be walked in order and a walk cannot be resumed.
//! The extractor is written against the CAS MHRA grid but is parameterised by
//! [`PostbackSite`].

use std::collections::BTreeMap;
use std::sync::Arc;

use alertwatch_storage::{BackoffPolicy, PageTransport};
use chrono::NaiveDate;
use scraper::{ElementRef, Html};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::detail::fetch_detail_body;
use crate::{element_text, selector, AdapterContext, AdapterError, PagingPolicy, RequestPacer};

/// Option keys accepted by [`SearchParameters::from_options`].
pub const RECOGNIZED_SEARCH_OPTIONS: [&str; 3] = ["date_from", "date_to", "category"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchParameters {
    date_from: Option<NaiveDate>,
    date_to: Option<NaiveDate>,
    category: Option<String>,
}

impl SearchParameters {
    pub fn new(
        date_from: Option<NaiveDate>,
        date_to: Option<NaiveDate>,
        category: Option<String>,
    ) -> Result<Self, AdapterError> {
        if let (Some(from), Some(to)) = (date_from, date_to) {
            if from > to {
                return Err(AdapterError::InvalidSearch(format!(
                    "date_from {from} is after date_to {to}"
                )));
            }
        }
        let category = category
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        Ok(Self {
            date_from,
            date_to,
            category,
        })
    }

    /// Builds parameters from string options; unrecognised keys are rejected
    /// rather than ignored.
    pub fn from_options(options: &BTreeMap<String, String>) -> Result<Self, AdapterError> {
        if let Some(unknown) = options
            .keys()
            .find(|key| !RECOGNIZED_SEARCH_OPTIONS.contains(&key.as_str()))
        {
            return Err(AdapterError::InvalidSearch(format!(
                "unrecognised search option `{unknown}`"
            )));
        }
        let date = |key: &str| -> Result<Option<NaiveDate>, AdapterError> {
            options
                .get(key)
                .map(|raw| {
                    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|err| {
                        AdapterError::InvalidSearch(format!("{key} {raw:?} is not YYYY-MM-DD: {err}"))
                    })
                })
                .transpose()
        };
        Self::new(date("date_from")?, date("date_to")?, options.get("category").cloned())
    }

    pub fn date_from(&self) -> Option<NaiveDate> {
        self.date_from
    }

    pub fn date_to(&self) -> Option<NaiveDate> {
        self.date_to
    }

    pub fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }

    fn filter_fields(&self, site: &PostbackSite) -> Vec<(String, String)> {
        let mut fields = Vec::new();
        if let Some(from) = self.date_from {
            fields.push((site.date_from_field.clone(), from.format("%d/%m/%Y").to_string()));
        }
        if let Some(to) = self.date_to {
            fields.push((site.date_to_field.clone(), to.format("%d/%m/%Y").to_string()));
        }
        if let Some(category) = &self.category {
            fields.push((site.category_field.clone(), category.clone()));
        }
        fields
    }
}

/// Where a postback listing lives and how its results grid is laid out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostbackSite {
    pub source_id: String,
    pub search_url: String,
    /// CSS selector for the results grid.
    pub results_table: String,
    /// Submit button posted with the initial search, as `(name, value)`.
    pub search_button: (String, String),
    pub date_from_field: String,
    pub date_to_field: String,
    pub category_field: String,
    /// Rows with fewer data cells are treated as headers or pager rows.
    pub min_columns: usize,
}

impl PostbackSite {
    pub fn cas_mhra() -> Self {
        Self {
            source_id: "cas-mhra".to_string(),
            search_url: "https://www.cas.mhra.gov.uk/SearchAlerts.aspx".to_string(),
            results_table: "#ctl00_ContentPlaceHolder1_AlertSearchResults1_gvwAlertList".to_string(),
            search_button: (
                "ctl00$ContentPlaceHolder1$btnSearch".to_string(),
                "Search".to_string(),
            ),
            date_from_field: "ctl00$ContentPlaceHolder1$txtIssueDateFrom".to_string(),
            date_to_field: "ctl00$ContentPlaceHolder1$txtIssueDateTo".to_string(),
            category_field: "ctl00$ContentPlaceHolder1$ddlAlertType".to_string(),
            min_columns: 5,
        }
    }

    pub fn with_search_url(mut self, search_url: impl Into<String>) -> Self {
        self.search_url = search_url.into();
        self
    }

    fn parse_form(&self, html: &str) -> Result<HiddenTokens, String> {
        let document = Html::parse_document(html);
        HiddenTokens::extract(&document)
    }

    fn parse_results(&self, html: &str, current_page: u32) -> Result<ResultsPage, String> {
        let document = Html::parse_document(html);
        let tokens = HiddenTokens::extract(&document)?;
        let table_selector = selector(&self.results_table)?;
        let table = document
            .select(&table_selector)
            .next()
            .ok_or_else(|| format!("results table `{}` not found", self.results_table))?;

        let rows = direct_rows(table)
            .into_iter()
            .filter_map(|row| raw_row(row, self.min_columns))
            .collect();
        let next = find_next_control(table, current_page)?;
        Ok(ResultsPage { rows, tokens, next })
    }
}

/// The opaque state the server round-trips through every postback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HiddenTokens {
    view_state: String,
    event_validation: String,
    view_state_generator: Option<String>,
}

impl HiddenTokens {
    fn extract(document: &Html) -> Result<Self, String> {
        let value = |name: &str| -> Result<Option<String>, String> {
            let sel = selector(&format!(r#"input[name="{name}"]"#))?;
            Ok(document
                .select(&sel)
                .next()
                .and_then(|input| input.value().attr("value"))
                .map(str::to_string)
                .filter(|v| !v.is_empty()))
        };
        let view_state = value("__VIEWSTATE")?.ok_or("hidden field __VIEWSTATE missing")?;
        let event_validation =
            value("__EVENTVALIDATION")?.ok_or("hidden field __EVENTVALIDATION missing")?;
        Ok(Self {
            view_state,
            event_validation,
            view_state_generator: value("__VIEWSTATEGENERATOR")?,
        })
    }

    pub fn view_state(&self) -> &str {
        &self.view_state
    }

    pub fn event_validation(&self) -> &str {
        &self.event_validation
    }

    fn form_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("__VIEWSTATE".to_string(), self.view_state.clone()),
            ("__EVENTVALIDATION".to_string(), self.event_validation.clone()),
        ];
        if let Some(generator) = &self.view_state_generator {
            fields.push(("__VIEWSTATEGENERATOR".to_string(), generator.clone()));
        }
        fields
    }
}

/// The control event the next postback will raise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostbackAction {
    pub event_target: String,
    pub event_argument: String,
    /// Submit button name/value, posted only for the initial search.
    pub submit: Option<(String, String)>,
}

/// Snapshot of a session between two requests. Each response produces a new
/// state; an old one must not be replayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    tokens: HiddenTokens,
    action: PostbackAction,
    filters: Vec<(String, String)>,
    pages_read: u32,
}

impl SessionState {
    pub fn tokens(&self) -> &HiddenTokens {
        &self.tokens
    }

    pub fn action(&self) -> &PostbackAction {
        &self.action
    }

    pub fn pages_read(&self) -> u32 {
        self.pages_read
    }

    fn form(&self) -> Vec<(String, String)> {
        let mut form = vec![
            ("__EVENTTARGET".to_string(), self.action.event_target.clone()),
            ("__EVENTARGUMENT".to_string(), self.action.event_argument.clone()),
        ];
        form.extend(self.tokens.form_fields());
        form.extend(self.filters.iter().cloned());
        if let Some(submit) = &self.action.submit {
            form.push(submit.clone());
        }
        form
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCell {
    pub text: String,
    pub href: Option<String>,
}

/// Cell texts of one grid row, in column order, before any interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    pub cells: Vec<RawCell>,
}

impl RawRow {
    pub fn text(&self, column: usize) -> Option<&str> {
        self.cells.get(column).map(|c| c.text.as_str())
    }

    pub fn href(&self, column: usize) -> Option<&str> {
        self.cells.get(column).and_then(|c| c.href.as_deref())
    }
}

#[derive(Debug)]
struct ResultsPage {
    rows: Vec<RawRow>,
    tokens: HiddenTokens,
    next: Option<(String, String)>,
}

enum PageRequest {
    Get,
    Post(Vec<(String, String)>),
}

pub struct PostbackNavigator {
    transport: Arc<dyn PageTransport>,
    site: PostbackSite,
    ctx: AdapterContext,
    pacer: RequestPacer,
    backoff: BackoffPolicy,
}

impl PostbackNavigator {
    pub fn new(
        transport: Arc<dyn PageTransport>,
        site: PostbackSite,
        ctx: AdapterContext,
        policy: &PagingPolicy,
    ) -> Self {
        Self {
            transport,
            site,
            ctx,
            pacer: RequestPacer::new(policy.request_delay),
            backoff: policy.backoff,
        }
    }

    pub fn site(&self) -> &PostbackSite {
        &self.site
    }

    /// Loads the search form and returns a state whose action submits the search.
    pub async fn open(&mut self, params: &SearchParameters) -> Result<SessionState, AdapterError> {
        info!(
            run_id = %self.ctx.run_id,
            source_id = %self.site.source_id,
            date_from = ?params.date_from(),
            date_to = ?params.date_to(),
            category = ?params.category(),
            "opening postback session"
        );
        let tokens = self
            .fetch_parsed("search-form", PageRequest::Get, |site, body| site.parse_form(body))
            .await?;
        Ok(SessionState {
            tokens,
            action: PostbackAction {
                event_target: String::new(),
                event_argument: String::new(),
                submit: Some(self.site.search_button.clone()),
            },
            filters: params.filter_fields(&self.site),
            pages_read: 0,
        })
    }

    /// Raises the state's action and returns the page's rows plus, when the
    /// page offers a control to the following page, the state for it.
    pub async fn advance(
        &mut self,
        state: &SessionState,
    ) -> Result<(Vec<RawRow>, Option<SessionState>), AdapterError> {
        let current_page = state.pages_read + 1;
        let label = format!("page-{current_page}");
        let page = self
            .fetch_parsed(&label, PageRequest::Post(state.form()), move |site, body| {
                site.parse_results(body, current_page)
            })
            .await?;

        debug!(page = current_page, rows = page.rows.len(), has_next = page.next.is_some(), "parsed results page");
        // An empty grid ends the walk even if a pager is still rendered.
        let next = match page.next {
            Some((event_target, event_argument)) if !page.rows.is_empty() => Some(SessionState {
                tokens: page.tokens,
                action: PostbackAction {
                    event_target,
                    event_argument,
                    submit: None,
                },
                filters: state.filters.clone(),
                pages_read: current_page,
            }),
            _ => None,
        };
        Ok((page.rows, next))
    }

    /// A linked alert page, paced like every other request of this session.
    pub async fn fetch_detail(&mut self, url: &str) -> Option<String> {
        fetch_detail_body(&*self.transport, &mut self.pacer, &self.ctx, &self.site.source_id, url).await
    }

    /// One paced request plus parse. Responses of the wrong shape are
    /// re-requested with backoff before escalating as structural failures.
    async fn fetch_parsed<T, F>(
        &mut self,
        label: &str,
        request: PageRequest,
        parse: F,
    ) -> Result<T, AdapterError>
    where
        F: Fn(&PostbackSite, &str) -> Result<T, String> + Send,
        T: Send,
    {
        let mut attempt = 0usize;
        loop {
            self.pacer.wait_turn().await;
            self.ctx.deadline.check()?;

            let url = self.site.search_url.clone();
            let response = match &request {
                PageRequest::Get => self.transport.get(&self.site.source_id, &url).await?,
                PageRequest::Post(form) => {
                    self.transport
                        .post_form(&self.site.source_id, &url, form)
                        .await?
                }
            };
            self.ctx
                .archive_page(&self.site.source_id, label, &response.body)
                .await;

            match parse(&self.site, &response.text()) {
                Ok(parsed) => return Ok(parsed),
                Err(reason) if attempt < self.backoff.max_retries => {
                    warn!(label, attempt, %reason, "unexpected page shape; re-requesting");
                    tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(reason) => {
                    return Err(AdapterError::Structural {
                        url: response.final_url,
                        reason,
                    })
                }
            }
        }
    }
}

enum PagerState {
    Unopened,
    Ready(SessionState),
    Done,
}

/// Lazy, single-pass page sequence over a postback listing.
pub struct PostbackPager {
    navigator: PostbackNavigator,
    params: SearchParameters,
    state: PagerState,
    pages_read: u32,
    max_pages: u32,
}

impl PostbackPager {
    pub fn new(navigator: PostbackNavigator, params: SearchParameters, max_pages: u32) -> Self {
        Self {
            navigator,
            params,
            state: PagerState::Unopened,
            pages_read: 0,
            max_pages,
        }
    }

    pub fn pages_read(&self) -> u32 {
        self.pages_read
    }

    pub fn navigator_mut(&mut self) -> &mut PostbackNavigator {
        &mut self.navigator
    }

    /// Rows of the next page, or `None` once the listing is exhausted, the page
    /// ceiling is hit, or an earlier call failed.
    pub async fn next_page(&mut self) -> Result<Option<Vec<RawRow>>, AdapterError> {
        let state = match std::mem::replace(&mut self.state, PagerState::Done) {
            PagerState::Done => return Ok(None),
            PagerState::Unopened => self.navigator.open(&self.params).await?,
            PagerState::Ready(state) => state,
        };
        if self.pages_read >= self.max_pages {
            warn!(
                source_id = %self.navigator.site().source_id,
                max_pages = self.max_pages,
                "page ceiling reached; stopping pagination"
            );
            return Ok(None);
        }

        let (rows, next) = self.navigator.advance(&state).await?;
        self.pages_read += 1;
        if let Some(next) = next {
            self.state = PagerState::Ready(next);
        }
        Ok(Some(rows))
    }
}

fn direct_rows(table: ElementRef<'_>) -> Vec<ElementRef<'_>> {
    let mut rows = Vec::new();
    for child in table.children().filter_map(ElementRef::wrap) {
        match child.value().name() {
            "tr" => rows.push(child),
            "thead" | "tbody" | "tfoot" => rows.extend(
                child
                    .children()
                    .filter_map(ElementRef::wrap)
                    .filter(|el| el.value().name() == "tr"),
            ),
            _ => {}
        }
    }
    rows
}

fn raw_row(row: ElementRef<'_>, min_columns: usize) -> Option<RawRow> {
    let anchor = selector("a[href]").ok()?;
    let cells = row
        .children()
        .filter_map(ElementRef::wrap)
        .filter(|el| el.value().name() == "td")
        .map(|td| RawCell {
            text: element_text(td),
            href: td
                .select(&anchor)
                .next()
                .and_then(|a| a.value().attr("href"))
                .map(str::to_string),
        })
        .collect::<Vec<_>>();
    (cells.len() >= min_columns).then_some(RawRow { cells })
}

fn find_next_control(
    table: ElementRef<'_>,
    current_page: u32,
) -> Result<Option<(String, String)>, String> {
    let anchors = selector("a[href]")?;
    let wanted = format!("Page${}", current_page + 1);
    Ok(table
        .select(&anchors)
        .filter_map(|a| a.value().attr("href").and_then(parse_postback_href))
        .find(|(_, argument)| *argument == wanted || argument == "Page$Next"))
}

/// Splits `javascript:__doPostBack('target','argument')` into its two arguments.
pub fn parse_postback_href(href: &str) -> Option<(String, String)> {
    const CALL: &str = "__doPostBack(";
    let start = href.find(CALL)? + CALL.len();
    let rest = &href[start..];
    let args = &rest[..rest.find(')')?];
    let mut parts = args
        .splitn(2, ',')
        .map(|part| part.trim().trim_matches(|c| c == '\'' || c == '"').to_string());
    let target = parts.next()?;
    let argument = parts.next()?;
    (!target.is_empty()).then_some((target, argument))
}
