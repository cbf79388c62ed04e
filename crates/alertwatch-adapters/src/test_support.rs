use std::collections::VecDeque;
use std::sync::Mutex;

use alertwatch_storage::{FetchError, FetchedResponse, PageTransport, StatusCode};
use async_trait::async_trait;
use tokio::time::Instant;

pub(crate) const CAS_GRID_ID: &str = "ctl00_ContentPlaceHolder1_AlertSearchResults1_gvwAlertList";
pub(crate) const CAS_GRID_TARGET: &str = "ctl00$ContentPlaceHolder1$AlertSearchResults1$gvwAlertList";

#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Page(String),
    Status(u16),
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub method: &'static str,
    pub url: String,
    pub form: Vec<(String, String)>,
    pub at: Instant,
}

impl RecordedCall {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.form
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Replays canned replies in order; once they run out every request gets a 404.
#[derive(Debug, Default)]
pub(crate) struct ScriptedTransport {
    replies: Mutex<VecDeque<Reply>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedTransport {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    fn respond(
        &self,
        method: &'static str,
        url: &str,
        form: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError> {
        self.calls.lock().unwrap().push(RecordedCall {
            method,
            url: url.to_string(),
            form: form.to_vec(),
            at: Instant::now(),
        });
        match self.replies.lock().unwrap().pop_front() {
            Some(Reply::Page(body)) => Ok(FetchedResponse {
                status: StatusCode::OK,
                final_url: url.to_string(),
                body: body.into_bytes(),
            }),
            Some(Reply::Status(status)) => Err(FetchError::HttpStatus {
                status,
                url: url.to_string(),
            }),
            None => Err(FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            }),
        }
    }
}

#[async_trait]
impl PageTransport for ScriptedTransport {
    async fn get(&self, _source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        self.respond("GET", url, &[])
    }

    async fn post_form(
        &self,
        _source_id: &str,
        url: &str,
        form: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError> {
        self.respond("POST", url, form)
    }
}

fn hidden_inputs(token: &str) -> String {
    format!(
        r#"<input type="hidden" name="__VIEWSTATE" id="__VIEWSTATE" value="vs-{token}" />
<input type="hidden" name="__VIEWSTATEGENERATOR" id="__VIEWSTATEGENERATOR" value="A1B2C3D4" />
<input type="hidden" name="__EVENTVALIDATION" id="__EVENTVALIDATION" value="ev-{token}" />"#
    )
}

/// Initial search form, before any search has been submitted.
pub(crate) fn cas_search_form() -> String {
    format!(
        r#"<html><body><form method="post" action="./SearchAlerts.aspx" id="aspnetForm">
{}
<input name="ctl00$ContentPlaceHolder1$txtIssueDateFrom" type="text" />
<input name="ctl00$ContentPlaceHolder1$txtIssueDateTo" type="text" />
<input type="submit" name="ctl00$ContentPlaceHolder1$btnSearch" value="Search" />
</form></body></html>"#,
        hidden_inputs("form")
    )
}

/// One results page: `rows` alert rows and, optionally, a pager link to `next`.
pub(crate) fn cas_results_page(page: u32, rows: usize, next: Option<u32>) -> String {
    let mut body = String::new();
    body.push_str(&format!(
        r#"<html><body><form method="post" action="./SearchAlerts.aspx" id="aspnetForm">
{}
<table id="{CAS_GRID_ID}" class="gridview">
<tr><th>Reference</th><th>Title</th><th>Originated By</th><th>Issue Date</th><th>Status</th></tr>
"#,
        hidden_inputs(&format!("page-{page}"))
    ));
    for i in 0..rows {
        body.push_str(&format!(
            r#"<tr>
  <td> MDA/2024/{page:02}{i:02} </td>
  <td><a href="ViewandAcknowledgment/ViewAlert.aspx?AlertID={page}{i:02}">Alert {page}-{i}</a></td>
  <td>National Patient Safety Alert</td>
  <td>12-Mar-2024</td>
  <td>Active</td>
</tr>
"#
        ));
    }
    let link = next
        .map(|n| {
            format!(
                r#"<td><a href="javascript:__doPostBack(&#39;{CAS_GRID_TARGET}&#39;,&#39;Page${n}&#39;)">{n}</a></td>"#
            )
        })
        .unwrap_or_default();
    body.push_str(&format!(
        r#"<tr class="pager"><td colspan="5"><table><tr><td><span>{page}</span></td>{link}</tr></table></td></tr>
</table></form></body></html>"#
    ));
    body
}

/// A results page whose hidden state has gone missing.
pub(crate) fn cas_page_without_tokens() -> String {
    format!(
        r#"<html><body><table id="{CAS_GRID_ID}"><tr><td>x</td><td>y</td><td>z</td><td>12-Mar-2024</td><td>Active</td></tr></table></body></html>"#
    )
}

pub(crate) struct GovUkItem<'a> {
    pub title: &'a str,
    pub href: &'a str,
    pub metadata: &'a [&'a str],
}

pub(crate) fn govuk_page(items: &[GovUkItem<'_>]) -> String {
    let mut body = String::from(
        r#"<html><body><main><ul class="gem-c-document-list">
"#,
    );
    for item in items {
        let dds = item
            .metadata
            .iter()
            .map(|value| format!("<dt>Field</dt><dd>{value}</dd>"))
            .collect::<String>();
        body.push_str(&format!(
            r#"<li class="gem-c-document-list__item">
  <div class="gem-c-document-list__item-title"><a href="{}">{}</a></div>
  <dl class="gem-c-document-list__item-metadata">{dds}</dl>
</li>
"#,
            item.href, item.title
        ));
    }
    body.push_str("</ul></main></body></html>");
    body
}

/// CAS alert page: label cells followed by value cells.
pub(crate) fn cas_detail_page() -> String {
    r#"<html><body><div id="alert"><table>
<tr><th>Originator:</th><td>Medicines and Healthcare products Regulatory Agency</td></tr>
<tr><th>Action category:</th><td>Action required</td></tr>
<tr><th>Broadcast content:</th><td><p>Stop using affected pumps.</p>
<p>Quarantine stock.</p></td></tr>
<tr><th>Additional information:</th><td>See the manufacturer notice.</td></tr>
<tr><th>Action underway deadline:</th><td>19-Mar-2024</td></tr>
<tr><th>Action complete deadline:</th><td>30-Apr-2024</td></tr>
<tr><th>Attachments:</th><td><a href="../Docs/fsn-100.pdf">Field safety notice</a></td></tr>
</table></div></body></html>"#
        .to_string()
}

pub(crate) fn govuk_detail_page() -> String {
    r#"<html><head><title>Infusion pump - GOV.UK</title></head><body>
<header><a href="/">GOV.UK</a></header>
<main>
<h1 class="gem-c-title__text">Infusion pump: risk of over-infusion (DSI/2024/004)</h1>
<dl><dt>Published</dt><dd><time data-module="govuk-datetime" datetime="2024-03-12T09:30:00.000+00:00">12 March 2024</time></dd></dl>
<div class="govspeak">
<p>Reference: DMRC-31337</p>
<h2>Background</h2>
<p>Pumps may over-infuse.</p>
<p>Batch 2 affected.</p>
<h2>Advice for Healthcare Professionals</h2>
<p>Check the pump model.</p>
<h3>Additional information</h3>
<p>Contact the manufacturer.</p>
<h2>Attachments</h2>
<p><a href="https://assets.publishing.service.gov.uk/fsn.pdf">Download the field safety notice</a></p>
<p><a href="/media/letter.pdf">Manufacturer letter</a></p>
</div>
</main></body></html>"#
        .to_string()
}
