use alertwatch_core::{AlertDetails, AlertDraft, AlertFields, AlertRecord, FieldParseError, SourceKind};
use alertwatch_storage::Url;
use chrono::{DateTime, NaiveDate, Utc};
use scraper::Html;
use serde::Serialize;
use tracing::warn;

const CAS_DATE_FORMATS: [&str; 3] = ["%d-%b-%Y", "%d/%m/%Y", "%Y-%m-%d"];
const GOVUK_DATE_FORMATS: [&str; 3] = ["%d %B %Y", "%d %b %Y", "%Y-%m-%d"];

/// Strips markup remnants and entities, then collapses whitespace.
pub fn clean_text(raw: &str) -> String {
    let text = if raw.contains('<') || raw.contains('&') {
        Html::parse_fragment(raw)
            .root_element()
            .text()
            .collect::<String>()
    } else {
        raw.to_string()
    };
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn cleaned(value: Option<&str>) -> Option<String> {
    value.map(clean_text).filter(|v| !v.is_empty())
}

/// Like [`clean_text`] per line; blank lines are dropped, line breaks kept.
fn cleaned_block(value: Option<&str>) -> Option<String> {
    let lines = value?
        .lines()
        .map(clean_text)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>();
    (!lines.is_empty()).then(|| lines.join("\n"))
}

fn cleaned_details(details: &AlertDetails) -> AlertDetails {
    AlertDetails {
        action_category: cleaned_block(details.action_category.as_deref()),
        broadcast_content: cleaned_block(details.broadcast_content.as_deref()),
        additional_info: cleaned_block(details.additional_info.as_deref()),
        action_underway_deadline: cleaned(details.action_underway_deadline.as_deref()),
        action_complete_deadline: cleaned(details.action_complete_deadline.as_deref()),
        attachments: details
            .attachments
            .iter()
            .map(|a| clean_text(a))
            .filter(|a| !a.is_empty())
            .collect(),
    }
}

pub fn parse_issue_date(raw: &str, source: SourceKind) -> Result<NaiveDate, FieldParseError> {
    let formats: &[&str] = match source {
        SourceKind::CasPortal => &CAS_DATE_FORMATS,
        SourceKind::GovUk => &GOVUK_DATE_FORMATS,
    };
    let trimmed = raw.trim();
    formats
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(trimmed, format).ok())
        .ok_or_else(|| FieldParseError::Date {
            raw: raw.to_string(),
            origin: source,
        })
}

fn absolute_url(raw: &str) -> Result<String, FieldParseError> {
    match Url::parse(raw.trim()) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.host_str().is_some() => {
            Ok(url.into())
        }
        _ => Err(FieldParseError::Url(raw.to_string())),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedDraft {
    pub source: SourceKind,
    pub title: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub records: Vec<AlertRecord>,
    pub skipped: Vec<SkippedDraft>,
}

/// Turns drafts into canonical records. Every record of one run shares the
/// run's `scraped_at`.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    scraped_at: DateTime<Utc>,
}

impl Normalizer {
    pub fn new(scraped_at: DateTime<Utc>) -> Self {
        Self { scraped_at }
    }

    pub fn normalize(&self, draft: &AlertDraft) -> Result<AlertRecord, FieldParseError> {
        let title = cleaned(draft.title.as_deref()).ok_or(FieldParseError::Missing("title"))?;
        let raw_date = cleaned(draft.issue_date.as_deref())
            .ok_or(FieldParseError::Missing("issue_date"))?;
        let issue_date = parse_issue_date(&raw_date, draft.source)?;
        let url = draft
            .url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or(FieldParseError::Missing("url"))
            .and_then(absolute_url)?;

        let fields = AlertFields {
            reference: cleaned(draft.reference.as_deref()),
            title,
            originator: cleaned(draft.originator.as_deref()).unwrap_or_default(),
            issue_date,
            status: cleaned(draft.status.as_deref()).unwrap_or_default(),
            alert_type: cleaned(draft.alert_type.as_deref()).unwrap_or_default(),
            source: draft.source,
            url,
            medical_specialty: cleaned(draft.medical_specialty.as_deref()),
            details: cleaned_details(&draft.details),
        };
        Ok(AlertRecord::new(fields, self.scraped_at))
    }

    /// Failed drafts are logged and skipped; the rest of the batch goes on.
    pub fn normalize_batch<'a>(&self, drafts: impl IntoIterator<Item = &'a AlertDraft>) -> NormalizedBatch {
        let mut batch = NormalizedBatch::default();
        for draft in drafts {
            match self.normalize(draft) {
                Ok(record) => batch.records.push(record),
                Err(err) => {
                    warn!(
                        source = %draft.source,
                        title = draft.title.as_deref().unwrap_or("<missing>"),
                        listing_url = %draft.listing_url,
                        error = %err,
                        "skipping unparseable alert"
                    );
                    batch.skipped.push(SkippedDraft {
                        source: draft.source,
                        title: draft.title.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        batch
    }
}
