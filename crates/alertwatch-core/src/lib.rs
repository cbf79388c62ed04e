//! Canonical alert model, change report and pipeline boundary contracts.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "alertwatch-core";

/// The two alert sources the pipeline knows how to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SourceKind {
    /// CAS MHRA portal: ASP.NET forms, postback pagination.
    #[serde(rename = "cas-mhra")]
    CasPortal,
    /// GOV.UK drug and device alerts finder: plain `?page=N` listing.
    #[serde(rename = "gov-uk")]
    GovUk,
}

impl SourceKind {
    /// Stable tag. Part of the identity hash projection, so never change these strings.
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::CasPortal => "cas-mhra",
            SourceKind::GovUk => "gov-uk",
        }
    }

    pub fn all() -> [SourceKind; 2] {
        [SourceKind::CasPortal, SourceKind::GovUk]
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw, pre-normalized field set handed from an adapter to the normalizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertDraft {
    pub source: SourceKind,
    pub listing_url: String,
    pub fetched_at: DateTime<Utc>,
    pub reference: Option<String>,
    pub title: Option<String>,
    pub originator: Option<String>,
    pub issue_date: Option<String>,
    pub status: Option<String>,
    pub alert_type: Option<String>,
    pub url: Option<String>,
    pub medical_specialty: Option<String>,
    /// Filled only when detail pages are fetched.
    #[serde(default)]
    pub details: AlertDetails,
}

impl AlertDraft {
    pub fn new(source: SourceKind, listing_url: impl Into<String>, fetched_at: DateTime<Utc>) -> Self {
        Self {
            source,
            listing_url: listing_url.into(),
            fetched_at,
            reference: None,
            title: None,
            originator: None,
            issue_date: None,
            status: None,
            alert_type: None,
            url: None,
            medical_specialty: None,
            details: AlertDetails::default(),
        }
    }
}

/// Extra content read from an alert's own page rather than the listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertDetails {
    pub action_category: Option<String>,
    pub broadcast_content: Option<String>,
    pub additional_info: Option<String>,
    pub action_underway_deadline: Option<String>,
    pub action_complete_deadline: Option<String>,
    /// `"{link text} ({absolute url})"` per attachment, in page order.
    pub attachments: Vec<String>,
}

impl AlertDetails {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Per-record normalization failure. The record is skipped; the batch continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldParseError {
    #[error("missing required field `{0}`")]
    Missing(&'static str),
    #[error("unrecognized issue date {raw:?} for {origin}")]
    Date { raw: String, origin: SourceKind },
    #[error("url {0:?} is not an absolute http(s) locator")]
    Url(String),
}

/// The editable content of an alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertFields {
    pub reference: Option<String>,
    pub title: String,
    pub originator: String,
    pub issue_date: NaiveDate,
    pub status: String,
    pub alert_type: String,
    pub source: SourceKind,
    pub url: String,
    pub medical_specialty: Option<String>,
    #[serde(default)]
    pub details: AlertDetails,
}

/// Canonical alert. Only the normalizer creates one from scratch; the merge
/// engine derives revised values through [`AlertRecord::revise`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertRecord {
    #[serde(flatten)]
    fields: AlertFields,
    scraped_at: DateTime<Utc>,
    identity_hash: String,
}

impl AlertRecord {
    pub fn new(fields: AlertFields, scraped_at: DateTime<Utc>) -> Self {
        let identity_hash = identity_hash(
            fields.reference.as_deref(),
            &fields.title,
            fields.issue_date,
            fields.source,
        );
        Self {
            fields,
            scraped_at,
            identity_hash,
        }
    }

    /// Build the next version of this record. The identity hash, the source and
    /// a non-empty reference always carry over from `self`.
    pub fn revise(&self, mut fields: AlertFields) -> Self {
        fields.source = self.fields.source;
        if has_text(self.fields.reference.as_deref()) {
            fields.reference = self.fields.reference.clone();
        }
        Self {
            fields,
            scraped_at: self.scraped_at,
            identity_hash: self.identity_hash.clone(),
        }
    }

    pub fn fields(&self) -> &AlertFields {
        &self.fields
    }

    pub fn identity_hash(&self) -> &str {
        &self.identity_hash
    }

    pub fn scraped_at(&self) -> DateTime<Utc> {
        self.scraped_at
    }

    pub fn reference(&self) -> Option<&str> {
        self.fields.reference.as_deref().filter(|r| !r.trim().is_empty())
    }

    pub fn title(&self) -> &str {
        &self.fields.title
    }

    pub fn issue_date(&self) -> NaiveDate {
        self.fields.issue_date
    }

    pub fn source(&self) -> SourceKind {
        self.fields.source
    }
}

fn has_text(value: Option<&str>) -> bool {
    value.map(|v| !v.trim().is_empty()).unwrap_or(false)
}

/// Lowercase, alphanumerics only, single spaces. Used for every equality and
/// similarity decision so that case and punctuation noise never count as change.
pub fn comparison_form(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// SHA-256 over `"{reference-or-title}|{YYYY-MM-DD}|{source}"`, each text part in
/// comparison form. Stored identities depend on this exact derivation.
pub fn identity_hash(
    reference: Option<&str>,
    title: &str,
    issue_date: NaiveDate,
    source: SourceKind,
) -> String {
    let key = reference
        .map(comparison_form)
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| comparison_form(title));
    let projection = format!(
        "{}|{}|{}",
        key,
        issue_date.format("%Y-%m-%d"),
        source.as_str()
    );
    let mut hasher = Sha256::new();
    hasher.update(projection.as_bytes());
    hex::encode(hasher.finalize())
}

/// Which matching tier tied an incoming record to an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    Reference,
    IdentityHash,
    Fuzzy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub previous: Option<String>,
    pub current: Option<String>,
}

/// A non-empty value that lost a precedence decision during a merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldConflict {
    pub field: String,
    pub kept: String,
    pub discarded: String,
    pub discarded_source: SourceKind,
}

/// One audit entry per incoming record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeEntry {
    New {
        record: AlertRecord,
    },
    Update {
        previous: AlertRecord,
        current: AlertRecord,
        matched_by: MatchTier,
        changed_fields: Vec<FieldChange>,
        conflicts: Vec<FieldConflict>,
    },
    Duplicate {
        existing: AlertRecord,
        matched_by: MatchTier,
        conflicts: Vec<FieldConflict>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    New,
    Update,
    Duplicate,
}

impl ChangeEntry {
    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeEntry::New { .. } => ChangeKind::New,
            ChangeEntry::Update { .. } => ChangeKind::Update,
            ChangeEntry::Duplicate { .. } => ChangeKind::Duplicate,
        }
    }

    /// The canonical record this entry resolved to.
    pub fn resolved(&self) -> &AlertRecord {
        match self {
            ChangeEntry::New { record } => record,
            ChangeEntry::Update { current, .. } => current,
            ChangeEntry::Duplicate { existing, .. } => existing,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCounts {
    pub new: usize,
    pub updated: usize,
    pub duplicate: usize,
}

impl ChangeCounts {
    pub fn tally(entries: &[ChangeEntry]) -> Self {
        let mut counts = Self::default();
        for entry in entries {
            match entry.kind() {
                ChangeKind::New => counts.new += 1,
                ChangeKind::Update => counts.updated += 1,
                ChangeKind::Duplicate => counts.duplicate += 1,
            }
        }
        counts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Snapshot read of the canonical set at the start of a run.
#[async_trait]
pub trait ExistingRecords: Send + Sync {
    async fn load_existing(&self) -> anyhow::Result<Vec<AlertRecord>>;
}

/// Receives the full reconciled set once per run.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn write(&self, merged: &[AlertRecord], report: &[ChangeEntry]) -> anyhow::Result<()>;
}

/// Fire-and-forget from the pipeline's point of view: errors are logged only.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, severity: Severity, message: &str) -> anyhow::Result<()>;
}
