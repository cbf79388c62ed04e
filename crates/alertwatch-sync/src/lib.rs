//! Sync pipeline orchestration: both sources, normalization, reconciliation,
//! persistence, reports and notifications.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use alertwatch_adapters::{
    AdapterContext, AdapterError, CasPortalAdapter, GovUkAdapter, GovUkSite, PostbackSite,
    SourceAdapter,
};
use alertwatch_core::{
    AlertDraft, ChangeCounts, ExistingRecords, Notifier, PersistenceSink, Severity, SourceKind,
};
use alertwatch_storage::{
    HttpClientConfig, HttpFetcher, JsonLedgerStore, PageArchive, PageTransport, TokenBucketConfig,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod merge;
pub mod normalize;
pub mod notify;
pub mod reports;

pub use config::{ConfigError, DateRange, RunOptions, SyncConfig};
pub use merge::{MergeConfig, MergeEngine, MergeOutcome};
pub use normalize::{clean_text, parse_issue_date, NormalizedBatch, Normalizer, SkippedDraft};
pub use notify::TracingNotifier;
pub use reports::{
    report_daily_markdown, ParquetManifest, ParquetManifestFile, ReportWriter, RunRecord,
    RunReportPaths,
};

pub const CRATE_NAME: &str = "alertwatch-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Network,
    Structural,
    Deadline,
    InvalidSearch,
}

impl FailureKind {
    fn of(err: &AdapterError) -> Self {
        match err {
            AdapterError::Network(_) => FailureKind::Network,
            AdapterError::Structural { .. } => FailureKind::Structural,
            AdapterError::DeadlineExceeded => FailureKind::Deadline,
            AdapterError::InvalidSearch(_) => FailureKind::InvalidSearch,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            FailureKind::Structural => Severity::Critical,
            _ => Severity::Warning,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureKind::Network => "network",
            FailureKind::Structural => "structural",
            FailureKind::Deadline => "deadline",
            FailureKind::InvalidSearch => "invalid_search",
        })
    }
}

/// Why a source stopped early. Drafts read before the failure are still merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFailure {
    pub source: SourceKind,
    pub kind: FailureKind,
    pub message: String,
    pub drafts_before_failure: usize,
}

#[derive(Debug)]
pub struct SourceHarvest {
    pub source: SourceKind,
    pub drafts: Vec<AlertDraft>,
    pub batches: usize,
    pub failure: Option<SourceFailure>,
}

/// Pulls batches until the adapter is exhausted or fails.
pub async fn drain_adapter<A: SourceAdapter>(mut adapter: A) -> SourceHarvest {
    let source = adapter.source();
    let mut harvest = SourceHarvest {
        source,
        drafts: Vec::new(),
        batches: 0,
        failure: None,
    };
    loop {
        match adapter.next_batch().await {
            Ok(Some(batch)) => {
                harvest.batches += 1;
                harvest.drafts.extend(batch);
            }
            Ok(None) => break,
            Err(err) => {
                warn!(%source, error = %err, drafts = harvest.drafts.len(), "source stopped early");
                harvest.failure = Some(SourceFailure {
                    source,
                    kind: FailureKind::of(&err),
                    message: err.to_string(),
                    drafts_before_failure: harvest.drafts.len(),
                });
                break;
            }
        }
    }
    info!(%source, drafts = harvest.drafts.len(), batches = harvest.batches, "source drained");
    harvest
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub drafts_by_source: BTreeMap<SourceKind, usize>,
    pub counts: ChangeCounts,
    pub skipped: usize,
    pub merged_records: usize,
    pub failures: Vec<SourceFailure>,
    /// `None` when the run's reports could not be written.
    pub reports_dir: Option<String>,
    pub parquet_manifest: Option<String>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    options: RunOptions,
    transport: Arc<dyn PageTransport>,
    existing: Arc<dyn ExistingRecords>,
    sink: Arc<dyn PersistenceSink>,
    notifier: Arc<dyn Notifier>,
}

impl SyncPipeline {
    /// Options are validated here, before anything touches the network.
    pub fn new(config: SyncConfig, options: RunOptions) -> Result<Self> {
        options.validate()?;
        let delay = options.paging_policy().request_delay;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            backoff: options.backoff(),
            per_host: Some(TokenBucketConfig {
                capacity: 1,
                refill_every: delay,
            }),
        })?;
        let store = Arc::new(JsonLedgerStore::new(config.data_dir.clone()));
        Ok(Self {
            config,
            options,
            transport: Arc::new(http),
            existing: store.clone(),
            sink: store,
            notifier: Arc::new(TracingNotifier),
        })
    }

    pub fn with_transport(mut self, transport: Arc<dyn PageTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_store(
        mut self,
        existing: Arc<dyn ExistingRecords>,
        sink: Arc<dyn PersistenceSink>,
    ) -> Self {
        self.existing = existing;
        self.sink = sink;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        self.run_with_id(run_id).instrument(span).await
    }

    async fn run_with_id(&self, run_id: Uuid) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let search = self.options.search_parameters()?;
        let existing = self
            .existing
            .load_existing()
            .await
            .context("loading existing alerts")?;

        let mut ctx = AdapterContext::new(run_id).with_deadline(self.options.deadline());
        if self.options.archive_raw_pages {
            ctx = ctx.with_archive(Arc::new(PageArchive::new(self.config.archive_dir.clone())));
        }
        let policy = self.options.paging_policy();
        let cas = CasPortalAdapter::new(
            self.transport.clone(),
            PostbackSite::cas_mhra().with_search_url(self.config.cas_search_url.clone()),
            search,
            ctx.clone(),
            &policy,
        );
        let govuk = GovUkAdapter::new(
            self.transport.clone(),
            GovUkSite::default().with_listing_url(self.config.govuk_listing_url.clone()),
            ctx,
            &policy,
        );

        let (cas, govuk) = tokio::join!(drain_adapter(cas), drain_adapter(govuk));

        let normalized = Normalizer::new(started_at)
            .normalize_batch(cas.drafts.iter().chain(govuk.drafts.iter()));
        let engine = MergeEngine::new(self.options.merge_config());
        let outcome = engine.reconcile(&existing, normalized.records);

        self.sink
            .write(&outcome.records, &outcome.report)
            .await
            .context("writing reconciled alerts")?;

        let counts = ChangeCounts::tally(&outcome.report);
        let failures = [&cas, &govuk]
            .into_iter()
            .filter_map(|h| h.failure.clone())
            .collect::<Vec<_>>();
        let finished_at = Utc::now();
        let run = RunRecord {
            run_id,
            started_at,
            finished_at,
            status: if failures.is_empty() { "completed" } else { "partial" }.to_string(),
            counts,
            skipped: normalized.skipped.len(),
            failures: failures.clone(),
        };
        // The ledger is already written; a report failure must not hide that.
        let paths = match ReportWriter::new(self.config.reports_root())
            .write_run(&run, &normalized.skipped, &outcome.records, &outcome.report)
            .await
        {
            Ok(paths) => Some(paths),
            Err(err) => {
                warn!(error = ?err, "writing run reports failed");
                self.notify(Severity::Warning, &format!("alert sync reports were not written: {err:#}"))
                    .await;
                None
            }
        };

        for failure in &failures {
            self.notify(
                failure.kind.severity(),
                &format!(
                    "{} source failed ({}): {}; {} alerts read before the failure were kept",
                    failure.source, failure.kind, failure.message, failure.drafts_before_failure
                ),
            )
            .await;
        }
        self.notify(
            Severity::Info,
            &format!(
                "alert sync {}: {} new, {} updated, {} duplicate, {} skipped",
                run.status, counts.new, counts.updated, counts.duplicate, run.skipped
            ),
        )
        .await;

        info!(
            new = counts.new,
            updated = counts.updated,
            duplicate = counts.duplicate,
            skipped = run.skipped,
            failures = failures.len(),
            "sync run finished"
        );

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            drafts_by_source: BTreeMap::from([
                (cas.source, cas.drafts.len()),
                (govuk.source, govuk.drafts.len()),
            ]),
            counts,
            skipped: run.skipped,
            merged_records: outcome.records.len(),
            failures,
            reports_dir: paths.as_ref().map(|p| p.reports_dir.display().to_string()),
            parquet_manifest: paths.as_ref().map(|p| p.parquet_manifest.display().to_string()),
        })
    }

    async fn notify(&self, severity: Severity, message: &str) {
        if let Err(err) = self.notifier.notify(severity, message).await {
            warn!(error = %err, ?severity, "notifier failed");
        }
    }
}

/// Daily trigger for `run_once`; the caller starts and shuts it down.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config().daily_cron.clone();
    let job = Job::new_async(&cron, move |_uuid, _lock| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!(run_id = %summary.run_id, "scheduled sync finished"),
                Err(err) => error!(error = ?err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

pub fn pipeline_from_env(options_path: Option<PathBuf>) -> Result<SyncPipeline> {
    let mut config = SyncConfig::from_env();
    if options_path.is_some() {
        config.options_path = options_path;
    }
    let options = RunOptions::load_optional(config.options_path.as_deref())?;
    SyncPipeline::new(config, options)
}

pub async fn run_sync_once_from_env(options_path: Option<PathBuf>) -> Result<SyncRunSummary> {
    pipeline_from_env(options_path)?.run_once().await
}
