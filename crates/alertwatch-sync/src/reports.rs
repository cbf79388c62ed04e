use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use alertwatch_core::{AlertDetails, AlertRecord, ChangeCounts, ChangeEntry, MatchTier};
use anyhow::{Context, Result};
use arrow_array::{ArrayRef, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

use crate::normalize::SkippedDraft;
use crate::SourceFailure;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// `completed`, or `partial` when at least one source failed.
    pub status: String,
    pub counts: ChangeCounts,
    pub skipped: usize,
    pub failures: Vec<SourceFailure>,
}

#[derive(Debug, Serialize)]
struct ChangeReportFile<'a> {
    run: &'a RunRecord,
    skipped: &'a [SkippedDraft],
    entries: &'a [ChangeEntry],
}

#[derive(Debug, Deserialize)]
struct ChangeReportHeader {
    run: RunRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

#[derive(Debug, Clone)]
pub struct RunReportPaths {
    pub reports_dir: PathBuf,
    pub change_report: PathBuf,
    pub daily_brief: PathBuf,
    pub parquet_manifest: PathBuf,
}

/// Writes `{root}/{run_id}/` with the change report, the daily brief and
/// Parquet snapshots of the reconciled set.
#[derive(Debug, Clone)]
pub struct ReportWriter {
    reports_root: PathBuf,
}

impl ReportWriter {
    pub fn new(reports_root: impl Into<PathBuf>) -> Self {
        Self {
            reports_root: reports_root.into(),
        }
    }

    pub async fn write_run(
        &self,
        run: &RunRecord,
        skipped: &[SkippedDraft],
        merged: &[AlertRecord],
        report: &[ChangeEntry],
    ) -> Result<RunReportPaths> {
        let reports_dir = self.reports_root.join(run.run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let change_report = reports_dir.join("change_report.json");
        let bytes = serde_json::to_vec_pretty(&ChangeReportFile {
            run,
            skipped,
            entries: report,
        })
        .context("serializing change report")?;
        fs::write(&change_report, bytes)
            .await
            .with_context(|| format!("writing {}", change_report.display()))?;

        let daily_brief = reports_dir.join("daily_brief.md");
        fs::write(&daily_brief, render_daily_brief(run, report))
            .await
            .with_context(|| format!("writing {}", daily_brief.display()))?;

        let parquet_manifest = export_parquet_snapshots(&reports_dir, run.run_id, merged, report).await?;

        Ok(RunReportPaths {
            reports_dir,
            change_report,
            daily_brief,
            parquet_manifest,
        })
    }
}

fn render_daily_brief(run: &RunRecord, report: &[ChangeEntry]) -> String {
    let mut lines = vec![
        "# Safety Alert Daily Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", run.run_id),
        format!("- Started: {}", run.started_at),
        format!("- Finished: {}", run.finished_at),
        format!("- Status: {}", run.status),
        format!(
            "- New: {} / Updated: {} / Duplicate: {} / Skipped: {}",
            run.counts.new, run.counts.updated, run.counts.duplicate, run.skipped
        ),
        String::new(),
    ];

    let new_alerts = report
        .iter()
        .filter_map(|entry| match entry {
            ChangeEntry::New { record } => Some(format!(
                "- [{}]({}) ({}, {})",
                record.title(),
                record.fields().url,
                record.source(),
                record.issue_date()
            )),
            _ => None,
        })
        .collect::<Vec<_>>();
    if !new_alerts.is_empty() {
        lines.push("## New Alerts".to_string());
        lines.extend(new_alerts);
        lines.push(String::new());
    }

    let updated = report
        .iter()
        .filter_map(|entry| match entry {
            ChangeEntry::Update {
                current,
                changed_fields,
                ..
            } => Some(format!(
                "- {}: {}",
                current.title(),
                changed_fields
                    .iter()
                    .map(|c| c.field.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )),
            _ => None,
        })
        .collect::<Vec<_>>();
    if !updated.is_empty() {
        lines.push("## Updated Alerts".to_string());
        lines.extend(updated);
        lines.push(String::new());
    }

    if !run.failures.is_empty() {
        lines.push("## Source Failures".to_string());
        for failure in &run.failures {
            lines.push(format!(
                "- {} ({}): {} [{} drafts kept]",
                failure.source, failure.kind, failure.message, failure.drafts_before_failure
            ));
        }
        lines.push(String::new());
    }

    lines.join("\n")
}

async fn export_parquet_snapshots(
    reports_dir: &Path,
    run_id: Uuid,
    merged: &[AlertRecord],
    report: &[ChangeEntry],
) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let alerts_path = snapshot_dir.join("alerts.parquet");
    let changes_path = snapshot_dir.join("changes.parquet");
    write_alerts_parquet(&alerts_path, merged)?;
    write_changes_parquet(&changes_path, report)?;

    let manifest = ParquetManifest {
        schema_version: 2,
        run_id,
        files: vec![
            manifest_entry("alerts", reports_dir, &alerts_path, merged.len())?,
            manifest_entry("changes", reports_dir, &changes_path, report.len())?,
        ],
    };

    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn utf8_column<'a>(values: impl Iterator<Item = Option<&'a str>>) -> ArrayRef {
    Arc::new(StringArray::from(values.collect::<Vec<_>>()))
}

fn detail_column(merged: &[AlertRecord], pick: fn(&AlertDetails) -> Option<&str>) -> ArrayRef {
    utf8_column(merged.iter().map(|r| pick(&r.fields().details)))
}

fn write_alerts_parquet(path: &Path, merged: &[AlertRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("identity_hash", DataType::Utf8, false),
        ArrowField::new("source", DataType::Utf8, false),
        ArrowField::new("reference", DataType::Utf8, true),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("originator", DataType::Utf8, false),
        ArrowField::new("issue_date", DataType::Utf8, false),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("alert_type", DataType::Utf8, false),
        ArrowField::new("url", DataType::Utf8, false),
        ArrowField::new("medical_specialty", DataType::Utf8, true),
        ArrowField::new("action_category", DataType::Utf8, true),
        ArrowField::new("broadcast_content", DataType::Utf8, true),
        ArrowField::new("additional_info", DataType::Utf8, true),
        ArrowField::new("action_underway_deadline", DataType::Utf8, true),
        ArrowField::new("action_complete_deadline", DataType::Utf8, true),
        ArrowField::new("attachments", DataType::Utf8, true),
        ArrowField::new("scraped_at", DataType::Utf8, false),
    ]));

    let issue_dates = merged
        .iter()
        .map(|r| r.issue_date().format("%Y-%m-%d").to_string())
        .collect::<Vec<_>>();
    let scraped_at = merged
        .iter()
        .map(|r| r.scraped_at().to_rfc3339())
        .collect::<Vec<_>>();
    let attachments = merged
        .iter()
        .map(|r| {
            let list = &r.fields().details.attachments;
            (!list.is_empty()).then(|| list.join("; "))
        })
        .collect::<Vec<_>>();

    let batch = RecordBatch::try_new(
        schema,
        vec![
            utf8_column(merged.iter().map(|r| Some(r.identity_hash()))),
            utf8_column(merged.iter().map(|r| Some(r.source().as_str()))),
            utf8_column(merged.iter().map(|r| r.reference())),
            utf8_column(merged.iter().map(|r| Some(r.title()))),
            utf8_column(merged.iter().map(|r| Some(r.fields().originator.as_str()))),
            utf8_column(issue_dates.iter().map(|d| Some(d.as_str()))),
            utf8_column(merged.iter().map(|r| Some(r.fields().status.as_str()))),
            utf8_column(merged.iter().map(|r| Some(r.fields().alert_type.as_str()))),
            utf8_column(merged.iter().map(|r| Some(r.fields().url.as_str()))),
            utf8_column(merged.iter().map(|r| r.fields().medical_specialty.as_deref())),
            detail_column(merged, |d| d.action_category.as_deref()),
            detail_column(merged, |d| d.broadcast_content.as_deref()),
            detail_column(merged, |d| d.additional_info.as_deref()),
            detail_column(merged, |d| d.action_underway_deadline.as_deref()),
            detail_column(merged, |d| d.action_complete_deadline.as_deref()),
            utf8_column(attachments.iter().map(Option::as_deref)),
            utf8_column(scraped_at.iter().map(|d| Some(d.as_str()))),
        ],
    )
    .context("building alerts record batch")?;
    write_parquet(path, batch)
}

fn write_changes_parquet(path: &Path, report: &[ChangeEntry]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("kind", DataType::Utf8, false),
        ArrowField::new("identity_hash", DataType::Utf8, false),
        ArrowField::new("matched_by", DataType::Utf8, true),
        ArrowField::new("changed_fields", DataType::UInt32, false),
        ArrowField::new("conflicts", DataType::UInt32, false),
    ]));

    let kind = |entry: &ChangeEntry| match entry {
        ChangeEntry::New { .. } => "new",
        ChangeEntry::Update { .. } => "update",
        ChangeEntry::Duplicate { .. } => "duplicate",
    };
    let matched_by = |entry: &ChangeEntry| {
        let tier = match entry {
            ChangeEntry::New { .. } => return None,
            ChangeEntry::Update { matched_by, .. } | ChangeEntry::Duplicate { matched_by, .. } => matched_by,
        };
        Some(match tier {
            MatchTier::Reference => "reference",
            MatchTier::IdentityHash => "identity_hash",
            MatchTier::Fuzzy => "fuzzy",
        })
    };
    let counts = |entry: &ChangeEntry| match entry {
        ChangeEntry::New { .. } => (0, 0),
        ChangeEntry::Update {
            changed_fields,
            conflicts,
            ..
        } => (changed_fields.len() as u32, conflicts.len() as u32),
        ChangeEntry::Duplicate { conflicts, .. } => (0, conflicts.len() as u32),
    };

    let batch = RecordBatch::try_new(
        schema,
        vec![
            utf8_column(report.iter().map(|e| Some(kind(e)))),
            utf8_column(report.iter().map(|e| Some(e.resolved().identity_hash()))),
            utf8_column(report.iter().map(matched_by)),
            Arc::new(UInt32Array::from(report.iter().map(|e| counts(e).0).collect::<Vec<_>>())),
            Arc::new(UInt32Array::from(report.iter().map(|e| counts(e).1).collect::<Vec<_>>())),
        ],
    )
    .context("building changes record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path, rows: usize) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
        rows,
    })
}

/// Markdown summary of the most recent `runs` report directories.
pub fn report_daily_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter_map(|entry| {
            let path = entry.path().join("change_report.json");
            let text = std::fs::read_to_string(&path).ok()?;
            let header: ChangeReportHeader = serde_json::from_str(&text).ok()?;
            Some((header.run, entry.path()))
        })
        .collect::<Vec<_>>();
    dirs.sort_by(|(a, _), (b, _)| b.started_at.cmp(&a.started_at));

    let mut lines = vec!["# Safety Alert Report".to_string(), String::new()];
    for (run, dir) in dirs.into_iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}`", run.run_id));
        lines.push(format!("- started: {}", run.started_at));
        lines.push(format!("- status: {}", run.status));
        lines.push(format!(
            "- new: {}, updated: {}, duplicate: {}, skipped: {}",
            run.counts.new, run.counts.updated, run.counts.duplicate, run.skipped
        ));
        for failure in &run.failures {
            lines.push(format!("- failure: {} ({}): {}", failure.source, failure.kind, failure.message));
        }
        let manifest_path = dir.join("snapshots").join("manifest.json");
        if manifest_path.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        lines.push(format!("- daily brief: `{}`", dir.join("daily_brief.md").display()));
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FailureKind;
    use alertwatch_core::{AlertFields, SourceKind};
    use arrow_array::Array;
    use chrono::{Duration, NaiveDate, TimeZone};
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use tempfile::tempdir;

    fn record(title: &str) -> AlertRecord {
        AlertRecord::new(
            AlertFields {
                reference: Some("MDA/2024/010".to_string()),
                title: title.to_string(),
                originator: "National Patient Safety Alert".to_string(),
                issue_date: NaiveDate::from_ymd_opt(2024, 3, 12).unwrap(),
                status: "Active".to_string(),
                alert_type: "National Patient Safety Alert".to_string(),
                source: SourceKind::CasPortal,
                url: "https://www.cas.mhra.gov.uk/ViewAlert.aspx?AlertID=10".to_string(),
                medical_specialty: None,
                details: AlertDetails {
                    action_category: Some("Action required".to_string()),
                    attachments: vec!["FSN (https://example.test/fsn.pdf)".to_string(), "Letter".to_string()],
                    ..AlertDetails::default()
                },
            },
            Utc.with_ymd_and_hms(2024, 3, 14, 7, 0, 0).single().unwrap(),
        )
    }

    fn run(started_at: DateTime<Utc>, failures: Vec<SourceFailure>) -> RunRecord {
        RunRecord {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at: started_at + Duration::seconds(40),
            status: if failures.is_empty() { "completed" } else { "partial" }.to_string(),
            counts: ChangeCounts {
                new: 1,
                updated: 0,
                duplicate: 0,
            },
            skipped: 0,
            failures,
        }
    }

    #[tokio::test]
    async fn run_reports_and_snapshots_are_written() {
        let dir = tempdir().expect("tempdir");
        let writer = ReportWriter::new(dir.path());
        let merged = vec![record("Recall of XYZ Infusion Pump Model 200")];
        let report = vec![ChangeEntry::New {
            record: merged[0].clone(),
        }];
        let failures = vec![SourceFailure {
            source: SourceKind::GovUk,
            kind: FailureKind::Structural,
            message: "document list missing".to_string(),
            drafts_before_failure: 0,
        }];
        let run = run(Utc::now(), failures);

        let paths = writer.write_run(&run, &[], &merged, &report).await.unwrap();
        assert!(paths.change_report.exists());
        assert!(paths.reports_dir.join("snapshots/alerts.parquet").exists());

        let brief = std::fs::read_to_string(&paths.daily_brief).unwrap();
        assert!(brief.contains("## New Alerts"));
        assert!(brief.contains("Recall of XYZ Infusion Pump Model 200"));
        assert!(brief.contains("gov-uk (structural)"));

        let manifest: ParquetManifest =
            serde_json::from_slice(&std::fs::read(&paths.parquet_manifest).unwrap()).unwrap();
        assert_eq!(manifest.files.len(), 2);
        assert_eq!(manifest.files[0].path, "snapshots/alerts.parquet");
        assert_eq!(manifest.files[0].rows, 1);
        assert_eq!(manifest.files[0].sha256.len(), 64);

        let file = File::open(paths.reports_dir.join("snapshots/alerts.parquet")).unwrap();
        let batch = ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        let column = |name: &str| {
            let index = batch.schema().index_of(name).unwrap();
            batch.column(index).as_any().downcast_ref::<StringArray>().unwrap().clone()
        };
        assert_eq!(column("action_category").value(0), "Action required");
        assert_eq!(column("attachments").value(0), "FSN (https://example.test/fsn.pdf); Letter");
        assert!(column("broadcast_content").is_null(0));
    }

    #[tokio::test]
    async fn report_lists_the_latest_runs_first() {
        let dir = tempdir().expect("tempdir");
        let writer = ReportWriter::new(dir.path());
        let older = run(Utc.with_ymd_and_hms(2024, 3, 13, 7, 0, 0).single().unwrap(), vec![]);
        let newer = run(Utc.with_ymd_and_hms(2024, 3, 14, 7, 0, 0).single().unwrap(), vec![]);
        writer.write_run(&newer, &[], &[], &[]).await.unwrap();
        writer.write_run(&older, &[], &[], &[]).await.unwrap();

        let markdown = report_daily_markdown(5, dir.path()).unwrap();
        let newer_at = markdown.find(&newer.run_id.to_string()).unwrap();
        let older_at = markdown.find(&older.run_id.to_string()).unwrap();
        assert!(newer_at < older_at);

        let only_latest = report_daily_markdown(1, dir.path()).unwrap();
        assert!(!only_latest.contains(&older.run_id.to_string()));
    }
}
