use std::path::{Path, PathBuf};

use alertwatch_core::{AlertRecord, ChangeEntry, ExistingRecords, PersistenceSink};
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;
use uuid::Uuid;

const LEDGER_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct LedgerFile {
    schema_version: u32,
    records: Vec<AlertRecord>,
}

/// File-backed canonical set: `alerts.json` holds the ordered record list and
/// `changes.jsonl` accumulates every change entry ever written.
#[derive(Debug, Clone)]
pub struct JsonLedgerStore {
    root: PathBuf,
}

impl JsonLedgerStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.root.join("alerts.json")
    }

    pub fn changes_path(&self) -> PathBuf {
        self.root.join("changes.jsonl")
    }

    async fn replace_ledger(&self, merged: &[AlertRecord]) -> anyhow::Result<()> {
        let ledger = LedgerFile {
            schema_version: LEDGER_SCHEMA_VERSION,
            records: merged.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&ledger).context("serializing alert ledger")?;
        let target = self.ledger_path();
        let temp = self.root.join(format!(".alerts.{}.tmp", Uuid::new_v4()));
        fs::write(&temp, bytes)
            .await
            .with_context(|| format!("writing {}", temp.display()))?;
        fs::rename(&temp, &target)
            .await
            .with_context(|| format!("renaming {} -> {}", temp.display(), target.display()))?;
        Ok(())
    }

    async fn append_changes(&self, report: &[ChangeEntry]) -> anyhow::Result<()> {
        let path = self.changes_path();
        let mut lines = Vec::new();
        for entry in report {
            serde_json::to_writer(&mut lines, entry).context("serializing change entry")?;
            lines.push(b'\n');
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        file.write_all(&lines)
            .await
            .with_context(|| format!("appending to {}", path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing {}", path.display()))?;
        Ok(())
    }
}

async fn read_ledger(path: &Path) -> anyhow::Result<Vec<AlertRecord>> {
    if !fs::try_exists(path)
        .await
        .with_context(|| format!("checking {}", path.display()))?
    {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let ledger: LedgerFile =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    anyhow::ensure!(
        ledger.schema_version == LEDGER_SCHEMA_VERSION,
        "unsupported ledger schema version {} in {}",
        ledger.schema_version,
        path.display()
    );
    Ok(ledger.records)
}

#[async_trait]
impl ExistingRecords for JsonLedgerStore {
    async fn load_existing(&self) -> anyhow::Result<Vec<AlertRecord>> {
        let records = read_ledger(&self.ledger_path()).await?;
        info!(count = records.len(), path = %self.ledger_path().display(), "loaded existing alerts");
        Ok(records)
    }
}

#[async_trait]
impl PersistenceSink for JsonLedgerStore {
    async fn write(&self, merged: &[AlertRecord], report: &[ChangeEntry]) -> anyhow::Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating {}", self.root.display()))?;
        self.replace_ledger(merged).await?;
        self.append_changes(report).await?;
        info!(records = merged.len(), changes = report.len(), "ledger written");
        Ok(())
    }
}
