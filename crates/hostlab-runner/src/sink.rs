use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const RETRY_JOURNAL_FILE: &str = "retry_journal.jsonl";
const RETRY_SESSION_MANIFEST_FILE: &str = "retry_session.json";
pub const RETRY_SESSION_SCHEMA_VERSION: &str = "retry_session_v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySessionManifest {
    pub schema_version: String,
    pub started_at: String,
    pub suite: String,
    pub results_root: String,
    pub retry_count: usize,
    pub force_retry_count: usize,
    pub cleanup_devices: bool,
    pub serials: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supplied_bundle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_digest: Option<String>,
    pub former_results: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryDecision {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryIterationRecord {
    pub session_started_at: String,
    pub recorded_at: String,
    pub suite: String,
    pub iteration: usize,
    pub baseline: String,
    pub failed_count: u64,
    pub skipped_modules: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passed_count: Option<u64>,
    pub decision: RetryDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatch_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_result_set: Option<String>,
}

pub trait RetrySink {
    fn write_session_manifest(&mut self, manifest: &RetrySessionManifest) -> Result<()>;
    fn append_iteration(&mut self, row: &RetryIterationRecord) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

pub struct JsonlRetrySink {
    manifest_path: PathBuf,
    journal_writer: BufWriter<File>,
}

impl JsonlRetrySink {
    pub fn new(journal_dir: &Path) -> Result<Self> {
        fs::create_dir_all(journal_dir)
            .with_context(|| format!("create journal dir {}", journal_dir.display()))?;
        Ok(Self {
            manifest_path: journal_dir.join(RETRY_SESSION_MANIFEST_FILE),
            journal_writer: open_append(journal_dir.join(RETRY_JOURNAL_FILE))?,
        })
    }
}

impl RetrySink for JsonlRetrySink {
    fn write_session_manifest(&mut self, manifest: &RetrySessionManifest) -> Result<()> {
        fs::write(&self.manifest_path, serde_json::to_vec_pretty(manifest)?)?;
        Ok(())
    }

    fn append_iteration(&mut self, row: &RetryIterationRecord) -> Result<()> {
        append_row(&mut self.journal_writer, row)
    }

    fn flush(&mut self) -> Result<()> {
        self.journal_writer.flush()?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct NullRetrySink;

impl RetrySink for NullRetrySink {
    fn write_session_manifest(&mut self, _manifest: &RetrySessionManifest) -> Result<()> {
        Ok(())
    }

    fn append_iteration(&mut self, _row: &RetryIterationRecord) -> Result<()> {
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

fn open_append(path: PathBuf) -> Result<BufWriter<File>> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open {}", path.display()))?;
    Ok(BufWriter::new(file))
}

fn append_row<T: Serialize>(writer: &mut BufWriter<File>, row: &T) -> Result<()> {
    serde_json::to_writer(&mut *writer, row)?;
    writer.write_all(b"\n")?;
    Ok(())
}
