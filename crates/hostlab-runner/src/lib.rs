use anyhow::Result;
use chrono::Utc;
use hostlab_archive::{fetch_and_extract, CloudStorage};
use hostlab_core::{
    HostlabError, ResultSetIndex, ResultSetSnapshot, ResultSummary, SuiteRegistry,
};
use std::path::PathBuf;

pub mod cleanup;
pub mod invocation;
pub mod sink;

pub use cleanup::{
    cleanup_devices, AdbDeviceCommander, CleanupReport, CleanupStep, DeviceCommander,
    DEFAULT_ACCESS_POINT,
};
pub use invocation::{RetryInvocation, Sharding};
pub use sink::{
    JsonlRetrySink, NullRetrySink, RetryDecision, RetryIterationRecord, RetrySessionManifest,
    RetrySink, RETRY_SESSION_SCHEMA_VERSION,
};

pub const DEFAULT_SUITE: &str = "vts";
pub const DEFAULT_RETRY_COUNT: usize = 30;
pub const DEFAULT_FORCE_RETRY_COUNT: usize = 3;

pub trait TestRunner {
    fn dispatch(&mut self, invocation: &RetryInvocation) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOptions {
    pub suite: String,
    pub retry_count: usize,
    pub force_retry_count: usize,
    /// `gs://…/*.zip` bundle to retry instead of the newest local result set.
    pub result_from_gcs: Option<String>,
    pub serials: Vec<String>,
    pub shards: Option<u32>,
    pub shard_count: Option<u32>,
    pub cleanup_devices: bool,
    pub access_point: String,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            suite: DEFAULT_SUITE.to_string(),
            retry_count: DEFAULT_RETRY_COUNT,
            force_retry_count: DEFAULT_FORCE_RETRY_COUNT,
            result_from_gcs: None,
            serials: Vec::new(),
            shards: None,
            shard_count: None,
            cleanup_devices: false,
            access_point: DEFAULT_ACCESS_POINT.to_string(),
        }
    }
}

pub struct RetryCollaborators<'a> {
    pub runner: &'a mut dyn TestRunner,
    pub storage: &'a dyn CloudStorage,
    pub devices: &'a mut dyn DeviceCommander,
    pub sink: &'a mut dyn RetrySink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOutcome {
    pub dispatches: usize,
    pub last_session_id: Option<usize>,
    /// The stopping rule fired before `retry_count` dispatches.
    pub stopped_early: bool,
    /// Directory name of the last evaluated or detected result set.
    pub final_baseline: String,
}

/// Stop once the forced retries are done and the evaluated run ran every
/// module without failures.
pub fn should_stop(iteration: usize, force_retry_count: usize, summary: &ResultSummary) -> bool {
    iteration >= force_retry_count && summary.is_complete_pass()
}

struct RetrySession {
    index: ResultSetIndex,
    former_results: ResultSetSnapshot,
    /// Result sets present when the command started; `track` does not change it.
    former_result_count: usize,
    current: String,
    /// Supplied bundle and its session id; consumed by the first iteration.
    supplied: Option<(String, usize)>,
}

impl RetrySession {
    /// Baseline directory and descriptor for the next evaluation, plus the
    /// session id a retry of it would use.
    fn next_baseline(&mut self, iteration: usize) -> (String, PathBuf, usize) {
        if let Some((name, session_id)) = self.supplied.take() {
            let descriptor = self.index.result_set(&name).descriptor_path();
            return (name, descriptor, session_id);
        }
        let session_id = self.former_result_count - 1 + iteration;
        let alias = self.index.latest_alias_descriptor();
        if alias.exists() {
            return (
                hostlab_core::LATEST_RESULT_ALIAS.to_string(),
                alias,
                session_id,
            );
        }
        let descriptor = self.index.result_set(&self.current).descriptor_path();
        (self.current.clone(), descriptor, session_id)
    }

    fn reindex(&mut self) -> Result<Option<String>> {
        let found = self.index.detect_new(&self.former_results)?;
        if let Some(name) = &found {
            self.former_results.track(name.clone());
            self.current = name.clone();
        }
        Ok(found)
    }
}

pub fn run_retry(
    suites: &SuiteRegistry,
    options: &RetryOptions,
    collaborators: RetryCollaborators<'_>,
) -> Result<RetryOutcome> {
    let RetryCollaborators {
        runner,
        storage,
        devices,
        sink,
    } = collaborators;
    let started_at = Utc::now().to_rfc3339();

    let results_root = suites.results_root(&options.suite)?;
    let index = ResultSetIndex::new(&results_root);

    let mut bundle_digest = None;
    let mut supplied_dir = None;
    if let Some(locator) = &options.result_from_gcs {
        let extracted = fetch_and_extract(storage, locator, &results_root)?;
        tracing::info!(
            locator = %locator,
            directory = %extracted.directory_name,
            "retrying supplied result bundle"
        );
        bundle_digest = Some(extracted.archive_digest);
        supplied_dir = Some(extracted.directory_name);
    }

    let former_results = index.require_snapshot()?;
    let supplied = match supplied_dir {
        Some(name) => {
            let session_id = former_results.session_id_of(&name).ok_or_else(|| {
                HostlabError::NotAResultArchive {
                    path: results_root.join(&name),
                    reason: "extracted bundle is not a result-set directory".to_string(),
                }
            })?;
            Some((name, session_id))
        }
        None => None,
    };
    let current = former_results
        .lexicographically_last()
        .unwrap_or_default()
        .to_string();

    sink.write_session_manifest(&RetrySessionManifest {
        schema_version: RETRY_SESSION_SCHEMA_VERSION.to_string(),
        started_at: started_at.clone(),
        suite: options.suite.clone(),
        results_root: results_root.display().to_string(),
        retry_count: options.retry_count,
        force_retry_count: options.force_retry_count,
        cleanup_devices: options.cleanup_devices,
        serials: options.serials.clone(),
        supplied_bundle: options.result_from_gcs.clone(),
        bundle_digest,
        former_results: former_results.names().to_vec(),
    })?;

    let mut session = RetrySession {
        index,
        former_result_count: former_results.len(),
        former_results,
        current,
        supplied,
    };
    let sharding = Sharding::resolve(options.shards, options.shard_count);
    let mut outcome = RetryOutcome {
        dispatches: 0,
        last_session_id: None,
        stopped_early: false,
        final_baseline: session.current.clone(),
    };

    for iteration in 0..options.retry_count {
        let (baseline, descriptor, session_id) = session.next_baseline(iteration);
        let summary = ResultSummary::from_path(&descriptor)?;
        outcome.final_baseline = baseline.clone();

        let mut record = RetryIterationRecord {
            session_started_at: started_at.clone(),
            recorded_at: String::new(),
            suite: options.suite.clone(),
            iteration,
            baseline: baseline.clone(),
            failed_count: summary.failed_count,
            skipped_modules: summary.skipped_modules(),
            passed_count: summary.passed_count,
            decision: RetryDecision::Continue,
            session_id: None,
            dispatch_error: None,
            new_result_set: None,
        };

        if should_stop(iteration, options.force_retry_count, &summary) {
            tracing::info!(
                iteration,
                remaining = options.retry_count - iteration,
                "all modules have run and passed; skipping remaining retries"
            );
            record.decision = RetryDecision::Stop;
            record.recorded_at = Utc::now().to_rfc3339();
            sink.append_iteration(&record)?;
            outcome.stopped_early = true;
            break;
        }

        if options.cleanup_devices {
            let report = cleanup_devices(devices, &options.serials, &options.access_point);
            if !report.all_succeeded() {
                tracing::warn!(iteration, "device cleanup did not complete on every serial");
            }
        }

        let invocation = RetryInvocation::new(&options.suite, &summary.suite_plan, session_id)
            .with_sharding(sharding)
            .with_serials(&options.serials);
        tracing::info!(
            iteration,
            session_id,
            baseline = %baseline,
            failed = summary.failed_count,
            skipped_modules = summary.skipped_modules(),
            command = %invocation,
            "dispatching retry"
        );
        if let Err(err) = runner.dispatch(&invocation) {
            tracing::warn!(iteration, session_id, error = %err, "retry dispatch reported an error");
            record.dispatch_error = Some(format!("{:#}", err));
        }
        outcome.dispatches += 1;
        outcome.last_session_id = Some(session_id);
        record.session_id = Some(session_id);

        match session.reindex()? {
            Some(name) => {
                tracing::info!(iteration, result_set = %name, "detected new result set");
                outcome.final_baseline = name.clone();
                record.new_result_set = Some(name);
            }
            None => {
                tracing::warn!(iteration, "retry produced no new result set");
            }
        }
        record.recorded_at = Utc::now().to_rfc3339();
        sink.append_iteration(&record)?;
    }

    sink.flush()?;
    Ok(outcome)
}
