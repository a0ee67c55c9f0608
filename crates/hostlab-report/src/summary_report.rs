use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use hostlab_core::summary::{
    END_TIME_ATTR_KEY, SUITE_BUILD_NUM_ATTR_KEY, SUITE_VERSION_ATTR_KEY, START_TIME_ATTR_KEY,
    SYSTEM_FINGERPRINT_ATTR_KEY, VENDOR_FINGERPRINT_ATTR_KEY,
};
use hostlab_core::ResultSetIndex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const SUITE_REPORT_SCHEMA_VERSION: &str = "suite_report_v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteReport {
    pub schema_version: String,
    pub result_set: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Build under test, from the fetch that staged it; unrelated to
    /// `suite_build_number`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_id: Option<String>,
    pub suite_name: String,
    pub suite_plan: String,
    pub suite_version: String,
    pub suite_build_number: String,
    /// Epoch milliseconds as recorded by the suite.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
    pub host_name: String,
    pub build_system_fingerprint: String,
    pub build_vendor_fingerprint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passed_test_case_count: Option<u64>,
    pub failed_test_case_count: u64,
    pub modules_total: u64,
    pub modules_done: u64,
}

fn epoch_millis(raw: &str) -> Option<i64> {
    raw.trim().parse::<i64>().ok()
}

fn rfc3339(millis: Option<i64>) -> Option<String> {
    millis
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .map(|ts| ts.to_rfc3339())
}

impl SuiteReport {
    /// Report for the lexicographically last result set under `index`.
    pub fn from_result_set(index: &ResultSetIndex) -> Result<Self> {
        let snapshot = index.require_snapshot()?;
        let name = snapshot
            .sorted()
            .pop()
            .context("results root has no result sets")?;
        let summary = index
            .result_set(&name)
            .summary()
            .with_context(|| format!("summarize result set {}", name))?;
        let result = &summary.attributes.result;
        let build = &summary.attributes.build;
        let start_time = epoch_millis(result.get(START_TIME_ATTR_KEY));
        let end_time = epoch_millis(result.get(END_TIME_ATTR_KEY));
        Ok(Self {
            schema_version: SUITE_REPORT_SCHEMA_VERSION.to_string(),
            result_set: name,
            result_path: None,
            branch: None,
            target: None,
            build_id: None,
            suite_name: summary.suite_name().to_string(),
            suite_plan: summary.suite_plan.clone(),
            suite_version: result.get(SUITE_VERSION_ATTR_KEY).to_string(),
            suite_build_number: result.get(SUITE_BUILD_NUM_ATTR_KEY).to_string(),
            start_time,
            end_time,
            started_at: rfc3339(start_time),
            ended_at: rfc3339(end_time),
            host_name: summary.host_name().to_string(),
            build_system_fingerprint: build.get(SYSTEM_FINGERPRINT_ATTR_KEY).to_string(),
            build_vendor_fingerprint: build.get(VENDOR_FINGERPRINT_ATTR_KEY).to_string(),
            passed_test_case_count: summary.passed_count,
            failed_test_case_count: summary.failed_count,
            modules_total: summary.modules_total,
            modules_done: summary.modules_done,
        })
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_vec_pretty(self)?)
            .with_context(|| format!("write report {}", path.display()))
    }
}
