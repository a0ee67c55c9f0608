use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{HostlabError, Result};
use crate::RESULTS_BASE_PATH;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SuiteRegistry {
    suites: BTreeMap<String, PathBuf>,
}

impl SuiteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, suite: impl Into<String>, launcher: impl Into<PathBuf>) {
        self.suites.insert(suite.into(), launcher.into());
    }

    pub fn is_empty(&self) -> bool {
        self.suites.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.suites.keys().map(String::as_str)
    }

    pub fn launcher(&self, suite: &str) -> Result<&Path> {
        self.suites
            .get(suite)
            .map(PathBuf::as_path)
            .ok_or_else(|| HostlabError::UnknownSuite {
                suite: suite.to_string(),
                registered: if self.suites.is_empty() {
                    "none".to_string()
                } else {
                    self.names().collect::<Vec<_>>().join(", ")
                },
            })
    }

    /// `<launcher dir>/../results`, where the suite writes its result sets.
    pub fn results_root(&self, suite: &str) -> Result<PathBuf> {
        let launcher = self.launcher(suite)?;
        let tools_dir = launcher.parent().unwrap_or_else(|| Path::new("."));
        Ok(tools_dir.join(RESULTS_BASE_PATH))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results_root_is_sibling_of_tools_dir() {
        let mut registry = SuiteRegistry::new();
        registry.register("vts", "/opt/android-vts/tools/vts-tradefed");
        assert_eq!(
            registry.results_root("vts").expect("vts is registered"),
            PathBuf::from("/opt/android-vts/tools/../results")
        );
    }

    #[test]
    fn unknown_suite_lists_registered_names() {
        let mut registry = SuiteRegistry::new();
        registry.register("vts", "/opt/android-vts/tools/vts-tradefed");
        registry.register("cts", "/opt/android-cts/tools/cts-tradefed");
        let err = registry.launcher("gts").expect_err("gts is not registered");
        assert_eq!(err.kind(), "unknown_suite");
        assert!(err.to_string().contains("cts, vts"), "{}", err);
    }
}
