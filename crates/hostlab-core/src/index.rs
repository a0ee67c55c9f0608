use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{HostlabError, Result};
use crate::summary::ResultSummary;
use crate::{LATEST_RESULT_ALIAS, TEST_RESULT_XML};

#[derive(Debug, Clone)]
pub struct ResultSetIndex {
    root: PathBuf,
}

/// Directory names seen at one point in time, in enumeration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSetSnapshot {
    names: Vec<String>,
    known: HashSet<String>,
}

impl ResultSetSnapshot {
    pub fn from_names(names: Vec<String>) -> Self {
        let known = names.iter().cloned().collect();
        Self { names, known }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.known.contains(name)
    }

    /// Records a newly detected result set. Returns false if already tracked.
    pub fn track(&mut self, name: String) -> bool {
        if !self.known.insert(name.clone()) {
            return false;
        }
        self.names.push(name);
        true
    }

    pub fn sorted(&self) -> Vec<String> {
        let mut names = self.names.clone();
        names.sort();
        names
    }

    /// Lexicographic rank of `name`; this is the session id the test runner
    /// uses for that result set.
    pub fn session_id_of(&self, name: &str) -> Option<usize> {
        self.sorted().iter().position(|n| n == name)
    }

    pub fn lexicographically_last(&self) -> Option<&str> {
        self.names.iter().max().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultSet {
    pub directory_name: String,
    pub path: PathBuf,
}

impl ResultSet {
    pub fn descriptor_path(&self) -> PathBuf {
        self.path.join(TEST_RESULT_XML)
    }

    /// Parses the descriptor on every call.
    pub fn summary(&self) -> Result<ResultSummary> {
        ResultSummary::from_path(&self.descriptor_path())
    }
}

impl ResultSetIndex {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn result_set(&self, directory_name: &str) -> ResultSet {
        ResultSet {
            directory_name: directory_name.to_string(),
            path: self.root.join(directory_name),
        }
    }

    /// Eligible directory names in enumeration order. A missing root lists
    /// as empty.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .follow_links(false)
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) if err.depth() == 0 && is_not_found(&err) => return Ok(Vec::new()),
                Err(err) => {
                    let context = format!("listing results root {}", self.root.display());
                    return Err(match err.into_io_error() {
                        Some(io) => HostlabError::io(context, io),
                        None => HostlabError::io(
                            context,
                            std::io::Error::new(ErrorKind::Other, "filesystem loop"),
                        ),
                    });
                }
            };
            if entry.path_is_symlink() || !entry.file_type().is_dir() {
                continue;
            }
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        Ok(names)
    }

    pub fn snapshot(&self) -> Result<ResultSetSnapshot> {
        Ok(ResultSetSnapshot::from_names(self.list()?))
    }

    /// Like [`snapshot`](Self::snapshot) but an empty root is an error.
    pub fn require_snapshot(&self) -> Result<ResultSetSnapshot> {
        let snapshot = self.snapshot()?;
        if snapshot.is_empty() {
            return Err(HostlabError::NoResultSetsFound(self.root.clone()));
        }
        Ok(snapshot)
    }

    /// First eligible directory not present in `known`.
    pub fn detect_new(&self, known: &ResultSetSnapshot) -> Result<Option<String>> {
        Ok(self.list()?.into_iter().find(|name| !known.contains(name)))
    }

    pub fn latest_alias_descriptor(&self) -> PathBuf {
        self.root.join(LATEST_RESULT_ALIAS).join(TEST_RESULT_XML)
    }

    /// Descriptor of the most recent result set: the `latest` alias when it
    /// exists, else the lexicographically last directory.
    pub fn latest_descriptor(&self, snapshot: &ResultSetSnapshot) -> Option<PathBuf> {
        let alias = self.latest_alias_descriptor();
        if alias.exists() {
            return Some(alias);
        }
        snapshot
            .lexicographically_last()
            .map(|name| self.result_set(name).descriptor_path())
    }
}

fn is_not_found(err: &walkdir::Error) -> bool {
    err.io_error()
        .map(|io| io.kind() == ErrorKind::NotFound)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    struct TempDirGuard {
        path: PathBuf,
    }

    impl TempDirGuard {
        fn new(label: &str) -> Self {
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("time should be monotonic")
                .as_nanos();
            let path = std::env::temp_dir().join(format!(
                "hostlab_index_{}_{}_{}",
                label,
                std::process::id(),
                nanos
            ));
            fs::create_dir_all(&path).expect("temp dir");
            Self { path }
        }
    }

    impl Drop for TempDirGuard {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_and_files_are_not_result_sets() {
        let tmp = TempDirGuard::new("symlink");
        fs::create_dir(tmp.path.join("A")).expect("dir A");
        std::os::unix::fs::symlink(tmp.path.join("A"), tmp.path.join("B")).expect("link B");
        fs::write(tmp.path.join("C.txt"), "not a result").expect("file C");

        let index = ResultSetIndex::new(&tmp.path);
        assert_eq!(index.list().expect("list"), vec!["A".to_string()]);
    }

    #[test]
    fn missing_root_lists_empty_and_require_snapshot_fails() {
        let tmp = TempDirGuard::new("missing");
        let index = ResultSetIndex::new(tmp.path.join("results"));
        assert!(index.list().expect("list").is_empty());
        let err = index
            .require_snapshot()
            .expect_err("empty root must be rejected");
        assert_eq!(err.kind(), "no_result_sets_found");
    }

    #[test]
    fn session_id_is_lexicographic_rank() {
        let snapshot = ResultSetSnapshot::from_names(vec![
            "2018.06.11_10.00.00".to_string(),
            "2018.06.09_08.00.00".to_string(),
            "2018.06.10_09.00.00".to_string(),
        ]);
        assert_eq!(snapshot.session_id_of("2018.06.09_08.00.00"), Some(0));
        assert_eq!(snapshot.session_id_of("2018.06.11_10.00.00"), Some(2));
        assert_eq!(snapshot.session_id_of("absent"), None);
        assert_eq!(
            snapshot.lexicographically_last(),
            Some("2018.06.11_10.00.00")
        );
    }

    #[test]
    fn detect_new_skips_known_directories() {
        let tmp = TempDirGuard::new("detect");
        fs::create_dir(tmp.path.join("2018.06.09_08.00.00")).expect("first");
        let index = ResultSetIndex::new(&tmp.path);
        let mut snapshot = index.snapshot().expect("snapshot");
        assert_eq!(index.detect_new(&snapshot).expect("detect"), None);

        fs::create_dir(tmp.path.join("2018.06.09_09.00.00")).expect("second");
        let found = index.detect_new(&snapshot).expect("detect");
        assert_eq!(found.as_deref(), Some("2018.06.09_09.00.00"));
        assert!(snapshot.track("2018.06.09_09.00.00".to_string()));
        assert!(!snapshot.track("2018.06.09_09.00.00".to_string()));
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn latest_alias_wins_over_last_directory() {
        let tmp = TempDirGuard::new("alias");
        fs::create_dir(tmp.path.join("2018.06.09_08.00.00")).expect("first");
        fs::create_dir(tmp.path.join("2018.06.10_08.00.00")).expect("second");
        let index = ResultSetIndex::new(&tmp.path);
        let snapshot = index.snapshot().expect("snapshot");
        assert_eq!(
            index.latest_descriptor(&snapshot),
            Some(tmp.path.join("2018.06.10_08.00.00").join(TEST_RESULT_XML))
        );

        fs::create_dir(tmp.path.join(LATEST_RESULT_ALIAS)).expect("alias");
        fs::write(
            tmp.path.join(LATEST_RESULT_ALIAS).join(TEST_RESULT_XML),
            "<Result/>",
        )
        .expect("alias descriptor");
        assert_eq!(
            index.latest_descriptor(&snapshot),
            Some(index.latest_alias_descriptor())
        );
    }
}
