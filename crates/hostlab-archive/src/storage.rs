use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

use hostlab_core::run_checked_command;

pub const GSUTIL_BINARY: &str = "gsutil";

/// Object-storage client the archive layer talks to. Locators are full
/// `gs://bucket/path` strings.
pub trait CloudStorage {
    /// Path of the storage tool, or `None` when it is not installed.
    fn tool_path(&self) -> Option<PathBuf>;

    fn is_remote_file(&self, tool: &Path, locator: &str) -> bool;

    /// Object locators directly under `locator`; empty on failure.
    fn list(&self, tool: &Path, locator: &str) -> Vec<String>;

    fn copy(&self, tool: &Path, src: &str, dest_dir: &Path) -> bool;

    fn upload(&self, tool: &Path, local: &Path, dest: &str) -> bool;
}

#[derive(Debug, Clone, Default)]
pub struct Gsutil {
    explicit: Option<PathBuf>,
}

impl Gsutil {
    pub fn new(explicit: Option<PathBuf>) -> Self {
        Self { explicit }
    }
}

impl CloudStorage for Gsutil {
    fn tool_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.explicit {
            return path.is_file().then(|| path.clone());
        }
        find_on_path(GSUTIL_BINARY)
    }

    fn is_remote_file(&self, tool: &Path, locator: &str) -> bool {
        let mut cmd = Command::new(tool);
        cmd.args(["-q", "stat", locator]);
        match run_checked_command(cmd, "gsutil stat") {
            Ok(_) => true,
            Err(err) => {
                tracing::debug!(locator, error = %err, "remote object not found");
                false
            }
        }
    }

    fn list(&self, tool: &Path, locator: &str) -> Vec<String> {
        let mut cmd = Command::new(tool);
        cmd.args(["ls", locator]);
        match run_checked_command(cmd, "gsutil ls") {
            Ok(out) => String::from_utf8_lossy(&out.stdout)
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
            Err(err) => {
                tracing::error!(locator, error = %err, "listing failed");
                Vec::new()
            }
        }
    }

    fn copy(&self, tool: &Path, src: &str, dest_dir: &Path) -> bool {
        let mut cmd = Command::new(tool);
        cmd.arg("cp").arg(src).arg(dest_dir);
        match run_checked_command(cmd, "gsutil cp") {
            Ok(_) => true,
            Err(err) => {
                tracing::error!(src, dest = %dest_dir.display(), error = %err, "copy failed");
                false
            }
        }
    }

    fn upload(&self, tool: &Path, local: &Path, dest: &str) -> bool {
        let mut cmd = Command::new(tool);
        cmd.arg("cp").arg(local).arg(dest);
        match run_checked_command(cmd, "gsutil cp") {
            Ok(_) => true,
            Err(err) => {
                tracing::error!(src = %local.display(), dest, error = %err, "upload failed");
                false
            }
        }
    }
}

fn find_on_path(binary: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_missing_tool_is_unavailable() {
        let storage = Gsutil::new(Some(PathBuf::from("/definitely/not/here/gsutil")));
        assert_eq!(storage.tool_path(), None);
    }

    #[cfg(unix)]
    #[test]
    fn shell_is_found_on_path() {
        assert!(find_on_path("sh").is_some());
        assert!(find_on_path("hostlab-no-such-binary").is_none());
    }
}
