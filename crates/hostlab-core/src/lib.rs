use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

pub mod error;
pub mod index;
pub mod suite;
pub mod summary;

pub use error::{HostlabError, Result};
pub use index::{ResultSet, ResultSetIndex, ResultSetSnapshot};
pub use suite::SuiteRegistry;
pub use summary::{AttributeGroup, DescriptorAttributes, ResultSummary};

pub const RESULTS_BASE_PATH: &str = "../results";
pub const TEST_RESULT_XML: &str = "test_result.xml";
pub const LOG_RESULT_XML: &str = "log-result.xml";
/// Alias the test runner keeps pointing at its most recent result set.
pub const LATEST_RESULT_ALIAS: &str = "latest";

pub const GCS_SCHEME_PREFIX: &str = "gs://";
pub const RESULT_ARCHIVE_SUFFIX: &str = ".zip";

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).map_err(|e| HostlabError::io(format!("open {}", path.display()), e))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .map_err(|e| HostlabError::io(format!("read {}", path.display()), e))?;
    Ok(sha256_bytes(&buf))
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .map_err(|e| HostlabError::io(format!("create {}", path.display()), e))
}

/// Final path component of a `/`-separated locator (local or `gs://`).
pub fn locator_basename(locator: &str) -> &str {
    locator
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(locator)
}

/// Runs `cmd` to completion; a non-zero exit becomes an error carrying the
/// trimmed stderr (or stdout) prefixed with `step`.
pub fn run_checked_command(mut cmd: Command, step: &str) -> std::io::Result<Output> {
    let out = cmd.output().map_err(|e| {
        std::io::Error::new(e.kind(), format!("{}: failed to launch: {}", step, e))
    })?;
    if out.status.success() {
        return Ok(out);
    }
    let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&out.stdout).trim().to_string();
    let detail = if !stderr.is_empty() {
        stderr
    } else if !stdout.is_empty() {
        stdout
    } else {
        format!("command exited with {}", out.status)
    };
    Err(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("{}: {}", step, detail),
    ))
}

/// Scratch directory under the system temp dir, removed on drop.
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub fn new(label: &str) -> Result<Self> {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let path = std::env::temp_dir().join(format!(
            "hostlab_{}_{}_{}",
            label,
            std::process::id(),
            nanos
        ));
        ensure_dir(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}
