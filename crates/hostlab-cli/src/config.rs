use anyhow::{anyhow, Context, Result};
use hostlab_core::SuiteRegistry;
use hostlab_report::sheet::DEFAULT_MAX_ROWS;
use hostlab_runner::DEFAULT_ACCESS_POINT;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "hostlab.yaml";
pub const DEFAULT_MAX_PARALLEL: usize = 4;

const ANDROID_SERIAL_ENV: &str = "ANDROID_SERIAL";
const HOSTLAB_GSUTIL_ENV: &str = "HOSTLAB_GSUTIL";
const HOSTLAB_MAX_PARALLEL_ENV: &str = "HOSTLAB_MAX_PARALLEL";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsoleConfig {
    /// Suite name to launcher binary, e.g. `vts: /opt/android-vts/tools/vts-tradefed`.
    pub suites: SuiteRegistry,
    pub serials: Vec<String>,
    pub gsutil: Option<PathBuf>,
    pub wifi_ap: String,
    pub sheet_max_rows: usize,
    pub max_parallel: usize,
    pub journal_dir: Option<PathBuf>,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            suites: SuiteRegistry::new(),
            serials: Vec::new(),
            gsutil: None,
            wifi_ap: DEFAULT_ACCESS_POINT.to_string(),
            sheet_max_rows: DEFAULT_MAX_ROWS,
            max_parallel: DEFAULT_MAX_PARALLEL,
            journal_dir: None,
        }
    }
}

/// Reads `path`, or `hostlab.yaml` in the working directory when no path is
/// given. A missing default file yields the defaults; a missing explicit
/// file is an error. Environment overrides apply last.
pub fn load_config(path: Option<&Path>) -> Result<ConsoleConfig> {
    let mut config = match path {
        Some(path) => parse_config_file(path)?,
        None => {
            let default_path = Path::new(DEFAULT_CONFIG_FILE);
            if default_path.is_file() {
                parse_config_file(default_path)?
            } else {
                ConsoleConfig::default()
            }
        }
    };
    apply_env_overrides(&mut config, |name| env::var(name).ok())?;
    Ok(config)
}

fn parse_config_file(path: &Path) -> Result<ConsoleConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(ConsoleConfig::default());
    }
    let config: ConsoleConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    if config.max_parallel == 0 {
        return Err(anyhow!("max_parallel must be > 0 in {}", path.display()));
    }
    Ok(config)
}

pub fn apply_env_overrides(
    config: &mut ConsoleConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if config.serials.is_empty() {
        if let Some(serial) = lookup(ANDROID_SERIAL_ENV).filter(|s| !s.trim().is_empty()) {
            config.serials.push(serial.trim().to_string());
        }
    }
    if let Some(gsutil) = lookup(HOSTLAB_GSUTIL_ENV).filter(|s| !s.trim().is_empty()) {
        config.gsutil = Some(PathBuf::from(gsutil.trim()));
    }
    if let Some(max_parallel) =
        parse_optional_positive_usize(HOSTLAB_MAX_PARALLEL_ENV, lookup(HOSTLAB_MAX_PARALLEL_ENV))?
    {
        config.max_parallel = max_parallel;
    }
    Ok(())
}

fn parse_optional_positive_usize(name: &str, raw: Option<String>) -> Result<Option<usize>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let parsed = trimmed.parse::<usize>().map_err(|_| {
        anyhow!(
            "{} must be a positive integer when set (got: {})",
            name,
            raw
        )
    })?;
    if parsed == 0 {
        return Err(anyhow!("{} must be > 0 when set", name));
    }
    Ok(Some(parsed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostlab_core::ScratchDir;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn yaml_fields_and_defaults() {
        let scratch = ScratchDir::new("config").expect("scratch");
        let path = scratch.path().join("hostlab.yaml");
        fs::write(
            &path,
            "suites:\n  vts: /opt/android-vts/tools/vts-tradefed\nserials: [S1, S2]\njournal_dir: /var/lib/hostlab\n",
        )
        .expect("config");
        let config = parse_config_file(&path).expect("parse");
        assert_eq!(
            config.suites.launcher("vts").expect("vts"),
            Path::new("/opt/android-vts/tools/vts-tradefed")
        );
        assert_eq!(config.serials, vec!["S1", "S2"]);
        assert_eq!(config.wifi_ap, "GoogleGuest");
        assert_eq!(config.sheet_max_rows, 30000);
        assert_eq!(config.max_parallel, 4);
        assert_eq!(config.journal_dir, Some(PathBuf::from("/var/lib/hostlab")));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let scratch = ScratchDir::new("config_unknown").expect("scratch");
        let path = scratch.path().join("hostlab.yaml");
        fs::write(&path, "sutes: {}\n").expect("config");
        assert!(parse_config_file(&path).is_err());
    }

    #[test]
    fn env_overrides_fill_serial_and_validate_parallelism() {
        let mut config = ConsoleConfig::default();
        apply_env_overrides(
            &mut config,
            lookup_from(&[
                ("ANDROID_SERIAL", "HT7A1B"),
                ("HOSTLAB_GSUTIL", "/usr/local/bin/gsutil"),
                ("HOSTLAB_MAX_PARALLEL", "8"),
            ]),
        )
        .expect("overrides");
        assert_eq!(config.serials, vec!["HT7A1B"]);
        assert_eq!(config.gsutil, Some(PathBuf::from("/usr/local/bin/gsutil")));
        assert_eq!(config.max_parallel, 8);

        let mut config = ConsoleConfig {
            serials: vec!["S1".to_string()],
            ..ConsoleConfig::default()
        };
        apply_env_overrides(&mut config, lookup_from(&[("ANDROID_SERIAL", "HT7A1B")]))
            .expect("overrides");
        assert_eq!(config.serials, vec!["S1"]);

        let err = apply_env_overrides(
            &mut ConsoleConfig::default(),
            lookup_from(&[("HOSTLAB_MAX_PARALLEL", "0")]),
        )
        .expect_err("zero is rejected");
        assert!(err.to_string().contains("must be > 0"));
        let err = apply_env_overrides(
            &mut ConsoleConfig::default(),
            lookup_from(&[("HOSTLAB_MAX_PARALLEL", "many")]),
        )
        .expect_err("non-numeric is rejected");
        assert!(err.to_string().contains("positive integer"));
    }
}
