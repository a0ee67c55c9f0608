use std::fs;
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};

use hostlab_core::{
    ensure_dir, locator_basename, sha256_file, HostlabError, Result, ScratchDir,
    GCS_SCHEME_PREFIX, LOG_RESULT_XML, RESULT_ARCHIVE_SUFFIX, TEST_RESULT_XML,
};
use zip::write::FileOptions;
use zip::ZipArchive;

pub mod storage;

pub use storage::{CloudStorage, Gsutil};

const RESULTS_ARCHIVE_PREFIX: &str = "results_";
const LOG_RESULT_ARCHIVE_PREFIX: &str = "log-result_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedResultSet {
    pub directory_name: String,
    pub archive_digest: String,
}

/// More than one entry and at least one entry naming the descriptor.
pub fn is_result_archive<R: Read + Seek>(archive: &mut ZipArchive<R>) -> bool {
    if archive.len() <= 1 {
        return false;
    }
    archive_entry_names(archive)
        .iter()
        .any(|name| name.contains(TEST_RESULT_XML))
}

fn archive_entry_names<R: Read + Seek>(archive: &mut ZipArchive<R>) -> Vec<String> {
    (0..archive.len())
        .filter_map(|idx| archive.by_index(idx).ok().map(|f| f.name().to_string()))
        .collect()
}

fn open_archive(path: &Path) -> Result<ZipArchive<fs::File>> {
    let file =
        fs::File::open(path).map_err(|e| HostlabError::io(format!("open {}", path.display()), e))?;
    ZipArchive::new(file).map_err(|e| HostlabError::NotAResultArchive {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Validates a local bundle and extracts it into `destination_dir`. Returns
/// the top-level directory of the bundle's first entry; a bundle whose first
/// entry is a loose file is rejected before anything is written.
pub fn extract_result_archive(archive_path: &Path, destination_dir: &Path) -> Result<String> {
    let mut archive = open_archive(archive_path)?;
    if !is_result_archive(&mut archive) {
        return Err(HostlabError::NotAResultArchive {
            path: archive_path.to_path_buf(),
            reason: format!(
                "expected more than one entry including {} ({} entries)",
                TEST_RESULT_XML,
                archive.len()
            ),
        });
    }
    let first = archive
        .by_index(0)
        .map(|f| f.name().to_string())
        .map_err(|e| HostlabError::NotAResultArchive {
            path: archive_path.to_path_buf(),
            reason: e.to_string(),
        })?;
    let mut components = first.split('/').filter(|part| !part.is_empty());
    let directory_name = components.next().unwrap_or_default().to_string();
    let inside_directory = first.ends_with('/') || components.next().is_some();
    if directory_name.is_empty() || !inside_directory {
        return Err(HostlabError::NotAResultArchive {
            path: archive_path.to_path_buf(),
            reason: format!(
                "first entry '{}' is not inside a top-level result directory",
                first
            ),
        });
    }

    ensure_dir(destination_dir)?;
    archive
        .extract(destination_dir)
        .map_err(|e| HostlabError::NotAResultArchive {
            path: archive_path.to_path_buf(),
            reason: format!("extraction into {} failed: {}", destination_dir.display(), e),
        })?;
    tracing::info!(
        archive = %archive_path.display(),
        destination = %destination_dir.display(),
        directory = %directory_name,
        "extracted result archive"
    );
    Ok(directory_name)
}

/// Downloads the bundle at `locator` and extracts it into `destination_dir`.
///
/// `locator` must name a single `gs://…/*.zip` object; picking an archive out
/// of a directory is the caller's business.
pub fn fetch_and_extract(
    storage: &dyn CloudStorage,
    locator: &str,
    destination_dir: &Path,
) -> Result<ExtractedResultSet> {
    let tool = storage.tool_path().ok_or_else(|| {
        HostlabError::ToolUnavailable("check that gsutil is installed and on PATH".to_string())
    })?;
    if !locator.starts_with(GCS_SCHEME_PREFIX) {
        return Err(HostlabError::invalid_locator(
            locator,
            format!("expected a {} url", GCS_SCHEME_PREFIX),
        ));
    }
    if !storage.is_remote_file(&tool, locator) {
        return Err(HostlabError::invalid_locator(locator, "no such remote object"));
    }
    if !locator.ends_with(RESULT_ARCHIVE_SUFFIX) {
        return Err(HostlabError::invalid_locator(
            locator,
            format!("expected a {} result archive", RESULT_ARCHIVE_SUFFIX),
        ));
    }

    let scratch = ScratchDir::new("fetch")?;
    let local = copy_to_scratch(storage, &tool, locator, &scratch)?;
    let archive_digest = sha256_file(&local)?;
    let directory_name = extract_result_archive(&local, destination_dir)?;
    Ok(ExtractedResultSet {
        directory_name,
        archive_digest,
    })
}

fn copy_to_scratch(
    storage: &dyn CloudStorage,
    tool: &Path,
    locator: &str,
    scratch: &ScratchDir,
) -> Result<PathBuf> {
    let local = scratch.path().join(locator_basename(locator));
    if !storage.copy(tool, locator, scratch.path()) || !local.is_file() {
        return Err(HostlabError::CopyFailed {
            src: locator.to_string(),
            dest: scratch.path().to_path_buf(),
        });
    }
    Ok(local)
}

/// Picks the archive to export out of a directory listing: `results_<id>.zip`
/// first, `log-result_<id>.zip` otherwise. Ties go to the lexicographically
/// first name.
pub fn select_result_archive(candidates: &[String]) -> Option<String> {
    for prefix in [RESULTS_ARCHIVE_PREFIX, LOG_RESULT_ARCHIVE_PREFIX] {
        let mut matches: Vec<&String> = candidates
            .iter()
            .filter(|c| {
                let base = locator_basename(c);
                base.starts_with(prefix) && base.ends_with(RESULT_ARCHIVE_SUFFIX)
            })
            .collect();
        if matches.is_empty() {
            continue;
        }
        matches.sort();
        if matches.len() > 1 {
            tracing::warn!(
                candidates = ?matches,
                chosen = %matches[0],
                "more than one {}*{} archive; using the first",
                prefix,
                RESULT_ARCHIVE_SUFFIX
            );
        }
        return Some(matches[0].clone());
    }
    None
}

/// Resolves a `gs://` file or directory locator to a local bundle copy in
/// `scratch`. Directory locators go through [`select_result_archive`].
pub fn fetch_bundle(
    storage: &dyn CloudStorage,
    locator: &str,
    scratch: &ScratchDir,
) -> Result<PathBuf> {
    let tool = storage.tool_path().ok_or_else(|| {
        HostlabError::ToolUnavailable("check that gsutil is installed and on PATH".to_string())
    })?;
    if !locator.starts_with(GCS_SCHEME_PREFIX) {
        return Err(HostlabError::invalid_locator(
            locator,
            format!("expected a {} url", GCS_SCHEME_PREFIX),
        ));
    }
    let archive = if locator.ends_with(RESULT_ARCHIVE_SUFFIX) {
        locator.to_string()
    } else {
        let listing = storage.list(&tool, locator);
        select_result_archive(&listing).ok_or_else(|| {
            HostlabError::invalid_locator(locator, "no results_*.zip or log-result_*.zip inside")
        })?
    };
    copy_to_scratch(storage, &tool, &archive, scratch)
}

/// Name and bytes of the descriptor inside a bundle (`test_result.xml` or
/// `log-result.xml`, first match in entry order).
pub fn read_descriptor_entry(archive_path: &Path) -> Result<(String, Vec<u8>)> {
    let mut archive = open_archive(archive_path)?;
    let name = archive_entry_names(&mut archive)
        .into_iter()
        .find(|n| n.ends_with(TEST_RESULT_XML) || n.ends_with(LOG_RESULT_XML))
        .ok_or_else(|| HostlabError::NotAResultArchive {
            path: archive_path.to_path_buf(),
            reason: format!("no {} or {} entry", TEST_RESULT_XML, LOG_RESULT_XML),
        })?;
    let mut entry = archive
        .by_name(&name)
        .map_err(|e| HostlabError::NotAResultArchive {
            path: archive_path.to_path_buf(),
            reason: e.to_string(),
        })?;
    let mut bytes = Vec::new();
    entry
        .read_to_end(&mut bytes)
        .map_err(|e| HostlabError::io(format!("read {} from {}", name, archive_path.display()), e))?;
    Ok((name, bytes))
}

/// Zips `<results_root>/<directory_name>` so that it extracts back into the
/// same directory name; the output is a valid result archive.
pub fn bundle_result_set(results_root: &Path, directory_name: &str, out_path: &Path) -> Result<()> {
    let result_dir = results_root.join(directory_name);
    if !result_dir.join(TEST_RESULT_XML).is_file() {
        return Err(HostlabError::malformed(
            result_dir.join(TEST_RESULT_XML),
            "result set has no descriptor",
        ));
    }
    let io_err = |e: std::io::Error| HostlabError::io(format!("write {}", out_path.display()), e);
    let zip_err = |e: zip::result::ZipError| {
        HostlabError::io(
            format!("write {}", out_path.display()),
            std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
        )
    };

    let file = fs::File::create(out_path).map_err(io_err)?;
    let mut zip = zip::ZipWriter::new(file);
    let opts = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for entry in walkdir::WalkDir::new(&result_dir).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            HostlabError::io(
                format!("walk {}", result_dir.display()),
                e.into_io_error().unwrap_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::Other, "filesystem loop")
                }),
            )
        })?;
        let rel = match entry.path().strip_prefix(results_root) {
            Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
            Err(_) => continue,
        };
        if entry.file_type().is_dir() {
            zip.add_directory(format!("{}/", rel), opts).map_err(zip_err)?;
        } else if entry.file_type().is_file() {
            zip.start_file(rel, opts).map_err(zip_err)?;
            let data = fs::read(entry.path()).map_err(io_err)?;
            zip.write_all(&data).map_err(io_err)?;
        }
    }

    zip.finish().map_err(zip_err)?;
    Ok(())
}
