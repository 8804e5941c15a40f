use std::path::{Path, PathBuf};

use crate::error::{ProfusionError, Result};
use crate::utils::{extension_lowercase, find_entry_ci, glob_sorted, EntryKind};

/// Directory holding the segment header and payload files
pub const DATA_DIR_PATTERN: &str = "EEGData";
/// Segment header file inside the data directory
pub const SEGMENT_HEADER_PATTERN: &str = "EEGData.ini";
/// Directory holding electrode placement documents
pub const PLACEMENT_DIR_PATTERN: &str = "ElectrodePlacements";
/// Legacy event database in the bundle root
pub const EVENT_DB_PATTERN: &str = "EEGStudyDB.mdb";

/// Every file that makes up one export bundle
#[derive(Debug, Clone, PartialEq)]
pub struct BundlePaths {
    /// Directory holding the study header
    pub root: PathBuf,
    pub study_header: PathBuf,
    pub data_root: PathBuf,
    pub segment_header: PathBuf,
    /// Payload files in import order
    pub payload_files: Vec<PathBuf>,
    /// `true` when a single payload file was opened directly
    pub single_payload: bool,
    pub placement_files: Vec<PathBuf>,
    pub event_database: Option<PathBuf>,
}

/// Checks whether a path looks like a Profusion export entry point
///
/// Accepts the bundle directory (`.eeg`), the study header (`.sdy`) and
/// a single payload file (`.rda`).
pub fn is_profusion_path<P: AsRef<Path>>(path: P) -> bool {
    matches!(
        extension_lowercase(path.as_ref()).as_deref(),
        Some("eeg") | Some("sdy") | Some("rda")
    )
}

/// Locates the required and optional bundle members from one entry path
///
/// `path` may be the bundle directory, the `.sdy` study header or a single
/// `.rda` payload file. In the last case only that payload file is used;
/// its metadata is still read from the surrounding bundle, so a payload file
/// moved out of its bundle cannot be opened.
///
/// # Errors
///
/// * `ProfusionError::NotFound` - no study header, no data directory, no
///   segment header or zero payload files
pub fn resolve_bundle<P: AsRef<Path>>(path: P) -> Result<BundlePaths> {
    let path = path.as_ref();
    log::debug!("Resolving bundle from {}", path.display());

    let (root, single_payload) = match extension_lowercase(path).as_deref() {
        Some("sdy") if path.is_file() => (parent_dir(path)?, None),
        Some("rda") if path.is_file() => {
            let data_root = parent_dir(path)?;
            (parent_dir(&data_root)?, Some(path.to_path_buf()))
        }
        _ if path.is_dir() => (locate_root(path)?, None),
        _ => {
            return Err(ProfusionError::NotFound(format!(
                "{} is neither a bundle directory, a .sdy nor a .rda file",
                path.display()
            )))
        }
    };
    if root != path {
        log::debug!("Adjusted bundle root to {}", root.display());
    }

    let study_header = find_study_header(&root)?;
    log::debug!("Found study header at {}", study_header.display());

    let data_root = find_entry_ci(&root, DATA_DIR_PATTERN, EntryKind::Dir)?.ok_or_else(|| {
        ProfusionError::NotFound(format!(
            "no directory in {} matches '{}'",
            root.display(),
            DATA_DIR_PATTERN
        ))
    })?;

    let segment_header = find_entry_ci(&data_root, SEGMENT_HEADER_PATTERN, EntryKind::File)?
        .ok_or_else(|| {
            ProfusionError::NotFound(format!(
                "no file in {} matches '{}'",
                data_root.display(),
                SEGMENT_HEADER_PATTERN
            ))
        })?;
    log::debug!("Found segment header at {}", segment_header.display());

    let payload_files = match &single_payload {
        Some(payload) => {
            log::debug!("Only opening the given payload file {}", payload.display());
            vec![payload.clone()]
        }
        None => glob_sorted(&data_root, "*.rda")?,
    };
    if payload_files.is_empty() {
        return Err(ProfusionError::NotFound(format!(
            "no .rda payload file in {}",
            data_root.display()
        )));
    }
    log::debug!("Opening {} payload file(s)", payload_files.len());

    let placement_files = match find_entry_ci(&root, PLACEMENT_DIR_PATTERN, EntryKind::Dir)? {
        Some(dir) => glob_sorted(&dir, "*.xml")?,
        None => Vec::new(),
    };
    match placement_files.len() {
        0 => log::warn!("No electrode placement file found"),
        1 => log::debug!("Electrode placement file ok"),
        n => log::warn!("{} electrode placement files found", n),
    }

    let event_database = find_entry_ci(&root, EVENT_DB_PATTERN, EntryKind::File)?;
    if event_database.is_none() {
        log::warn!("No event database found");
    }

    Ok(BundlePaths {
        root,
        study_header,
        data_root,
        segment_header,
        payload_files,
        single_payload: single_payload.is_some(),
        placement_files,
        event_database,
    })
}

fn parent_dir(path: &Path) -> Result<PathBuf> {
    path.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| ProfusionError::NotFound(format!("{} has no parent directory", path.display())))
}

/// 目录本身含 .sdy 时即为根目录，否则取第一个含 .sdy 的子目录
fn locate_root(dir: &Path) -> Result<PathBuf> {
    if !glob_sorted(dir, "*.sdy")?.is_empty() {
        return Ok(dir.to_path_buf());
    }
    glob_sorted(dir, "*/*.sdy")?
        .first()
        .and_then(|sdy| sdy.parent())
        .map(Path::to_path_buf)
        .ok_or_else(|| ProfusionError::NotFound(format!("no .sdy study header under {}", dir.display())))
}

fn find_study_header(root: &Path) -> Result<PathBuf> {
    let candidates = glob_sorted(root, "*.sdy")?;
    if candidates.len() > 1 {
        log::warn!(
            "{} study headers in {}, using the first one by name",
            candidates.len(),
            root.display()
        );
    }
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| ProfusionError::NotFound(format!("no .sdy study header in {}", root.display())))
}
