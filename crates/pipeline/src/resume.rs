//! Resume-skip decision for one cell.
//!
//! A cell is skipped when a prior terminal record proves the same work
//! was already done: matching prompt fingerprint, seed, and workflow
//! hash, with every recorded output file still present on disk.
//!
//! The status gate accepts `success` OR `skipped` records, mirroring
//! the long-standing behavior this tool inherited. A prior `resume_hit`
//! chain stays skippable; a prior dry-run record carries no local image
//! paths and therefore fails the file-existence gate in practice.
//! Whether `skipped` should count at all is an open product question;
//! do not tighten this to `success` only without deciding it.

use std::path::Path;

use crate::record::{MetadataRecord, RecordStatus};

/// Decide whether a prior record makes this cell a resume skip.
pub fn should_resume_skip(
    existing: Option<&MetadataRecord>,
    run_dir: &Path,
    expected_prompt_hash: &str,
    expected_seed: u64,
    expected_workflow_hash: &str,
) -> bool {
    let Some(existing) = existing else {
        return false;
    };

    if !matches!(existing.status, RecordStatus::Success | RecordStatus::Skipped) {
        return false;
    }
    if existing.prompt_hash != expected_prompt_hash {
        return false;
    }
    if existing.seed != expected_seed {
        return false;
    }
    if existing.effective_workflow_hash() != Some(expected_workflow_hash) {
        return false;
    }

    if let Some(paths) = extract_local_image_paths(existing) {
        return paths.iter().all(|path| file_exists(run_dir, path));
    }
    match extract_local_image_path(existing) {
        Some(path) => file_exists(run_dir, path),
        None => false,
    }
}

/// The prior record's output path list, cleaned: `None` when absent,
/// empty, or containing non-path entries.
pub fn extract_local_image_paths(existing: &MetadataRecord) -> Option<Vec<String>> {
    let paths = existing.local_image_paths.as_ref()?;
    if paths.is_empty() {
        return None;
    }
    let cleaned: Vec<String> = paths
        .iter()
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
        .collect();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// The prior record's single output path, if any.
pub fn extract_local_image_path(existing: &MetadataRecord) -> Option<&str> {
    existing
        .local_image_path
        .as_deref()
        .map(str::trim)
        .filter(|path| !path.is_empty())
}

fn file_exists(run_dir: &Path, recorded: &str) -> bool {
    let path = Path::new(recorded);
    let resolved = if path.is_absolute() {
        path.to_path_buf()
    } else {
        run_dir.join(path)
    };
    resolved.is_file()
}
