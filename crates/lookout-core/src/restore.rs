//! Context-data restore and the gated storage cleanup that follows it.

use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use crate::domain::{EvalError, Result};

/// Persisted-storage entries cleared by [`clear_user_storage`]. Nothing else
/// is ever deleted.
const STORAGE_ITEMS: [&str; 4] = [
    "Session Storage",
    "Local Storage",
    "Cookies",
    "Cookies-journal",
];

/// Copy a context-data fixture into place before the target launches.
///
/// Directories are copied recursively; existing files at the destination are
/// overwritten so a session always starts from the fixture state.
pub fn restore_context_data(from: &Path, to: &Path) -> Result<()> {
    if !from.exists() {
        return Err(EvalError::Restore(format!(
            "fixture not found: {}",
            from.display()
        )));
    }
    copy_recursive(from, to)?;
    debug!(from = %from.display(), to = %to.display(), "context data restored");
    Ok(())
}

fn copy_recursive(from: &Path, to: &Path) -> Result<()> {
    let metadata = fs::metadata(from)?;
    if metadata.is_dir() {
        fs::create_dir_all(to)?;
        for entry in fs::read_dir(from)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &to.join(entry.file_name()))?;
        }
    } else {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(from, to)?;
    }
    Ok(())
}

/// Clear persisted session storage under a restored user-data directory.
///
/// Destructive, so it is double-gated: callers opt in per task, and the path
/// itself must contain both the `vscode` and `user_data_dir` markers
/// (case-insensitive) or nothing is touched. Only the [`STORAGE_ITEMS`]
/// entries directly under `root` are removed; same-named entries deeper in
/// the tree are left alone. With `dry_run` the matches are logged but nothing
/// is deleted.
///
/// Cleanup never fails an evaluation; problems are logged and swallowed.
pub fn clear_user_storage(root: &Path, dry_run: bool) {
    let lowered = root.to_string_lossy().to_lowercase();
    if !lowered.contains("vscode") || !lowered.contains("user_data_dir") {
        warn!(
            path = %root.display(),
            "storage cleanup skipped: path lacks safety markers"
        );
        return;
    }
    for item in STORAGE_ITEMS {
        let path = root.join(item);
        if !path.exists() {
            continue;
        }
        if dry_run {
            debug!(path = %path.display(), "storage entry would be cleared");
            continue;
        }
        let removed = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match removed {
            Ok(()) => debug!(path = %path.display(), "storage entry cleared"),
            Err(error) => {
                warn!(path = %path.display(), %error, "storage entry not cleared");
            }
        }
    }
}
