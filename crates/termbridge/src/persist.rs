//! Durable JSON persistence with self-healing.
//!
//! Every store in this crate writes through [`write_json_atomic`]: the
//! payload goes to a temp file first, is re-parsed to prove it is valid
//! JSON, and only then replaces the previous file (which survives as a
//! `.bak` sibling). A crash mid-write can therefore never leave a
//! half-written main file behind.
//!
//! On the read side, [`quarantine`] renames a file that failed to parse
//! so the store can continue with a clean slate while the evidence is
//! kept for inspection.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Atomically replace `path` with the serialized `value`.
///
/// Order of operations: write `<path>.tmp`, re-parse it, copy the current
/// file (if any) to `<path>.bak`, rename the temp file into place.
pub fn write_json_atomic(path: &Path, value: &serde_json::Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }

    let tmp_path = sibling(path, "tmp");
    let payload = serde_json::to_string_pretty(value)?;
    std::fs::write(&tmp_path, &payload)
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;

    // Prove the bytes on disk parse before touching the live file.
    let written = std::fs::read_to_string(&tmp_path)?;
    if let Err(e) = serde_json::from_str::<serde_json::Value>(&written) {
        let _ = std::fs::remove_file(&tmp_path);
        anyhow::bail!("verification re-parse of {} failed: {e}", tmp_path.display());
    }

    if path.exists() {
        let bak_path = sibling(path, "bak");
        std::fs::copy(path, &bak_path)
            .with_context(|| format!("failed to back up {}", path.display()))?;
    }

    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

/// Move an unreadable file out of the way, returning where it went.
/// An older quarantined file at the same spot is overwritten.
pub fn quarantine(path: &Path) -> Result<PathBuf> {
    let target = sibling(path, "corrupted");
    if target.exists() {
        std::fs::remove_file(&target)
            .with_context(|| format!("failed to clear {}", target.display()))?;
    }
    std::fs::rename(path, &target)
        .with_context(|| format!("failed to quarantine {}", path.display()))?;
    Ok(target)
}

/// The `.bak` sibling of a persisted file.
pub fn backup_path(path: &Path) -> PathBuf {
    sibling(path, "bak")
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}
