//! Filesystem primitives with durability guarantees.
//!
//! Every durable mutation in ForgeFlow funnels through two shapes:
//! whole-document replacement (temp file + rename + fsync of file and parent
//! directory) and journal append (append + fsync). Readers tolerate a
//! torn trailing line in append-only logs; replaced documents are never
//! observed half-written.

use crate::core::error::ForgeFlowError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Replace `path` atomically with `bytes`, fsyncing the temp file before the
/// rename and the parent directory after it.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ForgeFlowError> {
    let parent = path.parent().ok_or_else(|| {
        ForgeFlowError::fault(
            crate::core::error::ErrorKind::OperationFailed,
            format!("target has no parent directory: {}", path.display()),
        )
    })?;
    fs::create_dir_all(parent)?;

    let tmp = path.with_extension("tmp");
    {
        let mut f = File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    fsync_dir(parent)?;
    Ok(())
}

/// Serialize `value` as pretty JSON and replace `path` atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), ForgeFlowError> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    write_atomic(path, &bytes)
}

/// Append one serialized JSON line to `path` and fsync.
pub fn append_jsonl_sync<T: Serialize>(path: &Path, value: &T) -> Result<(), ForgeFlowError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(value)?;
    writeln!(f, "{}", line)?;
    f.sync_all()?;
    Ok(())
}

/// Read and deserialize a whole JSON document.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ForgeFlowError> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Read a JSONL file into typed entries. Blank lines are skipped; a torn
/// final line (in-flight tail write) is tolerated and dropped.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, ForgeFlowError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)?;
    let lines: Vec<&str> = content.lines().collect();
    let mut entries = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) if i + 1 == lines.len() => {
                tracing::warn!(path = %path.display(), error = %e, "dropping torn tail line");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(entries)
}

/// fsync a directory so a preceding rename is durable.
pub fn fsync_dir(dir: &Path) -> Result<(), ForgeFlowError> {
    // Windows cannot open directories for sync; the rename is still atomic.
    #[cfg(unix)]
    {
        let d = File::open(dir)?;
        d.sync_all()?;
    }
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

/// Truncate a journal to empty, durably.
pub fn truncate_sync(path: &Path) -> Result<(), ForgeFlowError> {
    if !path.exists() {
        return Ok(());
    }
    let f = OpenOptions::new().write(true).truncate(true).open(path)?;
    f.sync_all()?;
    Ok(())
}
