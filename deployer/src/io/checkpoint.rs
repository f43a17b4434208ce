//! Checkpoint file persistence.
//!
//! The engine only hands out [`RestartInfo`] values; this is where the CLI
//! keeps the latest one between processes.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::types::RestartInfo;

/// Load a checkpoint. A missing file means there is nothing to resume.
pub fn load_checkpoint(path: &Path) -> Result<Option<RestartInfo>> {
    if !path.exists() {
        debug!(path = %path.display(), "no checkpoint file");
        return Ok(None);
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read checkpoint {}", path.display()))?;
    let checkpoint: RestartInfo = serde_json::from_str(&contents)
        .with_context(|| format!("parse checkpoint {}", path.display()))?;
    debug!(
        last_successful = ?checkpoint.last_successful,
        vm_id = ?checkpoint.vm_id,
        "checkpoint loaded"
    );
    Ok(Some(checkpoint))
}

/// Atomically replace the checkpoint file.
pub fn write_checkpoint(path: &Path, checkpoint: &RestartInfo) -> Result<()> {
    debug!(
        path = %path.display(),
        last_successful = ?checkpoint.last_successful,
        "writing checkpoint"
    );
    let mut buf = serde_json::to_string_pretty(checkpoint).context("serialize checkpoint")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}
