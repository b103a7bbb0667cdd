use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::cli::output::{output, CommandOutput};

use super::Workspace;

#[derive(Debug, Serialize)]
pub struct LockCleanupOutput {
    pub dir: PathBuf,
    pub backend: &'static str,
    pub older_than_secs: u64,
    pub removed: Vec<PathBuf>,
}

impl CommandOutput for LockCleanupOutput {
    fn to_human(&self) -> String {
        if self.removed.is_empty() {
            return format!(
                "No stale lock files older than {}s in {}.",
                self.older_than_secs,
                self.dir.display()
            );
        }
        let mut lines = vec![format!(
            "Removed {} stale lock file(s) ({} backend):",
            self.removed.len(),
            self.backend
        )];
        lines.extend(self.removed.iter().map(|path| format!("  {}", path.display())));
        lines.join("\n")
    }
}

/// Handle `cascade locks cleanup`
pub fn handle_cleanup(workspace: &Workspace, older_than: Option<u64>, json: bool) -> Result<()> {
    let locks = workspace.store.locks();
    let older_than_secs = older_than.unwrap_or(workspace.config.locking.stale_after_secs);
    let removed = locks
        .cleanup_stale(Duration::from_secs(older_than_secs))
        .context("Failed to clean up lock files")?;

    let out = LockCleanupOutput {
        dir: locks.dir().to_path_buf(),
        backend: locks.backend_name(),
        older_than_secs,
        removed,
    };
    output(&out, json);
    Ok(())
}
