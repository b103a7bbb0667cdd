//! Command handlers. Each returns `anyhow::Result<()>` and prints either
//! human output or JSON.

pub mod batches;
pub mod locks;
pub mod retry;
pub mod run;
pub mod stage;
pub mod status;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::domain::models::{Config, Plan};
use crate::infrastructure::state::StateStore;

/// Configuration and state store for one project directory.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub project_dir: PathBuf,
    pub config: Config,
    pub store: StateStore,
}

impl Workspace {
    /// Relative state paths in `config` are taken from `project_dir`.
    pub fn new(project_dir: impl Into<PathBuf>, mut config: Config) -> Self {
        let project_dir = project_dir.into();
        config.state.root = rebase(&project_dir, &config.state.root);
        if let Some(locks) = config.state.locks_dir.take() {
            config.state.locks_dir = Some(rebase(&project_dir, &locks));
        }
        let store = StateStore::from_config(&config);
        Self {
            project_dir,
            config,
            store,
        }
    }

    pub fn require_plan(&self) -> Result<Plan> {
        self.store
            .load_any_plan()
            .context("Failed to load plan")?
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "No plan found in {}. Write prd.json or mega-plan.json there first.",
                    self.store.root().display()
                )
            })
    }
}

fn rebase(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_state_paths_follow_project_dir() {
        let mut config = Config::default();
        config.state.locks_dir = Some(PathBuf::from("locks"));
        let workspace = Workspace::new("/work/project", config);
        assert_eq!(
            workspace.config.state.root,
            PathBuf::from("/work/project/.cascade/state")
        );
        assert_eq!(
            workspace.config.state.locks_dir,
            Some(PathBuf::from("/work/project/locks"))
        );
        assert_eq!(workspace.store.root(), Path::new("/work/project/.cascade/state"));
    }

    #[test]
    fn test_missing_plan_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(dir.path(), Config::default());
        let err = workspace.require_plan().unwrap_err();
        assert!(err.to_string().contains("No plan found"));
    }
}
