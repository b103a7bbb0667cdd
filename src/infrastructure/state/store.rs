use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, instrument};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    Config, ItemStatus, IterationState, Plan, PlanKind, RetryStateDocument, StageStateDocument,
};
use crate::infrastructure::locking::LockManager;

pub const STAGE_STATE_FILE: &str = "stage-state.json";
pub const ITERATION_STATE_FILE: &str = ".iteration-state.json";
pub const RETRY_STATE_FILE: &str = ".retry-state.json";

/// Lock-protected access to the documents in one state root.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
    locks: LockManager,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>, locks: LockManager) -> Self {
        Self {
            root: root.into(),
            locks,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let locks = LockManager::new(config.state.locks_dir(), &config.locking);
        Self::new(config.state.root.clone(), locks)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path(name).is_file()
    }

    /// Read a document. A missing file is `Ok(None)`.
    #[instrument(skip(self), level = "trace")]
    pub fn read_json<T: DeserializeOwned>(&self, name: &str) -> DomainResult<Option<T>> {
        let _guard = self.locks.acquire(name)?;
        self.read_unlocked(name)
    }

    /// Replace a document atomically.
    #[instrument(skip(self, value), level = "trace")]
    pub fn write_json<T: Serialize>(&self, name: &str, value: &T) -> DomainResult<()> {
        let _guard = self.locks.acquire(name)?;
        self.write_unlocked(name, value)
    }

    /// Read-modify-write under one lock hold. A missing document starts from
    /// `T::default()`.
    pub fn update_json<T, R, F>(&self, name: &str, f: F) -> DomainResult<R>
    where
        T: DeserializeOwned + Serialize + Default,
        F: FnOnce(&mut T) -> DomainResult<R>,
    {
        let _guard = self.locks.acquire(name)?;
        let mut value: T = self.read_unlocked(name)?.unwrap_or_default();
        let result = f(&mut value)?;
        self.write_unlocked(name, &value)?;
        Ok(result)
    }

    /// Delete a document if present.
    pub fn remove(&self, name: &str) -> DomainResult<bool> {
        let _guard = self.locks.acquire(name)?;
        match fs::remove_file(self.path(name)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn read_unlocked<T: DeserializeOwned>(&self, name: &str) -> DomainResult<Option<T>> {
        let path = self.path(name);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|err| DomainError::SerializationError(format!("{name}: {err}")))
    }

    fn write_unlocked<T: Serialize>(&self, name: &str, value: &T) -> DomainResult<()> {
        fs::create_dir_all(&self.root)?;
        let temp = NamedTempFile::new_in(&self.root)?;
        {
            let mut writer = BufWriter::new(temp.as_file());
            serde_json::to_writer_pretty(&mut writer, value)?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(self.path(name)).map_err(|err| err.error)?;
        debug!(file = name, "state written");
        Ok(())
    }

    // Plans

    pub fn load_plan(&self, kind: PlanKind) -> DomainResult<Option<Plan>> {
        self.read_json(kind.file_name())
    }

    /// The feature plan if present, otherwise the project plan.
    pub fn load_any_plan(&self) -> DomainResult<Option<Plan>> {
        if let Some(plan) = self.load_plan(PlanKind::Feature)? {
            return Ok(Some(plan));
        }
        self.load_plan(PlanKind::Project)
    }

    pub fn save_plan(&self, plan: &Plan) -> DomainResult<()> {
        self.write_json(plan.kind.file_name(), plan)
    }

    /// Read-modify-write a plan that must already exist.
    pub fn update_plan<R, F>(&self, kind: PlanKind, f: F) -> DomainResult<R>
    where
        F: FnOnce(&mut Plan) -> DomainResult<R>,
    {
        let name = kind.file_name();
        let _guard = self.locks.acquire(name)?;
        let mut plan: Plan = self
            .read_unlocked(name)?
            .ok_or_else(|| DomainError::NotFound(self.path(name)))?;
        let result = f(&mut plan)?;
        self.write_unlocked(name, &plan)?;
        Ok(result)
    }

    pub fn set_item_status(&self, kind: PlanKind, id: &str, status: ItemStatus) -> DomainResult<()> {
        self.update_plan(kind, |plan| plan.set_status(id, status))
    }

    // Stage state

    pub fn load_stage_state(&self) -> DomainResult<Option<StageStateDocument>> {
        let doc: Option<StageStateDocument> = self.read_json(STAGE_STATE_FILE)?;
        Ok(doc.map(|mut doc| {
            doc.normalize();
            doc
        }))
    }

    pub fn save_stage_state(&self, doc: &StageStateDocument) -> DomainResult<()> {
        self.write_json(STAGE_STATE_FILE, doc)
    }

    // Retry state

    pub fn load_retry_state(&self) -> DomainResult<RetryStateDocument> {
        Ok(self.read_json(RETRY_STATE_FILE)?.unwrap_or_default())
    }

    pub fn save_retry_state(&self, doc: &RetryStateDocument) -> DomainResult<()> {
        self.write_json(RETRY_STATE_FILE, doc)
    }

    // Iteration state

    pub fn load_iteration_state(&self) -> DomainResult<Option<IterationState>> {
        self.read_json(ITERATION_STATE_FILE)
    }

    /// Read-modify-write the iteration state, stamping `updated_at`.
    pub fn update_iteration_state<F>(&self, f: F) -> DomainResult<IterationState>
    where
        F: FnOnce(&mut IterationState),
    {
        self.update_json(ITERATION_STATE_FILE, |state: &mut IterationState| {
            f(state);
            state.updated_at = Some(Utc::now());
            Ok(state.clone())
        })
    }
}
