//! Update State Engine: drives a single artifact through its lifecycle
//! with crash recovery (spec §4.5), delegating each state transition to
//! the [`module_driver`].

pub mod header;
pub mod module_driver;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, UpdateError};
use crate::kvstore::{
    KvStore, ARTIFACT_GROUP_KEY, ARTIFACT_NAME_KEY, PROVIDES_KEY_PREFIX, STANDALONE_STATE_KEY,
};
use header::ArtifactHeader;
use module_driver::{ModuleDriver, ModuleState, NeedsReboot};

const BROKEN_ARTIFACT_SUFFIX: &str = "_INCONSISTENT";

/// Persisted snapshot of an in-progress update (spec §3). Its presence at
/// [`STANDALONE_STATE_KEY`] means "an update is in progress"; absence
/// means "idle".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateData {
    pub version: u32,
    pub artifact_name: String,
    pub artifact_group: String,
    pub artifact_provides: Option<BTreeMap<String, String>>,
    pub artifact_clears_provides: Option<Vec<String>>,
    /// Exactly one element: this agent installs a single payload type per
    /// artifact.
    pub payload_types: Vec<String>,
}

/// Terminal (or stable-pending-user-action) outcome of an `install`,
/// `commit`, or `rollback` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Metadata-only artifact, committed immediately.
    Committed,
    /// Installed, `SupportsRollback` was false so auto-committed.
    AutoCommitted,
    /// Installed and rollback-capable; no reboot required before commit.
    Installed,
    /// Installed and rollback-capable; a reboot is required before commit.
    InstalledRebootRequired,
    /// Rolled back on user request.
    RolledBack,
    /// Rollback was requested but the module does not support it; state
    /// is left in place, awaiting an external commit/rollback decision.
    NoRollback,
    /// Failed during Download; no device state changed, nothing to undo.
    FailedNothingDone,
    /// Failed after ArtifactInstall; rollback succeeded.
    FailedAndRolledBack,
    /// Failed after ArtifactInstall; module does not support rollback, so
    /// the broken artifact was committed under its `_INCONSISTENT` name.
    FailedAndNoRollback,
    /// Failed after ArtifactInstall; rollback itself also failed.
    FailedAndRollbackFailed,
}

/// Configuration the engine needs beyond what's in each `StateData`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub modules_dir: PathBuf,
    pub work_dir_root: PathBuf,
    pub device_type: String,
    pub module_timeout: Duration,
}

/// Drives artifacts through the state machine described in spec §4.5.
pub struct UpdateEngine<K: KvStore> {
    kv: Arc<K>,
    http: reqwest::Client,
    config: EngineConfig,
}

impl<K: KvStore> UpdateEngine<K> {
    #[must_use]
    pub fn new(kv: Arc<K>, http: reqwest::Client, config: EngineConfig) -> Self {
        Self { kv, http, config }
    }

    /// Load the persisted `StateData`, if any. Callers must resolve a
    /// present record with [`Self::commit`] or [`Self::rollback`] before
    /// calling [`Self::install`] again (crash recovery contract).
    pub fn load_state(&self) -> Result<Option<StateData>> {
        match self.kv.read(STANDALONE_STATE_KEY)? {
            None => Ok(None),
            Some(bytes) => {
                let data = serde_json::from_slice(&bytes)
                    .map_err(|e| UpdateError::DatabaseValue(e.to_string()))?;
                Ok(Some(data))
            }
        }
    }

    fn persist_state(&self, state: &StateData) -> Result<()> {
        let bytes =
            serde_json::to_vec(state).map_err(|e| UpdateError::DatabaseValue(e.to_string()))?;
        self.kv.write(STANDALONE_STATE_KEY, &bytes)
    }

    fn clear_state(&self) -> Result<()> {
        self.kv.delete(STANDALONE_STATE_KEY)
    }

    /// Commit `state`'s `provides` into the KV store's well-known
    /// per-provides entries (spec §6 Persisted state layout), first
    /// clearing any keys named in `artifact_clears_provides`.
    fn commit_provides(&self, state: &StateData) -> Result<()> {
        if let Some(cleared) = &state.artifact_clears_provides {
            for key in cleared {
                self.kv.delete(&format!("{PROVIDES_KEY_PREFIX}{key}"))?;
            }
        }
        self.kv.write(ARTIFACT_NAME_KEY, state.artifact_name.as_bytes())?;
        self.kv.write(ARTIFACT_GROUP_KEY, state.artifact_group.as_bytes())?;
        if let Some(provides) = &state.artifact_provides {
            for (key, value) in provides {
                self.kv
                    .write(&format!("{PROVIDES_KEY_PREFIX}{key}"), value.as_bytes())?;
            }
        }
        Ok(())
    }

    /// Read back the committed `provides` map, keyed by the bare provides
    /// name (i.e. without [`PROVIDES_KEY_PREFIX`]). Used to report
    /// `device_provides` on the next deployment poll.
    pub fn read_provides(&self) -> Result<BTreeMap<String, String>> {
        let mut out = BTreeMap::new();
        for key in [ARTIFACT_NAME_KEY, ARTIFACT_GROUP_KEY] {
            if let Some(bytes) = self.kv.read(key)? {
                out.insert(key.to_string(), String::from_utf8_lossy(&bytes).into_owned());
            }
        }
        Ok(out)
    }

    /// Begin installing the artifact at `source` (an `http(s)://` URL or a
    /// local file path). Rejects with [`UpdateError::OperationInProgress`]
    /// if a `StateData` record already exists.
    pub async fn install(&self, source: &str) -> Result<Outcome> {
        if self.load_state()?.is_some() {
            return Err(UpdateError::OperationInProgress.into());
        }

        let (header, body) = self.open_source(source).await?;

        if header.payload_type.is_empty() {
            info!(artifact = %header.artifact_name, "metadata-only artifact, committing immediately");
            self.commit_provides(&StateData {
                version: 1,
                artifact_name: header.artifact_name.clone(),
                artifact_group: header.artifact_group.clone(),
                artifact_provides: header.provides.clone(),
                artifact_clears_provides: header.clears_provides.clone(),
                payload_types: Vec::new(),
            })?;
            return Ok(Outcome::Committed);
        }

        let work_dir = self
            .config
            .work_dir_root
            .join(&header.payload_type);
        let module = ModuleDriver::new(
            module_driver::module_path(&self.config.modules_dir, &header.payload_type),
            work_dir,
            self.config.module_timeout,
        );
        module.prepare_work_dir(&header, &self.config.device_type)?;

        let state = StateData {
            version: 1,
            artifact_name: header.artifact_name.clone(),
            artifact_group: header.artifact_group.clone(),
            artifact_provides: header.provides.clone(),
            artifact_clears_provides: header.clears_provides.clone(),
            payload_types: vec![header.payload_type.clone()],
        };
        self.persist_state(&state)?;

        let download_state = if module.provide_payload_file_sizes().await.unwrap_or(false) {
            ModuleState::DownloadWithFileSizes
        } else {
            ModuleState::Download
        };

        if let Err(e) = module.download(download_state, body).await {
            warn!(error = %e, "download failed, no device state changed");
            let _ = module.cleanup().await;
            self.clear_state()?;
            return Ok(Outcome::FailedNothingDone);
        }

        if let Err(e) = module.call(ModuleState::ArtifactInstall).await {
            warn!(error = %e, "ArtifactInstall failed, entering failure handling");
            return self.handle_failure(&module, &state).await;
        }

        let needs_reboot = module.needs_reboot().await.unwrap_or(NeedsReboot::No);
        let supports_rollback = module.supports_rollback().await.unwrap_or(false);

        if !supports_rollback {
            return match self.commit_internal(&module, &state).await? {
                Outcome::Committed => Ok(Outcome::AutoCommitted),
                other => Ok(other),
            };
        }

        match needs_reboot {
            NeedsReboot::No => Ok(Outcome::Installed),
            NeedsReboot::Yes | NeedsReboot::Automatic => Ok(Outcome::InstalledRebootRequired),
        }
    }

    /// Commit the in-progress artifact (user-triggered, from `Installed`
    /// or `InstalledRebootRequired`).
    pub async fn commit(&self) -> Result<Outcome> {
        let state = self
            .load_state()?
            .ok_or(UpdateError::NoUpdateInProgress)?;
        let module = self.module_for(&state)?;
        self.commit_internal(&module, &state).await
    }

    /// Runs `ArtifactCommit`; on success commits `provides` and clears
    /// state, returning [`Outcome::Committed`]. On failure, falls through
    /// to failure-handling and returns whatever outcome that produces
    /// (never silently reports success — spec §4.5's `ArtifactCommit
    /// --fail--> Failure-handling` transition).
    async fn commit_internal(&self, module: &ModuleDriver, state: &StateData) -> Result<Outcome> {
        if let Err(e) = module.call(ModuleState::ArtifactCommit).await {
            warn!(error = %e, "ArtifactCommit failed, entering failure handling");
            return self.handle_failure(module, state).await;
        }
        self.commit_provides(state)?;
        self.clear_state()?;
        Ok(Outcome::Committed)
    }

    /// Roll back the in-progress artifact (user-triggered, from
    /// `Installed` or `InstalledRebootRequired`).
    pub async fn rollback(&self) -> Result<Outcome> {
        let state = self
            .load_state()?
            .ok_or(UpdateError::NoUpdateInProgress)?;
        let module = self.module_for(&state)?;

        if !module.supports_rollback().await.unwrap_or(false) {
            return Ok(Outcome::NoRollback);
        }

        match module.call(ModuleState::ArtifactRollback).await {
            Ok(_) => {
                module.cleanup().await?;
                self.clear_state()?;
                Ok(Outcome::RolledBack)
            }
            Err(e) => {
                warn!(error = %e, "ArtifactRollback failed");
                Ok(Outcome::FailedAndRollbackFailed)
            }
        }
    }

    async fn handle_failure(&self, module: &ModuleDriver, state: &StateData) -> Result<Outcome> {
        let supports_rollback = module.supports_rollback().await.unwrap_or(false);

        if supports_rollback {
            match module.call(ModuleState::ArtifactRollback).await {
                Ok(_) => {
                    let _ = module.call(ModuleState::ArtifactFailure).await;
                    module.cleanup().await?;
                    self.clear_state()?;
                    Ok(Outcome::FailedAndRolledBack)
                }
                Err(e) => {
                    warn!(error = %e, "rollback-during-failure also failed");
                    let _ = module.call(ModuleState::ArtifactFailure).await;
                    let _ = module.cleanup().await;
                    Ok(Outcome::FailedAndRollbackFailed)
                }
            }
        } else {
            let mut broken = state.clone();
            broken.artifact_name = format!("{}{BROKEN_ARTIFACT_SUFFIX}", state.artifact_name);
            let mut provides = broken.artifact_provides.clone().unwrap_or_default();
            provides.insert("artifact_name".to_string(), broken.artifact_name.clone());
            broken.artifact_provides = Some(provides);

            let _ = module.call(ModuleState::ArtifactFailure).await;
            module.cleanup().await?;
            self.commit_provides(&broken)?;
            self.clear_state()?;
            warn!(artifact = %broken.artifact_name, "committing broken artifact, no rollback support");
            Ok(Outcome::FailedAndNoRollback)
        }
    }

    fn module_for(&self, state: &StateData) -> Result<ModuleDriver> {
        let payload_type = state
            .payload_types
            .first()
            .ok_or_else(|| UpdateError::DatabaseValue("empty payload_types".into()))?;
        let work_dir = self.config.work_dir_root.join(payload_type);
        Ok(ModuleDriver::new(
            module_driver::module_path(&self.config.modules_dir, payload_type),
            work_dir,
            self.config.module_timeout,
        ))
    }

    async fn open_source(
        &self,
        source: &str,
    ) -> Result<(ArtifactHeader, Box<dyn tokio::io::AsyncRead + Unpin + Send>)> {
        if source.starts_with("http://") || source.starts_with("https://") {
            let response = self
                .http
                .get(source)
                .send()
                .await
                .map_err(|e| UpdateError::Transport(e.to_string()))?;
            if response.status() != reqwest::StatusCode::OK {
                return Err(UpdateError::UnexpectedHttpResponse(response.status().as_u16()).into());
            }
            let stream = response
                .bytes_stream()
                .map_err(std::io::Error::other);
            let reader = tokio_util::io::StreamReader::new(stream);
            let (header, buffered) = header::read_header(reader).await?;
            Ok((header, Box::new(buffered)))
        } else {
            let file = tokio::fs::File::open(source)
                .await
                .map_err(crate::error::Error::Io)?;
            let (header, buffered) = header::read_header(file).await?;
            Ok((header, Box::new(buffered)))
        }
    }
}
