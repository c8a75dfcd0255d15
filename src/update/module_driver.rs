//! Update Module Driver: speaks the CLI/stdio contract with an externally
//! supplied update-module executable (spec §4.6).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::info;

use crate::error::{ModuleError, Result};
use crate::update::header::ArtifactHeader;

/// One step of the update-module state machine, delivered to the module
/// executable as its first CLI argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Download,
    DownloadWithFileSizes,
    ProvidePayloadFileSizes,
    ArtifactInstall,
    NeedsArtifactReboot,
    SupportsRollback,
    ArtifactReboot,
    ArtifactVerifyReboot,
    ArtifactCommit,
    ArtifactRollback,
    ArtifactRollbackReboot,
    ArtifactVerifyRollbackReboot,
    ArtifactFailure,
    Cleanup,
}

impl ModuleState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Download => "Download",
            Self::DownloadWithFileSizes => "DownloadWithFileSizes",
            Self::ProvidePayloadFileSizes => "ProvidePayloadFileSizes",
            Self::ArtifactInstall => "ArtifactInstall",
            Self::NeedsArtifactReboot => "NeedsArtifactReboot",
            Self::SupportsRollback => "SupportsRollback",
            Self::ArtifactReboot => "ArtifactReboot",
            Self::ArtifactVerifyReboot => "ArtifactVerifyReboot",
            Self::ArtifactCommit => "ArtifactCommit",
            Self::ArtifactRollback => "ArtifactRollback",
            Self::ArtifactRollbackReboot => "ArtifactRollbackReboot",
            Self::ArtifactVerifyRollbackReboot => "ArtifactVerifyRollbackReboot",
            Self::ArtifactFailure => "ArtifactFailure",
            Self::Cleanup => "Cleanup",
        }
    }

    /// Whether this state's single stdout line is meaningful data rather
    /// than log chatter.
    fn is_query(self) -> bool {
        matches!(
            self,
            Self::NeedsArtifactReboot | Self::SupportsRollback | Self::ProvidePayloadFileSizes
        )
    }
}

/// Answer to the `NeedsArtifactReboot` query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeedsReboot {
    Yes,
    No,
    Automatic,
}

fn parse_yes_no(line: &str) -> bool {
    line.trim().eq_ignore_ascii_case("yes")
}

/// Drives a single update module executable through its CLI/stdio
/// contract, rooted at a deterministic per-payload work directory.
pub struct ModuleDriver {
    module_path: PathBuf,
    work_dir: PathBuf,
    timeout: Duration,
}

impl ModuleDriver {
    /// `module_path` is the update-module executable
    /// (`<modules_dir>/v3/<payload-type>`); `work_dir` is this payload's
    /// deterministic working directory under the data store.
    #[must_use]
    pub fn new(module_path: PathBuf, work_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            module_path,
            work_dir,
            timeout,
        }
    }

    /// Lay down the standard work-directory file tree (version file,
    /// `current_artifact_name`/`_group`/`_device_type`, a header sub-tree
    /// mirroring the artifact header) before the first state call.
    pub fn prepare_work_dir(&self, header: &ArtifactHeader, device_type: &str) -> Result<()> {
        std::fs::create_dir_all(&self.work_dir)
            .map_err(|e| ModuleError::Protocol(format!("creating work dir: {e}")))?;
        std::fs::write(self.work_dir.join("version"), "3\n")
            .map_err(|e| ModuleError::Protocol(format!("writing version file: {e}")))?;
        std::fs::write(
            self.work_dir.join("current_artifact_name"),
            &header.artifact_name,
        )
        .map_err(|e| ModuleError::Protocol(e.to_string()))?;
        std::fs::write(
            self.work_dir.join("current_artifact_group"),
            &header.artifact_group,
        )
        .map_err(|e| ModuleError::Protocol(e.to_string()))?;
        std::fs::write(self.work_dir.join("current_device_type"), device_type)
            .map_err(|e| ModuleError::Protocol(e.to_string()))?;

        let header_dir = self.work_dir.join("header");
        std::fs::create_dir_all(&header_dir).map_err(|e| ModuleError::Protocol(e.to_string()))?;
        std::fs::write(
            header_dir.join("header-info"),
            serde_json::to_vec(header).map_err(|e| ModuleError::Protocol(e.to_string()))?,
        )
        .map_err(|e| ModuleError::Protocol(e.to_string()))?;
        Ok(())
    }

    /// Invoke a state that takes no stdin and may return one line of
    /// stdout data.
    pub async fn call(&self, state: ModuleState) -> Result<Option<String>> {
        self.call_with_stdin(state, None).await
    }

    /// `Download`/`DownloadWithFileSizes`: stream the artifact payload
    /// into the module's stdin while it runs.
    pub async fn download(
        &self,
        state: ModuleState,
        mut payload: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    ) -> Result<Option<String>> {
        let mut buf = Vec::new();
        payload
            .read_to_end(&mut buf)
            .await
            .map_err(|e| ModuleError::Protocol(format!("reading payload: {e}")))?;
        self.call_with_stdin(state, Some(buf)).await
    }

    async fn call_with_stdin(
        &self,
        state: ModuleState,
        stdin_payload: Option<Vec<u8>>,
    ) -> Result<Option<String>> {
        let mut command = Command::new(&self.module_path);
        command
            .arg(state.as_str())
            .arg(&self.work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| ModuleError::Protocol(format!("spawning module: {e}")))?;

        if let Some(payload) = stdin_payload {
            if let Some(mut stdin) = child.stdin.take() {
                let _ = stdin.write_all(&payload).await;
            }
        } else {
            drop(child.stdin.take());
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => {
                result.map_err(|e| ModuleError::Protocol(format!("waiting for module: {e}")))?
            }
            Err(_) => {
                // `child` was consumed by `wait_with_output`'s future, which
                // kills the child on drop when cancelled by the timeout.
                return Err(ModuleError::Timeout(self.timeout).into());
            }
        };

        if !output.status.success() {
            return Err(ModuleError::GenericError {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }
            .into());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut lines = stdout.lines().filter(|l| !l.trim().is_empty());
        let first = lines.next().map(str::to_string);

        if state.is_query() {
            if lines.next().is_some() {
                return Err(ModuleError::Protocol(format!(
                    "{} produced more than one non-empty stdout line",
                    state.as_str()
                ))
                .into());
            }
        } else if let Some(first) = &first {
            info!(state = state.as_str(), output = %first, "update module output");
        }

        Ok(first)
    }

    /// `NeedsArtifactReboot` query.
    pub async fn needs_reboot(&self) -> Result<NeedsReboot> {
        let line = self.call(ModuleState::NeedsArtifactReboot).await?;
        Ok(match line.as_deref().map(str::trim) {
            Some("Automatic") => NeedsReboot::Automatic,
            Some(s) if parse_yes_no(s) => NeedsReboot::Yes,
            _ => NeedsReboot::No,
        })
    }

    /// `SupportsRollback` query.
    pub async fn supports_rollback(&self) -> Result<bool> {
        let line = self.call(ModuleState::SupportsRollback).await?;
        Ok(line.as_deref().is_some_and(parse_yes_no))
    }

    /// `ProvidePayloadFileSizes` probe, gating whether `Download` or
    /// `DownloadWithFileSizes` is used.
    pub async fn provide_payload_file_sizes(&self) -> Result<bool> {
        let line = self.call(ModuleState::ProvidePayloadFileSizes).await?;
        Ok(line.as_deref().is_some_and(parse_yes_no))
    }

    /// `Cleanup`: a no-op success if the work directory is already gone;
    /// otherwise invokes the module then recursively removes the
    /// directory.
    pub async fn cleanup(&self) -> Result<()> {
        if !self.work_dir.exists() {
            return Ok(());
        }
        self.call(ModuleState::Cleanup).await?;
        let work_dir = self.work_dir.clone();
        tokio::task::spawn_blocking(move || std::fs::remove_dir_all(&work_dir))
            .await
            .map_err(|e| ModuleError::Protocol(e.to_string()))?
            .map_err(|e| ModuleError::Protocol(format!("removing work dir: {e}")))?;
        Ok(())
    }
}

/// Locate the module executable for `payload_type` under
/// `<modules_dir>/v3/<payload-type>`.
pub fn module_path(modules_dir: &Path, payload_type: &str) -> PathBuf {
    modules_dir.join("v3").join(payload_type)
}
