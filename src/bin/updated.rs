//! Update daemon: the API Client over its own in-process Authenticator
//! (Open Question 2 of spec.md §9 — `authd` and `updated` each keep their
//! own Authenticator rather than sharing one over IPC), the Update State
//! Engine, the Update Module Driver, and the Deployment Client (spec §2).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use update_agent::api_client::ApiClient;
use update_agent::auth::{Authenticator, AuthenticatorConfig};
use update_agent::cli::Cli;
use update_agent::config::{self, Config};
use update_agent::deployment::{DeploymentClient, DeploymentStatus, LogDirectory};
use update_agent::identity::IdentityCollector;
use update_agent::keystore::Keystore;
use update_agent::kvstore::SledStore;
use update_agent::setup_tracing;
use update_agent::update::{EngineConfig, Outcome, UpdateEngine};

/// How often to poll for a new deployment when idle. Not part of the
/// config file's documented key set (spec §6); a fixed interval matching
/// Mender's own default poll cadence.
const POLL_INTERVAL: Duration = Duration::from_secs(30 * 60);
const MODULE_TIMEOUT: Duration = Duration::from_secs(600);

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(cli.log_level.as_tracing_level(), cli.log_file.as_deref()) {
        eprintln!("failed to set up logging: {e}");
        return ExitCode::FAILURE;
    }

    let conf_path = cli.config.clone().unwrap_or_else(|| config::conf_dir().join("mender.conf"));
    let fallback_path = cli
        .fallback_config
        .clone()
        .unwrap_or_else(|| config::conf_dir().join("mender.conf.fallback"));
    let data_dir = cli.data.clone().unwrap_or_else(config::datastore_dir);

    let conf = match Config::load(&conf_path, Some(&fallback_path)) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %conf_path.display(),
        data = %data_dir.display(),
        "starting updated"
    );

    let device_type = match conf.device_type() {
        Ok(dt) => dt,
        Err(e) => {
            error!(error = %e, "failed to read device type");
            return ExitCode::FAILURE;
        }
    };

    let key_path = data_dir.join("mender-agent.pem");
    let mut keystore = Keystore::new();
    if let Err(e) = keystore.load(&key_path, None) {
        error!(error = %e, "failed to load device key (run `authd bootstrap` first)");
        return ExitCode::FAILURE;
    }

    let http = reqwest::Client::new();
    let authenticator = Authenticator::spawn(
        AuthenticatorConfig {
            server_url: conf.server_url.clone(),
            tenant_token: (!conf.tenant_token.is_empty()).then(|| conf.tenant_token.clone()),
        },
        http.clone(),
        Arc::new(keystore),
        Arc::new(IdentityCollector::new(&conf.identity_script)),
    );

    let api = ApiClient::new(authenticator, http.clone());
    let deployments = DeploymentClient::new(api);

    let kv = match SledStore::open(&data_dir.join("mender-store")) {
        Ok(kv) => Arc::new(kv),
        Err(e) => {
            error!(error = %e, "failed to open datastore");
            return ExitCode::FAILURE;
        }
    };
    let engine = UpdateEngine::new(
        kv,
        http,
        EngineConfig {
            modules_dir: PathBuf::from(&conf.artifact_scripts_path),
            work_dir_root: data_dir.join("modules-work"),
            device_type: device_type.clone(),
            module_timeout: MODULE_TIMEOUT,
        },
    );
    let log_dir = LogDirectory::new(data_dir.join("log"));

    run_daemon(&deployments, &engine, &log_dir, &device_type).await
}

async fn run_daemon(
    deployments: &DeploymentClient,
    engine: &UpdateEngine<SledStore>,
    log_dir: &LogDirectory,
    device_type: &str,
) -> ExitCode {
    if let Err(e) = resume_pending(engine, deployments).await {
        error!(error = %e, "failed to resolve an in-progress update from a previous run");
    }

    loop {
        if let Err(e) = poll_once(deployments, engine, log_dir, device_type).await {
            warn!(error = %e, "deployment poll failed, retrying after the usual interval");
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// On startup, a persisted `StateData` record means the previous run died
/// mid-update. `Installed`/`InstalledRebootRequired` both resolve to a
/// commit here, matching the reference agent's "assume the reboot that
/// got us back up counts as success" standalone-mode default.
async fn resume_pending(
    engine: &UpdateEngine<SledStore>,
    deployments: &DeploymentClient,
) -> update_agent::Result<()> {
    let Some(state) = engine.load_state()? else {
        return Ok(());
    };
    info!(artifact = %state.artifact_name, "resuming an update left in progress by a previous run");
    let outcome = engine.commit().await?;
    report_outcome(deployments, None, outcome).await;
    Ok(())
}

async fn poll_once(
    deployments: &DeploymentClient,
    engine: &UpdateEngine<SledStore>,
    log_dir: &LogDirectory,
    device_type: &str,
) -> update_agent::Result<()> {
    let current_provides = engine.read_provides()?;
    let Some(deployment) = deployments
        .check_new_deployments(device_type, &current_provides)
        .await?
    else {
        return Ok(());
    };

    info!(id = %deployment.id, artifact = %deployment.artifact.name, "new deployment");
    deployments
        .push_status(&deployment.id, DeploymentStatus::Downloading, None)
        .await?;

    let log_path = log_dir.begin_new_log(&deployment.id)?;

    deployments
        .push_status(&deployment.id, DeploymentStatus::Installing, None)
        .await?;

    let outcome = engine.install(&deployment.artifact.uri).await?;
    std::fs::write(
        &log_path,
        format!("{{\"level\":\"info\",\"message\":\"install finished: {outcome:?}\"}}\n"),
    )?;
    if let Err(e) = deployments.push_logs(&deployment.id, &log_path).await {
        warn!(error = %e, deployment = %deployment.id, "failed to ship deployment log");
    }

    report_outcome(deployments, Some(&deployment.id), outcome).await;

    Ok(())
}

async fn report_outcome(deployments: &DeploymentClient, deployment_id: Option<&str>, outcome: Outcome) {
    let Some(id) = deployment_id else {
        info!(?outcome, "resumed update resolved");
        return;
    };
    let status = match outcome {
        Outcome::Committed | Outcome::AutoCommitted | Outcome::RolledBack => DeploymentStatus::Success,
        Outcome::Installed | Outcome::InstalledRebootRequired => DeploymentStatus::PauseBeforeCommitting,
        Outcome::NoRollback
        | Outcome::FailedNothingDone
        | Outcome::FailedAndRolledBack
        | Outcome::FailedAndNoRollback
        | Outcome::FailedAndRollbackFailed => DeploymentStatus::Failure,
    };
    if let Err(e) = deployments.push_status(id, status, None).await {
        warn!(error = %e, deployment = %id, "failed to report deployment status");
    }
}
