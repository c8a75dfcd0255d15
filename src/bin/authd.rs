//! Authenticator daemon: owns the device key, the JWT Authenticator, and
//! the Local Reverse Proxy (spec §2, §6).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use update_agent::auth::{Authenticator, AuthenticatorConfig};
use update_agent::cli::{read_passphrase, Cli, Command};
use update_agent::config::{self, Config};
use update_agent::identity::IdentityCollector;
use update_agent::keystore::Keystore;
use update_agent::proxy::LocalReverseProxy;
use update_agent::{setup_tracing, Error};

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
        "starting authd"
    );

    let key_path = data_dir.join("mender-agent.pem");
    let passphrase = match cli.passphrase_file.as_deref().map(read_passphrase) {
        Some(Ok(p)) => Some(p),
        Some(Err(e)) => {
            error!(error = %e, "failed to read passphrase");
            return ExitCode::FAILURE;
        }
        None => None,
    };

    let keystore = match load_or_generate_key(&key_path, passphrase.as_deref(), cli.forcebootstrap) {
        Ok(ks) => ks,
        Err(e) => {
            error!(error = %e, "keystore setup failed");
            return ExitCode::FAILURE;
        }
    };

    match &cli.command {
        Command::Bootstrap => {
            let identity = IdentityCollector::new(&conf.identity_script);
            match identity.collect().await {
                Ok(map) => {
                    info!(identity = %map.to_json(), "bootstrap complete");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!(error = %e, "failed to collect identity during bootstrap");
                    ExitCode::FAILURE
                }
            }
        }
        Command::Daemon => run_daemon(conf, keystore).await,
    }
}

fn load_or_generate_key(
    path: &PathBuf,
    passphrase: Option<&str>,
    force: bool,
) -> update_agent::Result<Keystore> {
    let mut keystore = Keystore::new();
    if !force {
        match keystore.load(path, passphrase) {
            Ok(()) => return Ok(keystore),
            Err(Error::Keystore(update_agent::error::KeystoreError::NoKey)) => {}
            Err(e) => return Err(e),
        }
    }
    keystore.generate_default()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    keystore.save(path)?;
    Ok(keystore)
}

async fn run_daemon(conf: Config, keystore: Keystore) -> ExitCode {
    let http = match build_http_client(&conf) {
        Ok(h) => h,
        Err(e) => {
            error!(error = %e, "failed to build HTTP client");
            return ExitCode::FAILURE;
        }
    };

    let identity = Arc::new(IdentityCollector::new(&conf.identity_script));
    let keystore = Arc::new(keystore);

    let authenticator = Authenticator::spawn(
        AuthenticatorConfig {
            server_url: conf.server_url.clone(),
            tenant_token: (!conf.tenant_token.is_empty()).then(|| conf.tenant_token.clone()),
        },
        http.clone(),
        Arc::clone(&keystore),
        Arc::clone(&identity),
    );

    let auth_data = match authenticator.get_token().await {
        Ok(data) => data,
        Err(e) => {
            error!(error = %e, "initial authentication failed");
            return ExitCode::FAILURE;
        }
    };

    // The proxy's `jwt` is the same device token the Authenticator just
    // obtained: on-device clients that already know it (handed to them by
    // this daemon's own on-device provisioning, outside this spec's scope)
    // can reach the server through the proxy without authenticating
    // themselves — see spec §4.4.
    let proxy = match LocalReverseProxy::new(
        http,
        Some(auth_data.server_url.clone()),
        Some(auth_data.token.as_str().to_string()),
    )
    .await
    {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "failed to start local reverse proxy");
            return ExitCode::FAILURE;
        }
    };

    info!(proxy_url = %proxy.get_server_url(), "authd ready");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal"),
        Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
    }

    proxy.stop().await;
    info!("authd shutdown complete");
    ExitCode::SUCCESS
}

fn build_http_client(conf: &Config) -> reqwest::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();
    if !conf.server_certificate.is_empty() {
        if let Ok(cert) = reqwest::Certificate::from_pem(conf.server_certificate.as_bytes()) {
            builder = builder.add_root_certificate(cert);
        }
    }
    builder.build()
}
