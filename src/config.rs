//! Configuration loading (spec §6).
//!
//! Parsing is lenient: unknown fields are ignored, and a fallback config
//! file is merged underneath the primary one, matching `figment`'s layer
//! ordering (later-added providers override earlier ones; we add the
//! fallback first, then the primary, then the environment).

use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Json};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Device-side agent configuration, loaded from the JSON config file(s)
/// named on the CLI plus `MENDER_*`-prefixed environment overrides.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Rootfs partition A device node, used by the reference rootfs-image
    /// update module script.
    #[serde(rename = "RootfsPartA")]
    pub rootfs_part_a: String,
    /// Rootfs partition B device node.
    #[serde(rename = "RootfsPartB")]
    pub rootfs_part_b: String,
    /// Base URL of the backend server.
    #[serde(rename = "ServerURL")]
    pub server_url: String,
    /// PEM-encoded CA certificate(s) to trust for `server_url`, or empty
    /// to use the system trust store.
    #[serde(rename = "ServerCertificate")]
    pub server_certificate: String,
    /// Tenant token included in auth requests, or empty if single-tenant.
    #[serde(rename = "TenantToken")]
    pub tenant_token: String,
    /// Path to the file naming this device's type (a single line, e.g.
    /// `raspberrypi4`).
    #[serde(rename = "DeviceTypeFile")]
    pub device_type_file: String,
    /// Directory update modules and their supporting scripts live under.
    #[serde(rename = "ArtifactScriptsPath")]
    pub artifact_scripts_path: String,
    /// Path to the identity-reporting script (spec §2 item 2).
    #[serde(rename = "IdentityScript")]
    pub identity_script: String,
    /// Path to the inventory-reporting script.
    #[serde(rename = "InventoryScript")]
    pub inventory_script: String,
}

impl Config {
    /// Load the primary config at `path`, merging `fallback_path` (if
    /// given) underneath it, then environment overrides prefixed
    /// `MENDER_`.
    pub fn load(path: &Path, fallback_path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(fallback) = fallback_path {
            if fallback.exists() {
                figment = figment.merge(Json::file(fallback));
            }
        }
        if path.exists() {
            figment = figment.merge(Json::file(path));
        }
        figment = figment.merge(Env::prefixed("MENDER_"));

        figment
            .extract()
            .map_err(|e| Error::Config(format!("loading {}: {e}", path.display())))
    }

    /// Read this device's type from [`Self::device_type_file`].
    pub fn device_type(&self) -> Result<String> {
        let contents = std::fs::read_to_string(&self.device_type_file)
            .map_err(|e| Error::Config(format!("reading device type file: {e}")))?;
        Ok(contents.trim().to_string())
    }
}

/// Resolve the config directory from `MENDER_CONF_DIR`, falling back to
/// `/etc/mender`.
#[must_use]
pub fn conf_dir() -> PathBuf {
    std::env::var("MENDER_CONF_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/mender"))
}

/// Resolve the general data directory from `MENDER_DATA_DIR`, falling
/// back to `/usr/share/mender`.
#[must_use]
pub fn data_dir() -> PathBuf {
    std::env::var("MENDER_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/usr/share/mender"))
}

/// Resolve the mutable data-store directory (KV store, keys, logs) from
/// `MENDER_DATASTORE_DIR`, falling back to `/var/lib/mender`.
#[must_use]
pub fn datastore_dir() -> PathBuf {
    std::env::var("MENDER_DATASTORE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/mender"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fields_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mender.conf");
        std::fs::write(
            &path,
            r#"{"ServerURL":"https://example.com","SomeFutureField":42}"#,
        )
        .unwrap();
        let config = Config::load(&path, None).unwrap();
        assert_eq!(config.server_url, "https://example.com");
    }

    #[test]
    fn fallback_config_is_merged_underneath_primary() {
        let dir = tempfile::tempdir().unwrap();
        let fallback = dir.path().join("mender.conf.fallback");
        std::fs::write(&fallback, r#"{"ServerURL":"https://fallback","TenantToken":"t1"}"#).unwrap();
        let primary = dir.path().join("mender.conf");
        std::fs::write(&primary, r#"{"ServerURL":"https://primary"}"#).unwrap();

        let config = Config::load(&primary, Some(&fallback)).unwrap();
        assert_eq!(config.server_url, "https://primary");
        assert_eq!(config.tenant_token, "t1");
    }

    #[test]
    fn missing_primary_with_no_fallback_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.conf");
        let config = Config::load(&path, None).unwrap();
        assert_eq!(config.server_url, "");
    }
}
