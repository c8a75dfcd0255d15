//! Deployment Client: polls for new deployments, streams status updates,
//! ships deployment logs (spec §4.7).

mod log_shipper;

use std::collections::BTreeMap;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use log_shipper::{LogDirectory, LOG_RETENTION_COUNT, LOG_RETENTION_FREE_BYTES};

use crate::api_client::{ApiClient, ApiRequest};
use crate::error::{ApiError, DeploymentError};

fn map_api_err(err: ApiError) -> DeploymentError {
    match err {
        ApiError::Unauthorized => DeploymentError::BadResponse(401),
        other => DeploymentError::InvalidData(other.to_string()),
    }
}

const NEXT_V2_PATH: &str = "/api/devices/v2/deployments/device/deployments/next";
const NEXT_V1_PATH: &str = "/api/devices/v1/deployments/device/deployments/next";

/// A deployment assignment received from the server.
#[derive(Debug, Clone, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub artifact: DeploymentArtifact,
    #[serde(default)]
    pub control_map: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentArtifact {
    pub uri: String,
    pub name: String,
    pub compatible_devices: Vec<String>,
    pub source: Option<ArtifactSource>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactSource {
    pub expire: Option<String>,
}

/// Deployment progress status, pushed via [`DeploymentClient::push_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentStatus {
    Installing,
    Downloading,
    Rebooting,
    Success,
    Failure,
    PauseBeforeInstalling,
    PauseBeforeRebooting,
    PauseBeforeCommitting,
    #[serde(rename = "already-installed")]
    AlreadyInstalled,
}

#[derive(Serialize)]
struct NextDeploymentBodyV2<'a> {
    device_provides: BTreeMap<&'a str, &'a str>,
}

#[derive(Serialize)]
struct PushStatusBody<'a> {
    status: DeploymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    substate: Option<&'a str>,
}

/// Uses the shared [`ApiClient`] to poll, report, and ship logs for
/// deployments.
pub struct DeploymentClient {
    api: ApiClient,
}

impl DeploymentClient {
    #[must_use]
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    /// Poll for the next deployment. `current_provides` excludes
    /// `device_type`, which is always injected separately.
    pub async fn check_new_deployments(
        &self,
        device_type: &str,
        current_provides: &BTreeMap<String, String>,
    ) -> std::result::Result<Option<Deployment>, DeploymentError> {
        let mut device_provides: BTreeMap<&str, &str> = current_provides
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        device_provides.insert("device_type", device_type);

        let body = serde_json::to_vec(&NextDeploymentBodyV2 { device_provides })
            .map_err(|e| DeploymentError::InvalidData(e.to_string()))?;
        let request = ApiRequest::new(Method::POST, NEXT_V2_PATH)
            .with_header("Content-Type", "application/json")
            .with_body(body);

        let response = self.api.call(&request).await.map_err(map_api_err)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!("v2 next-deployment endpoint not found, falling back to v1");
            return self
                .check_new_deployments_v1(device_type, current_provides)
                .await;
        }

        self.parse_deployment_response(response).await
    }

    async fn check_new_deployments_v1(
        &self,
        device_type: &str,
        current_provides: &BTreeMap<String, String>,
    ) -> std::result::Result<Option<Deployment>, DeploymentError> {
        let artifact_name = current_provides
            .get(crate::kvstore::ARTIFACT_NAME_KEY)
            .map_or("", String::as_str);
        let path = format!(
            "{NEXT_V1_PATH}?artifact_name={artifact_name}&device_type={device_type}"
        );
        let request = ApiRequest::new(Method::GET, path);
        let response = self.api.call(&request).await.map_err(map_api_err)?;
        self.parse_deployment_response(response).await
    }

    async fn parse_deployment_response(
        &self,
        response: reqwest::Response,
    ) -> std::result::Result<Option<Deployment>, DeploymentError> {
        match response.status() {
            reqwest::StatusCode::OK => {
                let deployment: Deployment = response
                    .json()
                    .await
                    .map_err(|e| DeploymentError::InvalidData(e.to_string()))?;
                if deployment.artifact.compatible_devices.is_empty() {
                    return Err(DeploymentError::InvalidData(
                        "compatible_devices must be non-empty".into(),
                    ));
                }
                Ok(Some(deployment))
            }
            reqwest::StatusCode::NO_CONTENT => Ok(None),
            other => Err(DeploymentError::BadResponse(other.as_u16())),
        }
    }

    /// Report deployment progress.
    pub async fn push_status(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
        substate: Option<&str>,
    ) -> std::result::Result<(), DeploymentError> {
        let body = serde_json::to_vec(&PushStatusBody { status, substate })
            .map_err(|e| DeploymentError::InvalidData(e.to_string()))?;
        let path = format!("/api/devices/v1/deployments/device/deployments/{deployment_id}/status");
        let request = ApiRequest::new(Method::PUT, path)
            .with_header("Content-Type", "application/json")
            .with_body(body);

        let response = self.api.call(&request).await.map_err(map_api_err)?;

        match response.status() {
            reqwest::StatusCode::NO_CONTENT => Ok(()),
            reqwest::StatusCode::CONFLICT => Err(DeploymentError::DeploymentAborted),
            other => Err(DeploymentError::BadResponse(other.as_u16())),
        }
    }

    /// Ship a deployment's log file, line-delimited-to-JSON wrapped on the
    /// fly.
    pub async fn push_logs(
        &self,
        deployment_id: &str,
        log_file_path: &std::path::Path,
    ) -> std::result::Result<(), DeploymentError> {
        let body = log_shipper::wrap_log_file(log_file_path)
            .map_err(|e| DeploymentError::InvalidData(e.to_string()))?;
        let path = format!("/api/devices/v1/deployments/device/deployments/{deployment_id}/log");
        let request = ApiRequest::new(Method::PUT, path)
            .with_header("Content-Type", "application/json")
            .with_header("Content-Length", body.len().to_string())
            .with_body(body);

        let response = self.api.call(&request).await.map_err(map_api_err)?;

        match response.status() {
            reqwest::StatusCode::NO_CONTENT | reqwest::StatusCode::OK => Ok(()),
            other => Err(DeploymentError::BadResponse(other.as_u16())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Authenticator, AuthenticatorConfig};
    use crate::identity::IdentityCollector;
    use crate::keystore::{KeyKind, Keystore};
    use std::sync::Arc;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn deployment_client_for(server: &MockServer) -> DeploymentClient {
        let mut ks = Keystore::new();
        ks.generate(KeyKind::Ed25519, 0).unwrap();
        let auth = Authenticator::spawn(
            AuthenticatorConfig {
                server_url: server.uri(),
                tenant_token: None,
            },
            reqwest::Client::new(),
            Arc::new(ks),
            Arc::new(IdentityCollector::new("/bin/echo")),
        );
        DeploymentClient::new(ApiClient::new(auth, reqwest::Client::new()))
    }

    #[tokio::test]
    async fn v1_fallback_carries_the_current_artifact_name() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/devices/v1/authentication/auth_requests"))
            .respond_with(ResponseTemplate::new(200).set_body_string("TOKEN"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/devices/v2/deployments/device/deployments/next"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/devices/v1/deployments/device/deployments/next"))
            .and(query_param("artifact_name", "release-7"))
            .and(query_param("device_type", "raspberrypi4"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let client = deployment_client_for(&server);
        let mut current_provides = BTreeMap::new();
        current_provides.insert("artifact-name".to_string(), "release-7".to_string());

        let result = client
            .check_new_deployments("raspberrypi4", &current_provides)
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
