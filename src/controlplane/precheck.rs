//! PMM Credential Prechecker
//!
//! Exchanges a PMM user/password for an API key before a monitoring instance
//! is accepted. Any failure, including an unreachable endpoint, rejects the
//! request.

use crate::domain::ports::CredentialPrechecker;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Prechecker configuration
#[derive(Debug, Clone)]
pub struct PrecheckConfig {
    /// Upper bound on the whole round-trip
    pub timeout: Duration,
    /// Role requested for the derived key
    pub key_role: String,
}

impl Default for PrecheckConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            key_role: "Admin".to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateKeyRequest<'a> {
    name: &'a str,
    role: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateKeyResponse {
    key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PmmErrorMessage {
    message: Option<String>,
}

/// Prechecker talking to the PMM (Grafana) key API
pub struct PmmPrechecker {
    client: reqwest::Client,
    config: PrecheckConfig,
}

impl PmmPrechecker {
    pub fn new(config: PrecheckConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }
}

fn precheck_failed(detail: impl std::fmt::Display) -> Error {
    Error::Credential(format!("Could not create an API key in PMM: {}", detail))
}

#[async_trait]
impl CredentialPrechecker for PmmPrechecker {
    async fn obtain_api_key(
        &self,
        url: &str,
        user: &str,
        password: &str,
        key_name: &str,
    ) -> Result<String> {
        let endpoint = format!("{}/graph/api/auth/keys", url.trim_end_matches('/'));
        debug!("Requesting PMM API key '{}' from {}", key_name, endpoint);

        let response = self
            .client
            .post(&endpoint)
            .basic_auth(user, Some(password))
            .json(&CreateKeyRequest {
                name: key_name,
                role: &self.config.key_role,
            })
            .send()
            .await
            .map_err(|e| {
                warn!("PMM at {} is unreachable: {}", url, e);
                precheck_failed(e)
            })?;

        let status = response.status();
        let body = response.bytes().await.map_err(precheck_failed)?;

        if status.is_client_error() || status.is_server_error() {
            let detail = match serde_json::from_slice::<PmmErrorMessage>(&body) {
                Ok(PmmErrorMessage {
                    message: Some(message),
                }) => format!("PMM returned an error with message: {}", message),
                _ => format!(
                    "PMM returned an unknown error. HTTP status code {}",
                    status.as_u16()
                ),
            };
            return Err(precheck_failed(detail));
        }

        let parsed: CreateKeyResponse = serde_json::from_slice(&body).map_err(precheck_failed)?;
        parsed
            .key
            .filter(|key| !key.is_empty())
            .ok_or_else(|| precheck_failed("the response carries no key"))
    }
}
