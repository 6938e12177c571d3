//! Monitoring instance operations
//!
//! A monitoring instance stores one API key. It is either supplied directly
//! or derived from user/password through the credential prechecker.

use super::ControlPlane;
use crate::controlplane::registry::MonitoringInstanceRecord;
use crate::controlplane::scope::Scope;
use crate::controlplane::validation::{
    check_name, check_url, shapes, validate, Mode, NamedKind,
};
use crate::error::{Error, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

const KIND: &str = "MonitoringInstance";

/// Credentials of a PMM endpoint
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PmmCredentials {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMonitoringInstanceRequest {
    #[serde(rename = "type")]
    pub instance_type: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub pmm: Option<PmmCredentials>,
    #[serde(default)]
    pub target_namespaces: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchMonitoringInstanceRequest {
    #[serde(default, rename = "type")]
    pub instance_type: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub pmm: Option<PmmCredentials>,
    #[serde(default)]
    pub target_namespaces: Option<Vec<String>>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

fn pmm_required() -> Error {
    Error::Validation("Pmm key is required for type pmm".into())
}

impl ControlPlane {
    /// API key to store: the supplied one, or one derived from user/password
    async fn resolve_api_key(&self, name: &str, url: &str, pmm: &PmmCredentials) -> Result<String> {
        if let Some(api_key) = non_empty(&pmm.api_key) {
            return Ok(api_key.to_string());
        }
        match (non_empty(&pmm.user), non_empty(&pmm.password)) {
            (Some(user), Some(password)) => {
                let key_name = format!("dbaas-{}-{}", name, Uuid::new_v4());
                self.prechecker
                    .obtain_api_key(url, user, password, &key_name)
                    .await
            }
            (None, None) => Err(Error::Validation(
                "one of pmm.apiKey, pmm.user or pmm.password fields is required".into(),
            )),
            _ => Err(Error::Validation(
                "pmm.user and pmm.password are both required to create an API key".into(),
            )),
        }
    }

    pub fn list_monitoring_instances(&self) -> Vec<MonitoringInstanceRecord> {
        self.store
            .monitoring_instances
            .list(&Scope::Global, None)
            .into_iter()
            .map(|e| e.record)
            .collect()
    }

    pub fn get_monitoring_instance(&self, name: &str) -> Result<MonitoringInstanceRecord> {
        let result = self
            .store
            .monitoring_instances
            .get(&Scope::Global, name)
            .map(|e| e.record);
        self.observed(KIND, "get", result)
    }

    pub async fn create_monitoring_instance(&self, body: Value) -> Result<MonitoringInstanceRecord> {
        let result = self.try_create_monitoring_instance(body).await;
        self.observed(KIND, "create", result)
    }

    async fn try_create_monitoring_instance(&self, body: Value) -> Result<MonitoringInstanceRecord> {
        validate(&body, &shapes::MONITORING_INSTANCE_CREATE, Mode::Create)?;
        let request: CreateMonitoringInstanceRequest = serde_json::from_value(body)?;

        check_name(NamedKind::MonitoringInstance, "name", &request.name)?;
        check_url("url", &request.url)?;
        for namespace in request.target_namespaces.iter().flatten() {
            check_name(NamedKind::Namespace, "targetNamespaces", namespace)?;
        }
        let pmm = request.pmm.as_ref().ok_or_else(pmm_required)?;

        let registry = &self.store.monitoring_instances;
        let lease = registry.lock(&Scope::Global, &request.name).await;
        if registry.contains(&Scope::Global, &request.name) {
            return Err(Error::exists(KIND, &request.name));
        }

        let api_key = self.resolve_api_key(&request.name, &request.url, pmm).await?;
        let api_key_secret_id = self.secrets.put(&api_key).await?;

        let record = MonitoringInstanceRecord {
            name: request.name,
            instance_type: request.instance_type,
            url: request.url,
            api_key_secret_id,
            target_namespaces: request.target_namespaces.unwrap_or_default(),
        };
        match registry.create(&lease, record.clone()) {
            Ok(entry) => {
                info!("Created monitoring instance {}", entry.name);
                Ok(entry.record)
            }
            Err(e) => {
                self.retire_secret(&record.api_key_secret_id).await;
                Err(e)
            }
        }
    }

    pub async fn patch_monitoring_instance(
        &self,
        name: &str,
        body: Value,
    ) -> Result<MonitoringInstanceRecord> {
        let result = self.try_patch_monitoring_instance(name, body).await;
        self.observed(KIND, "update", result)
    }

    async fn try_patch_monitoring_instance(
        &self,
        name: &str,
        body: Value,
    ) -> Result<MonitoringInstanceRecord> {
        validate(&body, &shapes::MONITORING_INSTANCE_PATCH, Mode::Patch)?;
        let patch: PatchMonitoringInstanceRequest = serde_json::from_value(body)?;

        if let Some(url) = patch.url.as_deref() {
            check_url("url", url)?;
        }
        for namespace in patch.target_namespaces.iter().flatten() {
            check_name(NamedKind::Namespace, "targetNamespaces", namespace)?;
        }
        if patch.instance_type.is_some() && patch.pmm.is_none() {
            return Err(pmm_required());
        }

        let registry = &self.store.monitoring_instances;
        let lease = registry.lock(&Scope::Global, name).await;
        let current = registry.get(&Scope::Global, name)?.record;

        let mut updated = current.clone();
        if let Some(instance_type) = patch.instance_type {
            updated.instance_type = instance_type;
        }
        if let Some(url) = patch.url {
            updated.url = url;
        }
        if let Some(target_namespaces) = patch.target_namespaces {
            updated.target_namespaces = target_namespaces;
        }

        // The reference only moves when the stored key actually changes
        let mut retired = None;
        if let Some(pmm) = patch.pmm.as_ref() {
            let api_key = self.resolve_api_key(name, &updated.url, pmm).await?;
            let stored = self.secrets.get(&current.api_key_secret_id).await?;
            if api_key != stored {
                updated.api_key_secret_id = self
                    .secrets
                    .rotate(&current.api_key_secret_id, &api_key)
                    .await?;
                retired = Some(current.api_key_secret_id.clone());
            }
        }

        let entry = match registry.update(&lease, updated.clone()) {
            Ok(entry) => entry,
            Err(e) => {
                if retired.is_some() {
                    self.retire_secret(&updated.api_key_secret_id).await;
                }
                return Err(e);
            }
        };
        drop(lease);

        if let Some(reference) = retired {
            self.retire_secret(&reference).await;
            self.metrics.secret_rotations.inc();
        }

        info!("Updated monitoring instance {}", name);
        Ok(entry.record)
    }

    pub async fn delete_monitoring_instance(&self, name: &str) -> Result<MonitoringInstanceRecord> {
        let result = self.try_delete_monitoring_instance(name).await;
        self.observed(KIND, "delete", result)
    }

    /// Whether a cluster or a scope's cluster monitoring points at the instance
    fn monitoring_instance_in_use(&self, name: &str) -> bool {
        self.store
            .clusters
            .list_all()
            .iter()
            .any(|e| e.record.monitoring_instance() == Some(name))
            || self.monitoring_bindings.iter().any(|b| b.value() == name)
    }

    async fn try_delete_monitoring_instance(&self, name: &str) -> Result<MonitoringInstanceRecord> {
        let registry = &self.store.monitoring_instances;
        let lease = registry.lock(&Scope::Global, name).await;
        registry.get(&Scope::Global, name)?;

        if self.monitoring_instance_in_use(name) {
            return Err(Error::ResourceInUse {
                kind: KIND.into(),
                name: name.into(),
            });
        }

        let entry = registry.delete(&lease)?;
        drop(lease);
        self.retire_secret(&entry.record.api_key_secret_id).await;

        info!("Deleted monitoring instance {}", name);
        Ok(entry.record)
    }
}
