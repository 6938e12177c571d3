//! Scope-level operations
//!
//! Database engine catalog, cluster capacity and metadata, legacy cluster
//! registrations, and the scope's cluster monitoring binding.

use super::ControlPlane;
use crate::controlplane::scope::{ClusterRegistration, Scope};
use crate::controlplane::validation::{check_envelope, shapes, validate, Mode};
use crate::crd::{DatabaseEngine, DatabaseEngineSpec};
use crate::domain::ports::{ClusterInfo, ClusterResources};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

const ENGINE_KIND: &str = "DatabaseEngine";

/// Body of a cluster monitoring toggle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMonitoringRequest {
    pub enable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitoring_instance: Option<String>,
}

impl ControlPlane {
    // -------------------------------------------------------------------------
    // Database engines
    // -------------------------------------------------------------------------

    pub async fn list_engines(&self, scope: &Scope) -> Result<Vec<DatabaseEngine>> {
        let resolved = self.resolver.resolve(scope)?;
        resolved.orchestrator.list_engines(&resolved.namespace).await
    }

    pub async fn get_engine(&self, scope: &Scope, name: &str) -> Result<DatabaseEngine> {
        let resolved = self.resolver.resolve(scope)?;
        resolved
            .orchestrator
            .get_engine(&resolved.namespace, name)
            .await?
            .ok_or_else(|| Error::not_found(ENGINE_KIND, name))
    }

    /// Replace an engine's allowed versions; nothing else is writable
    pub async fn update_engine(&self, scope: &Scope, name: &str, body: Value) -> Result<DatabaseEngine> {
        let result = self.try_update_engine(scope, name, body).await;
        self.observed(ENGINE_KIND, "update", result)
    }

    async fn try_update_engine(&self, scope: &Scope, name: &str, body: Value) -> Result<DatabaseEngine> {
        let resolved = self.resolver.resolve(scope)?;
        let declared = check_envelope(ENGINE_KIND, &body)?;
        if declared != name {
            return Err(Error::Validation(format!(
                "metadata.name '{}' does not match '{}' in the request path",
                declared, name
            )));
        }
        validate(&body, &shapes::DATABASE_ENGINE, Mode::Create)?;

        let current = resolved
            .orchestrator
            .get_engine(&resolved.namespace, name)
            .await?
            .ok_or_else(|| Error::not_found(ENGINE_KIND, name))?;

        let spec = body.get("spec").cloned().unwrap_or(Value::Null);
        let requested_type = spec.get("type").and_then(Value::as_str);
        if requested_type.is_some_and(|t| t != current.spec.r#type) {
            return Err(Error::Validation(
                "Only spec.allowedVersions of a database engine can be changed".into(),
            ));
        }
        let requested: DatabaseEngineSpec = serde_json::from_value(serde_json::json!({
            "type": current.spec.r#type,
            "allowedVersions": spec.get("allowedVersions").cloned().unwrap_or(Value::Array(vec![])),
        }))?;

        let engine = resolved
            .orchestrator
            .update_engine_allowed_versions(&resolved.namespace, name, requested.allowed_versions)
            .await?;
        info!("Updated allowed versions of {} in {}", name, scope);
        Ok(engine)
    }

    // -------------------------------------------------------------------------
    // Cluster metadata
    // -------------------------------------------------------------------------

    pub async fn cluster_resources(&self, scope: &Scope) -> Result<ClusterResources> {
        let resolved = self.resolver.resolve(scope)?;
        resolved.orchestrator.cluster_resources().await
    }

    pub async fn cluster_info(&self, scope: &Scope) -> Result<ClusterInfo> {
        let resolved = self.resolver.resolve(scope)?;
        resolved.orchestrator.cluster_info().await
    }

    pub fn list_registrations(&self) -> Vec<ClusterRegistration> {
        self.resolver.clusters()
    }

    pub fn get_registration(&self, id: &str) -> Result<ClusterRegistration> {
        self.resolver.registration(id)
    }

    // -------------------------------------------------------------------------
    // Cluster monitoring
    // -------------------------------------------------------------------------

    /// Monitoring instance the scope is bound to, if any
    pub fn monitoring_binding(&self, scope: &Scope) -> Option<String> {
        let partition = self.resolver.resolve(scope).ok()?.scope;
        self.monitoring_bindings
            .get(&partition)
            .map(|b| b.value().clone())
    }

    pub async fn set_cluster_monitoring(&self, scope: &Scope, body: Value) -> Result<()> {
        let result = self.try_set_cluster_monitoring(scope, body).await;
        self.observed("ClusterMonitoring", "update", result)
    }

    async fn try_set_cluster_monitoring(&self, scope: &Scope, body: Value) -> Result<()> {
        let partition = self.resolver.resolve(scope)?.scope;
        validate(&body, &shapes::CLUSTER_MONITORING, Mode::Create)?;
        let request: ClusterMonitoringRequest = serde_json::from_value(body)?;

        if !request.enable {
            if let Some((_, previous)) = self.monitoring_bindings.remove(&partition) {
                info!("Disabled cluster monitoring of {} (was {})", scope, previous);
            }
            return Ok(());
        }

        let instance = request
            .monitoring_instance
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                Error::Validation("monitoringInstance is required to enable cluster monitoring".into())
            })?;

        // Held so the instance cannot be deleted before the binding is recorded
        let registry = &self.store.monitoring_instances;
        let _lease = registry.lock(&Scope::Global, &instance).await;
        if !registry.contains(&Scope::Global, &instance) {
            return Err(Error::ReferenceNotFound {
                kind: "MonitoringInstance".into(),
                name: instance,
            });
        }
        self.monitoring_bindings.insert(partition, instance.clone());
        info!("Enabled cluster monitoring of {} with {}", scope, instance);
        Ok(())
    }
}
