//! DatabaseEngine CRD
//!
//! One descriptor per database operator, listing the engine, backup and proxy
//! versions it can run. Only `spec.allowedVersions` is user-editable.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version catalog of a database operator
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "dbaas.controlplane.io",
    version = "v1alpha1",
    kind = "DatabaseEngine",
    plural = "databaseengines",
    status = "DatabaseEngineStatus",
    printcolumn = r#"{"name": "Type", "type": "string", "jsonPath": ".spec.type"}"#,
    printcolumn = r#"{"name": "Status", "type": "string", "jsonPath": ".status.status"}"#,
    printcolumn = r#"{"name": "Operator", "type": "string", "jsonPath": ".status.operatorVersion"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseEngineSpec {
    /// pxc, psmdb or postgresql
    pub r#type: String,

    /// Versions clusters may use; empty means every available version
    #[serde(default)]
    pub allowed_versions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseEngineStatus {
    /// installed or not installed
    #[serde(default)]
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_version: Option<String>,

    #[serde(default)]
    pub available_versions: AvailableVersions,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AvailableVersions {
    #[serde(default)]
    pub engine: BTreeMap<String, Component>,
    #[serde(default)]
    pub backup: BTreeMap<String, Component>,
    /// Keyed by proxy type, then version
    #[serde(default)]
    pub proxy: BTreeMap<String, BTreeMap<String, Component>>,
}

/// A container image offered for a version
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    #[serde(default)]
    pub image_hash: String,
    #[serde(default)]
    pub image_path: String,
    /// recommended, available, unavailable
    #[serde(default)]
    pub status: String,
}

impl DatabaseEngine {
    pub fn is_installed(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.status == "installed")
            .unwrap_or(false)
    }

    /// Whether the version is offered by the operator
    pub fn offers_version(&self, version: &str) -> bool {
        self.status
            .as_ref()
            .map(|s| s.available_versions.engine.contains_key(version))
            .unwrap_or(false)
    }

    /// Whether the version passes the allowed-version list
    pub fn allows_version(&self, version: &str) -> bool {
        version.is_empty()
            || self.spec.allowed_versions.is_empty()
            || self.spec.allowed_versions.iter().any(|v| v == version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(allowed: &[&str]) -> DatabaseEngine {
        let mut engine = DatabaseEngine::new(
            "percona-server-mongodb-operator",
            DatabaseEngineSpec {
                r#type: "psmdb".into(),
                allowed_versions: allowed.iter().map(|v| v.to_string()).collect(),
            },
        );
        let mut available = AvailableVersions::default();
        available.engine.insert(
            "6.0.5-4".into(),
            Component {
                image_hash: "b6f875974c59".into(),
                image_path: "percona/percona-server-mongodb:6.0.5-4".into(),
                status: "recommended".into(),
            },
        );
        engine.status = Some(DatabaseEngineStatus {
            status: "installed".into(),
            operator_version: Some("1.14.0".into()),
            available_versions: available,
        });
        engine
    }

    #[test]
    fn test_version_checks() {
        let open = engine(&[]);
        assert!(open.is_installed());
        assert!(open.allows_version("5.0.7-6"));
        assert!(open.offers_version("6.0.5-4"));
        assert!(!open.offers_version("5.0.7-6"));

        let restricted = engine(&["6.0.5-4"]);
        assert!(restricted.allows_version("6.0.5-4"));
        assert!(!restricted.allows_version("6.0.4-3"));
    }

    #[test]
    fn test_engine_wire_shape() {
        let json = serde_json::to_value(engine(&["6.0.5-4"])).unwrap();
        assert_eq!(json["spec"]["allowedVersions"][0], "6.0.5-4");
        assert_eq!(
            json["status"]["availableVersions"]["engine"]["6.0.5-4"]["status"],
            "recommended"
        );
    }
}
