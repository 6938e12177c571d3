//! Control plane configuration file
//!
//! ```yaml
//! namespaces: [team-a, team-b]
//! defaultNamespace: dbaas
//! precheckTimeoutSecs: 10
//! clusters:
//!   - id: 7c9a...
//!     name: staging
//!     namespace: dbaas-staging
//!     kubeconfig: /etc/dbaas/staging.kubeconfig
//! ```

use crate::controlplane::scope::ClusterRegistration;
use crate::controlplane::validation::{check_name, NamedKind};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::info;

/// A legacy cluster registration as written in the file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterEntry {
    pub id: String,
    pub name: String,
    /// Falls back to the default namespace
    #[serde(default)]
    pub namespace: Option<String>,
    /// Kubeconfig of the cluster; the default client when absent
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,
}

/// Startup configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneConfig {
    /// Managed namespaces, empty to accept any valid namespace
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default = "default_namespace")]
    pub default_namespace: String,
    #[serde(default)]
    pub precheck_timeout_secs: Option<u64>,
    #[serde(default)]
    pub clusters: Vec<ClusterEntry>,
}

fn default_namespace() -> String {
    "dbaas".to_string()
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            namespaces: Vec::new(),
            default_namespace: default_namespace(),
            precheck_timeout_secs: None,
            clusters: Vec::new(),
        }
    }
}

impl ControlPlaneConfig {
    /// Read and validate a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ControlPlaneConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        info!(
            "Loaded {} namespaces and {} cluster registrations from {}",
            config.namespaces.len(),
            config.clusters.len(),
            path.display()
        );
        Ok(config)
    }

    /// Add namespaces given on the command line
    pub fn with_namespaces(mut self, extra: impl IntoIterator<Item = String>) -> Self {
        for namespace in extra {
            if !self.namespaces.contains(&namespace) {
                self.namespaces.push(namespace);
            }
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        check_name(NamedKind::Namespace, "defaultNamespace", &self.default_namespace)
            .map_err(|e| Error::Configuration(e.to_string()))?;
        for namespace in &self.namespaces {
            check_name(NamedKind::Namespace, "namespaces", namespace)
                .map_err(|e| Error::Configuration(e.to_string()))?;
        }

        let mut ids = BTreeSet::new();
        for cluster in &self.clusters {
            if cluster.id.is_empty() {
                return Err(Error::Configuration(format!(
                    "cluster '{}' has an empty id",
                    cluster.name
                )));
            }
            if !ids.insert(cluster.id.as_str()) {
                return Err(Error::Configuration(format!(
                    "cluster id '{}' is registered twice",
                    cluster.id
                )));
            }
            if let Some(namespace) = cluster.namespace.as_deref() {
                check_name(NamedKind::Namespace, "clusters.namespace", namespace)
                    .map_err(|e| Error::Configuration(e.to_string()))?;
            }
        }
        Ok(())
    }

    /// Registration of a cluster entry with its namespace resolved
    pub fn registration(&self, entry: &ClusterEntry) -> ClusterRegistration {
        ClusterRegistration {
            id: entry.id.clone(),
            name: entry.name.clone(),
            namespace: entry
                .namespace
                .clone()
                .unwrap_or_else(|| self.default_namespace.clone()),
        }
    }
}
