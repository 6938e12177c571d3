//! Scope Resolver
//!
//! Maps the scope segment of a request path (a namespace, or a legacy
//! single-cluster id) to a registry partition and the orchestrator serving it.

use crate::controlplane::validation::{check_name, NamedKind};
use crate::domain::ports::ClusterOrchestratorRef;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

// =============================================================================
// Scope
// =============================================================================

/// Registry partition a resource lives in
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    /// Control-plane wide: backup storages and monitoring instances
    Global,
    /// A namespace of the default orchestrator
    Namespace(String),
    /// Legacy registration of a whole orchestrator cluster
    Cluster(String),
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Global => write!(f, "global"),
            Scope::Namespace(ns) => write!(f, "namespace/{}", ns),
            Scope::Cluster(id) => write!(f, "kubernetes/{}", id),
        }
    }
}

/// Legacy orchestrator cluster registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRegistration {
    pub id: String,
    pub name: String,
    /// Namespace the cluster's resources are declared in
    pub namespace: String,
}

/// A scope together with where its objects are projected
#[derive(Clone)]
pub struct ResolvedScope {
    /// Registry partition; scopes projecting to the same orchestrator
    /// namespace share one
    pub scope: Scope,
    /// Orchestrator namespace objects of this scope live in
    pub namespace: String,
    pub orchestrator: ClusterOrchestratorRef,
}

impl std::fmt::Debug for ResolvedScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedScope")
            .field("scope", &self.scope)
            .field("namespace", &self.namespace)
            .field("orchestrator", &self.orchestrator.orchestrator_name())
            .finish()
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// Resolves request scopes; fixed at startup
pub struct ScopeResolver {
    /// Managed namespaces, empty to accept any valid namespace
    namespaces: BTreeSet<String>,
    clusters: BTreeMap<String, (ClusterRegistration, ClusterOrchestratorRef)>,
    default_orchestrator: ClusterOrchestratorRef,
}

impl ScopeResolver {
    pub fn new(
        default_orchestrator: ClusterOrchestratorRef,
        namespaces: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            namespaces: namespaces.into_iter().collect(),
            clusters: BTreeMap::new(),
            default_orchestrator,
        }
    }

    /// Register a legacy cluster served by its own orchestrator handle
    pub fn with_cluster(
        mut self,
        registration: ClusterRegistration,
        orchestrator: ClusterOrchestratorRef,
    ) -> Self {
        self.clusters
            .insert(registration.id.clone(), (registration, orchestrator));
        self
    }

    pub fn default_orchestrator(&self) -> &ClusterOrchestratorRef {
        &self.default_orchestrator
    }

    /// Resolve a namespaced or legacy scope
    pub fn resolve(&self, scope: &Scope) -> Result<ResolvedScope> {
        if let Scope::Namespace(ns) = scope {
            check_name(NamedKind::Namespace, "namespace", ns)?;
            if !self.namespaces.is_empty() && !self.namespaces.contains(ns) {
                return Err(Error::ScopeNotFound(format!(
                    "namespace '{}' is not managed",
                    ns
                )));
            }
        }
        self.resolve_partition(scope)
    }

    /// Resolve a registry partition, skipping the managed namespace check
    pub fn resolve_partition(&self, scope: &Scope) -> Result<ResolvedScope> {
        match scope {
            Scope::Global => Err(Error::ScopeNotFound(
                "the global scope has no orchestrator".into(),
            )),
            Scope::Namespace(ns) => Ok(ResolvedScope {
                scope: scope.clone(),
                namespace: ns.clone(),
                orchestrator: self.default_orchestrator.clone(),
            }),
            Scope::Cluster(id) => {
                let (registration, orchestrator) = self.clusters.get(id).ok_or_else(|| {
                    Error::ScopeNotFound(format!("Kubernetes cluster '{}' is not found", id))
                })?;
                Ok(ResolvedScope {
                    scope: self.partition(&registration.namespace, orchestrator),
                    namespace: registration.namespace.clone(),
                    orchestrator: orchestrator.clone(),
                })
            }
        }
    }

    /// Partition owning a namespace of an orchestrator. Legacy clusters on the
    /// default orchestrator alias the namespace scope; legacy clusters sharing
    /// another handle alias the lowest such cluster id.
    fn partition(&self, namespace: &str, orchestrator: &ClusterOrchestratorRef) -> Scope {
        if same_orchestrator(orchestrator, &self.default_orchestrator) {
            return Scope::Namespace(namespace.to_string());
        }
        self.clusters
            .iter()
            .find(|(_, (registration, other))| {
                registration.namespace == namespace && same_orchestrator(orchestrator, other)
            })
            .map(|(id, _)| Scope::Cluster(id.clone()))
            .unwrap_or_else(|| Scope::Namespace(namespace.to_string()))
    }

    pub fn registration(&self, id: &str) -> Result<ClusterRegistration> {
        self.clusters
            .get(id)
            .map(|(registration, _)| registration.clone())
            .ok_or_else(|| {
                Error::ScopeNotFound(format!("Kubernetes cluster '{}' is not found", id))
            })
    }

    /// Legacy registrations ordered by id
    pub fn clusters(&self) -> Vec<ClusterRegistration> {
        self.clusters
            .values()
            .map(|(registration, _)| registration.clone())
            .collect()
    }

    /// Every statically known partition: configured namespaces and legacy clusters
    pub fn known_scopes(&self) -> Vec<ResolvedScope> {
        let namespaces = self
            .namespaces
            .iter()
            .filter_map(|ns| self.resolve(&Scope::Namespace(ns.clone())).ok());
        let clusters = self
            .clusters
            .keys()
            .filter_map(|id| self.resolve(&Scope::Cluster(id.clone())).ok());
        let mut seen = BTreeSet::new();
        namespaces
            .chain(clusters)
            .filter(|resolved| seen.insert(resolved.scope.clone()))
            .collect()
    }
}

fn same_orchestrator(a: &ClusterOrchestratorRef, b: &ClusterOrchestratorRef) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
