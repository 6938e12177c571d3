//! DBaaS Control Plane
//!
//! REST control plane for database clusters, their backups and restores,
//! backup storages and monitoring instances. Declared resources are kept in
//! an in-process registry and projected to a reconciling orchestrator
//! (Kubernetes with the Percona operators, or an in-memory stand-in).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        REST API (axum)                               │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  Schema / Name   │  Reference   │  Credential   │  Scope            │
//! │  Validation      │  Checker     │  Prechecker   │  Resolver         │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │        Resource Registry (sharded, per-name write leases)            │
//! │        Secret Store (versioned references)                           │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  Apply Queue (FIFO, backoff)     │     Status Projector              │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │        Cluster Orchestrator: Kubernetes │ In-memory                  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: registry, validation, services and the REST API
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: port traits and shared domain types
//! - [`config`]: startup configuration file
//! - [`error`]: Error types and handling

pub mod config;
pub mod controlplane;
pub mod crd;
pub mod domain;
pub mod error;

pub use config::{ClusterEntry, ControlPlaneConfig};

pub use controlplane::{
    ApiMetrics, ApiServer, ApiServerConfig, ApplyQueue, ApplyQueueConfig, ClusterRegistration,
    ControlPlane, ControlPlaneDeps, InMemoryOrchestrator, InMemoryOrchestratorConfig,
    InMemorySecretStore, KubeOrchestrator, KubeOrchestratorConfig, PmmPrechecker,
    PrecheckConfig, RestRouter, Scope, ScopeResolver,
};

pub use crd::{
    BackupStorage, DatabaseCluster, DatabaseClusterBackup, DatabaseClusterRestore,
    DatabaseEngine, EngineType,
};

pub use domain::ports::{
    ClusterOrchestrator, ClusterOrchestratorRef, CredentialPrechecker, ObjectKind, ObjectRef,
    SecretRef, SecretStore,
};

pub use error::{Error, ErrorAction, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
