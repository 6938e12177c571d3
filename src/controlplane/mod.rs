//! Control Plane Module
//!
//! Registry, validation, scope resolution, credential handling, status
//! projection and the orchestrator adapters behind the REST API.

pub mod api;
pub mod metrics;
pub mod orchestrator;
pub mod precheck;
pub mod projector;
pub mod references;
pub mod registry;
pub mod scope;
pub mod secrets;
pub mod service;
pub mod validation;

pub use api::{ApiServer, ApiServerConfig, RestRouter};
pub use metrics::ApiMetrics;
pub use orchestrator::{
    ApplyQueue, ApplyQueueConfig, InMemoryOrchestrator, InMemoryOrchestratorConfig,
    KubeOrchestrator, KubeOrchestratorConfig,
};
pub use precheck::{PmmPrechecker, PrecheckConfig};
pub use projector::StatusProjector;
pub use registry::{ResourceKind, ResourceStore};
pub use scope::{ClusterRegistration, ResolvedScope, Scope, ScopeResolver};
pub use secrets::InMemorySecretStore;
pub use service::{ControlPlane, ControlPlaneDeps};
