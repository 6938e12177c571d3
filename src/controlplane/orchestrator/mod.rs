//! Orchestrator adapters and the apply queue feeding them

pub mod kubernetes;
pub mod memory;
pub mod queue;

pub use kubernetes::{KubeOrchestrator, KubeOrchestratorConfig, FIELD_MANAGER};
pub use memory::{InMemoryOrchestrator, InMemoryOrchestratorConfig};
pub use queue::{ApplyCommand, ApplyQueue, ApplyQueueConfig};
