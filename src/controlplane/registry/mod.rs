//! Resource Registry Module
//!
//! One sharded registry per resource kind, all publishing to a shared event
//! channel.

pub mod events;
pub mod records;
pub mod resource_registry;

pub use events::*;
pub use records::*;
pub use resource_registry::*;

use crate::crd::{DatabaseCluster, DatabaseClusterBackup, DatabaseClusterRestore};
use tokio::sync::broadcast;

/// Capacity of the registry event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// The authoritative store of every declared resource
pub struct ResourceStore {
    pub backup_storages: ResourceRegistry<BackupStorageRecord>,
    pub monitoring_instances: ResourceRegistry<MonitoringInstanceRecord>,
    pub clusters: ResourceRegistry<DatabaseCluster>,
    pub backups: ResourceRegistry<DatabaseClusterBackup>,
    pub restores: ResourceRegistry<DatabaseClusterRestore>,
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl ResourceStore {
    pub fn new() -> Self {
        let (event_sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            backup_storages: ResourceRegistry::new(event_sender.clone()),
            monitoring_instances: ResourceRegistry::new(event_sender.clone()),
            clusters: ResourceRegistry::new(event_sender.clone()),
            backups: ResourceRegistry::new(event_sender.clone()),
            restores: ResourceRegistry::new(event_sender.clone()),
            event_sender,
        }
    }

    /// Get an event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    /// Record counts per kind
    pub fn counts(&self) -> Vec<(ResourceKind, usize)> {
        vec![
            (ResourceKind::BackupStorage, self.backup_storages.len()),
            (ResourceKind::MonitoringInstance, self.monitoring_instances.len()),
            (ResourceKind::DatabaseCluster, self.clusters.len()),
            (ResourceKind::DatabaseClusterBackup, self.backups.len()),
            (ResourceKind::DatabaseClusterRestore, self.restores.len()),
        ]
    }
}

impl Default for ResourceStore {
    fn default() -> Self {
        Self::new()
    }
}
