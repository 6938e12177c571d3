//! Sharded Resource Registry
//!
//! A 256-way sharded store of declared resources of one kind, keyed by
//! (scope, name). Reads take a shard read lock only. Every write requires a
//! [`WriteLease`] for its key, which linearizes create, update, rename and
//! delete of one resource across await points without blocking other keys.

use super::events::RegistryEvent;
use super::records::Record;
use crate::controlplane::scope::Scope;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};

// =============================================================================
// Constants
// =============================================================================

/// Number of shards in the registry (256 for good distribution)
pub const REGISTRY_SHARD_COUNT: usize = 256;

// =============================================================================
// Resource Key
// =============================================================================

/// Registry key of a resource
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub scope: Scope,
    pub name: String,
}

impl ResourceKey {
    pub fn new(scope: Scope, name: impl Into<String>) -> Self {
        Self {
            scope,
            name: name.into(),
        }
    }

    /// Get the shard index for this key
    #[inline]
    pub fn shard_index(&self) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.hash(&mut hasher);
        (hasher.finish() as usize) % REGISTRY_SHARD_COUNT
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.scope, self.name)
    }
}

// =============================================================================
// Write Leases
// =============================================================================

type LockTable = DashMap<ResourceKey, Arc<Mutex<()>>>;

/// Exclusive right to write one key, held across await points
pub struct WriteLease {
    key: ResourceKey,
    guard: Option<OwnedMutexGuard<()>>,
    table: Arc<LockTable>,
}

impl WriteLease {
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }
}

impl std::fmt::Debug for WriteLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteLease").field("key", &self.key).finish()
    }
}

impl Drop for WriteLease {
    fn drop(&mut self) {
        self.guard.take();
        // Forget the mutex once nobody else holds or waits on it
        self.table
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

// =============================================================================
// Registry Entry
// =============================================================================

/// A stored record with its bookkeeping
#[derive(Debug, Clone)]
pub struct RegistryEntry<T> {
    pub scope: Scope,
    pub name: String,
    pub record: T,
    /// Starts at 1, bumped by every update or rename
    pub generation: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Shard
// =============================================================================

/// Statistics for a single shard
#[derive(Debug, Default)]
pub struct ShardStats {
    /// Number of records in shard
    pub record_count: AtomicU64,
    /// Total writes to this shard
    pub write_count: AtomicU64,
}

/// A single shard of the registry
pub struct RegistryShard<T> {
    records: RwLock<HashMap<ResourceKey, RegistryEntry<T>>>,
    stats: ShardStats,
}

impl<T> RegistryShard<T> {
    fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            stats: ShardStats::default(),
        }
    }

    fn record_count(&self) -> usize {
        self.stats.record_count.load(Ordering::Relaxed) as usize
    }
}

impl<T> std::fmt::Debug for RegistryShard<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryShard")
            .field("record_count", &self.record_count())
            .finish()
    }
}

// =============================================================================
// Global Statistics
// =============================================================================

/// Statistics across all shards
#[derive(Debug, Default)]
pub struct GlobalStats {
    pub total_records: AtomicU64,
    pub creates: AtomicU64,
    pub updates: AtomicU64,
    pub renames: AtomicU64,
    pub deletes: AtomicU64,
    /// Writes rejected with Conflict
    pub conflicts: AtomicU64,
}

impl GlobalStats {
    pub fn snapshot(&self) -> GlobalStatsSnapshot {
        GlobalStatsSnapshot {
            total_records: self.total_records.load(Ordering::Relaxed),
            creates: self.creates.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            renames: self.renames.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of global statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalStatsSnapshot {
    pub total_records: u64,
    pub creates: u64,
    pub updates: u64,
    pub renames: u64,
    pub deletes: u64,
    pub conflicts: u64,
}

// =============================================================================
// Resource Registry
// =============================================================================

/// Sharded registry for one resource kind
pub struct ResourceRegistry<T: Record> {
    shards: Box<[RegistryShard<T>]>,
    locks: Arc<LockTable>,
    global_stats: GlobalStats,
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl<T: Record> ResourceRegistry<T> {
    /// Create a registry publishing to `event_sender`
    pub fn new(event_sender: broadcast::Sender<RegistryEvent>) -> Self {
        let shards: Vec<RegistryShard<T>> = (0..REGISTRY_SHARD_COUNT)
            .map(|_| RegistryShard::new())
            .collect();

        Self {
            shards: shards.into_boxed_slice(),
            locks: Arc::new(DashMap::new()),
            global_stats: GlobalStats::default(),
            event_sender,
        }
    }

    fn shard(&self, key: &ResourceKey) -> &RegistryShard<T> {
        &self.shards[key.shard_index()]
    }

    fn check_lease(&self, lease: &WriteLease, name: &str) -> Result<()> {
        if lease.key.name != name {
            return Err(Error::Internal(format!(
                "write lease for {} used to write '{}'",
                lease.key, name
            )));
        }
        Ok(())
    }

    fn emit(&self, event: RegistryEvent) {
        let _ = self.event_sender.send(event);
    }

    // -------------------------------------------------------------------------
    // Leases
    // -------------------------------------------------------------------------

    /// Wait for the write lease of a key
    pub async fn lock(&self, scope: &Scope, name: &str) -> WriteLease {
        let key = ResourceKey::new(scope.clone(), name);
        let mutex = self.locks.entry(key.clone()).or_default().clone();
        let guard = mutex.lock_owned().await;
        WriteLease {
            key,
            guard: Some(guard),
            table: self.locks.clone(),
        }
    }

    /// Leases for two distinct names, acquired in name order
    pub async fn lock_pair(&self, scope: &Scope, a: &str, b: &str) -> (WriteLease, WriteLease) {
        if a <= b {
            let first = self.lock(scope, a).await;
            let second = self.lock(scope, b).await;
            (first, second)
        } else {
            let second = self.lock(scope, b).await;
            let first = self.lock(scope, a).await;
            (first, second)
        }
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Insert a new record; Conflict when the name is taken in the scope
    pub fn create(&self, lease: &WriteLease, record: T) -> Result<RegistryEntry<T>> {
        self.check_lease(lease, record.name())?;
        let key = lease.key.clone();
        let shard = self.shard(&key);

        let now = Utc::now();
        let entry = RegistryEntry {
            scope: key.scope.clone(),
            name: key.name.clone(),
            record,
            generation: 1,
            created_at: now,
            updated_at: now,
        };

        {
            let mut records = shard.records.write();
            if records.contains_key(&key) {
                self.global_stats.conflicts.fetch_add(1, Ordering::Relaxed);
                return Err(Error::exists(T::KIND.as_str(), &key.name));
            }
            records.insert(key.clone(), entry.clone());
        }
        shard.stats.record_count.fetch_add(1, Ordering::Relaxed);
        shard.stats.write_count.fetch_add(1, Ordering::Relaxed);
        self.global_stats.total_records.fetch_add(1, Ordering::Relaxed);
        self.global_stats.creates.fetch_add(1, Ordering::Relaxed);

        self.emit(RegistryEvent::Created {
            kind: T::KIND,
            scope: key.scope,
            name: key.name,
        });
        Ok(entry)
    }

    /// Replace an existing record
    pub fn update(&self, lease: &WriteLease, record: T) -> Result<RegistryEntry<T>> {
        self.check_lease(lease, record.name())?;
        let key = &lease.key;
        let shard = self.shard(key);

        let entry = {
            let mut records = shard.records.write();
            let entry = records
                .get_mut(key)
                .ok_or_else(|| Error::not_found(T::KIND.as_str(), &key.name))?;
            entry.record = record;
            entry.generation += 1;
            entry.updated_at = Utc::now();
            entry.clone()
        };
        shard.stats.write_count.fetch_add(1, Ordering::Relaxed);
        self.global_stats.updates.fetch_add(1, Ordering::Relaxed);

        self.emit(RegistryEvent::Updated {
            kind: T::KIND,
            scope: key.scope.clone(),
            name: key.name.clone(),
            generation: entry.generation,
        });
        Ok(entry)
    }

    /// Move a record to the name of `to`, replacing its value
    pub fn rename(
        &self,
        from: &WriteLease,
        to: &WriteLease,
        record: T,
    ) -> Result<RegistryEntry<T>> {
        self.check_lease(to, record.name())?;
        let (from_key, to_key) = (&from.key, &to.key);
        let (from_idx, to_idx) = (from_key.shard_index(), to_key.shard_index());

        let entry = if from_idx == to_idx {
            let mut records = self.shards[from_idx].records.write();
            self.move_entry(&mut records, None, from_key, to_key, record)?
        } else {
            // Lock shards in index order
            let (low, high) = (from_idx.min(to_idx), from_idx.max(to_idx));
            let mut low_guard = self.shards[low].records.write();
            let mut high_guard = self.shards[high].records.write();
            let (source, target) = if from_idx == low {
                (&mut *low_guard, &mut *high_guard)
            } else {
                (&mut *high_guard, &mut *low_guard)
            };
            self.move_entry(source, Some(target), from_key, to_key, record)?
        };

        if from_idx != to_idx {
            self.shards[from_idx]
                .stats
                .record_count
                .fetch_sub(1, Ordering::Relaxed);
            self.shards[to_idx]
                .stats
                .record_count
                .fetch_add(1, Ordering::Relaxed);
        }
        self.shards[to_idx]
            .stats
            .write_count
            .fetch_add(1, Ordering::Relaxed);
        self.global_stats.renames.fetch_add(1, Ordering::Relaxed);

        self.emit(RegistryEvent::Renamed {
            kind: T::KIND,
            scope: from_key.scope.clone(),
            from: from_key.name.clone(),
            to: to_key.name.clone(),
        });
        Ok(entry)
    }

    fn move_entry(
        &self,
        source: &mut HashMap<ResourceKey, RegistryEntry<T>>,
        target: Option<&mut HashMap<ResourceKey, RegistryEntry<T>>>,
        from_key: &ResourceKey,
        to_key: &ResourceKey,
        record: T,
    ) -> Result<RegistryEntry<T>> {
        if !source.contains_key(from_key) {
            return Err(Error::not_found(T::KIND.as_str(), &from_key.name));
        }
        let taken = match &target {
            Some(target) => target.contains_key(to_key),
            None => source.contains_key(to_key),
        };
        if taken {
            self.global_stats.conflicts.fetch_add(1, Ordering::Relaxed);
            return Err(Error::exists(T::KIND.as_str(), &to_key.name));
        }

        let mut entry = source
            .remove(from_key)
            .ok_or_else(|| Error::not_found(T::KIND.as_str(), &from_key.name))?;
        entry.name = to_key.name.clone();
        entry.record = record;
        entry.generation += 1;
        entry.updated_at = Utc::now();

        match target {
            Some(target) => target.insert(to_key.clone(), entry.clone()),
            None => source.insert(to_key.clone(), entry.clone()),
        };
        Ok(entry)
    }

    /// Remove a record; NotFound when absent
    pub fn delete(&self, lease: &WriteLease) -> Result<RegistryEntry<T>> {
        let key = &lease.key;
        let shard = self.shard(key);

        let entry = shard
            .records
            .write()
            .remove(key)
            .ok_or_else(|| Error::not_found(T::KIND.as_str(), &key.name))?;
        shard.stats.record_count.fetch_sub(1, Ordering::Relaxed);
        shard.stats.write_count.fetch_add(1, Ordering::Relaxed);
        self.global_stats.total_records.fetch_sub(1, Ordering::Relaxed);
        self.global_stats.deletes.fetch_add(1, Ordering::Relaxed);

        self.emit(RegistryEvent::Deleted {
            kind: T::KIND,
            scope: key.scope.clone(),
            name: key.name.clone(),
        });
        Ok(entry)
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    pub fn find(&self, scope: &Scope, name: &str) -> Option<RegistryEntry<T>> {
        let key = ResourceKey::new(scope.clone(), name);
        self.shard(&key).records.read().get(&key).cloned()
    }

    /// Get a record; NotFound when absent
    pub fn get(&self, scope: &Scope, name: &str) -> Result<RegistryEntry<T>> {
        self.find(scope, name)
            .ok_or_else(|| Error::not_found(T::KIND.as_str(), name))
    }

    pub fn contains(&self, scope: &Scope, name: &str) -> bool {
        let key = ResourceKey::new(scope.clone(), name);
        self.shard(&key).records.read().contains_key(&key)
    }

    /// Records of a scope ordered by name, optionally only those owned by `owner`
    pub fn list(&self, scope: &Scope, owner: Option<&str>) -> Vec<RegistryEntry<T>> {
        let mut entries: Vec<RegistryEntry<T>> = self
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .records
                    .read()
                    .values()
                    .filter(|e| &e.scope == scope)
                    .filter(|e| owner.map_or(true, |o| e.record.owner() == Some(o)))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    /// Records of every scope
    pub fn list_all(&self) -> Vec<RegistryEntry<T>> {
        let mut entries: Vec<RegistryEntry<T>> = self
            .shards
            .iter()
            .flat_map(|shard| shard.records.read().values().cloned().collect::<Vec<_>>())
            .collect();
        entries.sort_by(|a, b| a.scope.cmp(&b.scope).then_with(|| a.name.cmp(&b.name)));
        entries
    }

    pub fn len(&self) -> usize {
        self.global_stats.total_records.load(Ordering::Relaxed) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> GlobalStatsSnapshot {
        self.global_stats.snapshot()
    }

    /// (index, records, writes) of non-empty shards
    pub fn shard_stats(&self) -> Vec<(usize, usize, u64)> {
        self.shards
            .iter()
            .enumerate()
            .map(|(idx, shard)| {
                (
                    idx,
                    shard.record_count(),
                    shard.stats.write_count.load(Ordering::Relaxed),
                )
            })
            .filter(|(_, count, _)| *count > 0)
            .collect()
    }

    /// Live write leases, for tests and debugging
    pub fn active_leases(&self) -> usize {
        self.locks.len()
    }
}
