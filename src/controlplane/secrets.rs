//! In-memory Secret Store
//!
//! Secrets are addressed by `<lineage>.v<generation>`. A lineage is a uuid
//! shared by every version of one credential; the generation comes from a
//! store-wide counter, so a rotated reference never equals an earlier one.

use crate::domain::ports::{SecretRef, SecretStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;
use uuid::Uuid;

/// Secret store backed by a concurrent map
#[derive(Debug, Default)]
pub struct InMemorySecretStore {
    entries: DashMap<SecretRef, String>,
    generation: AtomicU64,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored secret versions
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn reference(&self, lineage: &str) -> SecretRef {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        SecretRef(format!("{}.v{}", lineage, generation))
    }
}

/// Lineage part of a reference
fn lineage(reference: &SecretRef) -> &str {
    reference
        .as_str()
        .rsplit_once(".v")
        .map(|(lineage, _)| lineage)
        .unwrap_or(reference.as_str())
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn put(&self, value: &str) -> Result<SecretRef> {
        let reference = self.reference(&Uuid::new_v4().to_string());
        self.entries.insert(reference.clone(), value.to_string());
        debug!("Stored secret {}", reference);
        Ok(reference)
    }

    async fn rotate(&self, reference: &SecretRef, value: &str) -> Result<SecretRef> {
        if !self.entries.contains_key(reference) {
            return Err(Error::SecretNotFound(reference.to_string()));
        }
        let rotated = self.reference(lineage(reference));
        self.entries.insert(rotated.clone(), value.to_string());
        debug!("Rotated secret {} -> {}", reference, rotated);
        Ok(rotated)
    }

    async fn get(&self, reference: &SecretRef) -> Result<String> {
        self.entries
            .get(reference)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::SecretNotFound(reference.to_string()))
    }

    async fn delete(&self, reference: &SecretRef) -> Result<()> {
        self.entries
            .remove(reference)
            .map(|_| ())
            .ok_or_else(|| Error::SecretNotFound(reference.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = InMemorySecretStore::new();
        let reference = store.put("sdfs").await.unwrap();
        assert!(reference.as_str().ends_with(".v1"));
        assert_eq!(store.get(&reference).await.unwrap(), "sdfs");

        store.delete(&reference).await.unwrap();
        let err = store.delete(&reference).await.unwrap_err();
        assert_matches!(err, Error::SecretNotFound(_));
    }

    #[tokio::test]
    async fn test_rotate_keeps_lineage_and_old_version() {
        let store = InMemorySecretStore::new();
        let first = store.put("old").await.unwrap();
        let second = store.rotate(&first, "new").await.unwrap();

        assert_ne!(first, second);
        assert_eq!(lineage(&first), lineage(&second));
        // the old version stays readable until the caller retires it
        assert_eq!(store.get(&first).await.unwrap(), "old");
        assert_eq!(store.get(&second).await.unwrap(), "new");

        // same value still yields a fresh reference
        let third = store.rotate(&second, "new").await.unwrap();
        assert_ne!(second, third);
    }

    #[tokio::test]
    async fn test_rotate_missing_reference() {
        let store = InMemorySecretStore::new();
        let err = store
            .rotate(&SecretRef::from("missing.v1"), "x")
            .await
            .unwrap_err();
        assert_matches!(err, Error::SecretNotFound(_));
        assert!(store.is_empty());
    }
}
