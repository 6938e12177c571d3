//! Backup storage operations
//!
//! Backup storages live in the global scope. Their credentials go to the
//! secret store; the record keeps only the two references.

use super::ControlPlane;
use crate::controlplane::registry::{BackupStorageRecord, WriteLease};
use crate::controlplane::scope::Scope;
use crate::controlplane::validation::{
    check_name, check_url, shapes, validate, Mode, NamedKind,
};
use crate::error::{Error, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

const KIND: &str = "BackupStorage";

/// Body of a backup storage create
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBackupStorageRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub storage_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    pub bucket_name: String,
    #[serde(default)]
    pub region: Option<String>,
    pub access_key: String,
    pub secret_key: String,
    #[serde(default)]
    pub target_namespaces: Option<Vec<String>>,
}

/// Body of a backup storage patch; absent fields keep their value
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchBackupStorageRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub storage_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub bucket_name: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub target_namespaces: Option<Vec<String>>,
}

/// Region is mandatory for S3 compatible storages
fn check_region(storage_type: &str, region: Option<&str>) -> Result<()> {
    if storage_type == "s3" && region.map_or(true, str::is_empty) {
        return Err(Error::Validation(
            "'region' is required for s3 backup storages".into(),
        ));
    }
    Ok(())
}

fn check_target_namespaces(namespaces: Option<&Vec<String>>) -> Result<()> {
    for namespace in namespaces.into_iter().flatten() {
        check_name(NamedKind::Namespace, "targetNamespaces", namespace)?;
    }
    Ok(())
}

impl ControlPlane {
    pub fn list_backup_storages(&self) -> Vec<BackupStorageRecord> {
        self.store
            .backup_storages
            .list(&Scope::Global, None)
            .into_iter()
            .map(|e| e.record)
            .collect()
    }

    pub fn get_backup_storage(&self, name: &str) -> Result<BackupStorageRecord> {
        let result = self
            .store
            .backup_storages
            .get(&Scope::Global, name)
            .map(|e| e.record);
        self.observed(KIND, "get", result)
    }

    pub async fn create_backup_storage(&self, body: Value) -> Result<BackupStorageRecord> {
        let result = self.try_create_backup_storage(body).await;
        self.observed(KIND, "create", result)
    }

    async fn try_create_backup_storage(&self, body: Value) -> Result<BackupStorageRecord> {
        validate(&body, &shapes::BACKUP_STORAGE_CREATE, Mode::Create)?;
        let request: CreateBackupStorageRequest = serde_json::from_value(body)?;

        check_name(NamedKind::BackupStorage, "name", &request.name)?;
        if let Some(url) = request.url.as_deref() {
            check_url("url", url)?;
        }
        check_region(&request.storage_type, request.region.as_deref())?;
        check_target_namespaces(request.target_namespaces.as_ref())?;

        let registry = &self.store.backup_storages;
        let lease = registry.lock(&Scope::Global, &request.name).await;
        if registry.contains(&Scope::Global, &request.name) {
            return Err(Error::exists(KIND, &request.name));
        }

        let (access_key_id, secret_key_id) = futures::try_join!(
            self.secrets.put(&request.access_key),
            self.secrets.put(&request.secret_key)
        )?;

        let record = BackupStorageRecord {
            name: request.name,
            storage_type: request.storage_type,
            description: request.description,
            url: request.url,
            bucket_name: request.bucket_name,
            region: request.region,
            access_key_id,
            secret_key_id,
            target_namespaces: request.target_namespaces.unwrap_or_default(),
        };

        match registry.create(&lease, record.clone()) {
            Ok(entry) => {
                info!("Created backup storage {}", entry.name);
                Ok(entry.record)
            }
            Err(e) => {
                self.retire_secret(&record.access_key_id).await;
                self.retire_secret(&record.secret_key_id).await;
                Err(e)
            }
        }
    }

    pub async fn patch_backup_storage(&self, name: &str, body: Value) -> Result<BackupStorageRecord> {
        let result = self.try_patch_backup_storage(name, body).await;
        self.observed(KIND, "update", result)
    }

    async fn try_patch_backup_storage(&self, name: &str, body: Value) -> Result<BackupStorageRecord> {
        validate(&body, &shapes::BACKUP_STORAGE_PATCH, Mode::Patch)?;
        let patch: PatchBackupStorageRequest = serde_json::from_value(body)?;

        if let Some(new_name) = patch.name.as_deref() {
            check_name(NamedKind::BackupStorage, "name", new_name)?;
        }
        if let Some(url) = patch.url.as_deref() {
            check_url("url", url)?;
        }
        check_target_namespaces(patch.target_namespaces.as_ref())?;

        let registry = &self.store.backup_storages;
        let renamed_to = patch.name.clone().filter(|new_name| new_name != name);
        let (lease, target_lease): (WriteLease, Option<WriteLease>) = match renamed_to.as_deref() {
            Some(new_name) => {
                let (current, target) = registry.lock_pair(&Scope::Global, name, new_name).await;
                (current, Some(target))
            }
            None => (registry.lock(&Scope::Global, name).await, None),
        };

        let current = registry.get(&Scope::Global, name)?.record;
        let referrers = self.storage_referrers(name);
        if renamed_to.is_some() && !referrers.is_empty() {
            return Err(Error::ResourceInUse {
                kind: KIND.into(),
                name: name.into(),
            });
        }

        let mut updated = current.clone();
        if let Some(storage_type) = patch.storage_type {
            updated.storage_type = storage_type;
        }
        if let Some(description) = patch.description {
            updated.description = Some(description);
        }
        if let Some(url) = patch.url {
            updated.url = Some(url);
        }
        if let Some(bucket_name) = patch.bucket_name {
            updated.bucket_name = bucket_name;
        }
        if let Some(region) = patch.region {
            updated.region = Some(region);
        }
        if let Some(target_namespaces) = patch.target_namespaces {
            updated.target_namespaces = target_namespaces;
        }
        if let Some(new_name) = renamed_to.as_deref() {
            updated.name = new_name.to_string();
        }
        check_region(&updated.storage_type, updated.region.as_deref())?;

        // New secret versions are written before the record points at them
        let mut retired = Vec::new();
        if let Some(access_key) = patch.access_key.as_deref() {
            updated.access_key_id = self.secrets.rotate(&current.access_key_id, access_key).await?;
            retired.push(current.access_key_id.clone());
        }
        if let Some(secret_key) = patch.secret_key.as_deref() {
            match self.secrets.rotate(&current.secret_key_id, secret_key).await {
                Ok(reference) => {
                    updated.secret_key_id = reference;
                    retired.push(current.secret_key_id.clone());
                }
                Err(e) => {
                    if updated.access_key_id != current.access_key_id {
                        self.retire_secret(&updated.access_key_id).await;
                    }
                    return Err(e);
                }
            }
        }

        let committed = match &target_lease {
            Some(target) => registry.rename(&lease, target, updated.clone()),
            None => registry.update(&lease, updated.clone()),
        };
        let entry = match committed {
            Ok(entry) => entry,
            Err(e) => {
                // Drop the versions that never got committed
                for (fresh, old) in [
                    (&updated.access_key_id, &current.access_key_id),
                    (&updated.secret_key_id, &current.secret_key_id),
                ] {
                    if fresh != old {
                        self.retire_secret(fresh).await;
                    }
                }
                return Err(e);
            }
        };

        for reference in &retired {
            self.retire_secret(reference).await;
            self.metrics.secret_rotations.inc();
        }

        // Refresh the copies held by scopes that use this storage
        for scope in referrers {
            let resolved = self.resolver.resolve_partition(&scope)?;
            self.project_storages(&resolved, std::slice::from_ref(&entry.name))
                .await?;
        }

        info!("Updated backup storage {}", entry.name);
        Ok(entry.record)
    }

    pub async fn delete_backup_storage(&self, name: &str) -> Result<BackupStorageRecord> {
        let result = self.try_delete_backup_storage(name).await;
        self.observed(KIND, "delete", result)
    }

    async fn try_delete_backup_storage(&self, name: &str) -> Result<BackupStorageRecord> {
        let registry = &self.store.backup_storages;
        let lease = registry.lock(&Scope::Global, name).await;
        registry.get(&Scope::Global, name)?;

        if !self.storage_referrers(name).is_empty() {
            return Err(Error::ResourceInUse {
                kind: KIND.into(),
                name: name.into(),
            });
        }

        let entry = registry.delete(&lease)?;
        drop(lease);
        self.retire_secret(&entry.record.access_key_id).await;
        self.retire_secret(&entry.record.secret_key_id).await;

        info!("Deleted backup storage {}", name);
        Ok(entry.record)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::harness;
    use super::*;
    use crate::domain::ports::SecretStore;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn payload(name: &str) -> Value {
        json!({
            "type": "s3",
            "name": name,
            "bucketName": "percona-test-backup-storage",
            "region": "us-east-2",
            "url": "http://custom-url",
            "accessKey": "sdfs",
            "secretKey": "sdfsdfsd"
        })
    }

    #[tokio::test]
    async fn test_create_get_delete_scenario() {
        let h = harness();
        let cp = &h.control_plane;

        let created = cp.create_backup_storage(payload("bs-1")).await.unwrap();
        assert_eq!(created.bucket_name, "percona-test-backup-storage");
        assert_eq!(h.secrets.get(&created.access_key_id).await.unwrap(), "sdfs");

        let err = cp.create_backup_storage(payload("bs-1")).await.unwrap_err();
        assert_matches!(err, Error::ResourceExists { .. });

        cp.delete_backup_storage("bs-1").await.unwrap();
        assert_matches!(
            cp.get_backup_storage("bs-1"),
            Err(Error::ResourceNotFound { .. })
        );
        assert_matches!(
            cp.delete_backup_storage("bs-1").await,
            Err(Error::ResourceNotFound { .. })
        );
        assert!(h.secrets.is_empty());
    }

    #[tokio::test]
    async fn test_create_failures() {
        let cp = harness().control_plane;

        let err = cp.create_backup_storage(json!({})).await.unwrap_err();
        assert!(err.to_string().contains("property \"name\" is missing"));

        let mut body = payload("Backup Name");
        let err = cp.create_backup_storage(body.clone()).await.unwrap_err();
        assert!(err.to_string().contains("'name' is not RFC 1123 compatible"));

        body["name"] = json!("backup");
        body["url"] = json!("not-valid-url");
        let err = cp.create_backup_storage(body.clone()).await.unwrap_err();
        assert_eq!(err.to_string(), "'url' is an invalid URL");

        body["url"] = json!("http://custom-url");
        body.as_object_mut().unwrap().remove("region");
        let err = cp.create_backup_storage(body).await.unwrap_err();
        assert!(err.to_string().contains("'region' is required"));
    }

    #[tokio::test]
    async fn test_patch_rotates_only_changed_credentials() {
        let h = harness();
        let cp = &h.control_plane;
        let created = cp.create_backup_storage(payload("bs-1")).await.unwrap();

        let updated = cp
            .patch_backup_storage("bs-1", json!({ "bucketName": "another" }))
            .await
            .unwrap();
        assert_eq!(updated.bucket_name, "another");
        assert_eq!(updated.access_key_id, created.access_key_id);
        assert_eq!(updated.secret_key_id, created.secret_key_id);

        let rotated = cp
            .patch_backup_storage("bs-1", json!({ "accessKey": "new-key" }))
            .await
            .unwrap();
        assert_ne!(rotated.access_key_id, created.access_key_id);
        assert_eq!(rotated.secret_key_id, created.secret_key_id);
        assert_eq!(h.secrets.get(&rotated.access_key_id).await.unwrap(), "new-key");
        assert!(h.secrets.get(&created.access_key_id).await.is_err());
        assert_eq!(h.secrets.len(), 2);
    }

    #[tokio::test]
    async fn test_patch_failures() {
        let cp = harness().control_plane;
        cp.create_backup_storage(payload("bs-1")).await.unwrap();

        let err = cp
            .patch_backup_storage("bs-1", json!({ "name": "-123dfdfs" }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("'name' is not RFC 1123 compatible"));

        let err = cp
            .patch_backup_storage("bs-1", json!({ "url": "-asldf;asdfk;sadf" }))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "'url' is an invalid URL");

        let err = cp
            .patch_backup_storage("bs-1", json!({ "bucket": "x" }))
            .await
            .unwrap_err();
        assert_matches!(err, Error::Schema(_));

        let err = cp
            .patch_backup_storage("missing", json!({ "type": "s3" }))
            .await
            .unwrap_err();
        assert_matches!(err, Error::ResourceNotFound { .. });
    }

    #[tokio::test]
    async fn test_patch_renames() {
        let cp = harness().control_plane;
        cp.create_backup_storage(payload("bs-1")).await.unwrap();
        cp.create_backup_storage(payload("bs-2")).await.unwrap();

        let err = cp
            .patch_backup_storage("bs-1", json!({ "name": "bs-2" }))
            .await
            .unwrap_err();
        assert_matches!(err, Error::ResourceExists { .. });

        let renamed = cp
            .patch_backup_storage("bs-1", json!({ "name": "bs-3" }))
            .await
            .unwrap();
        assert_eq!(renamed.name, "bs-3");
        assert!(cp.get_backup_storage("bs-1").is_err());
        assert!(cp.get_backup_storage("bs-3").is_ok());
    }
}
