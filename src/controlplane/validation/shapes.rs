//! Declared request shapes for every write operation

use super::schema::{Field, FieldType, Shape};

const STORAGE_TYPES: &[&str] = &["s3", "azure"];
const MONITORING_TYPES: &[&str] = &["pmm"];

// =============================================================================
// Backup Storages
// =============================================================================

pub static BACKUP_STORAGE_CREATE: Shape = Shape {
    fields: &[
        Field::required("name", FieldType::NonEmptyString),
        Field::required("type", FieldType::Enum(STORAGE_TYPES)),
        Field::optional("description", FieldType::String),
        Field::optional("url", FieldType::String),
        Field::required("bucketName", FieldType::NonEmptyString),
        Field::optional("region", FieldType::String),
        Field::required("accessKey", FieldType::NonEmptyString),
        Field::required("secretKey", FieldType::NonEmptyString),
        Field::optional("targetNamespaces", FieldType::StringList),
    ],
};

pub static BACKUP_STORAGE_PATCH: Shape = Shape {
    fields: &[
        Field::optional("name", FieldType::NonEmptyString),
        Field::optional("type", FieldType::Enum(STORAGE_TYPES)),
        Field::optional("description", FieldType::String),
        Field::optional("url", FieldType::String),
        Field::optional("bucketName", FieldType::NonEmptyString),
        Field::optional("region", FieldType::String),
        Field::optional("accessKey", FieldType::NonEmptyString),
        Field::optional("secretKey", FieldType::NonEmptyString),
        Field::optional("targetNamespaces", FieldType::StringList),
    ],
};

// =============================================================================
// Monitoring Instances
// =============================================================================

static PMM_CREDENTIALS: Shape = Shape {
    fields: &[
        Field::optional("apiKey", FieldType::NonEmptyString),
        Field::optional("user", FieldType::String),
        Field::optional("password", FieldType::String),
    ],
};

/// `pmm` is checked after the schema so its absence gets a dedicated message
pub static MONITORING_INSTANCE_CREATE: Shape = Shape {
    fields: &[
        Field::required("type", FieldType::Enum(MONITORING_TYPES)),
        Field::required("name", FieldType::NonEmptyString),
        Field::required("url", FieldType::NonEmptyString),
        Field::optional("pmm", FieldType::Object(&PMM_CREDENTIALS)),
        Field::optional("targetNamespaces", FieldType::StringList),
    ],
};

pub static MONITORING_INSTANCE_PATCH: Shape = Shape {
    fields: &[
        Field::optional("type", FieldType::Enum(MONITORING_TYPES)),
        Field::optional("url", FieldType::NonEmptyString),
        Field::optional("pmm", FieldType::Object(&PMM_CREDENTIALS)),
        Field::optional("targetNamespaces", FieldType::StringList),
    ],
};

// =============================================================================
// Database Clusters
// =============================================================================

static RESOURCES: Shape = Shape {
    fields: &[
        Field::optional("cpu", FieldType::Quantity),
        Field::optional("memory", FieldType::Quantity),
    ],
};

static STORAGE: Shape = Shape {
    fields: &[
        Field::required("size", FieldType::Quantity),
        Field::optional("class", FieldType::String),
    ],
};

static ENGINE: Shape = Shape {
    fields: &[
        Field::required("type", FieldType::NonEmptyString),
        Field::optional("version", FieldType::String),
        Field::optional("replicas", FieldType::Integer),
        Field::required("storage", FieldType::Object(&STORAGE)),
        Field::optional("resources", FieldType::Object(&RESOURCES)),
        Field::optional("config", FieldType::String),
        Field::optional("userSecretsName", FieldType::String),
    ],
};

static EXPOSE: Shape = Shape {
    fields: &[
        Field::required("type", FieldType::Enum(&["internal", "external"])),
        Field::optional("ipSourceRanges", FieldType::StringList),
    ],
};

static PROXY: Shape = Shape {
    fields: &[
        Field::optional(
            "type",
            FieldType::Enum(&["mongos", "haproxy", "proxysql", "pgbouncer"]),
        ),
        Field::optional("replicas", FieldType::Integer),
        Field::optional("expose", FieldType::Object(&EXPOSE)),
        Field::optional("config", FieldType::String),
        Field::optional("resources", FieldType::Object(&RESOURCES)),
    ],
};

static MONITORING: Shape = Shape {
    fields: &[Field::optional("monitoringConfigName", FieldType::String)],
};

static BACKUP_SCHEDULE: Shape = Shape {
    fields: &[
        Field::optional("enabled", FieldType::Boolean),
        Field::required("name", FieldType::NonEmptyString),
        Field::required("backupStorageName", FieldType::NonEmptyString),
        Field::required("schedule", FieldType::NonEmptyString),
        Field::optional("retentionCopies", FieldType::Integer),
    ],
};

static BACKUP: Shape = Shape {
    fields: &[
        Field::optional("enabled", FieldType::Boolean),
        Field::optional("schedules", FieldType::ObjectList(&BACKUP_SCHEDULE)),
    ],
};

static DATABASE_CLUSTER_SPEC: Shape = Shape {
    fields: &[
        Field::required("engine", FieldType::Object(&ENGINE)),
        Field::optional("proxy", FieldType::Object(&PROXY)),
        Field::optional("monitoring", FieldType::Object(&MONITORING)),
        Field::optional("backup", FieldType::Object(&BACKUP)),
        Field::optional("paused", FieldType::Boolean),
        Field::optional("allowUnsafeConfiguration", FieldType::Boolean),
    ],
};

pub static DATABASE_CLUSTER: Shape = Shape {
    fields: &[
        Field::optional("apiVersion", FieldType::String),
        Field::optional("kind", FieldType::String),
        Field::required("metadata", FieldType::FreeForm),
        Field::required("spec", FieldType::Object(&DATABASE_CLUSTER_SPEC)),
        Field::optional("status", FieldType::Any),
    ],
};

// =============================================================================
// Backups & Restores
// =============================================================================

static BACKUP_SPEC: Shape = Shape {
    fields: &[
        Field::required("dbClusterName", FieldType::NonEmptyString),
        Field::required("backupStorageName", FieldType::NonEmptyString),
    ],
};

pub static DATABASE_CLUSTER_BACKUP: Shape = Shape {
    fields: &[
        Field::optional("apiVersion", FieldType::String),
        Field::optional("kind", FieldType::String),
        Field::required("metadata", FieldType::FreeForm),
        Field::required("spec", FieldType::Object(&BACKUP_SPEC)),
        Field::optional("status", FieldType::Any),
    ],
};

static BACKUP_SOURCE: Shape = Shape {
    fields: &[
        Field::required("path", FieldType::NonEmptyString),
        Field::required("backupStorageName", FieldType::NonEmptyString),
    ],
};

static DATA_SOURCE: Shape = Shape {
    fields: &[
        Field::optional("dbClusterBackupName", FieldType::String),
        Field::optional("backupSource", FieldType::Object(&BACKUP_SOURCE)),
    ],
};

static RESTORE_SPEC: Shape = Shape {
    fields: &[
        Field::required("dbClusterName", FieldType::NonEmptyString),
        Field::required("dataSource", FieldType::Object(&DATA_SOURCE)),
    ],
};

pub static DATABASE_CLUSTER_RESTORE: Shape = Shape {
    fields: &[
        Field::optional("apiVersion", FieldType::String),
        Field::optional("kind", FieldType::String),
        Field::required("metadata", FieldType::FreeForm),
        Field::required("spec", FieldType::Object(&RESTORE_SPEC)),
        Field::optional("status", FieldType::Any),
    ],
};

// =============================================================================
// Engines & Cluster Monitoring
// =============================================================================

static DATABASE_ENGINE_SPEC: Shape = Shape {
    fields: &[
        Field::optional("type", FieldType::String),
        Field::optional("allowedVersions", FieldType::StringList),
    ],
};

pub static DATABASE_ENGINE: Shape = Shape {
    fields: &[
        Field::optional("apiVersion", FieldType::String),
        Field::optional("kind", FieldType::String),
        Field::required("metadata", FieldType::FreeForm),
        Field::required("spec", FieldType::Object(&DATABASE_ENGINE_SPEC)),
        Field::optional("status", FieldType::Any),
    ],
};

pub static CLUSTER_MONITORING: Shape = Shape {
    fields: &[
        Field::required("enable", FieldType::Boolean),
        Field::optional("monitoringInstance", FieldType::String),
    ],
};

#[cfg(test)]
mod tests {
    use super::super::schema::{validate, Mode};
    use super::*;
    use serde_json::json;

    #[test]
    fn test_backup_storage_patch_rejects_bucket() {
        let err = validate(&json!({ "bucket": "x" }), &BACKUP_STORAGE_PATCH, Mode::Patch)
            .unwrap_err();
        assert!(err.to_string().ends_with("property \"bucket\" is unsupported"));
        assert!(validate(
            &json!({ "bucketName": "x" }),
            &BACKUP_STORAGE_PATCH,
            Mode::Patch
        )
        .is_ok());
    }

    #[test]
    fn test_cluster_shape_accepts_full_declaration() {
        let body = json!({
            "apiVersion": "dbaas.controlplane.io/v1alpha1",
            "kind": "DatabaseCluster",
            "metadata": { "name": "orders" },
            "spec": {
                "engine": {
                    "type": "pxc",
                    "version": "8.0.32-24",
                    "replicas": 3,
                    "storage": { "size": "25G" },
                    "resources": { "cpu": "1", "memory": "1G" }
                },
                "proxy": { "type": "haproxy", "replicas": 1, "expose": { "type": "internal" } },
                "backup": {
                    "enabled": true,
                    "schedules": [{
                        "enabled": true,
                        "name": "daily",
                        "backupStorageName": "s3-a",
                        "schedule": "0 0 * * *"
                    }]
                }
            }
        });
        assert!(validate(&body, &DATABASE_CLUSTER, Mode::Create).is_ok());
    }

    #[test]
    fn test_cluster_shape_reports_nested_path() {
        let body = json!({
            "metadata": { "name": "orders" },
            "spec": { "engine": { "type": "pxc", "storage": { "size": "25G" }, "nodes": 3 } }
        });
        let err = validate(&body, &DATABASE_CLUSTER, Mode::Create).unwrap_err();
        assert!(err
            .to_string()
            .ends_with("Error at \"/spec/engine\": property \"nodes\" is unsupported"));
    }

    #[test]
    fn test_monitoring_patch_rejects_name() {
        let err = validate(&json!({ "name": "x" }), &MONITORING_INSTANCE_PATCH, Mode::Patch)
            .unwrap_err();
        assert!(err.to_string().contains("property \"name\" is unsupported"));
    }
}
