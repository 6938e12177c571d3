//! End-to-end scenarios through the REST router with an in-memory orchestrator

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use dbaas_control_plane::{
    ApiMetrics, ApplyQueue, ApplyQueueConfig, ClusterRegistration, ControlPlane,
    ControlPlaneDeps, CredentialPrechecker, Error, InMemoryOrchestrator, InMemorySecretStore,
    Result, RestRouter, ScopeResolver,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

struct RejectingPrechecker;

#[async_trait]
impl CredentialPrechecker for RejectingPrechecker {
    async fn obtain_api_key(&self, _: &str, _: &str, _: &str, _: &str) -> Result<String> {
        Err(Error::Credential("PMM is not reachable".into()))
    }
}

fn router() -> Router {
    let orchestrator = Arc::new(InMemoryOrchestrator::new());
    let metrics = Arc::new(ApiMetrics::new().unwrap());
    let (queue, _) = ApplyQueue::start(
        ApplyQueueConfig::default(),
        metrics.clone(),
        CancellationToken::new(),
    );
    let resolver = ScopeResolver::new(orchestrator, Vec::<String>::new()).with_cluster(
        ClusterRegistration {
            id: "c-1".into(),
            name: "staging".into(),
            namespace: "dbaas".into(),
        },
        Arc::new(InMemoryOrchestrator::new()),
    );
    let control_plane = ControlPlane::new(ControlPlaneDeps {
        resolver,
        secrets: Arc::new(InMemorySecretStore::new()),
        prechecker: Arc::new(RejectingPrechecker),
        queue,
        metrics,
    });
    RestRouter::new(Arc::new(control_plane)).build()
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

fn storage(name: &str) -> Value {
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

fn cluster(name: &str) -> Value {
    json!({
        "apiVersion": "dbaas.controlplane.io/v1alpha1",
        "kind": "DatabaseCluster",
        "metadata": { "name": name },
        "spec": {
            "engine": {
                "type": "pxc",
                "version": "8.0.32-24",
                "replicas": 1,
                "storage": { "size": "25G" },
                "resources": { "cpu": "1", "memory": "1G" }
            },
            "proxy": { "type": "haproxy", "replicas": 1, "expose": { "type": "internal" } }
        }
    })
}

fn backup(name: &str, cluster: &str) -> Value {
    json!({
        "apiVersion": "dbaas.controlplane.io/v1alpha1",
        "kind": "DatabaseClusterBackup",
        "metadata": { "name": name },
        "spec": { "dbClusterName": cluster, "backupStorageName": "s3-a" }
    })
}

#[tokio::test]
async fn test_backup_storage_scenario() {
    let router = router();

    let (status, body) = send(&router, "POST", "/v1/backup-storages", Some(storage("s3-a"))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["name"], "s3-a");

    let (status, _) = send(&router, "POST", "/v1/backup-storages", Some(storage("s3-a"))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send(&router, "GET", "/v1/backup-storages", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, _) = send(&router, "DELETE", "/v1/backup-storages/s3-a", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&router, "GET", "/v1/backup-storages/s3-a", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["message"].as_str().unwrap().contains("s3-a"));
}

#[tokio::test]
async fn test_monitoring_instance_credentials() {
    let router = router();
    let instance = |pmm: Value| {
        json!({
            "type": "pmm",
            "name": "mon-1",
            "url": "http://monitoring-instance",
            "pmm": pmm
        })
    };

    let (status, body) = send(
        &router,
        "POST",
        "/v1/monitoring-instances",
        Some(instance(json!({}))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body["message"],
        "one of pmm.apiKey, pmm.user or pmm.password fields is required"
    );

    let (status, _) = send(
        &router,
        "POST",
        "/v1/monitoring-instances",
        Some(instance(json!({ "user": "admin", "password": "admin" }))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &router,
        "POST",
        "/v1/monitoring-instances",
        Some(instance(json!({ "apiKey": "abc" }))),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["name"], "mon-1");
}

#[tokio::test]
async fn test_restore_of_missing_cluster() {
    let router = router();
    let restore = json!({
        "apiVersion": "dbaas.controlplane.io/v1alpha1",
        "kind": "DatabaseClusterRestore",
        "metadata": { "name": "restore" },
        "spec": {
            "dbClusterName": "not-existing-cluster",
            "dataSource": { "dbClusterBackupName": "some-backup" }
        }
    });
    let (status, body) = send(
        &router,
        "POST",
        "/v1/namespaces/team-a/database-cluster-restores",
        Some(restore),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body["message"],
        "DatabaseCluster 'not-existing-cluster' is not found"
    );
}

#[tokio::test]
async fn test_backups_filtered_by_cluster() {
    let router = router();
    let prefix = "/v1/namespaces/team-a";
    for name in ["cluster-a", "cluster-b"] {
        let (status, _) = send(
            &router,
            "POST",
            &format!("{}/database-clusters", prefix),
            Some(cluster(name)),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        for i in 1..=2 {
            let (status, _) = send(
                &router,
                "POST",
                &format!("{}/database-cluster-backups", prefix),
                Some(backup(&format!("{}-backup-{}", name, i), name)),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
        }
    }

    let (_, all) = send(&router, "GET", &format!("{}/database-cluster-backups", prefix), None).await;
    assert_eq!(all["items"].as_array().unwrap().len(), 4);

    let (status, owned) = send(
        &router,
        "GET",
        &format!("{}/database-clusters/cluster-a/backups", prefix),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let items = owned["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert!(items
        .iter()
        .all(|b| b["spec"]["dbClusterName"] == "cluster-a"));
}

#[tokio::test]
async fn test_legacy_cluster_scope() {
    let router = router();

    let (status, body) = send(&router, "GET", "/v1/kubernetes", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["id"], "c-1");

    let (status, _) = send(
        &router,
        "POST",
        "/v1/kubernetes/c-1/database-clusters",
        Some(cluster("legacy")),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(&router, "GET", "/v1/kubernetes/c-1/database-clusters", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"][0]["metadata"]["name"], "legacy");

    // legacy clusters do not leak into namespace scopes
    let (_, body) = send(&router, "GET", "/v1/namespaces/team-a/database-clusters", None).await;
    assert!(body["items"].as_array().unwrap().is_empty());

    let (status, _) = send(&router, "GET", "/v1/kubernetes/c-9/database-clusters", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
