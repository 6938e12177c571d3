//! Status Projector
//!
//! Joins a declared record with the status its orchestrator last reported.
//! Observations are cached per (scope, kind, name) so a failed or empty
//! read serves the previous observation instead of dropping `status`.

use crate::controlplane::registry::RegistryEvent;
use crate::controlplane::scope::{ResolvedScope, Scope};
use crate::domain::ports::{ObjectKind, ObjectRef};
use crate::error::Result;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type ObservationKey = (Scope, ObjectKind, String);

/// Cache of last observed orchestrator status
#[derive(Default)]
pub struct StatusProjector {
    observations: DashMap<ObservationKey, Value>,
}

impl StatusProjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest status for an object, falling back to the cached observation
    pub async fn observe(
        &self,
        resolved: &ResolvedScope,
        kind: ObjectKind,
        name: &str,
    ) -> Option<Value> {
        let key = (resolved.scope.clone(), kind, name.to_string());
        let object = ObjectRef::new(kind, &resolved.namespace, name);

        match resolved.orchestrator.observed_status(&object).await {
            Ok(Some(status)) => {
                self.observations.insert(key, status.clone());
                Some(status)
            }
            Ok(None) => self.cached(&key),
            Err(e) => {
                warn!("Serving cached status of {}: {}", object, e);
                self.cached(&key)
            }
        }
    }

    /// Serialize a record and attach its observed status, if any
    pub async fn project<T: Serialize>(
        &self,
        resolved: &ResolvedScope,
        kind: ObjectKind,
        name: &str,
        record: &T,
    ) -> Result<Value> {
        let mut body = serde_json::to_value(record)?;
        let status = self.observe(resolved, kind, name).await;
        if let Some(map) = body.as_object_mut() {
            map.remove("status");
            if let Some(status) = status {
                map.insert("status".into(), status);
            }
        }
        Ok(body)
    }

    pub fn evict(&self, scope: &Scope, kind: ObjectKind, name: &str) {
        if self
            .observations
            .remove(&(scope.clone(), kind, name.to_string()))
            .is_some()
        {
            debug!("Evicted status of {} {} in {}", kind, name, scope);
        }
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    fn cached(&self, key: &ObservationKey) -> Option<Value> {
        self.observations.get(key).map(|v| v.value().clone())
    }

    /// Evict observations of records the registry deletes or renames
    pub fn spawn_evictor(
        self: Arc<Self>,
        mut events: broadcast::Receiver<RegistryEvent>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) => {
                        let retired = (event.kind().object_kind(), event.retired_name());
                        let (Some(kind), Some(name)) = retired else {
                            continue;
                        };
                        self.evict(event.scope(), kind, name);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Status evictor lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
