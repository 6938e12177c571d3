//! Registry Events
//!
//! Events emitted by the resource registries for consumers that mirror or
//! cache registry state.

use super::records::ResourceKind;
use crate::controlplane::scope::Scope;

/// Events emitted by the resource registries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A record was created
    Created {
        kind: ResourceKind,
        scope: Scope,
        name: String,
    },

    /// A record was replaced
    Updated {
        kind: ResourceKind,
        scope: Scope,
        name: String,
        generation: u64,
    },

    /// A record was deleted
    Deleted {
        kind: ResourceKind,
        scope: Scope,
        name: String,
    },

    /// A record moved to a new name
    Renamed {
        kind: ResourceKind,
        scope: Scope,
        from: String,
        to: String,
    },
}

impl RegistryEvent {
    pub fn kind(&self) -> ResourceKind {
        match self {
            RegistryEvent::Created { kind, .. }
            | RegistryEvent::Updated { kind, .. }
            | RegistryEvent::Deleted { kind, .. }
            | RegistryEvent::Renamed { kind, .. } => *kind,
        }
    }

    pub fn scope(&self) -> &Scope {
        match self {
            RegistryEvent::Created { scope, .. }
            | RegistryEvent::Updated { scope, .. }
            | RegistryEvent::Deleted { scope, .. }
            | RegistryEvent::Renamed { scope, .. } => scope,
        }
    }

    /// Name the record no longer has, if the event retired one
    pub fn retired_name(&self) -> Option<&str> {
        match self {
            RegistryEvent::Deleted { name, .. } => Some(name),
            RegistryEvent::Renamed { from, .. } => Some(from),
            _ => None,
        }
    }
}
