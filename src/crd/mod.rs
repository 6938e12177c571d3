//! Custom Resource Definitions for the DBaaS control plane
//!
//! This module contains all CRD types:
//! - DatabaseCluster: engine, proxy, monitoring and backup schedule declaration
//! - DatabaseClusterBackup / DatabaseClusterRestore: backup lifecycle objects
//! - BackupStorage: namespaced projection of a global backup storage
//! - DatabaseEngine: per-operator version catalog

pub mod backup;
pub mod database_cluster;
pub mod database_engine;

pub use backup::*;
pub use database_cluster::*;
pub use database_engine::*;
