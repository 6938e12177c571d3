//! Name Policy
//!
//! DNS-label rules for user supplied names. Two rule families are in use and
//! each resource kind is bound to exactly one of them.

use crate::error::{Error, Result};

/// Longest name a database cluster may have; the engine operators derive
/// pod and service names from it.
pub const DATABASE_CLUSTER_NAME_MAX: usize = 22;

/// Longest DNS label
pub const DNS_LABEL_MAX: usize = 63;

// =============================================================================
// Rule Families
// =============================================================================

/// DNS label rule family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameRule {
    /// RFC 1035 host label: starts with a letter
    Rfc1035 { max_len: usize },
    /// RFC 1123 label: may start with a digit
    Rfc1123 { max_len: usize },
}

impl NameRule {
    /// Validate `value`, naming `field` in the error message
    pub fn check(&self, field: &str, value: &str) -> Result<()> {
        match *self {
            NameRule::Rfc1035 { max_len } => {
                if value.len() > max_len {
                    return Err(Error::NameViolation(format!(
                        "'{}' can be at most {} characters long",
                        field, max_len
                    )));
                }
                if !is_label(value, |c| c.is_ascii_lowercase()) {
                    return Err(Error::NameViolation(format!(
                        "'{}' is not RFC 1035 compatible. The name should contain only lowercase \
                         alphanumeric characters or '-', start with an alphabetic character, end \
                         with an alphanumeric character",
                        field
                    )));
                }
            }
            NameRule::Rfc1123 { max_len } => {
                if value.len() > max_len {
                    return Err(Error::NameViolation(format!(
                        "'{}' can be at most {} characters long",
                        field, max_len
                    )));
                }
                if !is_label(value, |c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
                    return Err(Error::NameViolation(format!(
                        "'{}' is not RFC 1123 compatible. The name should contain only lowercase \
                         alphanumeric characters or '-', start and end with an alphanumeric \
                         character",
                        field
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Lowercase alphanumerics and '-', first char accepted by `first`,
/// last char alphanumeric
fn is_label(value: &str, first: impl Fn(char) -> bool) -> bool {
    let mut chars = value.chars();
    let Some(head) = chars.next() else {
        return false;
    };
    if !first(head) {
        return false;
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return false;
    }
    value
        .chars()
        .last()
        .map(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .unwrap_or(false)
}

// =============================================================================
// Per-Kind Policy
// =============================================================================

/// Resource kinds that carry a user supplied name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamedKind {
    BackupStorage,
    MonitoringInstance,
    DatabaseCluster,
    DatabaseClusterBackup,
    DatabaseClusterRestore,
    Namespace,
}

/// The rule bound to each kind
pub fn rule_for(kind: NamedKind) -> NameRule {
    match kind {
        NamedKind::DatabaseCluster => NameRule::Rfc1035 {
            max_len: DATABASE_CLUSTER_NAME_MAX,
        },
        NamedKind::MonitoringInstance => NameRule::Rfc1035 {
            max_len: DNS_LABEL_MAX,
        },
        NamedKind::BackupStorage
        | NamedKind::DatabaseClusterBackup
        | NamedKind::DatabaseClusterRestore
        | NamedKind::Namespace => NameRule::Rfc1123 {
            max_len: DNS_LABEL_MAX,
        },
    }
}

/// Validate a name against the rule of its kind
pub fn check_name(kind: NamedKind, field: &str, value: &str) -> Result<()> {
    rule_for(kind).check(field, value)
}
