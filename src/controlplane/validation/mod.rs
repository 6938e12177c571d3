//! Request validation
//!
//! Pure checks run before any durable mutation:
//! - `schema`: declared field sets, create vs patch
//! - `shapes`: the field sets of each write operation
//! - `names`: DNS-label name rules per resource kind
//! - `cluster`: database cluster admission against the engine catalog

pub mod cluster;
pub mod names;
pub mod schema;
pub mod shapes;

pub use cluster::{admit, engine_type, Quantity};
pub use names::{check_name, rule_for, NameRule, NamedKind};
pub use schema::{check_envelope, validate, Field, FieldType, Mode, Shape};

use crate::error::{Error, Result};

/// URLs must be absolute with a scheme and host
pub fn check_url(field: &str, value: &str) -> Result<()> {
    match reqwest::Url::parse(value) {
        Ok(url) if url.has_host() => Ok(()),
        _ => Err(Error::Validation(format!("'{}' is an invalid URL", field))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_url() {
        assert!(check_url("url", "http://custom-url").is_ok());
        assert!(check_url("url", "https://s3.us-east-2.amazonaws.com/bucket").is_ok());
        let err = check_url("url", "not-a-url").unwrap_err();
        assert_eq!(err.to_string(), "'url' is an invalid URL");
        assert!(check_url("url", "/relative/path").is_err());
    }
}
