//! Database cluster admission
//!
//! Checks a cluster declaration against the engine catalog and the minimum
//! resource limits before it is committed.

use crate::crd::{DatabaseCluster, DatabaseEngine, EngineType, ResourceQuantity, ResourcesSpec};
use crate::error::{Error, Result};
use std::str::FromStr;

/// Smallest accepted CPU limit per engine replica
pub const MIN_CPU: &str = "600m";
/// Smallest accepted memory limit per engine replica
pub const MIN_MEMORY: &str = "512M";
/// Smallest accepted volume size
pub const MIN_STORAGE: &str = "1G";

const INT64_QUANTITY: &str =
    "Specifying resources using int64 data type is not supported. Please use string format for that";

// =============================================================================
// Quantity
// =============================================================================

/// Kubernetes resource quantity, held in nano units
///
/// Accepts decimal suffixes (`n`, `u`, `m`, `k`, `M`, `G`, `T`, `P`, `E`),
/// binary suffixes (`Ki` .. `Ei`) and exponents (`1e3`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Quantity {
    nanos: i128,
}

const NANOS_PER_UNIT: i128 = 1_000_000_000;

impl Quantity {
    /// Value in thousandths (CPU millicores)
    pub fn as_millis(&self) -> i128 {
        self.nanos / 1_000_000
    }

    /// Value in whole units (bytes, cores), truncated
    pub fn as_units(&self) -> i128 {
        self.nanos / NANOS_PER_UNIT
    }
}

impl FromStr for Quantity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::QuantityParse("empty quantity".into()));
        }

        // Split number and suffix
        let (negative, body) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };
        let num_end = body
            .char_indices()
            .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
            .map(|(i, _)| i)
            .unwrap_or(body.len());
        let (num_str, suffix) = body.split_at(num_end);

        let (mantissa, scale) = parse_decimal(num_str)
            .ok_or_else(|| Error::QuantityParse(format!("invalid number in '{}'", s)))?;

        // (numerator, power of ten) of the suffix multiplier
        let (factor, exp10): (i128, i32) = match suffix {
            "" => (1, 0),
            "n" => (1, -9),
            "u" => (1, -6),
            "m" => (1, -3),
            "k" => (1, 3),
            "M" => (1, 6),
            "G" => (1, 9),
            "T" => (1, 12),
            "P" => (1, 15),
            "E" => (1, 18),
            "Ki" => (1 << 10, 0),
            "Mi" => (1 << 20, 0),
            "Gi" => (1 << 30, 0),
            "Ti" => (1 << 40, 0),
            "Pi" => (1 << 50, 0),
            "Ei" => (1 << 60, 0),
            other => match other.strip_prefix(|c: char| c == 'e' || c == 'E') {
                Some(exp) => (
                    1,
                    exp.parse::<i32>().map_err(|_| {
                        Error::QuantityParse(format!("invalid exponent in '{}'", s))
                    })?,
                ),
                None => {
                    return Err(Error::QuantityParse(format!(
                        "unknown suffix '{}' in '{}'",
                        other, s
                    )))
                }
            },
        };

        // nanos = mantissa * factor * 10^(9 + exp10 - scale)
        let power = 9 + exp10 - scale as i32;
        let overflow = || Error::QuantityParse(format!("quantity '{}' is too large", s));
        let base = mantissa.checked_mul(factor).ok_or_else(overflow)?;
        let nanos = if power >= 0 {
            10i128
                .checked_pow(power as u32)
                .and_then(|p| base.checked_mul(p))
                .ok_or_else(overflow)?
        } else {
            match 10i128.checked_pow((-power) as u32) {
                Some(p) => base / p,
                None => 0,
            }
        };

        Ok(Quantity {
            nanos: if negative { -nanos } else { nanos },
        })
    }
}

/// Digits with an optional fraction, as (mantissa, fraction digits)
fn parse_decimal(s: &str) -> Option<(i128, u32)> {
    let (int_part, frac_part) = match s.split_once('.') {
        Some((i, f)) => (i, f),
        None => (s, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if frac_part.contains('.') {
        return None;
    }
    let digits = format!("{}{}", int_part, frac_part);
    let mantissa = digits.parse::<i128>().ok()?;
    Some((mantissa, frac_part.len() as u32))
}

fn minimum(s: &str) -> Result<Quantity> {
    Quantity::from_str(s)
}

// =============================================================================
// Admission Checks
// =============================================================================

/// Engine type of a declaration, rejecting engines without an operator
pub fn engine_type(cluster: &DatabaseCluster) -> Result<EngineType> {
    EngineType::parse(&cluster.spec.engine.r#type)
        .ok_or_else(|| Error::ClusterSpecInvalid("Unsupported database engine".into()))
}

/// Run every admission check against the engine descriptor of the cluster
pub fn admit(cluster: &DatabaseCluster, engine: &DatabaseEngine) -> Result<()> {
    let engine_type = engine_type(cluster)?;

    if let Some(version) = cluster.spec.engine.version.as_deref() {
        check_version(engine_type, version, engine)?;
    }

    if let Some(proxy_type) = cluster
        .spec
        .proxy
        .as_ref()
        .and_then(|p| p.r#type.as_deref())
    {
        check_proxy(engine_type, proxy_type)?;
    }

    check_resources(
        cluster.spec.engine.resources.as_ref(),
        &cluster.spec.engine.storage.size,
    )
}

/// Version must pass the allowed list and be offered by the operator
pub fn check_version(engine_type: EngineType, version: &str, engine: &DatabaseEngine) -> Result<()> {
    if !engine.allows_version(version) {
        return Err(Error::ClusterSpecInvalid(format!(
            "Using {} version for {} is not allowed",
            version, engine_type
        )));
    }
    if !engine.offers_version(version) {
        return Err(Error::ClusterSpecInvalid(format!(
            "{} is not in available versions list",
            version
        )));
    }
    Ok(())
}

/// Each engine works with its own proxy family
pub fn check_proxy(engine_type: EngineType, proxy_type: &str) -> Result<()> {
    let (accepted, message): (&[&str], &str) = match engine_type {
        EngineType::Pxc => (
            &["haproxy", "proxysql"],
            "You can use only either HAProxy or Proxy SQL for PXC clusters",
        ),
        EngineType::Postgresql => (
            &["pgbouncer"],
            "You can use only PGBouncer as a proxy type for Postgres clusters",
        ),
        EngineType::Psmdb => (
            &["mongos"],
            "You can use only Mongos as a proxy type for MongoDB clusters",
        ),
    };
    if accepted.contains(&proxy_type) {
        Ok(())
    } else {
        Err(Error::ClusterSpecInvalid(message.into()))
    }
}

/// CPU, memory and storage must be string quantities above the minimums
pub fn check_resources(
    resources: Option<&ResourcesSpec>,
    storage_size: &ResourceQuantity,
) -> Result<()> {
    let resources = resources.ok_or_else(|| {
        Error::ClusterSpecInvalid("Please specify resource limits for the cluster".into())
    })?;
    let cpu = resources.cpu.as_ref().ok_or_else(|| {
        Error::ClusterSpecInvalid("CPU limits should be above 600m and cannot be empty".into())
    })?;
    let memory = resources.memory.as_ref().ok_or_else(|| {
        Error::ClusterSpecInvalid("Memory limits should be above 512M and cannot be empty".into())
    })?;

    at_least(cpu, MIN_CPU, "CPU limits should be above 600m")?;
    at_least(memory, MIN_MEMORY, "Memory limits should be above 512M")?;
    at_least(storage_size, MIN_STORAGE, "Storage size should be above 1G")
}

fn at_least(value: &ResourceQuantity, min: &str, message: &str) -> Result<()> {
    match value {
        ResourceQuantity::Int(_) => Err(Error::ClusterSpecInvalid(INT64_QUANTITY.into())),
        ResourceQuantity::Str(s) => {
            if Quantity::from_str(s)? < minimum(min)? {
                Err(Error::ClusterSpecInvalid(message.into()))
            } else {
                Ok(())
            }
        }
    }
}
