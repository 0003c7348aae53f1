//! Request Parameters
//!
//! Parsing of the free-form parameter map carried by provisioning requests,
//! and capacity rounding.

use crate::controlplane::scheduler::SchedulingAlgorithm;
use crate::crd::VolumeProperties;
use crate::error::{Error, Result};
use std::collections::HashMap;

pub const MIB: u64 = 1 << 20;
pub const GIB: u64 = 1 << 30;

// =============================================================================
// Capacity
// =============================================================================

/// Round a requested size to what will be provisioned
///
/// Below 1 GiB sizes round up to a MiB multiple, at or above 1 GiB to a GiB
/// multiple. The result is never below 1 MiB.
pub fn round_capacity(bytes: u64) -> u64 {
    let unit = if bytes < GIB { MIB } else { GIB };
    let rounded = bytes.div_ceil(unit).saturating_mul(unit);
    rounded.max(MIB)
}

/// Requested size range of a volume
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapacityRange {
    /// Minimum size; zero means the smallest possible volume
    pub required_bytes: u64,
    /// Maximum size; zero means unbounded
    pub limit_bytes: u64,
}

impl CapacityRange {
    pub fn required(bytes: u64) -> Self {
        Self {
            required_bytes: bytes,
            limit_bytes: 0,
        }
    }

    /// Rounded size satisfying the range
    pub fn resolve(&self) -> Result<u64> {
        let size = round_capacity(self.required_bytes);
        if self.limit_bytes != 0 && size > self.limit_bytes {
            return Err(Error::InvalidArgument(format!(
                "rounded size {} exceeds limit {}",
                size, self.limit_bytes
            )));
        }
        Ok(size)
    }
}

// =============================================================================
// Volume Parameters
// =============================================================================

/// Parameters of a create request after parsing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeParams {
    pub pool_name: String,
    pub properties: VolumeProperties,
    pub scheduler: SchedulingAlgorithm,
    /// Explicit host; bypasses scheduling
    pub node: Option<String>,
    /// Block until a deleting record is gone or a snapshot is ready
    pub wait: bool,
}

impl VolumeParams {
    /// Parse a parameter map; keys are case-insensitive and unknown keys
    /// are ignored
    pub fn parse(params: &HashMap<String, String>) -> Result<Self> {
        let mut parsed = VolumeParams::default();

        for (key, value) in params {
            let value = value.trim();
            match key.to_lowercase().as_str() {
                "poolname" => parsed.pool_name = value.to_string(),
                "recordsize" => parsed.properties.record_size = non_empty(value),
                "volblocksize" => parsed.properties.vol_block_size = non_empty(value),
                "compression" => parsed.properties.compression = non_empty(value),
                "dedup" => parsed.properties.dedup = non_empty(value),
                "encryption" => parsed.properties.encryption = non_empty(value),
                "keyformat" => parsed.properties.key_format = non_empty(value),
                "keylocation" => parsed.properties.key_location = non_empty(value),
                "thinprovision" => parsed.properties.thin_provision = parse_flag(key, value)?,
                "scheduler" => {
                    if !value.is_empty() {
                        parsed.scheduler = value.parse()?;
                    }
                }
                "fstype" => parsed.properties.fs_type = non_empty(value),
                "node" => parsed.node = non_empty(value),
                "wait" => parsed.wait = parse_flag(key, value)?,
                "quotatype" => parsed.properties.quota_type = non_empty(value),
                "shared" => parsed.properties.shared = parse_flag(key, value)?,
                _ => {}
            }
        }

        if parsed.pool_name.is_empty() {
            return Err(Error::InvalidArgument("poolname parameter is required".into()));
        }

        Ok(parsed)
    }
}

/// Parameters of a snapshot request after parsing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotParams {
    pub wait: bool,
}

impl SnapshotParams {
    pub fn parse(params: &HashMap<String, String>) -> Result<Self> {
        let mut parsed = SnapshotParams::default();
        for (key, value) in params {
            if key.eq_ignore_ascii_case("wait") {
                parsed.wait = parse_flag(key, value.trim())?;
            }
        }
        Ok(parsed)
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "yes" | "true" | "on" => Ok(true),
        "no" | "false" | "off" | "" => Ok(false),
        other => Err(Error::InvalidArgument(format!(
            "invalid value {:?} for {}",
            other, key
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_round_capacity() {
        assert_eq!(round_capacity(0), MIB);
        assert_eq!(round_capacity(1), MIB);
        assert_eq!(round_capacity(MIB), MIB);
        assert_eq!(round_capacity(MIB + 1), 2 * MIB);
        assert_eq!(round_capacity(500 * MIB), 500 * MIB);
        assert_eq!(round_capacity(GIB - 1), GIB);
        assert_eq!(round_capacity(GIB), GIB);
        assert_eq!(round_capacity(GIB + 1), 2 * GIB);
    }

    #[test]
    fn test_capacity_range_limit() {
        let range = CapacityRange {
            required_bytes: MIB + 1,
            limit_bytes: MIB + 10,
        };
        assert_matches!(range.resolve(), Err(Error::InvalidArgument(_)));

        let unbounded = CapacityRange::required(MIB + 1);
        assert_eq!(unbounded.resolve().unwrap(), 2 * MIB);
    }

    #[test]
    fn test_parse_case_insensitive() {
        let parsed = VolumeParams::parse(&params(&[
            ("PoolName", "tank"),
            ("COMPRESSION", "lz4"),
            ("ThinProvision", "yes"),
            ("fsType", "zfs"),
            ("Scheduler", "CapacityWeighted"),
            ("Wait", "true"),
            ("unrelated", "ignored"),
        ]))
        .unwrap();

        assert_eq!(parsed.pool_name, "tank");
        assert_eq!(parsed.properties.compression.as_deref(), Some("lz4"));
        assert!(parsed.properties.thin_provision);
        assert!(parsed.properties.is_dataset());
        assert_eq!(parsed.scheduler, SchedulingAlgorithm::CapacityWeighted);
        assert!(parsed.wait);
        assert_eq!(parsed.node, None);
    }

    #[test]
    fn test_parse_requires_pool() {
        assert_matches!(
            VolumeParams::parse(&params(&[("compression", "lz4")])),
            Err(Error::InvalidArgument(_))
        );
    }

    #[test]
    fn test_parse_rejects_bad_flag() {
        assert_matches!(
            VolumeParams::parse(&params(&[("poolname", "tank"), ("shared", "maybe")])),
            Err(Error::InvalidArgument(_))
        );
    }

    #[test]
    fn test_snapshot_params() {
        assert!(SnapshotParams::parse(&params(&[("WAIT", "yes")])).unwrap().wait);
        assert!(!SnapshotParams::parse(&HashMap::new()).unwrap().wait);
    }
}
