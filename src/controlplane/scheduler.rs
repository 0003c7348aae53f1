//! Volume Scheduler
//!
//! Maps a topology constraint and a per-host load map to an ordered list of
//! candidate hosts. Pure and deterministic: identical inputs always give the
//! same order, which keeps retries of a create request stable.

use crate::crd::{IntentRecord, LocalVolume, NODE_ID_LABEL};
use crate::error::{Error, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;

/// A set of labels an acceptable host must carry
pub type TopologySegment = BTreeMap<String, String>;

// =============================================================================
// Scheduling Algorithm
// =============================================================================

/// How host load is measured
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SchedulingAlgorithm {
    /// Number of volumes on the pool
    #[default]
    VolumeWeighted,
    /// Bytes provisioned on the pool
    CapacityWeighted,
}

impl FromStr for SchedulingAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "volumeweighted" => Ok(SchedulingAlgorithm::VolumeWeighted),
            "capacityweighted" => Ok(SchedulingAlgorithm::CapacityWeighted),
            other => Err(Error::InvalidArgument(format!(
                "unknown scheduler algorithm: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for SchedulingAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulingAlgorithm::VolumeWeighted => write!(f, "VolumeWeighted"),
            SchedulingAlgorithm::CapacityWeighted => write!(f, "CapacityWeighted"),
        }
    }
}

// =============================================================================
// Host Topology
// =============================================================================

/// A host and the topology labels it carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTopology {
    pub node_id: String,
    pub labels: BTreeMap<String, String>,
}

impl HostTopology {
    pub fn new(node_id: impl Into<String>, labels: BTreeMap<String, String>) -> Self {
        Self {
            node_id: node_id.into(),
            labels,
        }
    }

    /// Whether every label of the segment is present on this host
    pub fn satisfies(&self, segment: &TopologySegment) -> bool {
        segment.iter().all(|(k, v)| {
            if k == NODE_ID_LABEL {
                return &self.node_id == v;
            }
            self.labels.get(k) == Some(v)
        })
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Candidate host selection
pub struct Scheduler;

impl Scheduler {
    /// Order the hosts acceptable under `constraint` by ascending load
    ///
    /// Ties keep first-seen order: segments in the order given, hosts in
    /// inventory order within a segment. Hosts absent from `load` count as
    /// zero. An empty constraint yields no candidates.
    pub fn select(
        constraint: &[TopologySegment],
        hosts: &[HostTopology],
        load: &HashMap<String, u64>,
    ) -> Vec<String> {
        // One segment naming one host: no comparison needed
        if let [segment] = constraint {
            if let Some(host) = segment.get(NODE_ID_LABEL) {
                return vec![host.clone()];
            }
        }

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();

        for segment in constraint {
            if let Some(host) = segment.get(NODE_ID_LABEL) {
                let known = hosts.iter().find(|h| &h.node_id == host);
                let acceptable = known.map(|h| h.satisfies(segment)).unwrap_or(true);
                if acceptable && seen.insert(host.clone()) {
                    candidates.push(host.clone());
                }
                continue;
            }

            for host in hosts.iter().filter(|h| h.satisfies(segment)) {
                if seen.insert(host.node_id.clone()) {
                    candidates.push(host.node_id.clone());
                }
            }
        }

        // sort_by_key is stable, so ties keep first-seen order
        candidates.sort_by_key(|host| load.get(host).copied().unwrap_or(0));
        candidates
    }

    /// Compute per-host load on `pool` from the existing volume records
    pub fn load_by_host(
        algorithm: SchedulingAlgorithm,
        volumes: &[LocalVolume],
        pool: &str,
    ) -> HashMap<String, u64> {
        let mut load = HashMap::new();
        for volume in volumes.iter().filter(|v| v.spec.pool_name == pool) {
            let weight = match algorithm {
                SchedulingAlgorithm::VolumeWeighted => 1,
                SchedulingAlgorithm::CapacityWeighted => volume.capacity_bytes(),
            };
            *load.entry(volume.owner_node_id().to_string()).or_insert(0) += weight;
        }
        load
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::LocalVolumeSpec;

    fn segment(pairs: &[(&str, &str)]) -> TopologySegment {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn host(id: &str, zone: &str) -> HostTopology {
        HostTopology::new(id, segment(&[("zone", zone)]))
    }

    fn inventory() -> Vec<HostTopology> {
        vec![
            host("node-a", "z1"),
            host("node-b", "z1"),
            host("node-c", "z2"),
            host("node-d", "z3"),
        ]
    }

    /// Small deterministic generator for load maps
    fn load_maps() -> Vec<HashMap<String, u64>> {
        let mut state: u64 = 0x2545F4914F6CDD1D;
        let mut maps = Vec::new();
        for _ in 0..64 {
            let mut map = HashMap::new();
            for id in ["node-a", "node-b", "node-c", "node-d"] {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                if state % 5 != 0 {
                    map.insert(id.to_string(), state % 7);
                }
            }
            maps.push(map);
        }
        maps
    }

    #[test]
    fn test_single_host_fast_path() {
        let constraint = vec![segment(&[(NODE_ID_LABEL, "node-x")])];
        for load in load_maps() {
            assert_eq!(
                Scheduler::select(&constraint, &inventory(), &load),
                vec!["node-x".to_string()]
            );
        }
    }

    #[test]
    fn test_order_non_decreasing_in_load() {
        let constraint = vec![segment(&[("zone", "z1")]), segment(&[("zone", "z2")])];
        for load in load_maps() {
            let selected = Scheduler::select(&constraint, &inventory(), &load);
            assert_eq!(selected.len(), 3);
            let loads: Vec<u64> = selected
                .iter()
                .map(|h| load.get(h).copied().unwrap_or(0))
                .collect();
            assert!(loads.windows(2).all(|w| w[0] <= w[1]), "{:?}", loads);
        }
    }

    #[test]
    fn test_topology_filter_excludes_hosts() {
        let constraint = vec![segment(&[("zone", "z1")])];
        for load in load_maps() {
            let selected = Scheduler::select(&constraint, &inventory(), &load);
            assert!(!selected.contains(&"node-c".to_string()));
            assert!(!selected.contains(&"node-d".to_string()));
        }
    }

    #[test]
    fn test_ties_keep_first_seen_order() {
        let constraint = vec![segment(&[("zone", "z2")]), segment(&[("zone", "z1")])];
        let selected = Scheduler::select(&constraint, &inventory(), &HashMap::new());
        assert_eq!(selected, vec!["node-c", "node-a", "node-b"]);
    }

    #[test]
    fn test_least_loaded_first() {
        let constraint = vec![segment(&[("zone", "z1")])];
        let mut load = HashMap::new();
        load.insert("node-a".to_string(), 3);
        load.insert("node-b".to_string(), 1);
        let selected = Scheduler::select(&constraint, &inventory(), &load);
        assert_eq!(selected, vec!["node-b", "node-a"]);
    }

    #[test]
    fn test_empty_constraint_or_no_match() {
        assert!(Scheduler::select(&[], &inventory(), &HashMap::new()).is_empty());
        let constraint = vec![segment(&[("zone", "nowhere")])];
        assert!(Scheduler::select(&constraint, &inventory(), &HashMap::new()).is_empty());
    }

    #[test]
    fn test_named_hosts_in_multiple_segments() {
        let constraint = vec![
            segment(&[(NODE_ID_LABEL, "node-c")]),
            segment(&[(NODE_ID_LABEL, "node-a")]),
            segment(&[(NODE_ID_LABEL, "node-c")]),
        ];
        let mut load = HashMap::new();
        load.insert("node-c".to_string(), 2);
        let selected = Scheduler::select(&constraint, &inventory(), &load);
        assert_eq!(selected, vec!["node-a", "node-c"]);
    }

    #[test]
    fn test_load_by_host() {
        let volumes = vec![
            LocalVolume::pending("v1", "ns", LocalVolumeSpec::new("node-a", "tank", 10)),
            LocalVolume::pending("v2", "ns", LocalVolumeSpec::new("node-a", "tank", 20)),
            LocalVolume::pending("v3", "ns", LocalVolumeSpec::new("node-b", "tank", 100)),
            LocalVolume::pending("v4", "ns", LocalVolumeSpec::new("node-b", "other", 100)),
        ];

        let by_count = Scheduler::load_by_host(SchedulingAlgorithm::VolumeWeighted, &volumes, "tank");
        assert_eq!(by_count.get("node-a"), Some(&2));
        assert_eq!(by_count.get("node-b"), Some(&1));

        let by_bytes = Scheduler::load_by_host(SchedulingAlgorithm::CapacityWeighted, &volumes, "tank");
        assert_eq!(by_bytes.get("node-a"), Some(&30));
        assert_eq!(by_bytes.get("node-b"), Some(&100));
    }

    #[test]
    fn test_algorithm_parse() {
        assert_eq!(
            "CapacityWeighted".parse::<SchedulingAlgorithm>().unwrap(),
            SchedulingAlgorithm::CapacityWeighted
        );
        assert_eq!(
            "volumeweighted".parse::<SchedulingAlgorithm>().unwrap(),
            SchedulingAlgorithm::VolumeWeighted
        );
        assert!("roundrobin".parse::<SchedulingAlgorithm>().is_err());
    }
}
