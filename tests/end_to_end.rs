//! End-to-end provisioning through the controller service, with agents
//! converging records on simulated hosts.

use assert_matches::assert_matches;
use localpv_provisioner::agent::simulated::ops;
use localpv_provisioner::controlplane::{
    CapacityRange, CreateSnapshotRequest, CreateVolumeRequest, GetCapacityRequest, TopologyRequirement, GIB, MIB,
};
use localpv_provisioner::crd::{ContentSource, LocalBackup, LocalRestore, LocalSnapshot, LocalVolume, StorageNode, NODE_ID_LABEL};
use localpv_provisioner::{
    Agent, AgentConfig, AgentStores, ControllerService, Error, ErrorKind, LockRegistry, MemoryStore, Metrics,
    Orchestrator, OrchestratorConfig, QueueConfig, RecordStore, SimulatedEngine, StorageEngine, Stores,
};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const POOL: &str = "zfspv-pool";
const ZONE: &str = "zone";

struct Cluster {
    service: ControllerService,
    orchestrator: Arc<Orchestrator>,
    volumes: Arc<MemoryStore<LocalVolume>>,
    snapshots: Arc<MemoryStore<LocalSnapshot>>,
    engines: BTreeMap<String, Arc<SimulatedEngine>>,
    cancel: CancellationToken,
    agents: Vec<JoinHandle<()>>,
}

impl Cluster {
    async fn start(hosts: &[&str]) -> Self {
        let volumes: Arc<MemoryStore<LocalVolume>> = Arc::new(MemoryStore::new("openebs"));
        let snapshots: Arc<MemoryStore<LocalSnapshot>> = Arc::new(MemoryStore::new("openebs"));
        let nodes: Arc<MemoryStore<StorageNode>> = Arc::new(MemoryStore::new("openebs"));
        let stores = AgentStores {
            volumes: volumes.clone(),
            snapshots: snapshots.clone(),
            backups: Arc::new(MemoryStore::<LocalBackup>::new("openebs")),
            restores: Arc::new(MemoryStore::<LocalRestore>::new("openebs")),
            nodes: nodes.clone(),
        };

        let metrics = Metrics::new().unwrap();
        let cancel = CancellationToken::new();
        let mut engines = BTreeMap::new();
        let mut agents = Vec::new();

        for host in hosts {
            let engine = Arc::new(SimulatedEngine::new(*host).with_pool(POOL, 10 * GIB));
            engines.insert(host.to_string(), engine.clone());
            let agent = Agent::new(
                AgentConfig {
                    node_id: host.to_string(),
                    labels: BTreeMap::from([(ZONE.to_string(), "east".to_string())]),
                    workers: 2,
                    report_interval: Duration::from_millis(20),
                    queue: QueueConfig {
                        base_delay: Duration::from_millis(1),
                        max_delay: Duration::from_millis(50),
                    },
                    ..Default::default()
                },
                stores.clone(),
                engine,
                Some(metrics.clone()),
            );
            let cancel = cancel.clone();
            agents.push(tokio::spawn(async move { agent.run(cancel).await }));
        }

        let orchestrator = Orchestrator::new(
            OrchestratorConfig {
                poll_interval: Duration::from_millis(5),
                wait_timeout: Duration::from_secs(10),
                ..Default::default()
            },
            Stores {
                volumes: volumes.clone(),
                snapshots: snapshots.clone(),
                nodes: nodes.clone(),
            },
            LockRegistry::new(),
        );
        let service = ControllerService::new(orchestrator.clone(), metrics);

        let expected = hosts.len();
        eventually(|| {
            let nodes = nodes.clone();
            async move { nodes.list(&BTreeMap::new()).await.unwrap().len() == expected }
        })
        .await;

        Self {
            service,
            orchestrator,
            volumes,
            snapshots,
            engines,
            cancel,
            agents,
        }
    }

    fn engine(&self, host: &str) -> &SimulatedEngine {
        &self.engines[host]
    }

    async fn stop(self) {
        self.cancel.cancel();
        self.orchestrator.shutdown().await;
        for agent in self.agents {
            tokio::time::timeout(Duration::from_secs(5), agent)
                .await
                .unwrap()
                .unwrap();
        }
    }
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let converged = tokio::time::timeout(Duration::from_secs(10), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(converged.is_ok(), "condition not reached in time");
}

fn pool_params() -> HashMap<String, String> {
    let mut params = HashMap::new();
    params.insert("poolName".to_string(), POOL.to_string());
    params
}

fn volume_request(name: &str, size: u64) -> CreateVolumeRequest {
    CreateVolumeRequest {
        name: name.to_string(),
        capacity_range: CapacityRange::required(size),
        accessibility: TopologyRequirement {
            requisite: vec![BTreeMap::from([(ZONE.to_string(), "east".to_string())])],
            preferred: Vec::new(),
        },
        parameters: pool_params(),
        ..Default::default()
    }
}

fn snapshot_request(volume: &str, name: &str) -> CreateSnapshotRequest {
    let mut parameters = HashMap::new();
    parameters.insert("wait".to_string(), "true".to_string());
    CreateSnapshotRequest {
        source_volume_id: volume.to_string(),
        name: name.to_string(),
        parameters,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_volume_snapshot_lifecycle() {
    let cluster = Cluster::start(&["node-a", "node-b"]).await;

    // v1 lands on one host and is rounded to a whole GiB
    let v1 = cluster
        .service
        .create_volume(volume_request("v1", GIB + 1))
        .await
        .unwrap();
    assert_eq!(v1.capacity_bytes, 2 * GIB);
    let owner = v1.accessible_topology[NODE_ID_LABEL].clone();
    assert!(cluster.engine(&owner).has_volume(POOL, "v1"));

    // A repeated create returns the same volume
    let again = cluster
        .service
        .create_volume(volume_request("v1", 2 * GIB))
        .await
        .unwrap();
    assert_eq!(again, v1);

    let v2 = cluster
        .service
        .create_volume(volume_request("v2", 500 * MIB))
        .await
        .unwrap();
    assert_eq!(v2.capacity_bytes, 500 * MIB);

    // s1 of v1 is idempotent; s1 of v2 conflicts
    let s1 = cluster
        .service
        .create_snapshot(snapshot_request("v1", "s1"))
        .await
        .unwrap();
    assert_eq!(s1.snapshot_id, "v1@s1");
    assert!(s1.ready_to_use);
    assert_eq!(s1.size_bytes, 2 * GIB);
    assert!(s1.creation_time.is_some());

    let s1_again = cluster
        .service
        .create_snapshot(snapshot_request("v1", "s1"))
        .await
        .unwrap();
    assert_eq!(s1_again, s1);

    let err = cluster
        .service
        .create_snapshot(snapshot_request("v2", "s1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    // A clone of s1 lands on the snapshot's host
    let clone = cluster
        .service
        .create_volume(CreateVolumeRequest {
            content_source: Some(ContentSource::Snapshot("v1@s1".into())),
            ..volume_request("v3", 2 * GIB)
        })
        .await
        .unwrap();
    assert_eq!(clone.accessible_topology[NODE_ID_LABEL], owner);
    assert_eq!(clone.content_source, Some(ContentSource::Snapshot("v1@s1".into())));
    assert!(cluster.engine(&owner).has_volume(POOL, "v3"));

    // Tear everything down through the hosts
    cluster.service.delete_snapshot("v1@s1").await.unwrap();
    for name in ["v1", "v2", "v3"] {
        cluster.service.delete_volume(name).await.unwrap();
    }

    let (volumes, snapshots) = (cluster.volumes.clone(), cluster.snapshots.clone());
    eventually(|| {
        let (volumes, snapshots) = (volumes.clone(), snapshots.clone());
        async move { volumes.is_empty() && snapshots.is_empty() }
    })
    .await;
    for engine in cluster.engines.values() {
        assert!(!engine.has_volume(POOL, "v1"));
        assert!(!engine.has_volume(POOL, "v3"));
        assert!(!engine.has_snapshot(POOL, "v1", "s1"));
    }

    // Deleting twice is fine
    cluster.service.delete_volume("v1").await.unwrap();
    cluster.service.delete_snapshot("v1@s1").await.unwrap();

    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_expand_reaches_host() {
    let cluster = Cluster::start(&["node-a"]).await;

    cluster
        .service
        .create_volume(volume_request("v1", GIB))
        .await
        .unwrap();

    let expanded = cluster
        .service
        .expand_volume("v1", CapacityRange::required(3 * GIB))
        .await
        .unwrap();
    assert_eq!(expanded.capacity_bytes, 3 * GIB);
    assert!(expanded.node_expansion_required);

    let engine = cluster.engines["node-a"].clone();
    eventually(|| {
        let engine = engine.clone();
        async move {
            engine
                .get_volume("v1", POOL)
                .await
                .unwrap()
                .is_some_and(|v| v.capacity_bytes == 3 * GIB)
        }
    })
    .await;

    // Shrinking is a no-op
    let same = cluster
        .service
        .expand_volume("v1", CapacityRange::required(GIB))
        .await
        .unwrap();
    assert_eq!(same.capacity_bytes, 3 * GIB);
    assert!(!same.node_expansion_required);

    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_host_failure_falls_through_to_next_host() {
    let cluster = Cluster::start(&["node-a", "node-b"]).await;
    cluster.engine("node-a").fail_next(ops::CREATE_VOLUME, usize::MAX);

    let v1 = cluster
        .service
        .create_volume(volume_request("v1", GIB))
        .await
        .unwrap();
    assert_eq!(v1.accessible_topology[NODE_ID_LABEL], "node-b");
    assert!(cluster.engine("node-a").calls(ops::CREATE_VOLUME) >= 1);
    assert!(!cluster.engine("node-a").has_volume(POOL, "v1"));

    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_capacity_and_scheduling_errors() {
    let cluster = Cluster::start(&["node-a", "node-b"]).await;

    let v1 = cluster
        .service
        .create_volume(volume_request("v1", 4 * GIB))
        .await
        .unwrap();

    // Largest single host, not the sum of both
    let service = &cluster.service;
    let capacity = |topology: Option<BTreeMap<String, String>>| async move {
        service
            .get_capacity(GetCapacityRequest {
                accessible_topology: topology,
                parameters: pool_params(),
            })
            .await
            .unwrap()
    };
    let owner = v1.accessible_topology;
    eventually(|| {
        let owner = owner.clone();
        async move { capacity(Some(owner)).await == 6 * GIB }
    })
    .await;
    assert_eq!(capacity(None).await, 10 * GIB);

    let mut other_pool = HashMap::new();
    other_pool.insert("poolname".to_string(), "missing".to_string());
    let err = cluster
        .service
        .create_volume(CreateVolumeRequest {
            parameters: other_pool,
            ..volume_request("v2", GIB)
        })
        .await
        .unwrap_err();
    assert_matches!(err, Error::SchedulingFailed { .. });

    // A zone no host is in
    let err = cluster
        .service
        .create_volume(CreateVolumeRequest {
            accessibility: TopologyRequirement {
                requisite: vec![BTreeMap::from([(ZONE.to_string(), "west".to_string())])],
                preferred: Vec::new(),
            },
            ..volume_request("v4", GIB)
        })
        .await
        .unwrap_err();
    assert_matches!(err, Error::SchedulingFailed { .. });

    let err = cluster
        .service
        .create_volume(CreateVolumeRequest {
            parameters: HashMap::new(),
            ..volume_request("v3", GIB)
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    cluster.stop().await;
}
