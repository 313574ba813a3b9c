//! Topology Probe (spec §4.2): the current set of shards open for reads,
//! with parent links for split/merge ordering. The probe implementation is
//! responsible for pagination against the upstream stream service and for
//! excluding shards whose stream-side lifecycle marks them fully closed
//! (unless they still carry unconsumed data) — both are out of scope here
//! per spec §1 ("the physical stream client... referenced only through
//! interfaces").

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OpenShard {
    pub shard_id: String,
    pub parent_shard_id: Option<String>,
}

#[async_trait::async_trait]
pub trait TopologyProbe: Send + Sync + 'static {
    async fn list_open_shards(&self) -> Result<Vec<OpenShard>>;
}

/// A fixed or mutable-via-channel topology, used by tests that need to
/// simulate shard splits/merges mid-run (spec §8 scenarios 3 and 5)
/// without standing up a real stream client.
pub struct StaticTopology {
    shards: tokio::sync::watch::Receiver<Vec<OpenShard>>,
}

impl StaticTopology {
    pub fn new(initial: Vec<OpenShard>) -> (tokio::sync::watch::Sender<Vec<OpenShard>>, Self) {
        let (tx, rx) = tokio::sync::watch::channel(initial);
        (tx, Self { shards: rx })
    }
}

#[async_trait::async_trait]
impl TopologyProbe for StaticTopology {
    async fn list_open_shards(&self) -> Result<Vec<OpenShard>> {
        Ok(self.shards.borrow().clone())
    }
}

/// A probe that always fails, used to exercise `probe_unavailable` handling
/// (spec §7: callers retain their last-known counts rather than propagate).
pub struct FailingTopology;

#[async_trait::async_trait]
impl TopologyProbe for FailingTopology {
    async fn list_open_shards(&self) -> Result<Vec<OpenShard>> {
        Err(Error::ProbeUnavailable(anyhow::anyhow!(
            "topology probe unreachable"
        )))
    }
}

/// A simple standalone-binary/dev-mode `TopologyProbe`: re-reads a JSON file
/// of `OpenShard`s on every call. Real deployments plug in a probe backed by
/// their stream service's shard-listing API (out of scope here per spec
/// §1); this exists so `shardlease` is runnable without one.
pub struct FileTopology {
    path: std::path::PathBuf,
}

impl FileTopology {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl TopologyProbe for FileTopology {
    async fn list_open_shards(&self) -> Result<Vec<OpenShard>> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|err| Error::ProbeUnavailable(anyhow::anyhow!(err)))?;
        serde_json::from_str(&contents).map_err(|err| Error::ProbeUnavailable(anyhow::anyhow!(err)))
    }
}
