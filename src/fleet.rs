//! Fleet Probe (spec §4.3): the worker count, advisory and compared only
//! by the Cap Resolver. Resolution order per spec §4.3:
//! 1. An explicit environment override, if set to a positive integer.
//! 2. The host orchestrator's declared replica count (out of scope per
//!    spec §1; modeled as a pluggable `HostReplicaProbe` trait object).
//! 3. Fallback: 1.

use crate::error::Result;

#[async_trait::async_trait]
pub trait FleetProbe: Send + Sync + 'static {
    async fn worker_count(&self) -> Result<u32>;
}

/// Queried only when the environment override is absent.
#[async_trait::async_trait]
pub trait HostReplicaProbe: Send + Sync + 'static {
    async fn replica_count(&self) -> Result<Option<u32>>;
}

/// A `HostReplicaProbe` that never has an opinion, used when no host
/// orchestrator integration is configured.
pub struct NoHostReplicaProbe;

#[async_trait::async_trait]
impl HostReplicaProbe for NoHostReplicaProbe {
    async fn replica_count(&self) -> Result<Option<u32>> {
        Ok(None)
    }
}

pub struct EnvFleetProbe {
    env_var: String,
    host_probe: Box<dyn HostReplicaProbe>,
}

impl EnvFleetProbe {
    pub fn new(env_var: impl Into<String>, host_probe: Box<dyn HostReplicaProbe>) -> Self {
        Self {
            env_var: env_var.into(),
            host_probe,
        }
    }
}

impl Default for EnvFleetProbe {
    fn default() -> Self {
        Self::new("WORKER_COUNT_OVERRIDE", Box::new(NoHostReplicaProbe))
    }
}

#[async_trait::async_trait]
impl FleetProbe for EnvFleetProbe {
    async fn worker_count(&self) -> Result<u32> {
        if let Ok(value) = std::env::var(&self.env_var) {
            if let Ok(count) = value.parse::<u32>() {
                if count > 0 {
                    return Ok(count);
                }
            }
        }

        if let Some(count) = self.host_probe.replica_count().await? {
            if count > 0 {
                return Ok(count);
            }
        }

        Ok(1)
    }
}

/// A fixed count, used by tests driving the scenarios in spec §8.
pub struct FixedFleet(pub u32);

#[async_trait::async_trait]
impl FleetProbe for FixedFleet {
    async fn worker_count(&self) -> Result<u32> {
        Ok(self.0.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn env_override_wins() {
        std::env::set_var("SHARDLEASE_TEST_WORKER_COUNT", "7");
        let probe = EnvFleetProbe::new("SHARDLEASE_TEST_WORKER_COUNT", Box::new(NoHostReplicaProbe));
        assert_eq!(probe.worker_count().await.unwrap(), 7);
        std::env::remove_var("SHARDLEASE_TEST_WORKER_COUNT");
    }

    #[tokio::test]
    async fn falls_back_to_one() {
        std::env::remove_var("SHARDLEASE_TEST_WORKER_COUNT_UNSET");
        let probe = EnvFleetProbe::new(
            "SHARDLEASE_TEST_WORKER_COUNT_UNSET",
            Box::new(NoHostReplicaProbe),
        );
        assert_eq!(probe.worker_count().await.unwrap(), 1);
    }
}
