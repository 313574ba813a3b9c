//! Downstream contract (spec §6): what the coordinator exposes to
//! record-processing business logic, which is itself out of scope
//! (spec §1).

use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The lease was stolen by a peer; processing has already stopped.
    Stolen,
    /// The shard has been fully drained.
    ShardEnd,
    /// The Worker Runtime is shutting down cooperatively; the shard is
    /// still live and the processor MUST NOT call `write_shard_end`.
    Requested,
}

/// Raised by `Checkpointer::write`/`write_shard_end` when the lease was
/// stolen out from under the caller (spec §6).
#[derive(Debug, thiserror::Error)]
#[error("lease lost: {0}")]
pub struct LeaseLost(pub String);

#[async_trait]
pub trait Checkpointer: Send + Sync {
    async fn write(&self, cursor: String) -> Result<(), LeaseLost>;
    async fn write_shard_end(&self) -> Result<(), LeaseLost>;
}

#[async_trait]
pub trait Processor: Send {
    async fn on_initialize(&mut self, shard_id: &str, initial_cursor: Option<String>);

    /// `batch` is an opaque, processor-defined record batch; the
    /// coordinator never inspects record payloads (spec §1 non-goal:
    /// "record-processing semantics").
    async fn on_records(&mut self, batch: &[u8], checkpointer: &dyn Checkpointer) -> Result<(), LeaseLost>;

    async fn on_shutdown(&mut self, reason: ShutdownReason);
}

/// Produces a fresh `Processor` per acquired shard (spec §9 "dynamic
/// dispatch (processor factory)").
pub trait ProcessorFactory: Send + Sync + 'static {
    fn create_processor(&self, shard_id: &str) -> Box<dyn Processor>;
}

/// Reference `Processor` that immediately checkpoints `SHARD_END` on its
/// first batch. Useful for exercising the Worker Runtime end-to-end in
/// tests without any real record-processing business logic.
#[derive(Default)]
pub struct NoopProcessor;

#[async_trait]
impl Processor for NoopProcessor {
    async fn on_initialize(&mut self, _shard_id: &str, _initial_cursor: Option<String>) {}

    async fn on_records(&mut self, _batch: &[u8], _checkpointer: &dyn Checkpointer) -> Result<(), LeaseLost> {
        Ok(())
    }

    async fn on_shutdown(&mut self, _reason: ShutdownReason) {}
}

pub struct NoopProcessorFactory;

impl ProcessorFactory for NoopProcessorFactory {
    fn create_processor(&self, _shard_id: &str) -> Box<dyn Processor> {
        Box::new(NoopProcessor)
    }
}
