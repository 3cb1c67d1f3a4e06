use async_trait::async_trait;

use super::{OperationOutcome, SyncRequest};

/// Receives exactly one outcome per finished operation.
#[async_trait]
pub trait HistorySink: Send + Sync {
    async fn record(&self, request: &SyncRequest, outcome: &OperationOutcome) -> anyhow::Result<()>;
}

#[cfg(test)]
pub use memory::MemoryHistory;
