use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::*;

pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    BlockchainReady,
    SyncStarted,
    SyncFinished,
    /// Emitted about a second into a running sync
    SyncProgress { blocks: u64, height: u64 },
    BlockApplied {
        id: String,
        height: u64,
        transactions: Vec<String>,
    },
    BlockReverted { id: String, height: u64 },
    TransactionsQueued { count: usize },
}

/// Fire-and-continue fan-out of node events. Emitting never waits on subscribers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<NodeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: NodeEvent) {
        trace!(?event, "Emitting event");
        // no subscribers is fine
        let _ = self.sender.send(event);
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HookError(pub String);

/// Steps the loader awaits while bringing the chain up.
#[async_trait]
pub trait LoaderHook: Send + Sync {
    /// Runs before the stored chain is trusted; an error forces a rebuild.
    async fn perform_integrity_checks(&self) -> Result<(), HookError> {
        Ok(())
    }

    /// Runs once the last block is loaded; an error forces a rebuild.
    async fn check_integrity(&self, _blocks_count: u64) -> Result<(), HookError> {
        Ok(())
    }

    async fn on_blockchain_ready(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let bus = EventBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        bus.emit(NodeEvent::SyncStarted);
        bus.emit(NodeEvent::SyncFinished);
        for receiver in [&mut first, &mut second] {
            assert_eq!(receiver.recv().await.unwrap(), NodeEvent::SyncStarted);
            assert_eq!(receiver.recv().await.unwrap(), NodeEvent::SyncFinished);
        }
    }

    #[test]
    fn emitting_without_subscribers_is_fine() {
        EventBus::new(4).emit(NodeEvent::BlockchainReady);
    }
}
