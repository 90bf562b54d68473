//! Transfer Registry
//!
//! Live collection of a door's outstanding transfers, keyed by session id.
//! Completion messages from pools are routed through it, the liveness
//! poller iterates it, and monitoring reads snapshots from it.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use super::coordinator::TransferCoordinator;
use super::types::{SessionId, TransferFinished, TransferInfo};

/// Thread-safe session id → transfer map.
///
/// Transfers are added and removed by unrelated tasks while the poller
/// iterates; DashMap shards keep that safe without a global lock.
#[derive(Default)]
pub struct TransferRegistry {
    transfers: DashMap<SessionId, Arc<TransferCoordinator>>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, transfer: Arc<TransferCoordinator>) {
        let session_id = transfer.session_id();
        if self.transfers.insert(session_id, transfer).is_some() {
            warn!(session_id = %session_id, "Replaced transfer with duplicate session id");
        }
        debug!(session_id = %session_id, active = self.transfers.len(), "Transfer registered");
    }

    pub fn remove(&self, session_id: SessionId) -> Option<Arc<TransferCoordinator>> {
        self.transfers.remove(&session_id).map(|(_, transfer)| transfer)
    }

    pub fn get(&self, session_id: SessionId) -> Option<Arc<TransferCoordinator>> {
        self.transfers.get(&session_id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    /// Clone out the current transfers so callers never hold a shard lock
    pub fn transfers(&self) -> Vec<Arc<TransferCoordinator>> {
        self.transfers
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Route a pool's completion message. Returns `false` for unknown ids.
    pub fn dispatch_finished(&self, message: TransferFinished) -> bool {
        let session_id = message.session_id;
        match self.get(session_id) {
            Some(transfer) => {
                transfer.finished_with(message);
                true
            }
            None => {
                // transfer already gone; late or duplicate reply
                warn!(session_id = %session_id, "Completion for unknown transfer dropped");
                false
            }
        }
    }

    /// Snapshot of all transfers, ordered by session id
    pub fn snapshot(&self) -> Vec<TransferInfo> {
        let mut infos: Vec<_> = self.transfers().iter().map(|t| t.info()).collect();
        infos.sort_by_key(|info| info.session_id);
        infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::adapters::mock::{MockNamespace, MockPool, MockPoolManager, file_attributes};
    use crate::transfer::coordinator::TransferServices;
    use crate::transfer::error::TransferError;
    use crate::transfer::types::Subject;

    fn transfer(services: &TransferServices, path: &str) -> Arc<TransferCoordinator> {
        Arc::new(TransferCoordinator::new(
            services.clone(),
            Subject::new("alice"),
            path,
        ))
    }

    fn services() -> TransferServices {
        TransferServices::new(
            Arc::new(MockNamespace::new(file_attributes("0300", 1))),
            Arc::new(MockPoolManager::new("pool-a")),
            Arc::new(MockPool::new()),
        )
    }

    #[test]
    fn test_register_and_remove() {
        let services = services();
        let registry = TransferRegistry::new();
        let t1 = transfer(&services, "/a");
        let t2 = transfer(&services, "/b");
        registry.register(t1.clone());
        registry.register(t2.clone());

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(t1.session_id()).unwrap().path(), "/a");

        assert!(registry.remove(t1.session_id()).is_some());
        assert!(registry.get(t1.session_id()).is_none());
        assert!(registry.remove(t1.session_id()).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_dispatch_finished() {
        let services = services();
        let registry = TransferRegistry::new();
        let t = transfer(&services, "/a");
        registry.register(t.clone());

        let delivered = registry.dispatch_finished(TransferFinished {
            session_id: t.session_id(),
            attributes: Some(file_attributes("0301", 512)),
            result: Err(TransferError::MoverFailed {
                rc: 5,
                message: "io error".into(),
            }),
        });

        assert!(delivered);
        assert!(t.has_mover_finished());
        assert_eq!(t.file_attributes().size, Some(512));
        assert_eq!(t.error().unwrap().rc(), 5);
    }

    #[test]
    fn test_duplicate_dispatch_keeps_first_completion() {
        let services = services();
        let registry = TransferRegistry::new();
        let t = transfer(&services, "/a");
        registry.register(t.clone());

        registry.dispatch_finished(TransferFinished {
            session_id: t.session_id(),
            attributes: Some(file_attributes("0301", 512)),
            result: Ok(()),
        });
        registry.dispatch_finished(TransferFinished {
            session_id: t.session_id(),
            attributes: Some(file_attributes("9999", 7)),
            result: Err(TransferError::MoverFailed {
                rc: 5,
                message: "late reply".into(),
            }),
        });

        let attributes = t.file_attributes();
        assert_eq!(attributes.size, Some(512));
        assert_eq!(attributes.pnfs_id, file_attributes("0301", 512).pnfs_id);
        assert!(t.error().is_none());
    }

    #[test]
    fn test_dispatch_unknown_session() {
        let registry = TransferRegistry::new();
        let delivered = registry.dispatch_finished(TransferFinished {
            session_id: SessionId(42),
            attributes: None,
            result: Ok(()),
        });
        assert!(!delivered);
    }

    #[test]
    fn test_snapshot_sorted() {
        let services = services();
        let registry = TransferRegistry::new();
        let first = transfer(&services, "/first");
        let second = transfer(&services, "/second");
        registry.register(second);
        registry.register(first);

        let paths: Vec<_> = registry.snapshot().into_iter().map(|i| i.path).collect();
        assert_eq!(paths, vec!["/first", "/second"]);
    }
}
