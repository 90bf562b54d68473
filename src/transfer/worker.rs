//! Liveness Poller
//!
//! Background worker that probes the movers of all registered transfers and
//! declares a transfer dead after two consecutive failed probes. A single
//! slow or dropped probe is tolerated.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use super::error::TransferError;
use super::registry::TransferRegistry;
use super::types::SessionId;

/// Configuration for the liveness poller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessConfig {
    /// Time between two probe cycles
    pub poll_interval: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(300),
        }
    }
}

pub struct LivenessPoller {
    registry: Arc<TransferRegistry>,
    config: LivenessConfig,
    /// Transfers whose probe failed in the previous cycle, with that failure
    missing: Mutex<FxHashMap<SessionId, TransferError>>,
}

impl LivenessPoller {
    pub fn new(registry: Arc<TransferRegistry>, config: LivenessConfig) -> Self {
        Self {
            registry,
            config,
            missing: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn with_defaults(registry: Arc<TransferRegistry>) -> Self {
        Self::new(registry, LivenessConfig::default())
    }

    fn missing(&self) -> MutexGuard<'_, FxHashMap<SessionId, TransferError>> {
        self.missing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run the poller loop
    ///
    /// This method runs forever, probing once per poll interval.
    pub async fn run(&self) -> ! {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Starting liveness poller"
        );

        loop {
            tokio::time::sleep(self.config.poll_interval).await;
            self.poll_once().await;
        }
    }

    /// Run a single probe cycle. Returns the number of transfers declared dead.
    pub async fn poll_once(&self) -> usize {
        let previous = std::mem::take(&mut *self.missing());

        let candidates: Vec<_> = self
            .registry
            .transfers()
            .into_iter()
            .filter_map(|transfer| {
                let mover = transfer.active_mover()?;
                Some((transfer, mover))
            })
            .collect();
        if candidates.is_empty() {
            debug!("No movers to probe");
            return 0;
        }

        let probes = candidates.iter().map(|(transfer, _)| transfer.query_mover_info());
        let results = join_all(probes).await;

        let mut current = FxHashMap::default();
        let mut dead = 0;
        for ((transfer, (pool, mover_id)), result) in candidates.iter().zip(results) {
            let Err(error) = result else {
                continue;
            };
            let session_id = transfer.session_id();

            match previous.get(&session_id) {
                Some(first) => {
                    warn!(
                        session_id = %session_id,
                        pool = %pool,
                        mover_id = %mover_id,
                        error = %error,
                        "Mover lost; failing transfer"
                    );
                    transfer.finished(Err(TransferError::Timeout(format!(
                        "mover {pool}/{mover_id} did not respond to two probes: {first}; {error}"
                    ))));
                    dead += 1;
                }
                None => {
                    debug!(
                        session_id = %session_id,
                        pool = %pool,
                        mover_id = %mover_id,
                        error = %error,
                        "Mover probe failed"
                    );
                    current.insert(session_id, error);
                }
            }
        }

        if dead > 0 {
            info!(count = dead, "Declared transfers dead this cycle");
        }
        *self.missing() = current;
        dead
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_liveness_config_default() {
        let config = LivenessConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_empty_registry() {
        let poller = LivenessPoller::with_defaults(Arc::new(TransferRegistry::new()));
        assert_eq!(poller.poll_once().await, 0);
    }
}
