//! Redirect Gate
//!
//! For protocols where the pool tells the door where the client has to
//! connect. The door task blocks in `wait_for_redirect` while the messaging
//! layer delivers the pool's redirect through `redirect`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;

use super::coordinator::TransferCoordinator;
use super::error::TransferError;

pub struct RedirectGate<T> {
    transfer: Arc<TransferCoordinator>,
    redirect: Mutex<Option<T>>,
}

impl<T: Clone + Send> RedirectGate<T> {
    pub fn new(transfer: Arc<TransferCoordinator>) -> Self {
        Self {
            transfer,
            redirect: Mutex::new(None),
        }
    }

    pub fn transfer(&self) -> &Arc<TransferCoordinator> {
        &self.transfer
    }

    fn payload(&self) -> MutexGuard<'_, Option<T>> {
        self.redirect.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_redirected(&self) -> bool {
        self.payload().is_some()
    }

    /// Deliver the pool's redirect and wake the waiting door task.
    pub fn redirect(&self, payload: T) {
        debug!(session_id = %self.transfer.session_id(), "Redirect received");
        *self.payload() = Some(payload);
        self.transfer.notify_waiters();
    }

    /// Wait for the redirect.
    ///
    /// Fails with the mover's error when it finished before redirecting, and
    /// with `Timeout` when nothing happened within `timeout`.
    pub async fn wait_for_redirect(&self, timeout: Duration) -> Result<T, TransferError> {
        self.transfer
            .wait_until(timeout, || {
                self.is_redirected() || self.transfer.has_mover_finished()
            })
            .await;

        if let Some(payload) = self.payload().clone() {
            return Ok(payload);
        }
        if self.transfer.has_mover_finished() {
            return Err(self.transfer.error().unwrap_or(TransferError::MoverFailed {
                rc: 0,
                message: "mover finished without redirect".into(),
            }));
        }
        Err(TransferError::Timeout(format!(
            "no redirect from pool within {timeout:?}"
        )))
    }
}
