//! Asynchronous Redirect Driver
//!
//! Runs the redirect state machine of [`super::state`] on behalf of a door
//! that does not block a task per transfer. Signals come from the task that
//! starts the mover, from the messaging layer (redirect, completion) and
//! from the liveness poller; the driver serializes them under its own lock
//! and invokes the door's [`RedirectHandler`] in protocol order.
//!
//! Lock order is machine, then transfer. Handlers run under the machine lock
//! and must not signal the machine or call `finished` on its transfer.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, warn};

use super::coordinator::{MoverObserver, TransferCoordinator};
use super::error::TransferError;
use super::policy::RetryPolicy;
use super::state::{RedirectEffect, RedirectEvent, RedirectPhase, RedirectState};

/// Door callbacks, invoked at most once each and in protocol order.
///
/// An `Err` from `on_queued` or `on_redirect` aborts the transfer: the mover
/// is killed and `on_failure` receives the error. The transfer is already
/// finished when `on_finish` runs, so its errors are only logged.
pub trait RedirectHandler<R>: Send + Sync {
    /// The mover was created and is queued on the pool
    fn on_queued(&self) -> Result<(), TransferError>;

    /// The pool sent the client's redirect target
    fn on_redirect(&self, payload: R) -> Result<(), TransferError>;

    /// The mover finished successfully
    fn on_finish(&self) -> Result<(), TransferError>;

    /// The transfer failed. Called at most once, and never after `on_finish`.
    fn on_failure(&self, error: TransferError);
}

pub struct AsyncRedirectStateMachine<R> {
    transfer: Arc<TransferCoordinator>,
    handler: Arc<dyn RedirectHandler<R>>,
    state: Mutex<RedirectState<R>>,
}

impl<R: Send + 'static> AsyncRedirectStateMachine<R> {
    /// Create the machine and subscribe it to the transfer's completion.
    pub fn new(transfer: Arc<TransferCoordinator>, handler: Arc<dyn RedirectHandler<R>>) -> Arc<Self> {
        let machine = Arc::new(Self {
            transfer,
            handler,
            state: Mutex::new(RedirectState::new()),
        });

        let observer: Weak<dyn MoverObserver> = Arc::downgrade(&machine) as Weak<dyn MoverObserver>;
        if !machine.transfer.set_observer(observer) {
            warn!(
                session_id = %machine.transfer.session_id(),
                "Transfer already has a completion observer"
            );
        }
        machine
    }

    pub fn transfer(&self) -> &Arc<TransferCoordinator> {
        &self.transfer
    }

    pub fn phase(&self) -> RedirectPhase {
        self.lock().phase()
    }

    fn lock(&self) -> MutexGuard<'_, RedirectState<R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Select a pool and start the mover, then report the outcome.
    ///
    /// Usually spawned by the door right after the transfer was set up.
    pub async fn start(&self, queue: Option<&str>, policy: &RetryPolicy) {
        match self
            .transfer
            .select_pool_and_start_mover(queue, policy)
            .await
        {
            Ok(()) => self.fire(RedirectEvent::MoverQueued),
            Err(e) => self.fire(RedirectEvent::Failed(e)),
        }
    }

    /// Redirect message from the pool
    pub fn redirect(&self, payload: R) {
        self.fire(RedirectEvent::Redirect(payload));
    }

    /// Abort on behalf of the door, e.g. after the client disconnected
    pub fn abort(&self, error: TransferError) {
        self.fire(RedirectEvent::Failed(error));
    }

    fn fire(&self, event: RedirectEvent<R>) {
        let mut state = self.lock();
        let mut next_event = Some(event);

        while let Some(event) = next_event.take() {
            let mover_known = self.transfer.mover_id().is_some();
            let (next, effects) = std::mem::take(&mut *state).next(event, mover_known);
            *state = next;

            for effect in effects {
                if let Err(error) = self.apply(effect) {
                    warn!(
                        session_id = %self.transfer.session_id(),
                        error = %error,
                        "Redirect callback failed; aborting transfer"
                    );
                    next_event = Some(RedirectEvent::Failed(error));
                    break;
                }
            }
        }
        debug!(session_id = %self.transfer.session_id(), phase = %state.phase(), "Redirect state");
    }

    fn apply(&self, effect: RedirectEffect<R>) -> Result<(), TransferError> {
        match effect {
            RedirectEffect::KillMover => {
                self.transfer.send_kill("transfer aborted");
                Ok(())
            }
            RedirectEffect::OnQueued => self.handler.on_queued(),
            RedirectEffect::OnRedirect(payload) => self.handler.on_redirect(payload),
            RedirectEffect::OnFinish => self.handler.on_finish(),
            RedirectEffect::OnFailure(error) => {
                self.handler.on_failure(error);
                Ok(())
            }
        }
    }
}

impl<R: Send + 'static> MoverObserver for AsyncRedirectStateMachine<R> {
    fn mover_finished(&self, result: &Result<(), TransferError>) {
        match result {
            Ok(()) => self.fire(RedirectEvent::Finished),
            Err(e) => self.fire(RedirectEvent::Failed(e.clone())),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::transfer::adapters::mock::{MockNamespace, MockPool, MockPoolManager, file_attributes};
    use crate::transfer::coordinator::TransferServices;
    use crate::transfer::types::{ProtocolInfo, Subject};
    use std::time::Duration;

    /// Records callbacks as strings
    #[derive(Default)]
    pub(crate) struct RecordingHandler {
        calls: Mutex<Vec<String>>,
        fail_redirect: bool,
        fail_finish: bool,
    }

    impl RecordingHandler {
        pub(crate) fn failing_redirect() -> Self {
            Self {
                fail_redirect: true,
                ..Self::default()
            }
        }

        pub(crate) fn failing_finish() -> Self {
            Self {
                fail_finish: true,
                ..Self::default()
            }
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl RedirectHandler<String> for RecordingHandler {
        fn on_queued(&self) -> Result<(), TransferError> {
            self.calls.lock().unwrap().push("queued".into());
            Ok(())
        }

        fn on_redirect(&self, payload: String) -> Result<(), TransferError> {
            if self.fail_redirect {
                return Err(TransferError::Unexpected("client gone".into()));
            }
            self.calls.lock().unwrap().push(format!("redirect:{payload}"));
            Ok(())
        }

        fn on_finish(&self) -> Result<(), TransferError> {
            self.calls.lock().unwrap().push("finish".into());
            if self.fail_finish {
                return Err(TransferError::Unexpected("reply lost".into()));
            }
            Ok(())
        }

        fn on_failure(&self, error: TransferError) {
            self.calls.lock().unwrap().push(format!("failure:{}", error.code()));
        }
    }

    fn setup(
        handler: RecordingHandler,
    ) -> (
        Arc<AsyncRedirectStateMachine<String>>,
        Arc<RecordingHandler>,
        Arc<MockPoolManager>,
        Arc<MockPool>,
    ) {
        let pool_manager = Arc::new(MockPoolManager::new("pool-a"));
        let pool = Arc::new(MockPool::new());
        let services = TransferServices::new(
            Arc::new(MockNamespace::new(file_attributes("0200", 1))),
            pool_manager.clone(),
            pool.clone(),
        );
        let transfer = TransferCoordinator::new(services, Subject::new("alice"), "/data/a");
        transfer.set_protocol_info(ProtocolInfo::new("Http", 1, 1));

        let handler = Arc::new(handler);
        let machine = AsyncRedirectStateMachine::<String>::new(Arc::new(transfer), handler.clone());
        (machine, handler, pool_manager, pool)
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::try_once_policy(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_happy_path() {
        let (machine, handler, _, pool) = setup(RecordingHandler::default());

        machine.start(None, &policy()).await;
        assert_eq!(machine.phase(), RedirectPhase::Queued);

        machine.redirect("http://pool-a/x".into());
        machine.transfer().finished(Ok(()));

        assert_eq!(handler.calls(), vec!["queued", "redirect:http://pool-a/x", "finish"]);
        assert_eq!(machine.phase(), RedirectPhase::Finished);
        assert!(pool.killed().is_empty());
    }

    #[tokio::test]
    async fn test_redirect_and_finish_before_queued() {
        let (machine, handler, _, _) = setup(RecordingHandler::default());

        machine.redirect("early".into());
        machine.transfer().finished(Ok(()));
        assert!(handler.calls().is_empty());

        machine.start(None, &policy()).await;
        assert_eq!(handler.calls(), vec!["queued", "redirect:early", "finish"]);
    }

    #[tokio::test]
    async fn test_start_failure_reports_once() {
        let (machine, handler, pool_manager, pool) = setup(RecordingHandler::default());
        pool_manager.push_error(TransferError::FileInCache("/data/a".into()));

        machine.start(None, &policy()).await;
        machine.redirect("late".into());

        assert_eq!(handler.calls(), vec!["failure:FILE_IN_CACHE"]);
        assert_eq!(machine.phase(), RedirectPhase::Failed);
        assert!(pool.killed().is_empty());
    }

    #[tokio::test]
    async fn test_mover_started_after_abort_is_killed() {
        let (machine, handler, _, pool) = setup(RecordingHandler::default());

        machine.abort(TransferError::Unexpected("client disconnected".into()));
        machine.start(None, &policy()).await;
        machine.redirect("late".into());
        machine.transfer().finished(Ok(()));

        assert_eq!(handler.calls(), vec!["failure:UNEXPECTED"]);
        assert_eq!(pool.killed().len(), 1);
    }

    #[tokio::test]
    async fn test_callback_error_aborts() {
        let (machine, handler, _, pool) = setup(RecordingHandler::failing_redirect());

        machine.start(None, &policy()).await;
        machine.redirect("x".into());
        machine.transfer().finished(Ok(()));

        assert_eq!(handler.calls(), vec!["queued", "failure:UNEXPECTED"]);
        assert_eq!(pool.killed().len(), 1);
    }

    #[tokio::test]
    async fn test_finish_error_does_not_report_failure() {
        let (machine, handler, _, pool) = setup(RecordingHandler::failing_finish());

        machine.start(None, &policy()).await;
        machine.redirect("x".into());
        machine.transfer().finished(Ok(()));

        assert_eq!(handler.calls(), vec!["queued", "redirect:x", "finish"]);
        assert_eq!(machine.phase(), RedirectPhase::Finished);
        assert!(pool.killed().is_empty());
    }

    #[tokio::test]
    async fn test_mover_failure_reaches_handler() {
        let (machine, handler, _, _) = setup(RecordingHandler::default());

        machine.start(None, &policy()).await;
        machine.transfer().finished(Err(TransferError::MoverFailed {
            rc: 41,
            message: "no space left".into(),
        }));
        machine.redirect("too late".into());

        assert_eq!(handler.calls(), vec!["queued", "failure:MOVER_FAILED"]);
    }
}
