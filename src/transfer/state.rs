//! Redirect State Machine
//!
//! Pure transition function of the asynchronous redirect protocol. The
//! signals (mover queued, redirect, completion, failure) arrive from
//! different tasks in any order; `next` turns each of them into the callbacks
//! that may fire now, so that callbacks always come out as
//! queued → redirect → finish, or end with a single failure.
//!
//! Signals that arrive too early are remembered and replayed once their
//! predecessors have fired. Every guard is re-evaluated on every event.

use std::fmt;

use super::error::TransferError;

/// Redirect protocol phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RedirectPhase {
    /// Pool selection / mover creation still running
    AwaitingMover,
    /// Mover known and queued callback fired
    Queued,
    /// Redirect callback fired
    Redirected,
    /// Terminal: finish callback fired
    Finished,
    /// Terminal: failure callback fired
    Failed,
}

impl RedirectPhase {
    /// Check if this is a terminal phase (no more callbacks possible)
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, RedirectPhase::Finished | RedirectPhase::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RedirectPhase::AwaitingMover => "AWAITING_MOVER",
            RedirectPhase::Queued => "QUEUED",
            RedirectPhase::Redirected => "REDIRECTED",
            RedirectPhase::Finished => "FINISHED",
            RedirectPhase::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RedirectPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Input signals
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectEvent<R> {
    /// Mover creation succeeded
    MoverQueued,
    /// Pool sent redirect information
    Redirect(R),
    /// Mover completed successfully
    Finished,
    /// Mover failed, the door aborted, or a callback failed
    Failed(TransferError),
}

/// Actions the driver performs, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectEffect<R> {
    KillMover,
    OnQueued,
    OnRedirect(R),
    OnFinish,
    OnFailure(TransferError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectState<R> {
    phase: RedirectPhase,
    /// Redirect that arrived before the mover was queued
    pending_redirect: Option<R>,
    /// Successful completion that arrived before the redirect fired
    finish_pending: bool,
}

impl<R> Default for RedirectState<R> {
    fn default() -> Self {
        Self {
            phase: RedirectPhase::AwaitingMover,
            pending_redirect: None,
            finish_pending: false,
        }
    }
}

impl<R> RedirectState<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> RedirectPhase {
        self.phase
    }

    pub fn is_done(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Apply `event`. `mover_known` tells whether the transfer has a mover id.
    pub fn next(mut self, event: RedirectEvent<R>, mover_known: bool) -> (Self, Vec<RedirectEffect<R>>) {
        let mut effects = Vec::new();

        if self.phase.is_terminal() {
            // a mover that shows up after the end must not be left running
            if matches!(event, RedirectEvent::MoverQueued) {
                effects.push(RedirectEffect::KillMover);
            }
            return (self, effects);
        }

        match event {
            RedirectEvent::MoverQueued => {
                if self.phase == RedirectPhase::AwaitingMover && mover_known {
                    self.phase = RedirectPhase::Queued;
                    effects.push(RedirectEffect::OnQueued);
                }
            }
            RedirectEvent::Redirect(payload) => {
                if matches!(
                    self.phase,
                    RedirectPhase::AwaitingMover | RedirectPhase::Queued
                ) {
                    self.pending_redirect = Some(payload);
                }
            }
            RedirectEvent::Finished => {
                self.finish_pending = true;
            }
            RedirectEvent::Failed(error) => {
                self.phase = RedirectPhase::Failed;
                self.pending_redirect = None;
                self.finish_pending = false;
                effects.push(RedirectEffect::KillMover);
                effects.push(RedirectEffect::OnFailure(error));
                return (self, effects);
            }
        }

        self.advance(mover_known, &mut effects);
        (self, effects)
    }

    fn advance(&mut self, mover_known: bool, effects: &mut Vec<RedirectEffect<R>>) {
        if self.phase == RedirectPhase::Queued && mover_known {
            if let Some(payload) = self.pending_redirect.take() {
                self.phase = RedirectPhase::Redirected;
                effects.push(RedirectEffect::OnRedirect(payload));
            }
        }
        if self.phase == RedirectPhase::Redirected && self.finish_pending {
            self.phase = RedirectPhase::Finished;
            effects.push(RedirectEffect::OnFinish);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type State = RedirectState<&'static str>;
    type Effect = RedirectEffect<&'static str>;

    fn run(events: Vec<RedirectEvent<&'static str>>) -> (State, Vec<Effect>) {
        let mut state = State::new();
        let mut all = Vec::new();
        for event in events {
            let (next, effects) = state.next(event, true);
            state = next;
            all.extend(effects);
        }
        (state, all)
    }

    #[test]
    fn test_terminal_phases() {
        assert!(RedirectPhase::Finished.is_terminal());
        assert!(RedirectPhase::Failed.is_terminal());

        assert!(!RedirectPhase::AwaitingMover.is_terminal());
        assert!(!RedirectPhase::Queued.is_terminal());
        assert!(!RedirectPhase::Redirected.is_terminal());
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", RedirectPhase::AwaitingMover), "AWAITING_MOVER");
        assert_eq!(format!("{}", RedirectPhase::Redirected), "REDIRECTED");
    }

    #[test]
    fn test_in_order() {
        let (state, effects) = run(vec![
            RedirectEvent::MoverQueued,
            RedirectEvent::Redirect("http://pool-a/f"),
            RedirectEvent::Finished,
        ]);
        assert_eq!(state.phase(), RedirectPhase::Finished);
        assert_eq!(effects, vec![
            Effect::OnQueued,
            Effect::OnRedirect("http://pool-a/f"),
            Effect::OnFinish,
        ]);
    }

    #[test]
    fn test_every_arrival_order_yields_same_callbacks() {
        let orders = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for order in orders {
            let events = order
                .iter()
                .map(|i| match i {
                    0 => RedirectEvent::MoverQueued,
                    1 => RedirectEvent::Redirect("r"),
                    _ => RedirectEvent::Finished,
                })
                .collect();
            let (state, effects) = run(events);
            assert!(state.is_done(), "order {order:?}");
            assert_eq!(
                effects,
                vec![Effect::OnQueued, Effect::OnRedirect("r"), Effect::OnFinish],
                "order {order:?}"
            );
        }
    }

    #[test]
    fn test_queued_requires_mover() {
        let (state, effects) = State::new().next(RedirectEvent::MoverQueued, false);
        assert_eq!(state.phase(), RedirectPhase::AwaitingMover);
        assert!(effects.is_empty());
    }

    #[test]
    fn test_abort_suppresses_later_callbacks() {
        let (state, effects) = run(vec![
            RedirectEvent::Failed(TransferError::FileIsNew),
            RedirectEvent::Redirect("r"),
            RedirectEvent::Finished,
        ]);
        assert_eq!(state.phase(), RedirectPhase::Failed);
        assert_eq!(effects, vec![
            Effect::KillMover,
            Effect::OnFailure(TransferError::FileIsNew),
        ]);
    }

    #[test]
    fn test_mover_queued_after_abort_is_killed() {
        let (_, effects) = run(vec![
            RedirectEvent::Failed(TransferError::Timeout("select".into())),
            RedirectEvent::MoverQueued,
        ]);
        assert_eq!(effects.last(), Some(&Effect::KillMover));
        assert!(!effects.contains(&Effect::OnQueued));
    }

    #[test]
    fn test_failure_after_redirect() {
        let (state, effects) = run(vec![
            RedirectEvent::MoverQueued,
            RedirectEvent::Redirect("r"),
            RedirectEvent::Failed(TransferError::Unexpected("disk".into())),
            RedirectEvent::Finished,
        ]);
        assert_eq!(state.phase(), RedirectPhase::Failed);
        assert_eq!(effects.len(), 4);
        assert_eq!(effects[3], Effect::OnFailure(TransferError::Unexpected("disk".into())));
    }

    #[test]
    fn test_single_terminal_callback() {
        let (_, effects) = run(vec![
            RedirectEvent::MoverQueued,
            RedirectEvent::Redirect("r"),
            RedirectEvent::Finished,
            RedirectEvent::Failed(TransferError::FileIsNew),
        ]);
        let terminal = effects
            .iter()
            .filter(|e| matches!(e, Effect::OnFinish | Effect::OnFailure(_)))
            .count();
        assert_eq!(terminal, 1);
    }

    #[test]
    fn test_duplicate_redirect_fires_once() {
        let (_, effects) = run(vec![
            RedirectEvent::MoverQueued,
            RedirectEvent::Redirect("first"),
            RedirectEvent::Redirect("second"),
        ]);
        assert_eq!(effects, vec![Effect::OnQueued, Effect::OnRedirect("first")]);
    }
}
