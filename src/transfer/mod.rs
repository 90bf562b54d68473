//! Door-side Transfer Orchestration
//!
//! Coordinates a single upload or download between three independently
//! failing actors: the door (this code), the pool manager that places the
//! transfer, and the pool whose mover moves the bytes.
//!
//! # Architecture
//!
//! - [`TransferCoordinator`] owns one transfer: namespace entry, pool
//!   selection, mover startup with retries, completion and billing.
//! - [`RedirectGate`] lets a door task block until the pool redirects.
//! - [`AsyncRedirectStateMachine`] turns out-of-order signals into ordered
//!   door callbacks for doors that do not block.
//! - [`TransferRegistry`] and [`LivenessPoller`] keep track of outstanding
//!   transfers and fail those whose mover disappeared.
//!
//! # Callback order
//!
//! ```text
//! AWAITING_MOVER → QUEUED → REDIRECTED → FINISHED
//!        ↓            ↓          ↓
//!        └──────── FAILED ───────┘
//! ```
//!
//! # Retry classes
//!
//! 1. **Transient placement** errors are retried at once, outside the budget
//! 2. **Conflicts**, permission and request errors are never retried
//! 3. **Timeouts after a pool was chosen for an upload** are never retried
//! 4. Everything else is retried while count and deadline allow

pub mod adapters;
pub mod async_redirect;
pub mod coordinator;
pub mod error;
pub mod policy;
pub mod redirect;
pub mod registry;
pub mod session;
pub mod state;
pub mod types;
pub mod worker;


// Re-exports for convenience
pub use async_redirect::{AsyncRedirectStateMachine, RedirectHandler};
pub use coordinator::{MoverObserver, ServiceTimeouts, TransferCoordinator, TransferServices};
pub use error::{ErrorClass, TransferError};
pub use policy::{Deadline, RetryPolicy};
pub use redirect::RedirectGate;
pub use registry::TransferRegistry;
pub use session::SessionIdGenerator;
pub use state::{RedirectPhase, RedirectState};
pub use types::{
    Direction, FileAttributes, MoverId, PnfsId, Pool, ProtocolInfo, SessionId, Subject,
    TransferFinished, TransferInfo,
};
pub use worker::{LivenessConfig, LivenessPoller};
