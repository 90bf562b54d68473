//! Door Transfer - transfer orchestration for storage doors
//!
//! The part of a protocol door that turns a client request into a running
//! mover on a storage pool, and keeps track of it until it finishes.
//!
//! # Modules
//!
//! - [`transfer`] - Transfer coordinator, retry loop, redirect handling, liveness
//! - [`config`] - YAML configuration
//! - [`logging`] - Tracing subscriber setup

pub mod config;
pub mod logging;
pub mod transfer;

// Convenient re-exports at crate root
pub use config::DoorConfig;
pub use logging::init_logging;
pub use transfer::{
    AsyncRedirectStateMachine, LivenessPoller, RedirectGate, RedirectHandler, RetryPolicy,
    TransferCoordinator, TransferError, TransferRegistry, TransferServices,
};
