//! Process-level plumbing for the sandbox harness.
//!
//! This crate covers everything that happens around the bootstrap itself: initializing logging, writing the PID file,
//! and turning operator interrupts into a termination request that the supervisor can wait on.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod bootstrap;

#[cfg(feature = "logging")]
pub mod logging;

pub mod termination;

/// Common imports.
pub mod prelude {
    pub use super::bootstrap::update_pid_file;
    #[cfg(feature = "logging")]
    pub use super::logging::{fatal_and_exit, initialize_logging};
    pub use super::termination::{TerminationHandle, TerminationRequest};
}
