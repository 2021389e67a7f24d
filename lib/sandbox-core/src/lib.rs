//! Core of the sandbox bootstrapper.
//!
//! A sandbox is built in a fixed order: a [`Topology`][topology::Topology] is generated from a table of service rules,
//! its directories are [provisioned][provision::provision], a certificate chain is [issued][certs::generate_chain],
//! discovery agent configuration is [rendered][registry::write_registry], and finally every service is spawned and
//! [supervised][supervisor::supervise] until termination is requested.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod certs;

mod error;
pub use self::error::{BootstrapError, FailureKind};

pub mod provision;
pub mod registry;
pub mod supervisor;
pub mod topology;
