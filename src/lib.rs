//! meshprobe - verifies that a service mesh propagates authorization changes
//!
//! A single probe across an eventually-consistent control plane proves
//! nothing. meshprobe provisions a source and a destination workload, grants
//! access between them, waits until traffic is *repeatedly* allowed, revokes
//! the grant and waits until traffic is *repeatedly* refused with the
//! signature of a denial, not merely broken.
//!
//! # Modules
//!
//! - [`convergence`] - Repeated-success polling on an injectable [`clock`]
//! - [`probe`] - Single-shot HTTP/TCP requests issued from inside a workload
//! - [`classifier`] - Maps probe results to verdicts
//! - [`scenario`] - Provision, grant, verify, revoke, verify
//! - [`environment`] - Cluster collaborator and its Kubernetes implementation
//! - [`policy`] - Allow rules and their SMI rendering
//! - [`workload`] - Workload definitions and Kubernetes object builders
//! - [`registry`] - Named scenarios and the run-all-and-report runner
//! - [`config`] - Harness configuration
//! - [`telemetry`] - Logging setup
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod classifier;
pub mod clock;
pub mod config;
pub mod context;
pub mod convergence;
pub mod environment;
pub mod error;
pub mod policy;
pub mod probe;
pub mod registry;
pub mod scenario;
pub mod telemetry;
pub mod workload;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
