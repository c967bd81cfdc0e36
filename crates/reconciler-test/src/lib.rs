//! Integration testing utilities for the reconciling installer
//!
//! This crate provides scripted processors, a tracking backend with
//! injectable failures, a harness that wires them to an [`Installer`] and
//! verifiers for the store and the outcome stream.
//!
//! [`Installer`]: reconciler_core::Installer

pub mod fixtures;
mod harness;
mod verification;

pub use fixtures::*;
pub use harness::*;
pub use verification::*;
