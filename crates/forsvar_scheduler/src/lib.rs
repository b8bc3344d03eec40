// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of forsvar

//! Judges attack/defense competitions in timed rounds.
//!
//! Every running competition has its own scheduler loop. Once a round is due, every team that runs
//! an instance of a public challenge is attacked with the challenge's attack script, and the
//! optional health check verifies that the service still works. A team defends the round if the
//! attack failed while the service stayed functional.

pub mod judge;
pub mod metrics;
mod registry;
mod scheduler;

pub use registry::{SchedulerError, SchedulerRegistry};
pub use scheduler::SchedulerStatus;
