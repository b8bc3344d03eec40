// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of forsvar

//! Creates, resets and destroys the per-team challenge instances.

mod flags;
mod manager;
pub mod metrics;
pub mod runtime;
mod sweeper;
#[cfg(test)]
mod testing;

pub use flags::{CREDENTIAL_ENV, DEFAULT_FLAG_ENV, FLAG_ARGUMENT_PLACEHOLDER};
pub use manager::{InstanceError, InstanceManager, ProvisionReport, TeardownReport};
pub use sweeper::run_sweeper;
