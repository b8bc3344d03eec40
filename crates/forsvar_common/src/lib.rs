// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of forsvar

pub mod config;
pub mod models;
pub mod runtime;
pub mod store;
pub mod utils;
