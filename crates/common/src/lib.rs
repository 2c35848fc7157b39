// Copyright (C) 2026 Palisade Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Shared utilities for Palisade gateway components
//!
//! Currently this crate carries the logging bootstrap used by the gateway
//! binary and by tests. It is a separate crate so that sidecar binaries
//! (admin tooling, migration helpers) share the same logging setup.

pub mod logging;

pub use logging::*;
