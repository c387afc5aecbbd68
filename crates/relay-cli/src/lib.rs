// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Shared library half of the `relay` binary — split out so the intercept
//! proxy can be driven directly from integration tests without going
//! through a spawned process.

pub mod intercept_proxy;
