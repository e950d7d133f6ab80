// Copyright (c) The isolate-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Process-level test isolation for a host test runner.
//!
//! Tests marked as isolated execute in freshly spawned worker processes
//! rather than the main test process, so global state, singleton caches and
//! native-library crashes cannot leak between test cases.
//!
//! The flow: [`plan::IsolationPlan`] batches marked tests into groups,
//! [`runner::GroupRunner`] launches one worker per group and enforces its
//! wall-clock timeout, the worker streams per-phase [`records`] back over a
//! side-channel file, and [`reconcile`] plus [`replay`] turn whatever the
//! worker left behind (complete results, partial results, or nothing at
//! all) into reports the host's pipeline consumes as if the tests had run
//! natively.

pub mod crash;
pub mod errors;
pub mod host;
pub mod launcher;
pub mod plan;
pub mod reconcile;
pub mod records;
pub mod replay;
pub mod runner;
mod time;
pub mod worker;
