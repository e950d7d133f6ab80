// Copyright (c) The isolate-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Worker-side support.
//!
//! A worker process is the same test entry point re-invoked by the
//! orchestrator. It recognizes itself through the environment the launcher
//! sets (a re-entrancy guard and the side-channel path) and, instead of
//! planning isolation again, runs its assigned tests natively while
//! recording every completed phase. Without the guard a worker would treat
//! its own tests as isolation candidates and fork without bound.

use crate::{
    errors::RecordWriteError,
    host::HostReport,
    records::{PhaseRecord, RecordWriter},
};
use camino::{Utf8Path, Utf8PathBuf};

/// Environment variable marking a process as a worker.
pub const WORKER_ENV: &str = "ISOLATE_RUNNER_WORKER";

/// Environment variable naming the side-channel file a worker appends its
/// records to.
pub const REPORT_PATH_ENV: &str = "ISOLATE_RUNNER_REPORT_PATH";

/// The worker-related environment of the current process.
///
/// Read once at startup and never mutated afterward.
#[derive(Clone, Debug, Default)]
pub struct WorkerEnv {
    is_worker: bool,
    report_path: Option<Utf8PathBuf>,
}

impl WorkerEnv {
    /// Captures the worker environment of the current process.
    pub fn capture() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Captures a worker environment through `lookup` instead of the real
    /// process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            is_worker: lookup(WORKER_ENV).as_deref() == Some("1"),
            report_path: lookup(REPORT_PATH_ENV).map(Utf8PathBuf::from),
        }
    }

    /// True if this process is a worker and must not plan isolation.
    pub fn is_worker(&self) -> bool {
        self.is_worker
    }

    /// The side-channel path this process should record phases to.
    pub fn report_path(&self) -> Option<&Utf8Path> {
        self.report_path.as_deref()
    }
}

/// Records each completed phase to the side-channel, in the order the host
/// reports them.
#[derive(Debug)]
pub struct WorkerRecorder {
    writer: RecordWriter,
}

impl WorkerRecorder {
    /// Creates a recorder appending to the path named by `env`, or `None`
    /// when this process is not recording.
    pub fn from_env(env: &WorkerEnv) -> Option<Result<Self, RecordWriteError>> {
        let path = env.report_path()?;
        Some(Self::open(path.to_owned()))
    }

    /// Creates a recorder appending to `path`.
    pub fn open(path: impl Into<Utf8PathBuf>) -> Result<Self, RecordWriteError> {
        Ok(Self {
            writer: RecordWriter::open(path)?,
        })
    }

    /// Records one phase report.
    ///
    /// The record is written and flushed immediately, so a crash right
    /// after this call still leaves the phase on disk.
    pub fn record(&mut self, report: &HostReport) -> Result<(), RecordWriteError> {
        self.writer.append(&record_from_report(report))
    }
}

/// Converts the host's native report into the wire record.
fn record_from_report(report: &HostReport) -> PhaseRecord {
    PhaseRecord {
        nodeid: report.nodeid.clone(),
        when: report.when,
        outcome: report.outcome,
        longrepr: report.detail.to_text(),
        duration: report.duration,
        stdout: report.stdout.clone(),
        stderr: report.stderr.clone(),
        keywords: report.keywords.clone(),
        sections: report.sections.clone(),
        user_properties: report.user_properties.clone(),
        wasxfail: report.wasxfail,
    }
}
