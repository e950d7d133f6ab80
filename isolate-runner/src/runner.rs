// Copyright (c) The isolate-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The orchestration loop.
//!
//! Groups run strictly sequentially: launch one worker, wait for it to exit
//! or time out, reconcile and replay its results, then move on. Sequencing
//! keeps worker output unambiguous and gives each side-channel file exactly
//! one writer and one reader. Native (non-isolated) tests are handed back
//! to the host once every group has completed.

use crate::{
    errors::{DisplayErrorChain, RunnerBuildError, WorkerStartError},
    host::{HostRunner, RunStats},
    launcher::{WorkerCommand, WorkerOutcome},
    plan::{IsolationPlan, IsolationSettings, TestGroup},
    reconcile::{reconcile_group, worker_start_failure},
    records::read_records,
    replay::ReplayContext,
};
use camino::Utf8PathBuf;
use camino_tempfile::Builder;
use std::io::Write as _;
use tokio::runtime::Runtime;
use tracing::{debug, warn};

/// The final outcome of one orchestrated run.
#[derive(Clone, Copy, Debug)]
pub struct RunResult {
    /// Aggregate phase counters for the run.
    pub stats: RunStats,
    /// True if the failure threshold stopped the run before the remaining
    /// groups and the native tests had a chance to execute.
    pub early_exited: bool,
}

impl RunResult {
    /// Returns true if the run as a whole succeeded.
    pub fn is_success(&self) -> bool {
        self.stats.is_success()
    }
}

/// Drives isolated groups through worker processes and replays their
/// results, then hands native tests back to the host.
pub struct GroupRunner<'a> {
    plan: &'a IsolationPlan,
    command: WorkerCommand,
    settings: &'a IsolationSettings,
}

impl<'a> GroupRunner<'a> {
    /// Creates a runner for `plan`, launching workers with `command`.
    pub fn new(
        plan: &'a IsolationPlan,
        command: WorkerCommand,
        settings: &'a IsolationSettings,
    ) -> Self {
        Self {
            plan,
            command,
            settings,
        }
    }

    /// Runs every planned group, then the native tests.
    ///
    /// One group is fully processed, worker exit through replay, before the
    /// next worker is launched. When the failure threshold is reached after
    /// a group completes, the remaining groups and the native tests are
    /// skipped; a group's tests are never partially abandoned once its
    /// worker is launched.
    pub fn execute<H: HostRunner>(&self, host: &mut H) -> Result<RunResult, RunnerBuildError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(RunnerBuildError::RuntimeCreate)?;

        let mut stats = RunStats::default();
        let mut early_exited = false;

        for group in self.plan.groups() {
            self.run_group(&runtime, group, host, &mut stats);
            if self.settings.max_fail.is_exceeded(stats.failed) {
                debug!(
                    "failure threshold {} reached after group `{}`; stopping",
                    self.settings.max_fail, group.key,
                );
                early_exited = true;
                break;
            }
        }

        if !early_exited {
            let native = self.plan.native();
            for (index, item) in native.iter().enumerate() {
                host.run_native(item, native.get(index + 1));
            }
        }

        Ok(RunResult {
            stats,
            early_exited,
        })
    }

    fn run_group<H: HostRunner>(
        &self,
        runtime: &Runtime,
        group: &TestGroup,
        host: &mut H,
        stats: &mut RunStats,
    ) {
        let records = match self.launch(runtime, group) {
            Ok((outcome, report_path)) => {
                forward_stdout(&outcome.stdout);
                let results = read_records(&report_path);
                reconcile_group(group, &outcome, results)
            }
            Err(error) => {
                warn!(
                    "worker for group `{}` failed to start: {}",
                    group.key,
                    DisplayErrorChain::new(&error),
                );
                worker_start_failure(group, &error)
            }
        };
        ReplayContext::new(host, stats, self.settings.capture_passed).replay_group(group, records);
    }

    /// Creates a fresh side-channel file and runs the group's worker to
    /// completion.
    fn launch(
        &self,
        runtime: &Runtime,
        group: &TestGroup,
    ) -> Result<(WorkerOutcome, Utf8PathBuf), WorkerStartError> {
        let report_path = side_channel_path(group)?;
        let outcome = runtime.block_on(self.command.run(group, &report_path))?;
        Ok((outcome, report_path))
    }
}

/// Creates the fresh, empty side-channel file for one group's worker.
fn side_channel_path(group: &TestGroup) -> Result<Utf8PathBuf, WorkerStartError> {
    let file = Builder::new()
        .prefix("isolate-worker-")
        .suffix(".jsonl")
        .tempfile()
        .map_err(|error| WorkerStartError::SideChannel {
            group: group.key.clone(),
            error,
        })?;
    // The worker appends to the path and the parent deletes it after
    // reading; keep() opts out of delete-on-drop.
    let (_, path) = file.keep().map_err(|error| WorkerStartError::SideChannel {
        group: group.key.clone(),
        error: error.error,
    })?;
    Ok(path)
}

/// Forwards a worker's captured stdout to the parent's stdout so
/// interleaved prints remain visible.
fn forward_stdout(stdout: &[u8]) {
    if stdout.is_empty() {
        return;
    }
    let mut out = std::io::stdout();
    // If our own stdout is gone there is nothing sensible left to do.
    let _ = out.write_all(stdout).and_then(|()| out.flush());
}
