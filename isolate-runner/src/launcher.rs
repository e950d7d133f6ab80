// Copyright (c) The isolate-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Launching worker processes.
//!
//! Each group gets a freshly spawned worker running the same test entry
//! point in worker mode. The launcher owns command construction, the
//! re-entrancy and side-channel environment, output capture and the
//! wall-clock timeout. A timeout is not an error here: it is recorded on
//! the [`WorkerOutcome`] and consumed by reconciliation.

use crate::{
    crash::WorkerExit,
    errors::WorkerStartError,
    plan::TestGroup,
    time,
    worker::{REPORT_PATH_ENV, WORKER_ENV},
};
use bytes::{Bytes, BytesMut};
use camino::{Utf8Path, Utf8PathBuf};
use itertools::Itertools;
use std::{process::Stdio, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, ChildStderr, ChildStdout},
};
use tracing::{debug, warn};

/// Flags forwarded to workers verbatim (no value follows).
const FORWARD_FLAGS: &[&str] = &[
    "-v",
    "--verbose",
    "-q",
    "--quiet",
    "-s",
    "-l",
    "--showlocals",
    "--strict-markers",
    "--strict-config",
    "-x",
    "--exitfirst",
];

/// Options forwarded to workers together with their value.
const FORWARD_OPTIONS_WITH_VALUE: &[&str] = &["--tb", "-r", "--capture"];

/// Builds the allow-listed argument subset forwarded to every worker.
///
/// Positional arguments and unrecognized options are dropped. A worker must
/// run exactly the identifiers it is handed; forwarding path arguments
/// would make it re-collect tests on its own.
pub fn forwarded_args(invocation_args: &[String]) -> Vec<String> {
    let mut forwarded = Vec::new();
    let mut args = invocation_args.iter();
    while let Some(arg) = args.next() {
        if FORWARD_FLAGS.contains(&arg.as_str()) {
            forwarded.push(arg.clone());
        } else if FORWARD_OPTIONS_WITH_VALUE.contains(&arg.as_str()) {
            forwarded.push(arg.clone());
            if let Some(value) = args.next() {
                forwarded.push(value.clone());
            }
        } else if FORWARD_OPTIONS_WITH_VALUE
            .iter()
            .any(|opt| arg.strip_prefix(opt).is_some_and(|rest| rest.starts_with('=')))
        {
            forwarded.push(arg.clone());
        }
    }
    forwarded
}

/// The summary of one worker invocation, consumed by reconciliation.
#[derive(Clone, Debug)]
pub struct WorkerOutcome {
    /// How the process exited.
    pub exit: WorkerExit,
    /// Captured standard output, carried so the orchestrator can forward it
    /// to its own stdout.
    pub stdout: Bytes,
    /// Captured standard error, kept for diagnostics on failure.
    pub stderr: Bytes,
    /// Whether the group timeout expired before the worker exited.
    pub timed_out: bool,
    /// Wall-clock execution time.
    pub elapsed: Duration,
}

/// The recipe for launching one group's worker process.
#[derive(Clone, Debug)]
pub struct WorkerCommand {
    program: Utf8PathBuf,
    forwarded_args: Vec<String>,
    root_dir: Utf8PathBuf,
}

impl WorkerCommand {
    /// Creates a launcher for `program`, forwarding the allow-listed subset
    /// of `invocation_args` and pinning workers to `root_dir`.
    pub fn new(
        program: impl Into<Utf8PathBuf>,
        invocation_args: &[String],
        root_dir: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            forwarded_args: forwarded_args(invocation_args),
            root_dir: root_dir.into(),
        }
    }

    /// The program workers are spawned from.
    pub fn program(&self) -> &Utf8Path {
        &self.program
    }

    /// The arguments forwarded to every worker.
    pub fn forwarded_args(&self) -> &[String] {
        &self.forwarded_args
    }

    /// Builds the command line for one group's worker.
    pub(crate) fn command(
        &self,
        group: &TestGroup,
        report_path: &Utf8Path,
    ) -> std::process::Command {
        let mut cmd = std::process::Command::new(&self.program);
        cmd.args(&self.forwarded_args);
        // Relative identifiers must resolve identically no matter where the
        // parent was invoked from.
        cmd.arg("--rootdir").arg(self.root_dir.as_str());
        cmd.args(group.items.iter().map(|item| item.id.as_str()));
        cmd.current_dir(&self.root_dir);
        cmd.env(WORKER_ENV, "1");
        cmd.env(REPORT_PATH_ENV, report_path.as_str());
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // One process group per worker, so a timeout can take out the
            // worker and all its descendants.
            cmd.process_group(0);
        }
        cmd
    }

    /// Spawns the worker for `group` and waits for it to exit or for the
    /// group timeout to expire, collecting stdout and stderr along the way.
    ///
    /// A timed-out worker is killed together with its whole process group;
    /// the output gathered up to that point stays on the outcome. The
    /// worker may be killed mid-instruction with no teardown, which is why
    /// reconciliation does not trust partial results from a timed-out run.
    pub async fn run(
        &self,
        group: &TestGroup,
        report_path: &Utf8Path,
    ) -> Result<WorkerOutcome, WorkerStartError> {
        let mut cmd: tokio::process::Command = self.command(group, report_path).into();
        let stopwatch = time::stopwatch();

        let mut child = cmd.spawn().map_err(|error| WorkerStartError::Spawn {
            program: self.program.clone(),
            error,
        })?;
        debug!(
            "worker for group `{}` started at {} (timeout: {:?}): {} {}",
            group.key,
            stopwatch.start_time().format("%H:%M:%S%.3f"),
            group.timeout,
            self.program,
            group.items.iter().map(|item| item.id.as_str()).join(" "),
        );

        let mut acc = ChildAccumulator::new(child.stdout.take(), child.stderr.take());
        let mut sleep = std::pin::pin!(tokio::time::sleep(group.timeout));
        let mut timed_out = false;

        let wait_result = loop {
            tokio::select! {
                () = acc.fill_buf(), if !acc.is_done() => {}
                res = child.wait() => break res,
                _ = &mut sleep, if !timed_out => {
                    timed_out = true;
                    // Cancellation is not cooperative: no grace period, no
                    // chance for the worker to catch anything.
                    kill_worker(&mut child, &group.key);
                }
            }
        };

        // The child has exited; drain whatever is still buffered in the
        // pipes.
        while !acc.is_done() {
            acc.fill_buf().await;
        }

        let exit = match wait_result {
            Ok(status) => WorkerExit::extract(status),
            Err(error) => {
                warn!("failed to wait on worker for group `{}`: {error}", group.key);
                WorkerExit::Unknown
            }
        };
        debug!("worker for group `{}` finished: {exit:?}", group.key);

        Ok(WorkerOutcome {
            exit,
            stdout: acc.stdout_acc.freeze(),
            stderr: acc.stderr_acc.freeze(),
            timed_out,
            elapsed: stopwatch.elapsed(),
        })
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn kill_worker(child: &mut Child, key: &crate::plan::GroupKey) {
            let Some(pid) = child.id() else {
                // Already exited; the wait arm will pick up the status.
                return;
            };
            debug!("killing timed-out worker process group for `{key}` (pid {pid})");
            // Negative pid: the signal goes to the whole process group.
            unsafe { libc::kill(-(pid as i32), libc::SIGKILL) };
        }
    } else {
        fn kill_worker(child: &mut Child, key: &crate::plan::GroupKey) {
            debug!("killing timed-out worker for `{key}`");
            if let Err(error) = child.start_kill() {
                warn!("failed to kill timed-out worker for `{key}`: {error}");
            }
        }
    }
}

/// The size of each pipe reader's buffer, and the growth increment of the
/// accumulators.
const CHUNK_SIZE: usize = 4 * 1024;

/// A buffered reader over one child pipe that remembers reaching EOF.
struct PipeReader<R> {
    reader: BufReader<R>,
    done: bool,
}

impl<R: AsyncRead + Unpin> PipeReader<R> {
    fn new(reader: R) -> Self {
        Self {
            reader: BufReader::with_capacity(CHUNK_SIZE, reader),
            done: false,
        }
    }

    async fn fill_buf(&mut self, acc: &mut BytesMut) {
        if self.done {
            return;
        }
        match self.reader.fill_buf().await {
            Ok(buf) => {
                if buf.is_empty() {
                    self.done = true;
                }
                acc.extend_from_slice(buf);
                let len = buf.len();
                self.reader.consume(len);
            }
            Err(error) => {
                debug!("error reading from worker pipe: {error}");
                self.done = true;
            }
        }
    }
}

/// Collects a worker's stdout and stderr while the parent waits on it.
struct ChildAccumulator {
    stdout: Option<PipeReader<ChildStdout>>,
    stderr: Option<PipeReader<ChildStderr>>,
    stdout_acc: BytesMut,
    stderr_acc: BytesMut,
}

impl ChildAccumulator {
    fn new(stdout: Option<ChildStdout>, stderr: Option<ChildStderr>) -> Self {
        Self {
            stdout: stdout.map(PipeReader::new),
            stderr: stderr.map(PipeReader::new),
            stdout_acc: BytesMut::with_capacity(CHUNK_SIZE),
            stderr_acc: BytesMut::with_capacity(CHUNK_SIZE),
        }
    }

    fn is_done(&self) -> bool {
        self.stdout.as_ref().is_none_or(|reader| reader.done)
            && self.stderr.as_ref().is_none_or(|reader| reader.done)
    }

    /// Waits until either pipe makes progress. Cancel-safe, so it can sit
    /// in a `select!` next to the child wait and the timeout.
    async fn fill_buf(&mut self) {
        let stdout_done = self.stdout.as_ref().is_none_or(|reader| reader.done);
        let stderr_done = self.stderr.as_ref().is_none_or(|reader| reader.done);
        tokio::select! {
            () = fill_buf_opt(self.stdout.as_mut(), &mut self.stdout_acc), if !stdout_done => {}
            () = fill_buf_opt(self.stderr.as_mut(), &mut self.stderr_acc), if !stderr_done => {}
            else => {}
        }
    }
}

async fn fill_buf_opt<R: AsyncRead + Unpin>(reader: Option<&mut PipeReader<R>>, acc: &mut BytesMut) {
    if let Some(reader) = reader {
        reader.fill_buf(acc).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        host::{SourceLocation, TestItem},
        plan::GroupKey,
    };
    use test_case::test_case;

    fn to_args(args: &[&str]) -> Vec<String> {
        args.iter().map(|arg| (*arg).to_owned()).collect()
    }

    #[test_case(&["-v", "-s"], &["-v", "-s"]; "plain flags pass through")]
    #[test_case(&["tests/widget.rs", "-v"], &["-v"]; "positional arguments are dropped")]
    #[test_case(&["--tb", "short"], &["--tb", "short"]; "option values follow their option")]
    #[test_case(&["--tb=short"], &["--tb=short"]; "equals spelling passes through whole")]
    #[test_case(&["--unknown-flag", "-q"], &["-q"]; "unknown options are dropped")]
    #[test_case(&["--capture"], &["--capture"]; "trailing option without value survives")]
    #[test_case(&["-r", "fE", "--isolated-timeout", "5"], &["-r", "fE"]; "isolation options are not forwarded")]
    fn forwarded_args_allow_list(input: &[&str], expected: &[&str]) {
        assert_eq!(forwarded_args(&to_args(input)), to_args(expected));
    }

    #[test]
    fn command_pins_root_dir_and_targets() {
        let command = WorkerCommand::new(
            "/usr/bin/host-runner",
            &to_args(&["-v", "tests/widget.rs", "--tb", "short"]),
            "/work/project",
        );
        let group = TestGroup {
            key: GroupKey::new("g"),
            items: vec![
                TestItem::new("m.rs::one", SourceLocation::default()),
                TestItem::new("m.rs::two", SourceLocation::default()),
            ],
            timeout: Duration::from_secs(5),
        };

        let cmd = command.command(&group, Utf8Path::new("/tmp/records.jsonl"));
        let args: Vec<_> = cmd
            .get_args()
            .map(|arg| arg.to_str().unwrap().to_owned())
            .collect();
        assert_eq!(
            args,
            to_args(&[
                "-v",
                "--tb",
                "short",
                "--rootdir",
                "/work/project",
                "m.rs::one",
                "m.rs::two",
            ]),
        );

        let envs: Vec<_> = cmd
            .get_envs()
            .map(|(key, value)| {
                (
                    key.to_str().unwrap().to_owned(),
                    value.and_then(|value| value.to_str()).map(str::to_owned),
                )
            })
            .collect();
        assert!(envs.contains(&(WORKER_ENV.to_owned(), Some("1".to_owned()))));
        assert!(envs.contains(&(
            REPORT_PATH_ENV.to_owned(),
            Some("/tmp/records.jsonl".to_owned())
        )));
    }
}
