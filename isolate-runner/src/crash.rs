// Copyright (c) The isolate-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Classification of worker exit statuses.
//!
//! Signal-style termination and explicit-exit-code termination are both
//! observed across deployment platforms, and both must be diagnosable from
//! message text alone. Every message composed here therefore names either
//! `signal N` or `exit code N`.

use std::{fmt, process::ExitStatus};

/// How a worker process exited.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkerExit {
    /// The process exited on its own with the given code.
    Code(i32),
    /// The process was terminated by a signal (Unix).
    Signal(i32),
    /// The exit status could not be determined.
    Unknown,
}

impl WorkerExit {
    /// Extracts the exit classification from a process exit status.
    pub fn extract(status: ExitStatus) -> Self {
        cfg_if::cfg_if! {
            if #[cfg(unix)] {
                use std::os::unix::process::ExitStatusExt;
                if let Some(signal) = status.signal() {
                    return WorkerExit::Signal(signal);
                }
            }
        }
        match status.code() {
            Some(code) => WorkerExit::Code(code),
            None => WorkerExit::Unknown,
        }
    }

    /// Returns true if the worker was terminated abnormally, signal-style.
    ///
    /// A plain nonzero exit code is not an abort: it is indistinguishable
    /// from a deliberate failing exit.
    pub fn is_abort(&self) -> bool {
        matches!(self, WorkerExit::Signal(_))
    }

    /// Returns true if the worker exited successfully.
    pub fn success(&self) -> bool {
        matches!(self, WorkerExit::Code(0))
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerExit::Code(code) => write!(f, "exit code {code}"),
            WorkerExit::Signal(signal) => match signal_str(*signal) {
                Some(name) => write!(f, "signal {signal} (SIG{name})"),
                None => write!(f, "signal {signal}"),
            },
            WorkerExit::Unknown => write!(f, "an unknown exit status"),
        }
    }
}

/// Returns the conventional name for a Unix signal number, without the
/// `SIG` prefix.
pub fn signal_str(signal: i32) -> Option<&'static str> {
    // These signal numbers are the same on at least Linux, macOS, FreeBSD
    // and illumos.
    match signal {
        1 => Some("HUP"),
        2 => Some("INT"),
        3 => Some("QUIT"),
        4 => Some("ILL"),
        5 => Some("TRAP"),
        6 => Some("ABRT"),
        8 => Some("FPE"),
        9 => Some("KILL"),
        11 => Some("SEGV"),
        13 => Some("PIPE"),
        14 => Some("ALRM"),
        15 => Some("TERM"),
        _ => None,
    }
}

/// Describes how the worker exited: "exited with exit code 1", "aborted
/// with signal 11 (SIGSEGV)".
pub fn display_exited_with(exit: WorkerExit) -> String {
    match exit {
        WorkerExit::Code(code) => format!("exited with exit code {code}"),
        WorkerExit::Signal(_) => format!("aborted with {exit}"),
        WorkerExit::Unknown => "exited with an unknown error".to_owned(),
    }
}

/// Builds a complete crash message for the given exit status.
///
/// `context` describes when the crash occurred, e.g. "during test
/// execution". Captured stderr, when present, is appended as a trailing
/// block.
pub fn crash_message(exit: WorkerExit, context: &str, stderr: &[u8]) -> String {
    with_stderr(format!("worker crashed with {exit} {context}."), stderr)
}

/// Appends a worker's captured stderr to a message as a trailing block,
/// when there is any.
pub fn with_stderr(message: String, stderr: &[u8]) -> String {
    let stderr = String::from_utf8_lossy(stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        return message;
    }
    let mut message = message;
    message.push_str("\n\nworker stderr:\n");
    message.push_str(stderr);
    message
}
