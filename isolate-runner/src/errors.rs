// Copyright (c) The isolate-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by isolate-runner.

use crate::plan::GroupKey;
use camino::Utf8PathBuf;
use std::{error, fmt, io};
use thiserror::Error;

/// An error that occurred while preparing or spawning a worker process.
///
/// Worker start errors are absorbed at the group boundary by the
/// orchestrator and turned into synthesized failures for the group's tests;
/// they are never fatal to the run.
#[derive(Debug, Error)]
pub enum WorkerStartError {
    /// The side-channel file could not be created.
    #[error("failed to create side-channel file for group `{group}`")]
    SideChannel {
        /// The group whose worker was being prepared.
        group: GroupKey,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The worker process could not be spawned.
    #[error("failed to spawn worker process `{program}`")]
    Spawn {
        /// The program that was being spawned.
        program: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },
}

/// An error writing to the side-channel file from a worker process.
#[derive(Debug, Error)]
pub enum RecordWriteError {
    /// The side-channel file could not be opened for appending.
    #[error("failed to open side-channel file `{path}` for appending")]
    Open {
        /// The side-channel path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// A record could not be serialized.
    #[error("failed to serialize phase record for `{path}`")]
    Serialize {
        /// The side-channel path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: serde_json::Error,
    },

    /// A record line could not be written.
    #[error("failed to append phase record to `{path}`")]
    Write {
        /// The side-channel path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },
}

/// An error building the orchestrator.
#[derive(Debug, Error)]
pub enum RunnerBuildError {
    /// The Tokio runtime could not be created.
    #[error("error creating Tokio runtime")]
    RuntimeCreate(#[source] io::Error),
}

/// Error returned while parsing a [`MaxFail`](crate::plan::MaxFail) value
/// from a string.
#[derive(Clone, Debug, Error)]
#[error("error parsing max-fail value: {message}")]
pub struct MaxFailParseError {
    message: String,
}

impl MaxFailParseError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Error returned while parsing a [`Phase`](crate::records::Phase) from a
/// string.
#[derive(Clone, Debug, Error)]
#[error("unrecognized test phase: {input}\n(known values: setup, call, teardown)")]
pub struct PhaseParseError {
    input: String,
}

impl PhaseParseError {
    pub(crate) fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

/// Error returned while parsing a
/// [`PhaseOutcome`](crate::records::PhaseOutcome) from a string.
#[derive(Clone, Debug, Error)]
#[error("unrecognized phase outcome: {input}\n(known values: passed, failed, skipped)")]
pub struct PhaseOutcomeParseError {
    input: String,
}

impl PhaseOutcomeParseError {
    pub(crate) fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

/// Displays an error together with its source chain, separated by `: `.
pub struct DisplayErrorChain<E>(E);

impl<E: error::Error> DisplayErrorChain<E> {
    /// Creates a new display wrapper around `error`.
    pub fn new(error: E) -> Self {
        Self(error)
    }
}

impl<E: error::Error> fmt::Display for DisplayErrorChain<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = self.0.source();
        while let Some(error) = source {
            write!(f, ": {error}")?;
            source = error.source();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_error_chain_includes_sources() {
        let error = WorkerStartError::Spawn {
            program: "does/not/exist".into(),
            error: io::Error::new(io::ErrorKind::NotFound, "no such file"),
        };
        let rendered = DisplayErrorChain::new(&error).to_string();
        assert_eq!(
            rendered,
            "failed to spawn worker process `does/not/exist`: no such file"
        );
    }
}
