// Copyright (c) The isolate-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The wire format for per-phase results.
//!
//! A worker appends one self-contained JSON object per completed test phase
//! to the side-channel file named by its environment; the parent parses the
//! file back after the worker has fully exited. Records are written and
//! flushed as each phase completes, so a killed worker leaves every
//! finished phase on disk for the parent to reconcile.

use crate::{errors::RecordWriteError, host::TestId};
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    fs::{self, File, OpenOptions},
    io::Write as _,
    str::FromStr,
};
use tracing::{debug, warn};

/// A single test-execution phase.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Fixture setup before the test body.
    Setup,
    /// The test body itself.
    Call,
    /// Fixture teardown after the test body.
    Teardown,
}

impl Phase {
    /// All phases, in replay order.
    pub const ALL: [Phase; 3] = [Phase::Setup, Phase::Call, Phase::Teardown];

    fn as_str(self) -> &'static str {
        match self {
            Phase::Setup => "setup",
            Phase::Call => "call",
            Phase::Teardown => "teardown",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Phase {
    type Err = crate::errors::PhaseParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "setup" => Ok(Phase::Setup),
            "call" => Ok(Phase::Call),
            "teardown" => Ok(Phase::Teardown),
            other => Err(crate::errors::PhaseParseError::new(other)),
        }
    }
}

/// The outcome of one test phase.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseOutcome {
    /// The phase completed successfully.
    Passed,
    /// The phase raised or asserted.
    Failed,
    /// The phase was skipped.
    Skipped,
}

impl PhaseOutcome {
    fn as_str(self) -> &'static str {
        match self {
            PhaseOutcome::Passed => "passed",
            PhaseOutcome::Failed => "failed",
            PhaseOutcome::Skipped => "skipped",
        }
    }
}

impl fmt::Display for PhaseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PhaseOutcome {
    type Err = crate::errors::PhaseOutcomeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "passed" => Ok(PhaseOutcome::Passed),
            "failed" => Ok(PhaseOutcome::Failed),
            "skipped" => Ok(PhaseOutcome::Skipped),
            other => Err(crate::errors::PhaseOutcomeParseError::new(other)),
        }
    }
}

/// One observation of a test phase, as written by a worker.
///
/// Produced exactly once per (test, phase) and immutable once written; the
/// parent only reads and replays it. Everything past the first three fields
/// defaults when absent, so records written by older workers still decode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    /// The test the phase belongs to.
    pub nodeid: TestId,
    /// Which phase was observed.
    pub when: Phase,
    /// The phase outcome.
    pub outcome: PhaseOutcome,
    /// Free-text failure detail; empty when there is nothing to report.
    #[serde(default)]
    pub longrepr: String,
    /// Wall-clock duration of the phase in seconds.
    #[serde(default)]
    pub duration: f64,
    /// Captured standard output.
    #[serde(default)]
    pub stdout: String,
    /// Captured standard error.
    #[serde(default)]
    pub stderr: String,
    /// Keyword and marker names attached to the test.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Additional captured artifacts as (label, text) pairs.
    #[serde(default)]
    pub sections: Vec<(String, String)>,
    /// Properties attached by the test through the host's API.
    #[serde(default)]
    pub user_properties: Vec<(String, serde_json::Value)>,
    /// Whether the outcome represents an expected failure.
    #[serde(default)]
    pub wasxfail: bool,
}

impl PhaseRecord {
    /// Creates a record standing in for a phase the worker never reported.
    pub(crate) fn synthesized(
        nodeid: TestId,
        when: Phase,
        outcome: PhaseOutcome,
        longrepr: impl Into<String>,
    ) -> Self {
        Self {
            nodeid,
            when,
            outcome,
            longrepr: longrepr.into(),
            duration: 0.0,
            stdout: String::new(),
            stderr: String::new(),
            keywords: Vec::new(),
            sections: Vec::new(),
            user_properties: Vec::new(),
            wasxfail: false,
        }
    }
}

/// Per-phase records for one group's worker run, keyed by test then phase.
///
/// A test absent from the set never started. A test with a passed setup but
/// no call phase most likely took the worker down mid-run; reconciliation
/// turns both observations into definitive outcomes.
#[derive(Clone, Debug, Default)]
pub struct GroupResultSet {
    tests: IndexMap<TestId, IndexMap<Phase, PhaseRecord>>,
}

impl GroupResultSet {
    /// Inserts one record, replacing any earlier record for the same phase.
    pub fn insert(&mut self, record: PhaseRecord) {
        self.tests
            .entry(record.nodeid.clone())
            .or_default()
            .insert(record.when, record);
    }

    /// Returns true if no test reported any phase.
    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// Number of tests with at least one recorded phase.
    pub fn len(&self) -> usize {
        self.tests.len()
    }

    /// Returns true if `id` has at least one recorded phase.
    pub fn contains(&self, id: &TestId) -> bool {
        self.tests.contains_key(id)
    }

    /// The recorded phases for `id`, if any.
    pub fn phases(&self, id: &TestId) -> Option<&IndexMap<Phase, PhaseRecord>> {
        self.tests.get(id)
    }

    /// Removes and returns the recorded phases for `id`.
    pub fn remove(&mut self, id: &TestId) -> Option<IndexMap<Phase, PhaseRecord>> {
        self.tests.shift_remove(id)
    }
}

/// Parses the side-channel file at `path` into a [`GroupResultSet`].
///
/// Blank and malformed lines are skipped, never fatal. A missing or
/// unreadable file yields an empty set; the caller decides what that means.
/// The file is removed after a successful read so a recycled temp path can
/// never leak stale records into a later run.
pub fn read_records(path: &Utf8Path) -> GroupResultSet {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(error) => {
            debug!("no side-channel records at {path}: {error}");
            return GroupResultSet::default();
        }
    };

    let mut results = GroupResultSet::default();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<PhaseRecord>(line) {
            Ok(record) => results.insert(record),
            Err(error) => warn!("skipping malformed record line in {path}: {error}"),
        }
    }

    if let Err(error) = fs::remove_file(path) {
        debug!("failed to remove side-channel file {path}: {error}");
    }
    results
}

/// Appends records to the side-channel file, one JSON line at a time.
///
/// Every line is flushed as it is written: the parent must see each
/// completed phase even if this process is killed right afterward.
#[derive(Debug)]
pub struct RecordWriter {
    file: File,
    path: Utf8PathBuf,
}

impl RecordWriter {
    /// Opens `path` for appending, creating it if needed.
    pub fn open(path: impl Into<Utf8PathBuf>) -> Result<Self, RecordWriteError> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|error| RecordWriteError::Open {
                path: path.clone(),
                error,
            })?;
        Ok(Self { file, path })
    }

    /// Appends one record.
    pub fn append(&mut self, record: &PhaseRecord) -> Result<(), RecordWriteError> {
        let mut line =
            serde_json::to_string(record).map_err(|error| RecordWriteError::Serialize {
                path: self.path.clone(),
                error,
            })?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .and_then(|()| self.file.flush())
            .map_err(|error| RecordWriteError::Write {
                path: self.path.clone(),
                error,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use pretty_assertions::assert_eq;

    fn full_record() -> PhaseRecord {
        PhaseRecord {
            nodeid: TestId::new("pkg/widget_test.rs::flip"),
            when: Phase::Call,
            outcome: PhaseOutcome::Failed,
            longrepr: "assertion failed: flipped".to_owned(),
            duration: 0.25,
            stdout: "flipping\n".to_owned(),
            stderr: String::new(),
            keywords: vec!["flip".to_owned(), "isolated".to_owned()],
            sections: vec![("Captured log call".to_owned(), "WARN flip\n".to_owned())],
            user_properties: vec![("attempts".to_owned(), serde_json::json!(2))],
            wasxfail: false,
        }
    }

    #[test]
    fn round_trip_is_lossless() {
        let record = full_record();
        let line = serde_json::to_string(&record).expect("record serializes");
        let decoded: PhaseRecord = serde_json::from_str(&line).expect("record deserializes");
        assert_eq!(decoded, record);
    }

    #[test]
    fn round_trip_preserves_empty_fields() {
        let record = PhaseRecord::synthesized(
            TestId::new("pkg/widget_test.rs::flip"),
            Phase::Teardown,
            PhaseOutcome::Passed,
            "",
        );
        let line = serde_json::to_string(&record).expect("record serializes");
        let decoded: PhaseRecord = serde_json::from_str(&line).expect("record deserializes");
        assert_eq!(decoded, record);
    }

    #[test]
    fn missing_fields_default() {
        let decoded: PhaseRecord = serde_json::from_str(
            r#"{"nodeid":"pkg/widget_test.rs::flip","when":"setup","outcome":"passed"}"#,
        )
        .expect("minimal record decodes");
        assert_eq!(decoded.longrepr, "");
        assert_eq!(decoded.duration, 0.0);
        assert!(decoded.sections.is_empty());
        assert!(!decoded.wasxfail);
    }

    #[test]
    fn phase_and_outcome_round_trip_as_strings() {
        for phase in Phase::ALL {
            assert_eq!(phase.to_string().parse::<Phase>().unwrap(), phase);
        }
        for outcome in [
            PhaseOutcome::Passed,
            PhaseOutcome::Failed,
            PhaseOutcome::Skipped,
        ] {
            assert_eq!(
                outcome.to_string().parse::<PhaseOutcome>().unwrap(),
                outcome
            );
        }
        assert!("sideways".parse::<Phase>().is_err());
        assert!("sideways".parse::<PhaseOutcome>().is_err());
    }

    #[test]
    fn read_records_skips_malformed_lines_and_deletes_the_file() {
        let dir = Utf8TempDir::new().expect("temp dir is creatable");
        let path = dir.path().join("records.jsonl");

        let mut writer = RecordWriter::open(path.clone()).expect("writer opens");
        writer.append(&full_record()).expect("record appends");

        // Interleave garbage the way a half-written line from a killed
        // worker would appear.
        let mut contents = fs::read_to_string(&path).unwrap();
        contents.push_str("\n{\"nodeid\": \"trunc\n\nnot json at all\n");
        fs::write(&path, contents).unwrap();

        let results = read_records(&path);
        assert_eq!(results.len(), 1);
        let phases = results
            .phases(&TestId::new("pkg/widget_test.rs::flip"))
            .expect("recorded test is present");
        assert_eq!(phases.get(&Phase::Call), Some(&full_record()));

        assert!(!path.as_std_path().exists(), "file is deleted after read");
    }

    #[test]
    fn read_records_missing_file_is_empty() {
        let dir = Utf8TempDir::new().expect("temp dir is creatable");
        let results = read_records(&dir.path().join("never-written.jsonl"));
        assert!(results.is_empty());
    }

    #[test]
    fn result_set_insert_and_remove_preserve_order() {
        let mut results = GroupResultSet::default();
        for id in ["m.rs::b", "m.rs::a"] {
            for when in Phase::ALL {
                results.insert(PhaseRecord::synthesized(
                    TestId::new(id),
                    when,
                    PhaseOutcome::Passed,
                    "",
                ));
            }
        }
        assert_eq!(results.len(), 2);
        assert!(results.contains(&TestId::new("m.rs::b")));

        let phases = results.remove(&TestId::new("m.rs::b")).unwrap();
        assert_eq!(
            phases.keys().copied().collect::<Vec<_>>(),
            vec![Phase::Setup, Phase::Call, Phase::Teardown],
        );
        assert_eq!(results.len(), 1);
        assert!(results.remove(&TestId::new("m.rs::b")).is_none());
    }
}
