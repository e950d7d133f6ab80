// Copyright (c) The isolate-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Types at the boundary with the host test runner.
//!
//! The host runner owns collection, fixtures and markers; this crate only
//! consumes that machinery through the narrow surface in this module.
//! Collected [`TestItem`]s flow in, and native-shaped [`HostReport`]s flow
//! back out through the [`HostRunner`] trait.

use crate::records::{Phase, PhaseOutcome};
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier for a single collected test, assigned by the host runner.
///
/// Identifiers are opaque to this crate except for their `::`-separated
/// scope structure, which default grouping relies on. They are the join key
/// between the parent's item list and the records a worker reports back.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestId(String);

impl TestId {
    /// Creates a new test identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the module portion of the identifier: everything before the
    /// first `::`, or the whole identifier if there is none.
    pub fn module_id(&self) -> &str {
        match self.0.split_once("::") {
            Some((module, _)) => module,
            None => &self.0,
        }
    }

    /// Returns the `module::class` prefix of the identifier.
    ///
    /// Only identifiers with at least three `::`-separated segments have an
    /// enclosing class-like scope; for the rest this returns `None`.
    pub fn class_id(&self) -> Option<&str> {
        let mut separators = self.0.match_indices("::").map(|(index, _)| index);
        separators.next()?;
        let second = separators.next()?;
        Some(&self.0[..second])
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TestId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TestId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

/// Source location of a test item.
///
/// Used to shape skip reports the way the host renders them.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SourceLocation {
    /// Path to the defining file, relative to the root directory.
    pub file: Utf8PathBuf,
    /// 1-based line number of the definition, if known.
    pub line: Option<u32>,
}

/// Arguments carried by one application of the isolation marker.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MarkerArgs {
    /// Explicit group name, passed positionally or as `group=`.
    pub group: Option<String>,
    /// Per-group timeout override in seconds.
    pub timeout: Option<u64>,
}

/// The scope level at which an isolation marker was applied.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MarkerLevel {
    /// Applied directly to the test function.
    Own,
    /// Inherited from the enclosing class.
    Class,
    /// Inherited from the enclosing module.
    Module,
}

/// Isolation markers visible on a test item, one slot per scope level.
///
/// The host adapter fills this in from its own marker machinery. The core
/// never walks scopes itself; [`MarkerSet::closest`] is the whole lookup.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MarkerSet {
    /// Marker applied directly to the test function.
    pub own: Option<MarkerArgs>,
    /// Marker applied to the enclosing class.
    pub class: Option<MarkerArgs>,
    /// Marker applied to the enclosing module.
    pub module: Option<MarkerArgs>,
    /// Whether the item is marked as an expected failure.
    pub xfail: bool,
}

impl MarkerSet {
    /// Returns the closest isolation marker: own, then class, then module.
    pub fn closest(&self) -> Option<(MarkerLevel, &MarkerArgs)> {
        if let Some(args) = &self.own {
            Some((MarkerLevel::Own, args))
        } else if let Some(args) = &self.class {
            Some((MarkerLevel::Class, args))
        } else if let Some(args) = &self.module {
            Some((MarkerLevel::Module, args))
        } else {
            None
        }
    }
}

/// One collected test, as handed over by the host runner.
#[derive(Clone, Debug)]
pub struct TestItem {
    /// The host-assigned identifier.
    pub id: TestId,
    /// Where the test is defined.
    pub location: SourceLocation,
    /// Isolation and expected-failure markers visible on the item.
    pub markers: MarkerSet,
}

impl TestItem {
    /// Creates an unmarked item.
    pub fn new(id: impl Into<TestId>, location: SourceLocation) -> Self {
        Self {
            id: id.into(),
            location,
            markers: MarkerSet::default(),
        }
    }
}

/// Failure or skip detail attached to a report.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReportDetail {
    /// No detail. Passing phases, and skips with no recorded reason.
    None,
    /// Failure representation, rendered as free text.
    Failure(String),
    /// The host's native skip representation.
    ///
    /// Hosts render skips from this triple, not from free text; handing
    /// them a plain string displays incorrectly.
    Skip {
        /// File the skip points at.
        file: Utf8PathBuf,
        /// Line number, `-1` when unknown.
        line: i64,
        /// The skip reason.
        reason: String,
    },
}

impl ReportDetail {
    /// Renders the detail as the free text carried on the wire.
    pub fn to_text(&self) -> String {
        match self {
            ReportDetail::None => String::new(),
            ReportDetail::Failure(text) => text.clone(),
            ReportDetail::Skip { reason, .. } => reason.clone(),
        }
    }
}

/// One per-phase report in the host runner's native shape.
#[derive(Clone, Debug)]
pub struct HostReport {
    /// The test the report belongs to.
    pub nodeid: TestId,
    /// Which phase is being reported.
    pub when: Phase,
    /// The phase outcome.
    pub outcome: PhaseOutcome,
    /// Failure or skip detail.
    pub detail: ReportDetail,
    /// Wall-clock duration of the phase in seconds.
    pub duration: f64,
    /// Captured standard output for the phase.
    pub stdout: String,
    /// Captured standard error for the phase.
    pub stderr: String,
    /// Keyword and marker names attached to the test.
    pub keywords: Vec<String>,
    /// Additional display sections as (label, text) pairs.
    pub sections: Vec<(String, String)>,
    /// Properties attached by the test through the host's API.
    pub user_properties: Vec<(String, serde_json::Value)>,
    /// Whether the outcome represents an expected failure.
    pub wasxfail: bool,
}

/// The surface through which the core drives the host runner.
pub trait HostRunner {
    /// Submits one phase report into the host's reporting pipeline, exactly
    /// as if the phase had executed natively in this process.
    fn submit_report(&mut self, report: HostReport);

    /// Runs a single non-isolated test natively in this process.
    fn run_native(&mut self, item: &TestItem, next_item: Option<&TestItem>);
}

/// Aggregate counters for one run, updated as call phases are replayed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RunStats {
    /// Number of tests whose call phase passed.
    pub passed: usize,
    /// Number of tests whose call phase failed.
    pub failed: usize,
    /// Number of tests whose call phase was skipped.
    pub skipped: usize,
}

impl RunStats {
    /// Returns true if no test has failed so far.
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    pub(crate) fn on_call(&mut self, outcome: PhaseOutcome) {
        match outcome {
            PhaseOutcome::Passed => self.passed += 1,
            PhaseOutcome::Failed => self.failed += 1,
            PhaseOutcome::Skipped => self.skipped += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("pkg/widget_test.rs", "pkg/widget_test.rs"; "no separators")]
    #[test_case("pkg/widget_test.rs::flip", "pkg/widget_test.rs"; "module and test")]
    #[test_case("pkg/widget_test.rs::Suite::flip", "pkg/widget_test.rs"; "module class and test")]
    fn module_id(input: &str, expected: &str) {
        assert_eq!(TestId::new(input).module_id(), expected);
    }

    #[test_case("pkg/widget_test.rs", None; "no separators")]
    #[test_case("pkg/widget_test.rs::flip", None; "two segments")]
    #[test_case("pkg/widget_test.rs::Suite::flip", Some("pkg/widget_test.rs::Suite"); "three segments")]
    #[test_case("pkg/widget_test.rs::Suite::flip::extra", Some("pkg/widget_test.rs::Suite"); "four segments")]
    fn class_id(input: &str, expected: Option<&str>) {
        assert_eq!(TestId::new(input).class_id(), expected);
    }

    #[test]
    fn closest_marker_prefers_innermost_scope() {
        let own = MarkerArgs {
            group: Some("own-group".to_owned()),
            timeout: None,
        };
        let module = MarkerArgs {
            group: Some("module-group".to_owned()),
            timeout: Some(10),
        };

        let markers = MarkerSet {
            own: Some(own.clone()),
            class: None,
            module: Some(module.clone()),
            xfail: false,
        };
        assert_eq!(markers.closest(), Some((MarkerLevel::Own, &own)));

        let markers = MarkerSet {
            own: None,
            class: None,
            module: Some(module.clone()),
            xfail: false,
        };
        assert_eq!(markers.closest(), Some((MarkerLevel::Module, &module)));

        assert_eq!(MarkerSet::default().closest(), None);
    }

    #[test]
    fn run_stats_counts_call_outcomes() {
        let mut stats = RunStats::default();
        stats.on_call(PhaseOutcome::Passed);
        stats.on_call(PhaseOutcome::Failed);
        stats.on_call(PhaseOutcome::Skipped);
        stats.on_call(PhaseOutcome::Failed);
        assert_eq!(
            stats,
            RunStats {
                passed: 1,
                failed: 2,
                skipped: 1,
            }
        );
        assert!(!stats.is_success());
    }
}
