// Copyright (c) The isolate-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Replaying reconciled results into the host's reporting pipeline.
//!
//! Converts [`PhaseRecord`]s back into the host's native report shape and
//! submits them exactly as if the phases had executed in this process.
//! Records are consumed as they are replayed, so a record can only ever be
//! counted once.

use crate::{
    host::{HostReport, HostRunner, ReportDetail, RunStats, TestItem},
    plan::TestGroup,
    records::{Phase, PhaseOutcome, PhaseRecord},
};
use tracing::warn;

/// Replay context for one group's reconciled records.
pub struct ReplayContext<'a, H: HostRunner> {
    host: &'a mut H,
    stats: &'a mut RunStats,
    capture_passed: bool,
}

impl<'a, H: HostRunner> ReplayContext<'a, H> {
    /// Creates a context feeding `host` and accumulating into `stats`.
    ///
    /// `capture_passed` mirrors the host's "capture output even on
    /// success" configuration: captured output is attached to passing
    /// phases only when it is set.
    pub fn new(host: &'a mut H, stats: &'a mut RunStats, capture_passed: bool) -> Self {
        Self {
            host,
            stats,
            capture_passed,
        }
    }

    /// Replays all records for one group, consuming them.
    pub fn replay_group(&mut self, group: &TestGroup, records: Vec<PhaseRecord>) {
        for record in records {
            match group.items.iter().find(|item| item.id == record.nodeid) {
                Some(item) => self.replay_record(item, record),
                None => warn!(
                    "dropping record for `{}`, which is not a member of group `{}`",
                    record.nodeid, group.key,
                ),
            }
        }
    }

    /// Replays a single record for `item`, consuming it.
    pub fn replay_record(&mut self, item: &TestItem, record: PhaseRecord) {
        if record.when == Phase::Call {
            self.stats.on_call(record.outcome);
        }
        self.host
            .submit_report(to_host_report(item, record, self.capture_passed));
    }
}

/// Converts one record into the host's native report representation.
fn to_host_report(item: &TestItem, record: PhaseRecord, capture_passed: bool) -> HostReport {
    let PhaseRecord {
        nodeid,
        when,
        outcome,
        longrepr,
        duration,
        stdout,
        stderr,
        keywords,
        sections,
        user_properties,
        wasxfail,
    } = record;

    // The host renders skips from a (file, line, reason) triple, not from
    // free text.
    let detail = match outcome {
        _ if longrepr.is_empty() => ReportDetail::None,
        PhaseOutcome::Skipped => ReportDetail::Skip {
            file: item.location.file.clone(),
            line: item.location.line.map_or(-1, i64::from),
            reason: longrepr,
        },
        PhaseOutcome::Failed => ReportDetail::Failure(longrepr),
        PhaseOutcome::Passed => ReportDetail::None,
    };

    // Captured output is shown for failures always, and for passes only
    // when configured; mirroring the host's own visibility policy keeps
    // isolated and native tests looking identical.
    let mut attached = Vec::new();
    if outcome == PhaseOutcome::Failed || (outcome == PhaseOutcome::Passed && capture_passed) {
        attached = sections;
        if !stdout.is_empty() {
            attached.push(("Captured stdout call".to_owned(), stdout));
        }
        if !stderr.is_empty() {
            attached.push(("Captured stderr call".to_owned(), stderr));
        }
    }

    HostReport {
        nodeid,
        when,
        outcome,
        detail,
        duration,
        // Captured output travels in sections on replay; the host's own
        // capture fields describe the current process and stay empty.
        stdout: String::new(),
        stderr: String::new(),
        keywords,
        sections: attached,
        user_properties,
        wasxfail,
    }
}
