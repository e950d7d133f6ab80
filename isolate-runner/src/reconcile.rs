// Copyright (c) The isolate-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reconciliation of worker results.
//!
//! Given a worker's exit status and the (possibly incomplete) side-channel
//! records it left behind, produce the definitive ordered list of per-phase
//! records to replay. A dead or hung worker is data here, never an error:
//! every scenario collapses into synthesized records, so one group's fate
//! cannot abort the run.

use crate::{
    crash::{crash_message, display_exited_with, with_stderr},
    errors::{DisplayErrorChain, WorkerStartError},
    host::TestItem,
    launcher::WorkerOutcome,
    plan::TestGroup,
    records::{GroupResultSet, Phase, PhaseOutcome, PhaseRecord},
};

/// Turns one group's worker outcome and recorded phases into the ordered
/// list of records to replay.
///
/// Scenarios are checked in precedence order: crash-as-expected-failure,
/// timeout, collection-level crash, mid-run crash, then normal replay.
/// Phases are always emitted in setup, call, teardown order per test, and
/// tests in group order.
pub fn reconcile_group(
    group: &TestGroup,
    outcome: &WorkerOutcome,
    mut results: GroupResultSet,
) -> Vec<PhaseRecord> {
    if let Some(records) = crash_as_expected_failure(group, outcome, &results) {
        return records;
    }
    if outcome.timed_out {
        return timeout_failures(group, outcome);
    }
    if results.is_empty() {
        return collection_crash_failures(group, outcome);
    }
    let mut records = mid_run_crash_records(group, outcome, &mut results);
    records.extend(normal_replay_records(group, &mut results));
    records
}

/// Synthesizes failures for a group whose worker could not be started at
/// all.
pub fn worker_start_failure(group: &TestGroup, error: &WorkerStartError) -> Vec<PhaseRecord> {
    let message = format!(
        "worker for group `{}` could not be started: {}; none of the group's tests were run",
        group.key,
        DisplayErrorChain::new(error),
    );
    synthesized_group_failure(group, &message)
}

/// A crash is indistinguishable from "the operation expected to fail
/// aborted the process", which is a valid way to fail. When every test in
/// the group is marked as an expected failure and the worker aborted after
/// starting, the crash itself is the expected outcome and partial phase
/// data is discarded.
fn crash_as_expected_failure(
    group: &TestGroup,
    outcome: &WorkerOutcome,
    results: &GroupResultSet,
) -> Option<Vec<PhaseRecord>> {
    if !outcome.exit.is_abort() || results.is_empty() {
        return None;
    }
    if !group.items.iter().all(|item| item.markers.xfail) {
        return None;
    }
    let message = format!(
        "worker crashed with {} (expected failure)",
        outcome.exit
    );
    Some(synthesized_group_failure(group, &message))
}

/// Synthesizes the uniform timeout failure for every test in the group.
///
/// Partial results from before the timeout cannot be trusted to represent
/// final state; the caller discards them in favor of this.
fn timeout_failures(group: &TestGroup, outcome: &WorkerOutcome) -> Vec<PhaseRecord> {
    let message = format!(
        "worker for group `{}` timed out after {} seconds (execution time: {:.2}s); \
         raise the limit with --isolated-timeout, the isolated-timeout configuration \
         default, or the marker's timeout argument",
        group.key,
        group.timeout.as_secs(),
        outcome.elapsed.as_secs_f64(),
    );
    synthesized_group_failure(group, &message)
}

/// The worker exited without reporting a single phase: collection itself
/// probably crashed, or the process died before the first test began.
fn collection_crash_failures(group: &TestGroup, outcome: &WorkerOutcome) -> Vec<PhaseRecord> {
    let message = with_stderr(
        format!(
            "worker for group `{}` {} and produced no per-test report; it may have \
             crashed while collecting tests",
            group.key,
            display_exited_with(outcome.exit),
        ),
        &outcome.stderr,
    );
    synthesized_group_failure(group, &message)
}

/// Detects tests the worker died inside of, plus group members that never
/// got to run because they were ordered after the crash point.
///
/// A recorded passed setup with no call phase means the worker died inside
/// that test. A failed or skipped setup legitimately suppresses the call
/// phase and is not a crash.
fn mid_run_crash_records(
    group: &TestGroup,
    outcome: &WorkerOutcome,
    results: &mut GroupResultSet,
) -> Vec<PhaseRecord> {
    let crashed: Vec<&TestItem> = group
        .items
        .iter()
        .filter(|item| {
            results.phases(&item.id).is_some_and(|phases| {
                !phases.contains_key(&Phase::Call)
                    && phases
                        .get(&Phase::Setup)
                        .is_some_and(|setup| setup.outcome == PhaseOutcome::Passed)
            })
        })
        .collect();

    if crashed.is_empty() {
        return Vec::new();
    }

    let never_ran: Vec<&TestItem> = group
        .items
        .iter()
        .filter(|item| !results.contains(&item.id))
        .collect();

    let mut records = Vec::new();
    let message = crash_message(outcome.exit, "during test execution", &outcome.stderr);
    for item in crashed {
        let mut phases = results.remove(&item.id).unwrap_or_default();
        // The recorded setup is replayed verbatim; everything after it is
        // synthesized.
        let setup = phases.shift_remove(&Phase::Setup).unwrap_or_else(|| {
            PhaseRecord::synthesized(item.id.clone(), Phase::Setup, PhaseOutcome::Passed, "")
        });
        records.push(setup);
        records.push(synthesized_call(item, &message));
        records.push(PhaseRecord::synthesized(
            item.id.clone(),
            Phase::Teardown,
            PhaseOutcome::Passed,
            "",
        ));
    }

    if !never_ran.is_empty() {
        let message = format!(
            "test did not run: {}",
            crash_message(outcome.exit, "during earlier test execution", &outcome.stderr),
        );
        for item in never_ran {
            records.extend(synthesized_result(item, &message));
            results.remove(&item.id);
        }
    }

    records
}

/// Replays the remaining recorded phases in setup, call, teardown order.
fn normal_replay_records(group: &TestGroup, results: &mut GroupResultSet) -> Vec<PhaseRecord> {
    let mut records = Vec::new();
    for item in &group.items {
        let Some(mut phases) = results.remove(&item.id) else {
            continue;
        };
        let setup_passed = phases
            .get(&Phase::Setup)
            .is_some_and(|setup| setup.outcome == PhaseOutcome::Passed);
        for phase in Phase::ALL {
            match phases.shift_remove(&phase) {
                Some(record) => records.push(record),
                None => {
                    // Crash detection should have caught a vanished call
                    // phase; this is the safety net for records lost some
                    // other way. A missing call after a failed or skipped
                    // setup is the host's own convention and needs nothing.
                    if phase == Phase::Call && setup_passed {
                        records.push(PhaseRecord::synthesized(
                            item.id.clone(),
                            Phase::Call,
                            PhaseOutcome::Failed,
                            format!("missing 'call' phase result from worker for {}", item.id),
                        ));
                    }
                }
            }
        }
    }
    records
}

/// Synthesizes the full setup/call/teardown result for every test in the
/// group.
fn synthesized_group_failure(group: &TestGroup, message: &str) -> Vec<PhaseRecord> {
    group
        .items
        .iter()
        .flat_map(|item| synthesized_result(item, message))
        .collect()
}

/// Synthesizes a full three-phase result for one test.
///
/// Setup and teardown are reported as passed even though they never ran, so
/// the host categorizes the test as failed rather than errored; the failure
/// itself lands on the call phase. Expected-failure tests get a skipped
/// call with the expected-failure indicator instead.
fn synthesized_result(item: &TestItem, message: &str) -> [PhaseRecord; 3] {
    [
        PhaseRecord::synthesized(item.id.clone(), Phase::Setup, PhaseOutcome::Passed, ""),
        synthesized_call(item, message),
        PhaseRecord::synthesized(item.id.clone(), Phase::Teardown, PhaseOutcome::Passed, ""),
    ]
}

fn synthesized_call(item: &TestItem, message: &str) -> PhaseRecord {
    let mut call =
        PhaseRecord::synthesized(item.id.clone(), Phase::Call, PhaseOutcome::Failed, message);
    if item.markers.xfail {
        call.outcome = PhaseOutcome::Skipped;
        call.wasxfail = true;
    }
    call
}
