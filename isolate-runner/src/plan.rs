// Copyright (c) The isolate-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Isolation planning: which tests run in which worker process.
//!
//! The plan is computed once, after the host's collection, filtering and
//! reordering have settled, and is immutable from then on. Items not
//! selected for isolation are carried as native items and run in the parent
//! after all groups complete.

use crate::{
    errors::MaxFailParseError,
    host::{MarkerArgs, MarkerLevel, TestItem},
    worker::WorkerEnv,
};
use indexmap::IndexMap;
use std::{fmt, str::FromStr, time::Duration};

/// Fallback timeout for a group when neither a marker, the command line nor
/// the configuration specifies one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Identifies the batch of tests sharing one worker process.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct GroupKey(String);

impl GroupKey {
    /// Creates a new group key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for GroupKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// How tests are selected for isolation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum IsolationMode {
    /// Only tests carrying the isolation marker are isolated.
    #[default]
    Marked,
    /// Every test runs isolated, marked or not.
    All,
    /// Isolation is disabled entirely and everything runs natively. The
    /// debugging escape hatch.
    Disabled,
}

/// Type for the max-fail and exit-first configuration.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum MaxFail {
    /// Stop launching groups once this many tests have failed.
    Count(usize),
    /// Run everything regardless of failures.
    #[default]
    All,
}

impl MaxFail {
    /// Returns the max-fail corresponding to exit-first behavior.
    pub fn from_exit_first(exit_first: bool) -> Self {
        if exit_first { Self::Count(1) } else { Self::All }
    }

    /// Returns true if the threshold has been reached.
    pub fn is_exceeded(&self, failed: usize) -> bool {
        match self {
            Self::Count(max_fail) => failed >= *max_fail,
            Self::All => false,
        }
    }
}

impl FromStr for MaxFail {
    type Err = MaxFailParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }

        let max_fail = s
            .parse::<isize>()
            .map_err(|error| MaxFailParseError::new(format!("{error} parsing '{s}'")))?;
        if max_fail <= 0 {
            return Err(MaxFailParseError::new("max-fail may not be <= 0"));
        }
        Ok(Self::Count(max_fail as usize))
    }
}

impl fmt::Display for MaxFail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Count(max_fail) => write!(f, "{max_fail}"),
        }
    }
}

/// Knobs consumed from the host's option and configuration surface.
///
/// The core does not parse anything itself; the host adapter hands over
/// already parsed values.
#[derive(Clone, Debug, Default)]
pub struct IsolationSettings {
    /// Selection mode.
    pub mode: IsolationMode,
    /// Global command-line timeout override, in seconds.
    pub timeout_override: Option<u64>,
    /// Persisted configuration default timeout, in seconds.
    pub default_timeout: Option<u64>,
    /// Failure threshold for early termination, checked at group
    /// granularity.
    pub max_fail: MaxFail,
    /// Attach captured output to passing phases too.
    pub capture_passed: bool,
}

impl IsolationSettings {
    /// Returns the settings with isolation disabled when `env` says this
    /// process is itself a worker.
    ///
    /// A worker must run its assigned tests natively rather than plan
    /// isolation again; without this, every worker would treat its own
    /// tests as isolation candidates and spawn workers without bound.
    pub fn for_worker_env(mut self, env: &WorkerEnv) -> Self {
        if env.is_worker() {
            self.mode = IsolationMode::Disabled;
        }
        self
    }
}

/// One planned batch of tests sharing a worker process.
#[derive(Clone, Debug)]
pub struct TestGroup {
    /// The resolved group key.
    pub key: GroupKey,
    /// Member tests, in their original relative order.
    pub items: Vec<TestItem>,
    /// The resolved wall-clock timeout for the group's worker.
    pub timeout: Duration,
}

/// The complete, immutable isolation plan for one run.
#[derive(Clone, Debug, Default)]
pub struct IsolationPlan {
    groups: IndexMap<GroupKey, TestGroup>,
    native: Vec<TestItem>,
}

impl IsolationPlan {
    /// Builds the plan from the host's final filtered and ordered item
    /// list.
    ///
    /// Group membership preserves the relative order of the input, and
    /// groups themselves are ordered by first appearance. Items appearing
    /// more than once collapse to their first occurrence within a group.
    pub fn build(items: &[TestItem], settings: &IsolationSettings) -> Self {
        if settings.mode == IsolationMode::Disabled {
            return Self {
                groups: IndexMap::new(),
                native: items.to_vec(),
            };
        }

        let mut members: IndexMap<GroupKey, Vec<TestItem>> = IndexMap::new();
        let mut marker_timeouts: IndexMap<GroupKey, Option<u64>> = IndexMap::new();
        let mut native = Vec::new();

        for item in items {
            let closest = item.markers.closest();
            if closest.is_none() && settings.mode != IsolationMode::All {
                native.push(item.clone());
                continue;
            }

            let key = group_key(item, closest);

            // The first marker encountered for a group fixes its timeout;
            // later markers for the same key do not change it.
            marker_timeouts
                .entry(key.clone())
                .or_insert_with(|| closest.and_then(|(_, args)| args.timeout));

            let group = members.entry(key).or_default();
            if !group.iter().any(|member| member.id == item.id) {
                group.push(item.clone());
            }
        }

        let groups = members
            .into_iter()
            .map(|(key, items)| {
                let marker = marker_timeouts.get(&key).copied().flatten();
                let timeout = resolve_timeout(marker, settings);
                (key.clone(), TestGroup { key, items, timeout })
            })
            .collect();

        Self { groups, native }
    }

    /// Iterates the planned groups in first-appearance order.
    pub fn groups(&self) -> impl Iterator<Item = &TestGroup> {
        self.groups.values()
    }

    /// Looks up a group by key.
    pub fn group(&self, key: &GroupKey) -> Option<&TestGroup> {
        self.groups.get(key)
    }

    /// The non-isolated items, in their original relative order.
    pub fn native(&self) -> &[TestItem] {
        &self.native
    }

    /// Returns true when no test was selected for isolation.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Number of planned groups.
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Total number of isolated tests across all groups.
    pub fn isolated_count(&self) -> usize {
        self.groups.values().map(|group| group.items.len()).sum()
    }
}

/// Derives the group key for one isolated item.
///
/// An explicit group name always wins. An own-marker application without a
/// group name forces the item's own identifier, so an explicitly marked
/// function is never silently merged into a broader batch its author did
/// not request. Class- and module-level markers group by the enclosing
/// scope identifier, and items isolated only by mode run alone.
fn group_key(item: &TestItem, closest: Option<(MarkerLevel, &MarkerArgs)>) -> GroupKey {
    let Some((level, args)) = closest else {
        return GroupKey::new(item.id.as_str());
    };
    if let Some(group) = &args.group {
        return GroupKey::new(group.clone());
    }
    match level {
        MarkerLevel::Own => GroupKey::new(item.id.as_str()),
        MarkerLevel::Class => match item.id.class_id() {
            Some(class) => GroupKey::new(class),
            None => GroupKey::new(item.id.as_str()),
        },
        MarkerLevel::Module => GroupKey::new(item.id.module_id()),
    }
}

/// Applies the timeout resolution order: marker argument, then command-line
/// override, then configuration default, then [`DEFAULT_TIMEOUT`].
fn resolve_timeout(marker: Option<u64>, settings: &IsolationSettings) -> Duration {
    marker
        .or(settings.timeout_override)
        .or(settings.default_timeout)
        .map_or(DEFAULT_TIMEOUT, Duration::from_secs)
}
