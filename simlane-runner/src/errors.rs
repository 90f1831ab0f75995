// Copyright (c) The simlane Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by simlane.

use camino::Utf8PathBuf;
use config::ConfigError;
use simlane_metadata::{TestIdentifier, TestIdentifierParseError};
use std::{borrow::Cow, error, fmt, time::Duration};
use thiserror::Error;

/// An error that occurred while parsing the config.
#[derive(Debug, Error)]
#[error("failed to parse simlane config at `{config_file}`")]
#[non_exhaustive]
pub struct ConfigParseError {
    config_file: Utf8PathBuf,
    #[source]
    kind: ConfigParseErrorKind,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: impl Into<Utf8PathBuf>, kind: ConfigParseErrorKind) -> Self {
        Self {
            config_file: config_file.into(),
            kind,
        }
    }

    /// Returns the config file for this error.
    pub fn config_file(&self) -> &Utf8PathBuf {
        &self.config_file
    }

    /// Returns the kind of error this is.
    pub fn kind(&self) -> &ConfigParseErrorKind {
        &self.kind
    }
}

/// The kind of error that occurred while parsing a config.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigParseErrorKind {
    /// An error occurred while building the config.
    #[error(transparent)]
    BuildError(Box<ConfigError>),

    /// An error occurred while deserializing the config.
    #[error(transparent)]
    DeserializeError(Box<serde_path_to_error::Error<ConfigError>>),
}

/// An error which indicates that a profile was requested but not known to simlane.
#[derive(Clone, Debug, Error)]
#[error("profile `{profile}` not found (known profiles: {})", .all_profiles.join(", "))]
pub struct ProfileNotFound {
    profile: String,
    all_profiles: Vec<String>,
}

impl ProfileNotFound {
    pub(crate) fn new(
        profile: impl Into<String>,
        all_profiles: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let mut all_profiles: Vec<_> = all_profiles.into_iter().map(|s| s.into()).collect();
        all_profiles.sort_unstable();
        Self {
            profile: profile.into(),
            all_profiles,
        }
    }
}

/// An error that occurs while parsing a
/// [`FailureTolerance`](crate::config::FailureTolerance) from a string.
#[derive(Clone, Debug, Error)]
#[error("unrecognized value for failure-tolerance: {input} ({message})")]
pub struct FailureToleranceParseError {
    input: String,
    message: Cow<'static, str>,
}

impl FailureToleranceParseError {
    pub(crate) fn new(input: impl Into<String>, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            input: input.into(),
            message: message.into(),
        }
    }
}

/// An error that occurs while parsing a [`LaneCount`](crate::config::LaneCount) from a string.
#[derive(Clone, Debug, Error)]
#[error("unrecognized value for lanes: {input}\n(hint: expected a positive integer or \"num-cpus\")")]
pub struct LaneCountParseError {
    input: String,
}

impl LaneCountParseError {
    pub(crate) fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

/// An error that occurs while parsing a [`TestSelector`](crate::universe::TestSelector).
#[derive(Clone, Debug, Error)]
pub enum TestSelectorParseError {
    /// The selector was empty.
    #[error("test selector is empty")]
    Empty,

    /// The selector looked like a full identifier but was malformed.
    #[error(transparent)]
    InvalidIdentifier(#[from] TestIdentifierParseError),
}

/// An error that occurs while reading a list of test identifiers.
#[derive(Debug, Error)]
pub enum TestListReadError {
    /// An I/O error occurred while reading the list.
    #[error("error reading test list")]
    Read(#[source] std::io::Error),

    /// A line could not be parsed as a test identifier.
    #[error("line {line_number}: invalid test identifier")]
    InvalidLine {
        /// The 1-based line number.
        line_number: usize,

        /// The underlying parse error.
        #[source]
        err: TestIdentifierParseError,
    },
}

/// An error that occurs while reading historical test durations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TestDurationsReadError {
    /// The input was not a JSON object of numbers.
    #[error("error parsing test durations as JSON")]
    Json(#[source] serde_json::Error),

    /// A key was not a valid test identifier.
    #[error("invalid test identifier in durations")]
    InvalidIdentifier(#[source] TestIdentifierParseError),

    /// A duration was negative or not finite.
    #[error("duration for `{test}` must be a finite, non-negative number of seconds (got {value})")]
    InvalidDuration {
        /// The test with the invalid value.
        test: TestIdentifier,

        /// The invalid value.
        value: f64,
    },
}

/// An error that occurs while building a
/// [`TestUniverse`](crate::universe::TestUniverse).
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum UniverseBuildError {
    /// The same identifier was listed more than once.
    #[error("test `{0}` is listed more than once")]
    DuplicateTest(TestIdentifier),
}

/// A configuration error discovered while packing tests into lanes.
///
/// Packing is deterministic, so this error is never retried: it aborts the
/// attempt and becomes the final status of the run.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum PackError {
    /// A no-split group names a test (or a suite) that is not in the universe.
    #[error("no-split group `{group}` references `{entry}`, which is not in the test universe")]
    UnknownNoSplitMember {
        /// The name of the group.
        group: String,

        /// The entry that could not be resolved.
        entry: String,
    },

    /// A test belongs to more than one no-split group.
    #[error("test `{test}` is a member of both no-split groups `{first}` and `{second}`")]
    MemberInMultipleGroups {
        /// The test.
        test: TestIdentifier,

        /// The group the test was first seen in.
        first: String,

        /// The group the test was seen in next.
        second: String,
    },
}

/// A step of the sandbox lifecycle, as driven by a lane.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxStep {
    /// Creating a sandbox instance.
    Create,

    /// Booting a created instance.
    Boot,

    /// Installing the workload into the instance.
    Install,

    /// Launching the workload.
    Launch,

    /// Deleting the instance once the lane is done.
    Delete,
}

impl fmt::Display for SandboxStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create instance"),
            Self::Boot => write!(f, "boot instance"),
            Self::Install => write!(f, "install workload"),
            Self::Launch => write!(f, "launch workload"),
            Self::Delete => write!(f, "delete instance"),
        }
    }
}

/// An error returned by a [`SimulatorControl`](crate::sandbox::SimulatorControl)
/// implementation, or by the lane driving it.
#[derive(Debug, Error)]
#[error("failed to {step}")]
pub struct SandboxError {
    step: SandboxStep,
    #[source]
    kind: SandboxErrorKind,
}

impl SandboxError {
    /// Creates a new error for the given step with an underlying error.
    pub fn new(
        step: SandboxStep,
        err: impl Into<Box<dyn error::Error + Send + Sync + 'static>>,
    ) -> Self {
        Self {
            step,
            kind: SandboxErrorKind::Failed(err.into()),
        }
    }

    /// Creates a new error for a step that did not finish within its timeout.
    pub fn timed_out(step: SandboxStep, timeout: Duration) -> Self {
        Self {
            step,
            kind: SandboxErrorKind::TimedOut(timeout),
        }
    }

    /// Returns the step that failed.
    pub fn step(&self) -> SandboxStep {
        self.step
    }

    /// Returns the kind of failure.
    pub fn kind(&self) -> &SandboxErrorKind {
        &self.kind
    }
}

/// The kind of a [`SandboxError`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SandboxErrorKind {
    /// The step did not finish in time.
    #[error("timed out after {}", humantime_serde::re::humantime::format_duration(*.0))]
    TimedOut(Duration),

    /// The step failed.
    #[error(transparent)]
    Failed(Box<dyn error::Error + Send + Sync + 'static>),
}

/// An error returned by [`ProcessSandbox`](crate::sandbox::ProcessSandbox).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProcessSandboxError {
    /// The scratch directory for an instance could not be created.
    #[error("error creating scratch directory for lane {lane}")]
    CreateDir {
        /// The lane.
        lane: usize,

        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// The artifact to install could not be read.
    #[error("artifact `{artifact}` is not accessible")]
    ArtifactMissing {
        /// The artifact path.
        artifact: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// The workload command could not be spawned.
    #[error("error spawning `{program}`")]
    Spawn {
        /// The program.
        program: String,

        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// The scratch directory could not be removed.
    #[error("error removing scratch directory `{path}`")]
    RemoveDir {
        /// The directory.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: std::io::Error,
    },
}

/// An error occurred while setting up the signal handler.
#[derive(Debug, Error)]
#[error("error setting up signal handler")]
pub struct SignalHandlerSetupError(#[from] std::io::Error);

/// An error that occurs while building an
/// [`Orchestrator`](crate::runner::Orchestrator).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OrchestratorBuildError {
    /// An error occurred while setting up signals.
    #[error("error setting up signals")]
    SignalHandlerSetupError(#[from] SignalHandlerSetupError),
}

/// Displays an error and its sources as a single line chain, separated by
/// `: `.
pub struct DisplayErrorChain<E>(E);

impl<E: error::Error> DisplayErrorChain<E> {
    /// Wraps an error for display.
    pub fn new(error: E) -> Self {
        Self(error)
    }
}

impl<E: error::Error> fmt::Display for DisplayErrorChain<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = self.0.source();
        while let Some(err) = source {
            write!(f, ": {err}")?;
            source = err.source();
        }
        Ok(())
    }
}
