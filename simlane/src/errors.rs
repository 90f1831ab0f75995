// Copyright (c) The simlane Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::output::{NO_HEADING, StderrStyles};
use camino::Utf8PathBuf;
use owo_colors::OwoColorize;
use simlane_metadata::SimlaneExitCode;
use simlane_runner::errors::*;
use std::error::Error;
use thiserror::Error;

pub(crate) type Result<T, E = ExpectedError> = std::result::Result<T, E>;

// The #[error()] strings are placeholders: errors are meant to be printed with
// display_to_stderr, which styles them.

/// An error that simlane expects and reports without a backtrace.
#[derive(Debug, Error)]
#[doc(hidden)]
pub enum ExpectedError {
    #[error("config parse error")]
    ConfigParseError {
        #[from]
        err: ConfigParseError,
    },
    #[error("profile not found")]
    ProfileNotFound {
        #[from]
        err: ProfileNotFound,
    },
    #[error("argument file read error")]
    ArgumentFileReadError {
        arg_name: &'static str,
        file_name: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("test list read error")]
    TestListReadError {
        file_name: Utf8PathBuf,
        #[source]
        err: TestListReadError,
    },
    #[error("test durations read error")]
    TestDurationsReadError {
        file_name: Utf8PathBuf,
        #[source]
        err: TestDurationsReadError,
    },
    #[error("universe build error")]
    UniverseBuildError {
        #[from]
        err: UniverseBuildError,
    },
    #[error("pack error")]
    PackError {
        #[from]
        err: PackError,
    },
    #[error("no tests to run")]
    NoTestsRun,
    #[error("missing runner command")]
    MissingRunnerCommand,
    #[error("error creating tokio runtime")]
    TokioRuntimeError {
        #[source]
        err: std::io::Error,
    },
    #[error("orchestrator build error")]
    OrchestratorBuildError {
        #[from]
        err: OrchestratorBuildError,
    },
}

impl ExpectedError {
    /// Returns the exit code for the process.
    pub fn process_exit_code(&self) -> i32 {
        match self {
            Self::ConfigParseError { .. }
            | Self::ProfileNotFound { .. }
            | Self::ArgumentFileReadError { .. }
            | Self::TestListReadError { .. }
            | Self::TestDurationsReadError { .. }
            | Self::UniverseBuildError { .. }
            | Self::MissingRunnerCommand
            | Self::TokioRuntimeError { .. }
            | Self::OrchestratorBuildError { .. } => SimlaneExitCode::SETUP_ERROR,
            Self::PackError { .. } => SimlaneExitCode::CONFIGURATION_ERROR,
            Self::NoTestsRun => SimlaneExitCode::NO_TESTS_RUN,
        }
    }

    /// Displays this error to stderr.
    pub fn display_to_stderr(&self, styles: &StderrStyles) {
        let mut next_error = match self {
            Self::ConfigParseError { err } => {
                tracing::error!(
                    "failed to parse simlane config at `{}`",
                    err.config_file().style(styles.bold)
                );
                Some(err.kind() as &dyn Error)
            }
            Self::ProfileNotFound { err } => {
                tracing::error!("{err}");
                None
            }
            Self::ArgumentFileReadError {
                arg_name,
                file_name,
                err,
            } => {
                tracing::error!(
                    "failed to read `{}` for --{arg_name}",
                    file_name.style(styles.bold)
                );
                Some(err as &dyn Error)
            }
            Self::TestListReadError { file_name, err } => {
                tracing::error!("failed to read test list `{}`", file_name.style(styles.bold));
                Some(err as &dyn Error)
            }
            Self::TestDurationsReadError { file_name, err } => {
                tracing::error!(
                    "failed to read test durations `{}`",
                    file_name.style(styles.bold)
                );
                Some(err as &dyn Error)
            }
            Self::UniverseBuildError { err } => {
                tracing::error!("invalid test list");
                Some(err as &dyn Error)
            }
            Self::PackError { err } => {
                tracing::error!("invalid no-split configuration");
                Some(err as &dyn Error)
            }
            Self::NoTestsRun => {
                tracing::error!("no tests to run after applying filters");
                None
            }
            Self::MissingRunnerCommand => {
                tracing::error!(
                    "no runner command given (pass it after `{}`)",
                    "--".style(styles.bold)
                );
                None
            }
            Self::TokioRuntimeError { err } => {
                tracing::error!("error creating tokio runtime");
                Some(err as &dyn Error)
            }
            Self::OrchestratorBuildError { err } => {
                tracing::error!("failed to set up the run");
                Some(err as &dyn Error)
            }
        };

        while let Some(err) = next_error {
            tracing::error!(target: NO_HEADING, "\nCaused by:\n  {}", err);
            next_error = err.source();
        }
    }
}
