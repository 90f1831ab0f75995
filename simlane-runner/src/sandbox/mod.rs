// Copyright (c) The simlane Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The interface to the Simulator Control Service.
//!
//! simlane does not create or boot sandboxes itself. A lane drives an
//! implementation of [`SimulatorControl`] through create, boot, install,
//! launch and delete, and reads the launched workload's combined output as a
//! stream of byte chunks.

mod process;

pub use process::*;

use bytes::Bytes;
use camino::Utf8Path;
use debug_ignore::DebugIgnore;
use futures::{future::BoxFuture, stream::BoxStream};
use serde::Serialize;
use simlane_metadata::TestIdentifier;
use std::{error, fmt, future::Future, io};

/// The error type returned by [`SimulatorControl`] operations. The lane wraps
/// it in a [`SandboxError`](crate::errors::SandboxError) naming the step.
pub type BoxedSandboxError = Box<dyn error::Error + Send + Sync + 'static>;

/// Creates, prepares and tears down sandbox instances.
///
/// Every operation is called from the lane that owns the instance. Operations
/// for different lanes may run concurrently.
pub trait SimulatorControl: Send + Sync + 'static {
    /// A handle to a created instance.
    type Instance: Send + Sync + 'static;

    /// Creates an instance for `lane`.
    fn create_instance(
        &self,
        lane: usize,
    ) -> impl Future<Output = Result<Self::Instance, BoxedSandboxError>> + Send;

    /// Boots a created instance.
    fn boot_instance(
        &self,
        instance: &Self::Instance,
    ) -> impl Future<Output = Result<(), BoxedSandboxError>> + Send;

    /// Installs the workload artifact into the instance.
    fn install_workload(
        &self,
        instance: &Self::Instance,
        artifact: &Utf8Path,
    ) -> impl Future<Output = Result<(), BoxedSandboxError>> + Send;

    /// Launches the workload.
    fn launch_workload(
        &self,
        instance: &Self::Instance,
        request: &LaunchRequest,
    ) -> impl Future<Output = Result<LaunchedWorkload, BoxedSandboxError>> + Send;

    /// Asks the instance to stop the running workload. Returns immediately;
    /// the workload's exit future resolves once it has stopped.
    fn terminate_instance(&self, instance: &Self::Instance);

    /// Deletes the instance.
    fn delete_instance(
        &self,
        instance: Self::Instance,
    ) -> impl Future<Output = Result<(), BoxedSandboxError>> + Send;
}

/// What to launch in an instance.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LaunchRequest {
    /// The lane index.
    pub lane: usize,

    /// The 1-based attempt number.
    pub attempt: usize,

    /// The tests this lane runs, in order.
    pub tests: Vec<TestIdentifier>,

    /// Extra arguments for the workload.
    pub args: Vec<String>,

    /// Extra environment variables for the workload.
    pub env: Vec<(String, String)>,
}

/// A launched workload.
#[derive(Debug)]
pub struct LaunchedWorkload {
    /// The process ID, if the service knows it.
    pub pid: Option<u32>,

    /// The workload's combined output, as it arrives.
    pub output: DebugIgnore<BoxStream<'static, io::Result<Bytes>>>,

    /// Resolves once the workload has exited.
    pub exit: DebugIgnore<BoxFuture<'static, WorkloadExit>>,
}

/// How a workload ended.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "kebab-case")]
pub enum WorkloadExit {
    /// The process exited with a code.
    Exited(i32),

    /// The process was killed by a signal.
    Signaled(i32),

    /// The service lost track of the process, for example because the
    /// instance itself went away.
    Lost(String),
}

impl WorkloadExit {
    /// Returns true for the exit codes a test runner uses when it ran to the
    /// end: 0 if every test passed and 1 if some failed.
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Exited(0 | 1))
    }
}

impl fmt::Display for WorkloadExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Signaled(signal) => write!(f, "killed by signal {signal}"),
            Self::Lost(reason) => write!(f, "lost: {reason}"),
        }
    }
}
