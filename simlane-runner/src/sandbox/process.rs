// Copyright (c) The simlane Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{BoxedSandboxError, LaunchRequest, LaunchedWorkload, SimulatorControl, WorkloadExit};
use crate::errors::ProcessSandboxError;
use bytes::{Bytes, BytesMut};
use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::Utf8TempDir;
use debug_ignore::DebugIgnore;
use futures::{FutureExt, StreamExt, stream::BoxStream};
use itertools::Itertools;
use std::{
    io,
    process::{ExitStatus, Stdio},
    sync::{Mutex, PoisonError},
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    sync::oneshot,
};
use tracing::debug;

/// A [`SimulatorControl`] that runs a test-runner command directly on the
/// host.
///
/// Each instance is a scratch directory. Booting does nothing, installing
/// checks that the artifact exists, and launching spawns the command in the
/// scratch directory with these environment variables set:
///
/// * `SIMLANE_TESTS`: the lane's tests as comma-separated `Suite/case` names
/// * `SIMLANE_ARTIFACT`: the installed artifact, if any
/// * `SIMLANE_LANE` and `SIMLANE_ATTEMPT`
///
/// Standard output and standard error are merged at line boundaries. A
/// partial line is forwarded once its pipe goes quiet.
#[derive(Clone, Debug)]
pub struct ProcessSandbox {
    program: String,
    args: Vec<String>,
    termination_grace: Duration,
    scratch_root: Option<Utf8PathBuf>,
}

impl ProcessSandbox {
    /// Creates a sandbox that runs `program` with `args`.
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            termination_grace: Duration::from_secs(10),
            scratch_root: None,
        }
    }

    /// Sets how long a terminated workload has to exit before it is killed.
    pub fn set_termination_grace(&mut self, grace: Duration) -> &mut Self {
        self.termination_grace = grace;
        self
    }

    /// Creates scratch directories under `root` instead of the system
    /// temporary directory.
    pub fn set_scratch_root(&mut self, root: impl Into<Utf8PathBuf>) -> &mut Self {
        self.scratch_root = Some(root.into());
        self
    }
}

/// An instance created by [`ProcessSandbox`].
#[derive(Debug)]
pub struct ProcessInstance {
    lane: usize,
    dir: Utf8TempDir,
    artifact: Mutex<Option<Utf8PathBuf>>,
    kill_sender: Mutex<Option<oneshot::Sender<()>>>,
}

impl ProcessInstance {
    /// Returns the scratch directory.
    pub fn dir(&self) -> &Utf8Path {
        self.dir.path()
    }
}

impl SimulatorControl for ProcessSandbox {
    type Instance = ProcessInstance;

    async fn create_instance(&self, lane: usize) -> Result<ProcessInstance, BoxedSandboxError> {
        let prefix = format!("simlane-lane-{lane}-");
        let mut builder = camino_tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match &self.scratch_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(|error| ProcessSandboxError::CreateDir { lane, error })?;

        Ok(ProcessInstance {
            lane,
            dir,
            artifact: Mutex::new(None),
            kill_sender: Mutex::new(None),
        })
    }

    async fn boot_instance(&self, _instance: &ProcessInstance) -> Result<(), BoxedSandboxError> {
        Ok(())
    }

    async fn install_workload(
        &self,
        instance: &ProcessInstance,
        artifact: &Utf8Path,
    ) -> Result<(), BoxedSandboxError> {
        tokio::fs::metadata(artifact)
            .await
            .map_err(|error| ProcessSandboxError::ArtifactMissing {
                artifact: artifact.to_owned(),
                error,
            })?;
        *instance
            .artifact
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(artifact.to_owned());
        Ok(())
    }

    async fn launch_workload(
        &self,
        instance: &ProcessInstance,
        request: &LaunchRequest,
    ) -> Result<LaunchedWorkload, BoxedSandboxError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .args(&request.args)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("SIMLANE_TESTS", request.tests.iter().join(","))
            .env("SIMLANE_LANE", request.lane.to_string())
            .env("SIMLANE_ATTEMPT", request.attempt.to_string())
            .current_dir(instance.dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(artifact) = instance
            .artifact
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            cmd.env("SIMLANE_ARTIFACT", artifact);
        }
        // The workload gets its own process group so that termination reaches
        // anything it spawns.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|error| ProcessSandboxError::Spawn {
            program: self.program.clone(),
            error,
        })?;
        let pid = child.id();
        debug!(lane = instance.lane, ?pid, program = %self.program, "spawned workload");

        let output = merge_output(child.stdout.take(), child.stderr.take());

        let (kill_sender, kill_receiver) = oneshot::channel();
        *instance
            .kill_sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(kill_sender);
        let grace = self.termination_grace;
        let exit = async move {
            tokio::select! {
                status = child.wait() => exit_from_status(status),
                Ok(()) = kill_receiver => terminate_child(&mut child, grace).await,
            }
        }
        .boxed();

        Ok(LaunchedWorkload {
            pid,
            output: DebugIgnore(output),
            exit: DebugIgnore(exit),
        })
    }

    fn terminate_instance(&self, instance: &ProcessInstance) {
        let sender = instance
            .kill_sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            // The workload may have exited already.
            let _ = sender.send(());
        }
    }

    async fn delete_instance(&self, instance: ProcessInstance) -> Result<(), BoxedSandboxError> {
        let ProcessInstance { dir, .. } = instance;
        let path = dir.path().to_owned();
        dir.close()
            .map_err(|error| ProcessSandboxError::RemoveDir { path, error })?;
        Ok(())
    }
}

/// The read size for each pipe, and the most a partial line buffers before it
/// is forwarded.
const CHUNK_SIZE: usize = 4 * 1024;

/// How long a partial line waits for the rest of its line before it is
/// forwarded as is.
const PARTIAL_LINE_FLUSH: Duration = Duration::from_millis(100);

fn merge_output(
    stdout: Option<impl AsyncRead + Unpin + Send + 'static>,
    stderr: Option<impl AsyncRead + Unpin + Send + 'static>,
) -> BoxStream<'static, io::Result<Bytes>> {
    let stdout = stdout.map_or_else(|| futures::stream::empty().boxed(), pipe_stream);
    let stderr = stderr.map_or_else(|| futures::stream::empty().boxed(), pipe_stream);
    futures::stream::select(stdout, stderr).boxed()
}

fn pipe_stream(
    reader: impl AsyncRead + Unpin + Send + 'static,
) -> BoxStream<'static, io::Result<Bytes>> {
    futures::stream::try_unfold(PipeReader::new(reader), |mut pipe| async move {
        Ok::<_, io::Error>(pipe.next_chunk().await?.map(|chunk| (chunk, pipe)))
    })
    .boxed()
}

/// Reads one pipe, handing out complete lines as soon as they arrive so the
/// two pipes interleave at line boundaries.
///
/// A partial line is handed out once the pipe has been quiet for
/// [`PARTIAL_LINE_FLUSH`], or once it reaches [`CHUNK_SIZE`].
struct PipeReader<R> {
    reader: BufReader<R>,
    pending: BytesMut,
    eof: bool,
}

impl<R: AsyncRead + Unpin> PipeReader<R> {
    fn new(reader: R) -> Self {
        Self {
            reader: BufReader::with_capacity(CHUNK_SIZE, reader),
            pending: BytesMut::with_capacity(CHUNK_SIZE),
            eof: false,
        }
    }

    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            if let Some(newline) = self.pending.iter().rposition(|&b| b == b'\n') {
                return Ok(Some(self.pending.split_to(newline + 1).freeze()));
            }
            if self.eof || self.pending.len() >= CHUNK_SIZE {
                return Ok((!self.pending.is_empty()).then(|| self.pending.split().freeze()));
            }

            let read = if self.pending.is_empty() {
                self.fill().await?
            } else {
                match tokio::time::timeout(PARTIAL_LINE_FLUSH, self.fill()).await {
                    Ok(read) => read?,
                    Err(_) => return Ok(Some(self.pending.split().freeze())),
                }
            };
            self.eof = read == 0;
        }
    }

    async fn fill(&mut self) -> io::Result<usize> {
        let buf = self.reader.fill_buf().await?;
        let read = buf.len();
        self.pending.extend_from_slice(buf);
        self.reader.consume(read);
        Ok(read)
    }
}

fn exit_from_status(status: io::Result<ExitStatus>) -> WorkloadExit {
    match status {
        Ok(status) => {
            if let Some(code) = status.code() {
                return WorkloadExit::Exited(code);
            }
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                if let Some(signal) = status.signal() {
                    return WorkloadExit::Signaled(signal);
                }
            }
            WorkloadExit::Lost(format!("unrecognized exit status: {status}"))
        }
        Err(error) => WorkloadExit::Lost(format!("error waiting for workload: {error}")),
    }
}

#[cfg(unix)]
async fn terminate_child(child: &mut Child, grace: Duration) -> WorkloadExit {
    let Some(pid) = child.id() else {
        return exit_from_status(child.wait().await);
    };
    // A negative pid addresses the process group.
    let group = -(pid as libc::pid_t);

    unsafe { libc::kill(group, libc::SIGTERM) };
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => exit_from_status(status),
        Err(_) => {
            debug!(pid, "workload did not exit within the grace period, killing");
            unsafe { libc::kill(group, libc::SIGKILL) };
            exit_from_status(child.wait().await)
        }
    }
}

#[cfg(not(unix))]
async fn terminate_child(child: &mut Child, _grace: Duration) -> WorkloadExit {
    let _ = child.start_kill();
    exit_from_status(child.wait().await)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use simlane_metadata::TestIdentifier;
    use tokio::io::AsyncWriteExt;

    async fn collect_output(workload: &mut LaunchedWorkload) -> String {
        let mut output = Vec::new();
        while let Some(chunk) = workload.output.next().await {
            output.extend_from_slice(&chunk.expect("read output"));
        }
        String::from_utf8(output).expect("utf-8 output")
    }

    #[tokio::test]
    async fn runs_command_in_scratch_dir() {
        let sandbox = ProcessSandbox::new(
            "sh",
            ["-c", "echo \"tests=$SIMLANE_TESTS lane=$SIMLANE_LANE\"; echo oops >&2; exit 1"],
        );
        let instance = sandbox.create_instance(2).await.expect("created");
        let dir = instance.dir().to_owned();
        assert!(dir.is_dir());
        sandbox.boot_instance(&instance).await.expect("booted");

        let request = LaunchRequest {
            lane: 2,
            attempt: 1,
            tests: vec![TestIdentifier::new("A", "t1"), TestIdentifier::new("B", "t2")],
            ..Default::default()
        };
        let mut workload = sandbox
            .launch_workload(&instance, &request)
            .await
            .expect("launched");
        assert!(workload.pid.is_some());

        let output = collect_output(&mut workload).await;
        let mut lines: Vec<_> = output.lines().collect();
        lines.sort_unstable();
        assert_eq!(lines, ["oops", "tests=A/t1,B/t2 lane=2"]);
        assert_eq!(workload.exit.0.await, WorkloadExit::Exited(1));

        sandbox.delete_instance(instance).await.expect("deleted");
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn partial_line_is_forwarded_while_workload_waits() {
        let sandbox = ProcessSandbox::new("sh", ["-c", "printf 'progress...'; sleep 3; echo done"]);
        let instance = sandbox.create_instance(0).await.expect("created");
        let mut workload = sandbox
            .launch_workload(&instance, &LaunchRequest::default())
            .await
            .expect("launched");

        let first = tokio::time::timeout(Duration::from_millis(1500), workload.output.next())
            .await
            .expect("partial line arrives before the workload finishes its line")
            .expect("stream is open")
            .expect("read output");
        assert_eq!(first, Bytes::from_static(b"progress..."));

        assert_eq!(collect_output(&mut workload).await, "done\n");
        assert_eq!(workload.exit.0.await, WorkloadExit::Exited(0));
    }

    #[tokio::test]
    async fn pipe_reader_keeps_lines_whole() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let mut pipe = PipeReader::new(reader);

        writer.write_all(b"one\ntw").await.unwrap();
        assert_eq!(pipe.next_chunk().await.unwrap(), Some(Bytes::from_static(b"one\n")));
        writer.write_all(b"o\nthree").await.unwrap();
        drop(writer);
        assert_eq!(pipe.next_chunk().await.unwrap(), Some(Bytes::from_static(b"two\n")));
        assert_eq!(pipe.next_chunk().await.unwrap(), Some(Bytes::from_static(b"three")));
        assert_eq!(pipe.next_chunk().await.unwrap(), None);
    }

    #[tokio::test]
    async fn install_requires_artifact() {
        let sandbox = ProcessSandbox::new("true", Vec::<String>::new());
        let instance = sandbox.create_instance(0).await.expect("created");
        let missing = instance.dir().join("missing.app");
        let err = sandbox
            .install_workload(&instance, &missing)
            .await
            .expect_err("artifact is missing");
        assert!(err.to_string().contains("missing.app"), "{err}");

        let present = instance.dir().join("Present.app");
        std::fs::write(&present, b"").expect("wrote artifact");
        sandbox
            .install_workload(&instance, &present)
            .await
            .expect("installed");
    }

    #[tokio::test]
    async fn terminate_stops_workload() {
        let mut sandbox = ProcessSandbox::new("sh", ["-c", "sleep 600"]);
        sandbox.set_termination_grace(Duration::from_secs(5));
        let instance = sandbox.create_instance(0).await.expect("created");
        let workload = sandbox
            .launch_workload(&instance, &LaunchRequest::default())
            .await
            .expect("launched");

        sandbox.terminate_instance(&instance);
        // A second request is a no-op.
        sandbox.terminate_instance(&instance);
        assert_eq!(
            workload.exit.0.await,
            WorkloadExit::Signaled(libc::SIGTERM)
        );
    }

    #[tokio::test]
    async fn spawn_failure() {
        let sandbox = ProcessSandbox::new("/nonexistent/simlane-test-runner", Vec::<String>::new());
        let instance = sandbox.create_instance(0).await.expect("created");
        let err = sandbox
            .launch_workload(&instance, &LaunchRequest::default())
            .await
            .expect_err("spawn fails");
        assert_eq!(
            err.to_string(),
            "error spawning `/nonexistent/simlane-test-runner`"
        );
    }
}
