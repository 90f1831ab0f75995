// Copyright (c) The simlane Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Turning shutdown signals into run interruptions.
//!
//! Every signal simlane listens for means the same thing: stop the run. The
//! handler merges them into a single stream of [`ShutdownEvent`]s that the
//! orchestrator polls next to its lanes.

use crate::errors::SignalHandlerSetupError;
use debug_ignore::DebugIgnore;
use futures::{
    StreamExt,
    stream::{self, BoxStream},
};
use std::fmt;

/// The kind of signal handling to set up for a run.
///
/// Passed to [`OrchestratorBuilder::build`](crate::runner::OrchestratorBuilder::build).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum SignalHandlerKind {
    /// Interrupt the run on SIGINT, SIGTERM or SIGHUP (Ctrl-C on Windows).
    Standard,

    /// Ignore signals. Useful for tests.
    Noop,
}

impl SignalHandlerKind {
    pub(crate) fn build(self) -> Result<SignalHandler, SignalHandlerSetupError> {
        let events = match self {
            Self::Standard => stream::select_all(imp::shutdown_signals()?).boxed(),
            Self::Noop => stream::empty().boxed(),
        };
        Ok(SignalHandler {
            events: DebugIgnore(events),
        })
    }
}

/// A merged stream of shutdown signals.
#[derive(Debug)]
pub(crate) struct SignalHandler {
    events: DebugIgnore<BoxStream<'static, ShutdownEvent>>,
}

impl SignalHandler {
    /// Waits for the next signal. Returns `None` once no more signals can
    /// arrive. Cancel safe.
    pub(crate) async fn recv(&mut self) -> Option<ShutdownEvent> {
        self.events.0.next().await
    }
}

#[cfg(unix)]
mod imp {
    use super::*;
    use tokio::signal::unix::{SignalKind, signal};

    pub(super) fn shutdown_signals() -> std::io::Result<Vec<BoxStream<'static, ShutdownEvent>>> {
        [
            (SignalKind::interrupt(), ShutdownEvent::Interrupt),
            (SignalKind::terminate(), ShutdownEvent::Term),
            (SignalKind::hangup(), ShutdownEvent::Hangup),
        ]
        .into_iter()
        .map(|(kind, event)| {
            let signal = signal(kind)?;
            Ok(stream::unfold(signal, move |mut signal| async move {
                signal.recv().await.map(|()| (event, signal))
            })
            .boxed())
        })
        .collect()
    }
}

#[cfg(windows)]
mod imp {
    use super::*;
    use tokio::signal::windows::ctrl_c;

    pub(super) fn shutdown_signals() -> std::io::Result<Vec<BoxStream<'static, ShutdownEvent>>> {
        let ctrl_c = ctrl_c()?;
        Ok(vec![
            stream::unfold(ctrl_c, |mut ctrl_c| async move {
                ctrl_c
                    .recv()
                    .await
                    .map(|()| (ShutdownEvent::Interrupt, ctrl_c))
            })
            .boxed(),
        ])
    }
}

/// A signal that interrupts the run.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ShutdownEvent {
    /// SIGHUP.
    #[cfg(unix)]
    Hangup,

    /// SIGTERM.
    #[cfg(unix)]
    Term,

    /// SIGINT, or Ctrl-C on Windows.
    Interrupt,
}

impl fmt::Display for ShutdownEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(unix)]
            Self::Hangup => f.write_str("SIGHUP"),
            #[cfg(unix)]
            Self::Term => f.write_str("SIGTERM"),
            Self::Interrupt => f.write_str("interrupt"),
        }
    }
}
