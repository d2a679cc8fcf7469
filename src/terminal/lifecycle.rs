//! Command Lifecycle Controller
//!
//! Enforces at most one running command per session.
//!
//! ```text
//!          start (Idle only)
//!   Idle ---------------------> Running
//!     ^                           |
//!     |  task finished / stop()   |
//!     +---------------------------+
//! ```
//!
//! The record of the running command sits behind a plain mutex that is
//! only held for a field read or write, never across an `.await`. Both the
//! dispatch path (start/stop) and the command task's own completion path
//! clear it, and each clear checks the command id so a late completion can
//! never wipe out a newer command.

use super::allowlist::{CommandAllowlist, ValidatedCommand};
use super::error::{RunError, ValidationError};
use super::protocol::{InboundRequest, OutboundMessage};
use super::runner::ProcessRunner;
use super::sender::MessageSink;
use crate::metrics;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default time `stop` waits for a cancelled command to wind down
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(3);

/// Output delivery mode for one command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Buffered,
    Streaming,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Buffered => "buffered",
            RunMode::Streaming => "streaming",
        }
    }
}

/// Observable controller state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandState {
    Idle,
    Running(String),
}

/// Why a start request was refused
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("command {0:?} is already running")]
    Busy(String),

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// The single command currently executing for a session
#[derive(Debug, Clone)]
struct RunningCommand {
    id: u64,
    name: String,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

type ActiveSlot = Arc<Mutex<Option<RunningCommand>>>;

/// Starts and stops commands for one session
#[derive(Clone)]
pub struct CommandController {
    active: ActiveSlot,
    allowlist: Arc<CommandAllowlist>,
    runner: ProcessRunner,
    sink: Arc<dyn MessageSink>,
    session: CancellationToken,
    stop_grace: Duration,
    next_id: Arc<AtomicU64>,
}

impl CommandController {
    /// Create a controller whose commands are cancelled with `session`
    pub fn new(
        allowlist: Arc<CommandAllowlist>,
        runner: ProcessRunner,
        sink: Arc<dyn MessageSink>,
        session: CancellationToken,
    ) -> Self {
        Self {
            active: Arc::new(Mutex::new(None)),
            allowlist,
            runner,
            sink,
            session,
            stop_grace: DEFAULT_STOP_GRACE,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Override the stop grace period
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Current state
    pub fn state(&self) -> CommandState {
        match self.lock_active().as_ref() {
            Some(current) => CommandState::Running(current.name.clone()),
            None => CommandState::Idle,
        }
    }

    /// Validate a request and launch it in its own task.
    ///
    /// Only permitted from `Idle`. Nothing is spawned and the state is left
    /// untouched if a command is already running or validation fails.
    pub fn start(&self, request: &InboundRequest) -> Result<(), StartError> {
        let mut active = self.lock_active();
        if let Some(current) = active.as_ref() {
            metrics::COMMANDS_REJECTED_TOTAL
                .with_label_values(&["busy"])
                .inc();
            return Err(StartError::Busy(current.name.clone()));
        }

        let command = self
            .allowlist
            .validate(&request.command, &request.args)
            .inspect_err(|e| {
                warn!("Rejected command {:?}: {}", request.command, e);
                metrics::COMMANDS_REJECTED_TOTAL
                    .with_label_values(&[e.reason()])
                    .inc();
            })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.session.child_token();
        let (done_tx, done_rx) = watch::channel(false);
        *active = Some(RunningCommand {
            id,
            name: command.name().to_string(),
            cancel: cancel.clone(),
            done: done_rx,
        });
        drop(active);

        let mode = if request.streaming {
            RunMode::Streaming
        } else {
            RunMode::Buffered
        };
        debug!(command = %command, mode = mode.as_str(), id, "Launching command task");

        tokio::spawn(run_command(
            Arc::clone(&self.active),
            self.runner.clone(),
            Arc::clone(&self.sink),
            command,
            mode,
            id,
            cancel,
            done_tx,
        ));
        Ok(())
    }

    /// Cancel the running command and wait (bounded) for it to finish.
    ///
    /// `emit_feedback` sends a confirmation line to the operator; session
    /// teardown passes `false` since the peer is already gone. Calling this
    /// while idle returns immediately.
    pub async fn stop(&self, emit_feedback: bool) {
        let current = self.lock_active().clone();

        let Some(current) = current else {
            if emit_feedback {
                self.sink
                    .deliver(OutboundMessage::stdout("No command need to stop now"))
                    .await;
            }
            return;
        };

        info!(command = %current.name, id = current.id, "Stopping command");
        current.cancel.cancel();

        let mut done = current.done.clone();
        // The watch guard returned by `wait_for` must not outlive this line.
        let finished = tokio::time::timeout(self.stop_grace, done.wait_for(|finished| *finished))
            .await
            .is_ok();
        if !finished {
            warn!(
                command = %current.name,
                "Command did not finish within {:?}, detaching",
                self.stop_grace
            );
        }

        if emit_feedback {
            self.sink
                .deliver(OutboundMessage::stdout("This command stopped successfully"))
                .await;
        }

        clear_if_current(&self.active, current.id);
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<RunningCommand>> {
        lock_slot(&self.active)
    }
}

fn lock_slot(slot: &ActiveSlot) -> MutexGuard<'_, Option<RunningCommand>> {
    // The slot holds plain data; a panic elsewhere cannot leave it torn.
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn clear_if_current(slot: &ActiveSlot, id: u64) {
    let mut active = lock_slot(slot);
    if active.as_ref().map(|current| current.id) == Some(id) {
        *active = None;
    }
}

/// Body of the per-command task.
///
/// The runner itself executes in a nested task so a panic surfaces here as
/// a `JoinError` instead of tearing down the session.
#[allow(clippy::too_many_arguments)]
async fn run_command(
    active: ActiveSlot,
    runner: ProcessRunner,
    sink: Arc<dyn MessageSink>,
    command: ValidatedCommand,
    mode: RunMode,
    id: u64,
    cancel: CancellationToken,
    done: watch::Sender<bool>,
) {
    let started = Instant::now();
    let name = command.name().to_string();

    let work = {
        let sink = Arc::clone(&sink);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match mode {
                RunMode::Buffered => runner.run_buffered(&command, &cancel, sink.as_ref()).await,
                RunMode::Streaming => runner.run_streaming(&command, &cancel, sink.as_ref()).await,
            }
        })
    };

    let result = match work.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            error!(command = %name, "Command task panicked");
            Err(RunError::Panicked)
        }
        Err(_) => Err(RunError::Cancelled),
    };

    let outcome = match &result {
        Ok(()) => "success",
        Err(e) => e.outcome(),
    };
    metrics::COMMANDS_TOTAL
        .with_label_values(&[name.as_str(), outcome])
        .inc();
    metrics::COMMAND_DURATION_SECONDS
        .with_label_values(&[mode.as_str()])
        .observe(started.elapsed().as_secs_f64());

    if let Err(e) = result {
        if !e.is_cancellation() {
            sink.deliver(OutboundMessage::error(e.to_string())).await;
        }
    }

    cancel.cancel();
    clear_if_current(&active, id);
    let _ = done.send(true);
    debug!(command = %name, id, outcome, "Command task finished");
}
