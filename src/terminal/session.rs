//! Session Orchestrator
//!
//! One [`Session`] per operator connection. It owns the outbound writer, the
//! command lifecycle controller, the inbound request queue and the two
//! background tasks (inbound reader and heartbeat). Everything hangs off a
//! single root [`CancellationToken`]; cancelling it stops the whole tree.

use super::allowlist::CommandAllowlist;
use super::commands::{self, PseudoCommand, BUSY_MESSAGE, HELP_TEXT, READY_MESSAGE};
use super::error::TransportError;
use super::lifecycle::{CommandController, CommandState, StartError, DEFAULT_STOP_GRACE};
use super::protocol::{InboundRequest, OutboundMessage};
use super::runner::{ProcessRunner, RunnerConfig};
use super::sender::{FrameSink, OutputSender};
use crate::metrics;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default heartbeat period
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Default capacity of the inbound request queue
pub const DEFAULT_REQUEST_QUEUE: usize = 20;

/// Default time teardown waits for background tasks before aborting them
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// One inbound transport frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Close,
    Ping,
}

/// Read half of a session transport
#[async_trait]
pub trait FrameSource: Send {
    /// Wait for the next frame. `None` means the peer went away.
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>>;
}

/// Per-session settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub allowlist: Arc<CommandAllowlist>,
    pub runner: RunnerConfig,
    pub heartbeat_interval: Duration,
    pub stop_grace: Duration,
    pub request_queue: usize,
    pub shutdown_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            allowlist: Arc::new(CommandAllowlist::default()),
            runner: RunnerConfig::default(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            stop_grace: DEFAULT_STOP_GRACE,
            request_queue: DEFAULT_REQUEST_QUEUE,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// A live operator connection
pub struct Session {
    id: Uuid,
    token: CancellationToken,
    sender: Arc<OutputSender>,
    controller: CommandController,
    config: SessionConfig,
}

impl Session {
    /// Create a session writing to `sink`.
    ///
    /// The session's root token is a child of `parent`, so server shutdown
    /// tears down every session.
    pub fn new(sink: Box<dyn FrameSink>, parent: &CancellationToken, config: SessionConfig) -> Self {
        let token = parent.child_token();
        let sender = Arc::new(OutputSender::new(sink, token.clone()));
        let controller = CommandController::new(
            Arc::clone(&config.allowlist),
            ProcessRunner::new(config.runner.clone()),
            sender.clone(),
            token.clone(),
        )
        .with_stop_grace(config.stop_grace);

        Self {
            id: Uuid::new_v4(),
            token,
            sender,
            controller,
            config,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Root cancellation token; cancelling it ends the session
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Drive the session until the peer leaves or the token is cancelled.
    ///
    /// Returns only after every task the session spawned has finished or
    /// been aborted, and any running command has been stopped.
    pub async fn run(self, source: Box<dyn FrameSource>) {
        metrics::SESSIONS_ACTIVE.inc();
        info!(session_id = %self.id, "Terminal session started");

        self.sender.send(OutboundMessage::ready(READY_MESSAGE)).await;

        let (queue_tx, mut queue_rx) = mpsc::channel(self.config.request_queue);
        let reader = tokio::spawn(read_requests(
            source,
            queue_tx,
            Arc::clone(&self.sender),
            self.token.clone(),
        ));
        let heartbeat = tokio::spawn(heartbeat(
            Arc::clone(&self.sender),
            self.config.heartbeat_interval,
            self.token.clone(),
        ));

        loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    debug!(session_id = %self.id, "Session cancelled");
                    break;
                }
                request = queue_rx.recv() => match request {
                    Some(request) => self.dispatch(request).await,
                    None => {
                        debug!(session_id = %self.id, "Request queue closed");
                        break;
                    }
                },
            }
        }

        self.controller.stop(false).await;
        self.token.cancel();
        self.join_task("reader", reader).await;
        self.join_task("heartbeat", heartbeat).await;

        metrics::SESSIONS_ACTIVE.dec();
        info!(session_id = %self.id, "Terminal session closed");
    }

    /// Route one decoded request
    async fn dispatch(&self, request: InboundRequest) {
        if request.is_noop() {
            return;
        }

        if request.is_pseudo_command() {
            self.handle_pseudo_command(request.trimmed_command()).await;
            return;
        }

        if request.is_clear() {
            self.sender.send(OutboundMessage::clear()).await;
            return;
        }

        match self.controller.start(&request) {
            Ok(()) => {}
            Err(StartError::Busy(running)) => {
                debug!(session_id = %self.id, running = %running, "Rejected request while busy");
                self.sender.send(OutboundMessage::status(BUSY_MESSAGE)).await;
            }
            Err(StartError::Invalid(e)) => {
                self.sender.send(OutboundMessage::error(e.to_string())).await;
            }
        }
    }

    async fn handle_pseudo_command(&self, command: &str) {
        let reply = match PseudoCommand::parse(command) {
            Some(PseudoCommand::Help) => OutboundMessage::stdout(HELP_TEXT),
            Some(PseudoCommand::Version) => OutboundMessage::stdout(commands::version_text()),
            Some(PseudoCommand::Status) => match self.controller.state() {
                CommandState::Idle => OutboundMessage::status("idle"),
                CommandState::Running(name) => OutboundMessage::status(format!("running: {}", name)),
            },
            Some(PseudoCommand::Stop) => {
                self.controller.stop(true).await;
                return;
            }
            None => OutboundMessage::error(format!("Unknown command: {}", command)),
        };
        self.sender.send(reply).await;
    }

    async fn join_task(&self, name: &str, handle: JoinHandle<()>) {
        let abort = handle.abort_handle();
        if tokio::time::timeout(self.config.shutdown_grace, handle)
            .await
            .is_err()
        {
            warn!(session_id = %self.id, "{} task did not stop in time, aborting", name);
            abort.abort();
        }
    }
}

/// Inbound Reader Task.
///
/// Decodes frames into requests and queues them for dispatch. Malformed
/// payloads are reported and skipped; a transport failure or close ends the
/// session.
async fn read_requests(
    mut source: Box<dyn FrameSource>,
    queue: mpsc::Sender<InboundRequest>,
    sender: Arc<OutputSender>,
    token: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            frame = source.next_frame() => frame,
        };

        let payload = match frame {
            None | Some(Ok(Frame::Close)) => {
                debug!("Peer closed the connection");
                break;
            }
            Some(Err(e)) => {
                warn!("Failed to read from terminal connection: {}", e);
                break;
            }
            Some(Ok(Frame::Ping)) => continue,
            Some(Ok(Frame::Text(text))) => text,
            Some(Ok(Frame::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(e) => {
                    sender
                        .send(OutboundMessage::error(format!("malformed request: {}", e)))
                        .await;
                    continue;
                }
            },
        };

        let request: InboundRequest = match serde_json::from_str(&payload) {
            Ok(request) => request,
            Err(e) => {
                debug!("Malformed terminal request: {}", e);
                sender
                    .send(OutboundMessage::error(format!("malformed request: {}", e)))
                    .await;
                continue;
            }
        };
        if request.is_noop() {
            continue;
        }

        tokio::select! {
            _ = token.cancelled() => break,
            queued = queue.send(request) => {
                if queued.is_err() {
                    break;
                }
            }
        }
    }

    token.cancel();
}

/// Heartbeat Task: one `time` message per period until cancelled
async fn heartbeat(sender: Arc<OutputSender>, period: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => sender.send(OutboundMessage::time()).await,
        }
    }
}
