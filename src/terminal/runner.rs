//! Process Runner
//!
//! Executes one validated command to completion under a deadline, in one
//! of two modes:
//!
//! - **buffered**: stdout and stderr are collected and delivered once at exit
//! - **streaming**: every complete line is delivered as soon as it is read
//!
//! Both modes spawn the program directly (never through a shell), with a
//! null stdin, piped output and `kill_on_drop`, and both honour two stop
//! conditions: the per-command deadline and the caller's cancellation token.
//! On either, the child is killed before returning.

use super::allowlist::ValidatedCommand;
use super::error::RunError;
use super::protocol::{MessageKind, OutboundMessage};
use super::sender::MessageSink;
use super::timeout::CommandTimeout;
use futures::StreamExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command as TokioCommand};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the line queue between the reader tasks and delivery
const DEFAULT_STREAM_CAPACITY: usize = 64;

/// Longest single line accepted in streaming mode (512 KiB)
const DEFAULT_MAX_LINE_BYTES: usize = 512 * 1024;

/// Largest buffered-mode payload per stream (1 MiB)
const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Configuration for command execution
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Per-command deadline (default: 30 seconds)
    pub timeout: CommandTimeout,

    /// Bounded queue size between stream readers and delivery
    pub stream_capacity: usize,

    /// Maximum line length in streaming mode
    pub max_line_bytes: usize,

    /// Maximum bytes per stream in buffered mode, truncated beyond
    pub max_output_bytes: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            timeout: CommandTimeout::default(),
            stream_capacity: DEFAULT_STREAM_CAPACITY,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

impl RunnerConfig {
    /// Default config with a custom deadline
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: CommandTimeout::new(timeout),
            ..Default::default()
        }
    }
}

/// How a wait on the child ended
enum Outcome<T> {
    Finished(T),
    TimedOut,
    Cancelled,
}

/// Runs validated commands as isolated child processes
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    config: RunnerConfig,
}

impl ProcessRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    /// Run a command and deliver its whole output once it exits.
    ///
    /// Emits at most one `stdout` and one `stderr` message (each skipped if
    /// empty). Output is delivered even when the exit status is non-zero;
    /// the exit failure is then returned so the caller can report it.
    ///
    /// # Errors
    ///
    /// - [`RunError::Spawn`] if the program cannot be started
    /// - [`RunError::TimedOut`] if the deadline passes (the child is killed)
    /// - [`RunError::Cancelled`] if `cancel` fires (the child is killed)
    /// - [`RunError::Exited`] on a non-zero exit status
    pub async fn run_buffered(
        &self,
        command: &ValidatedCommand,
        cancel: &CancellationToken,
        sink: &dyn MessageSink,
    ) -> Result<(), RunError> {
        let deadline = self.config.timeout.start();
        let mut child = spawn(command)?;
        info!(command = %command, mode = "buffered", "Command started");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let cap = self.config.max_output_bytes;

        let outcome = tokio::select! {
            result = async {
                tokio::join!(read_capped(stdout, cap), read_capped(stderr, cap), child.wait())
            } => Outcome::Finished(result),
            _ = deadline.expired() => Outcome::TimedOut,
            _ = cancel.cancelled() => Outcome::Cancelled,
        };

        let (stdout, stderr, status) = match outcome {
            Outcome::Finished((Ok(stdout), Ok(stderr), Ok(status))) => (stdout, stderr, status),
            Outcome::Finished((stdout, stderr, status)) => {
                terminate(&mut child).await;
                let err = stdout.err().or(stderr.err()).or(status.err());
                return Err(RunError::Output(err.unwrap_or_else(|| {
                    std::io::Error::other("output collection failed")
                })));
            }
            Outcome::TimedOut => {
                terminate(&mut child).await;
                warn!(command = %command, "Command timed out after {:?}", self.config.timeout.duration());
                return Err(RunError::TimedOut(command.name().to_string()));
            }
            Outcome::Cancelled => {
                terminate(&mut child).await;
                debug!(command = %command, "Command cancelled");
                return Err(RunError::Cancelled);
            }
        };

        let stdout = truncate_output(String::from_utf8_lossy(&stdout).into_owned(), cap);
        let stderr = truncate_output(String::from_utf8_lossy(&stderr).into_owned(), cap);

        // Deliver both streams concurrently so one slow write does not
        // hold the other behind it.
        tokio::join!(
            async {
                if !stdout.is_empty() {
                    sink.deliver(OutboundMessage::stdout(stdout)).await;
                }
            },
            async {
                if !stderr.is_empty() {
                    sink.deliver(OutboundMessage::stderr(stderr)).await;
                }
            },
        );

        finish(command, status)
    }

    /// Run a command and deliver each output line as it is produced.
    ///
    /// stdout and stderr are read by two independent tasks into one bounded
    /// queue. Lines within one stream stay ordered; lines across the two
    /// streams are not ordered relative to each other.
    ///
    /// Returns only after both readers have finished, the queue is drained
    /// and the child has exited. On timeout or cancellation, lines already
    /// queued are still delivered before the error is returned.
    pub async fn run_streaming(
        &self,
        command: &ValidatedCommand,
        cancel: &CancellationToken,
        sink: &dyn MessageSink,
    ) -> Result<(), RunError> {
        let deadline = self.config.timeout.start();
        let mut child = spawn(command)?;
        info!(command = %command, mode = "streaming", "Command started");

        let (queue, mut lines) = mpsc::channel(self.config.stream_capacity.max(1));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(stream_lines(
                MessageKind::Stdout,
                stdout,
                queue.clone(),
                self.config.max_line_bytes,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(stream_lines(
                MessageKind::Stderr,
                stderr,
                queue.clone(),
                self.config.max_line_bytes,
            )));
        }
        drop(queue);

        let expired = deadline.expired();
        tokio::pin!(expired);

        // Forward lines until both readers hang up.
        let interrupted = loop {
            let next = tokio::select! {
                line = lines.recv() => Outcome::Finished(line),
                _ = &mut expired => Outcome::TimedOut,
                _ = cancel.cancelled() => Outcome::Cancelled,
            };
            match next {
                Outcome::Finished(Some(message)) => sink.deliver(message).await,
                Outcome::Finished(None) => break None,
                Outcome::TimedOut => break Some(Outcome::<()>::TimedOut),
                Outcome::Cancelled => break Some(Outcome::<()>::Cancelled),
            }
        };

        if let Some(interrupt) = interrupted {
            terminate(&mut child).await;
            lines.close();
            while let Some(message) = lines.recv().await {
                sink.deliver(message).await;
            }
            // A grandchild may still hold a pipe open; do not wait on it.
            for reader in &readers {
                reader.abort();
            }
            return Err(self.interrupt_error(command, interrupt));
        }

        for reader in readers {
            if let Err(e) = reader.await {
                warn!(command = %command, "Output reader failed: {}", e);
            }
        }

        let waited = tokio::select! {
            status = child.wait() => Outcome::Finished(status),
            _ = &mut expired => Outcome::TimedOut,
            _ = cancel.cancelled() => Outcome::Cancelled,
        };

        match waited {
            Outcome::Finished(Ok(status)) => finish(command, status),
            Outcome::Finished(Err(e)) => Err(RunError::Output(e)),
            Outcome::TimedOut => {
                terminate(&mut child).await;
                Err(self.interrupt_error(command, Outcome::TimedOut))
            }
            Outcome::Cancelled => {
                terminate(&mut child).await;
                Err(self.interrupt_error(command, Outcome::Cancelled))
            }
        }
    }

    fn interrupt_error(&self, command: &ValidatedCommand, interrupt: Outcome<()>) -> RunError {
        match interrupt {
            Outcome::TimedOut => {
                warn!(command = %command, "Command timed out after {:?}", self.config.timeout.duration());
                RunError::TimedOut(command.name().to_string())
            }
            _ => {
                debug!(command = %command, "Command cancelled");
                RunError::Cancelled
            }
        }
    }
}

fn spawn(command: &ValidatedCommand) -> Result<Child, RunError> {
    TokioCommand::new(command.name())
        .args(command.args())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            warn!(command = %command, "Failed to spawn process: {}", e);
            RunError::Spawn(e)
        })
}

fn finish(command: &ValidatedCommand, status: ExitStatus) -> Result<(), RunError> {
    if status.success() {
        info!(command = %command, "Command finished");
        Ok(())
    } else {
        warn!(command = %command, "Command failed: {}", status);
        Err(RunError::Exited(status))
    }
}

/// Kill the child and reap it. Errors mean it already exited.
async fn terminate(child: &mut Child) {
    if let Err(e) = child.kill().await {
        debug!("Child already gone: {}", e);
    }
}

/// Keep at most `max_bytes + 1` bytes of a pipe and discard the rest.
///
/// The extra byte tells the caller the stream overflowed. Reading carries
/// on past the cap so a chatty child never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(pipe: Option<R>, max_bytes: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let limit = u64::try_from(max_bytes).unwrap_or(u64::MAX).saturating_add(1);
        (&mut pipe).take(limit).read_to_end(&mut buf).await?;
        if buf.len() > max_bytes {
            tokio::io::copy(&mut pipe, &mut tokio::io::sink()).await?;
        }
    }
    Ok(buf)
}

/// Reader task: one message per complete line until EOF or a dead queue
async fn stream_lines<R>(
    kind: MessageKind,
    pipe: R,
    queue: mpsc::Sender<OutboundMessage>,
    max_line_bytes: usize,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(pipe, LinesCodec::new_with_max_length(max_line_bytes));
    while let Some(line) = lines.next().await {
        let message = match line {
            Ok(line) => OutboundMessage::new(kind, line),
            Err(e) => {
                let _ = queue
                    .send(OutboundMessage::error(format!("{} stream output error: {}", kind, e)))
                    .await;
                return;
            }
        };
        if queue.send(message).await.is_err() {
            return;
        }
    }
}

/// Truncate to at most `max_len` bytes on a char boundary, marking the cut
fn truncate_output(mut s: String, max_len: usize) -> String {
    if s.len() > max_len {
        let mut cut = max_len.saturating_sub(3);
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push_str("...");
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::allowlist::CommandAllowlist;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collector {
        messages: Mutex<Vec<OutboundMessage>>,
    }

    impl Collector {
        fn take(&self) -> Vec<OutboundMessage> {
            std::mem::take(&mut *self.messages.lock().unwrap())
        }
    }

    #[async_trait]
    impl MessageSink for Collector {
        async fn deliver(&self, message: OutboundMessage) {
            self.messages.lock().unwrap().push(message);
        }
    }

    fn validated(name: &str, args: &[&str]) -> ValidatedCommand {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        CommandAllowlist::with_commands(["echo", "ls", "sleep", "cat", "seq", "sh"])
            .validate(name, &args)
            .unwrap()
    }

    #[tokio::test]
    async fn test_buffered_echo() {
        let runner = ProcessRunner::default();
        let sink = Collector::default();
        runner
            .run_buffered(&validated("echo", &["hello world"]), &CancellationToken::new(), &sink)
            .await
            .unwrap();

        let messages = sink.take();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, MessageKind::Stdout);
        assert_eq!(messages[0].data, "hello world\n");
    }

    #[tokio::test]
    async fn test_buffered_failure_keeps_stderr() {
        let runner = ProcessRunner::default();
        let sink = Collector::default();
        let result = runner
            .run_buffered(
                &validated("ls", &["/definitely/not/a/real/path"]),
                &CancellationToken::new(),
                &sink,
            )
            .await;

        assert!(matches!(result, Err(RunError::Exited(_))));
        let messages = sink.take();
        assert!(messages.iter().any(|m| m.kind == MessageKind::Stderr));
        assert!(messages.iter().all(|m| m.kind != MessageKind::Stdout));
    }

    #[tokio::test]
    async fn test_buffered_timeout() {
        let runner = ProcessRunner::new(RunnerConfig::with_timeout(Duration::from_millis(200)));
        let sink = Collector::default();
        let started = std::time::Instant::now();
        let result = runner
            .run_buffered(&validated("sleep", &["10"]), &CancellationToken::new(), &sink)
            .await;

        assert!(matches!(result, Err(RunError::TimedOut(ref name)) if name == "sleep"));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(sink.take().is_empty());
    }

    #[tokio::test]
    async fn test_buffered_cancellation() {
        let runner = ProcessRunner::default();
        let sink = Collector::default();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = runner
            .run_buffered(&validated("sleep", &["10"]), &cancel, &sink)
            .await;
        assert!(matches!(result, Err(RunError::Cancelled)));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let runner = ProcessRunner::default();
        let sink = Collector::default();
        let command = CommandAllowlist::with_commands(["hostconsole-no-such-binary"])
            .validate("hostconsole-no-such-binary", &[])
            .unwrap();

        let result = runner
            .run_buffered(&command, &CancellationToken::new(), &sink)
            .await;
        let err = result.unwrap_err();
        assert!(matches!(err, RunError::Spawn(_)));
        assert!(err.to_string().starts_with("failed to start command"));
    }

    #[tokio::test]
    async fn test_streaming_echo_single_line() {
        let runner = ProcessRunner::default();
        let sink = Collector::default();
        runner
            .run_streaming(&validated("echo", &["hello"]), &CancellationToken::new(), &sink)
            .await
            .unwrap();

        let messages = sink.take();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, MessageKind::Stdout);
        assert_eq!(messages[0].data, "hello");
    }

    #[tokio::test]
    async fn test_streaming_preserves_line_order() {
        let runner = ProcessRunner::new(RunnerConfig {
            stream_capacity: 4,
            ..Default::default()
        });
        let sink = Collector::default();
        runner
            .run_streaming(&validated("seq", &["500"]), &CancellationToken::new(), &sink)
            .await
            .unwrap();

        let lines: Vec<String> = sink.take().into_iter().map(|m| m.data).collect();
        let expected: Vec<String> = (1..=500).map(|i| i.to_string()).collect();
        assert_eq!(lines, expected);
    }

    #[tokio::test]
    async fn test_streaming_timeout_flushes_earlier_output() {
        let runner = ProcessRunner::new(RunnerConfig::with_timeout(Duration::from_millis(300)));
        let sink = Collector::default();
        // The allow-list forbids `;`, so build the script-like command directly.
        let command = ValidatedCommand::unchecked("sh", &["-c", "echo early; sleep 10"]);
        let result = runner
            .run_streaming(&command, &CancellationToken::new(), &sink)
            .await;

        assert!(matches!(result, Err(RunError::TimedOut(_))));
        let messages = sink.take();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].data, "early");
    }

    #[tokio::test]
    async fn test_streaming_cancellation() {
        let runner = ProcessRunner::default();
        let sink = Collector::default();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let result = runner
            .run_streaming(&validated("sleep", &["10"]), &cancel, &sink)
            .await;
        assert!(matches!(result, Err(RunError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_streaming_line_too_long() {
        let runner = ProcessRunner::new(RunnerConfig {
            max_line_bytes: 8,
            ..Default::default()
        });
        let sink = Collector::default();
        let _ = runner
            .run_streaming(
                &validated("echo", &["this line is longer than eight bytes"]),
                &CancellationToken::new(),
                &sink,
            )
            .await;

        let messages = sink.take();
        assert!(messages
            .iter()
            .any(|m| m.kind == MessageKind::Error && m.data.starts_with("stdout stream output error")));
    }

    #[tokio::test]
    async fn test_buffered_output_is_capped() {
        let runner = ProcessRunner::new(RunnerConfig {
            max_output_bytes: 1024,
            ..Default::default()
        });
        let sink = Collector::default();
        runner
            .run_buffered(&validated("seq", &["100000"]), &CancellationToken::new(), &sink)
            .await
            .unwrap();

        let messages = sink.take();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, MessageKind::Stdout);
        assert!(messages[0].data.len() <= 1024);
        assert!(messages[0].data.starts_with("1\n2\n3\n"));
        assert!(messages[0].data.ends_with("..."));
    }

    /// Resident set size of this process in KiB
    #[cfg(target_os = "linux")]
    fn resident_kib() -> u64 {
        let status = std::fs::read_to_string("/proc/self/status").unwrap();
        status
            .lines()
            .find_map(|line| line.strip_prefix("VmRSS:"))
            .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse().ok())
            .unwrap()
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_buffered_endless_output_stays_bounded() {
        let runner = ProcessRunner::new(RunnerConfig {
            max_output_bytes: 64 * 1024,
            ..RunnerConfig::with_timeout(Duration::from_secs(1))
        });
        let sink = Collector::default();
        let before = resident_kib();

        let result = runner
            .run_buffered(&validated("cat", &["/dev/zero"]), &CancellationToken::new(), &sink)
            .await;

        assert!(matches!(result, Err(RunError::TimedOut(ref name)) if name == "cat"));
        assert!(sink.take().is_empty());
        let grown_mib = resident_kib().saturating_sub(before) / 1024;
        assert!(grown_mib < 64, "buffered read grew by {} MiB", grown_mib);
    }

    #[test]
    fn test_truncate_output() {
        assert_eq!(truncate_output("hello".to_string(), 10), "hello");
        assert_eq!(truncate_output("hello world".to_string(), 5), "he...");
        assert_eq!(truncate_output("".to_string(), 10), "");
        // Never splits a multi-byte character
        let cut = truncate_output("日志日志日志".to_string(), 7);
        assert!(cut.ends_with("..."));
        assert!(cut.len() <= 7);
    }

    #[test]
    fn test_runner_config_defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.timeout.duration(), Duration::from_secs(30));
        assert_eq!(config.stream_capacity, 64);
        assert_eq!(config.max_line_bytes, 512 * 1024);

        let config = RunnerConfig::with_timeout(Duration::from_secs(5));
        assert_eq!(config.timeout.duration(), Duration::from_secs(5));
    }
}
