//! Bridge relay - the process the browser launches.
//!
//! Owns the worker subprocess and moves messages between the two legs:
//!
//! ```text
//! host stdin  --[u32 LE length + JSON]-->  relay  --[JSON line]-->  worker stdin
//! host stdout <--[u32 LE length + JSON]--  relay  <--[JSON line]--  worker stdout
//! ```
//!
//! Host EOF is the only shutdown trigger. The relay then terminates the
//! worker, drains what it already wrote, and sends a final `info` frame.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{
    AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, FramedRead, FramedWrite,
};

use crate::bridge::codec::{DEFAULT_MAX_FRAME_BYTES, Framing, FramingError, JsonCodec};
use crate::bridge::protocol::Reply;
use crate::session::CancellationToken;
use crate::supervisor::{CommandSpawner, SpawnError, WorkerCommand, WorkerProcess, WorkerSpawner};
use crate::worker::MALFORMED_INPUT_TEXT;

pub const EXITING_TEXT: &str = "Relay exiting";
pub const WORKER_UNAVAILABLE_TEXT: &str = "Error: worker unavailable";

pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub type HostWriter<W> = Arc<Mutex<FramedWrite<W, JsonCodec<Value>>>>;

#[derive(Clone)]
pub struct RelayConfig {
    pub command: WorkerCommand,
    pub max_frame_bytes: usize,
    /// How long the worker gets to exit after being terminated.
    pub shutdown_grace: Duration,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl RelayConfig {
    pub fn new(command: WorkerCommand) -> Self {
        Self {
            command,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            spawner: Arc::new(CommandSpawner),
        }
    }

    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}

impl std::fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConfig")
            .field("command", &self.command)
            .field("max_frame_bytes", &self.max_frame_bytes)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("failed to start worker: {0}")]
    Spawn(#[from] SpawnError),
    #[error("host channel failed: {0}")]
    Host(#[from] FramingError),
}

/// Relay between the host streams and a freshly spawned worker until host EOF.
pub async fn run_relay<R, W>(host_in: R, host_out: W, config: RelayConfig) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut worker = WorkerProcess::spawn(config.spawner.as_ref(), &config.command)?;
    let worker_in = worker.take_stdin().ok_or(SpawnError::MissingPipe("stdin"))?;
    let worker_out = worker.take_stdout().ok_or(SpawnError::MissingPipe("stdout"))?;
    let worker_pid = worker.id();

    let host_writer: HostWriter<W> = Arc::new(Mutex::new(FramedWrite::new(
        host_out,
        JsonCodec::with_framing(Framing::LengthPrefixed, config.max_frame_bytes),
    )));
    let stop = CancellationToken::new();
    let forwarder = tokio::spawn(forward_worker_output(
        worker_out,
        Arc::clone(&host_writer),
        stop.clone(),
        config.max_frame_bytes,
    ));

    let result =
        forward_host_input(host_in, worker_in, &host_writer, config.max_frame_bytes).await;
    match &result {
        Ok(()) => tracing::info!(pid = ?worker_pid, "Host closed input, stopping worker"),
        Err(e) => tracing::error!(pid = ?worker_pid, error = %e, "Host channel failed, stopping worker"),
    }

    worker.terminate();
    if let Err(e) = worker.join(config.shutdown_grace).await {
        tracing::warn!(error = %e, "Failed to reap worker");
    }

    // Output the worker wrote before exiting is still in the pipe and is read
    // ahead of the stop signal.
    stop.cancel();
    match forwarder.await {
        Ok(forwarded) => tracing::debug!(forwarded, "Worker output task finished"),
        Err(e) => tracing::warn!(error = %e, "Worker output task panicked"),
    }

    let farewell = host_writer.lock().await.send(Reply::info(EXITING_TEXT)).await;
    if let Err(e) = farewell {
        tracing::debug!(error = %e, "Could not send exit notice to host");
    }

    result.map_err(RelayError::Host)
}

/// Host frames to worker lines. Returns `Ok` on clean host EOF.
///
/// A worker that stopped reading does not end the relay: every later message
/// is answered with an `error` frame until the host closes.
pub async fn forward_host_input<R, WI, W>(
    host_in: R,
    worker_in: WI,
    host_writer: &HostWriter<W>,
    max_frame_bytes: usize,
) -> Result<(), FramingError>
where
    R: AsyncRead + Unpin,
    WI: AsyncWrite + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut frames = FramedRead::new(
        host_in,
        JsonCodec::<Value>::with_framing(Framing::LengthPrefixed, max_frame_bytes),
    );
    let mut worker_lines = Some(FramedWrite::new(
        worker_in,
        JsonCodec::<Value>::with_framing(Framing::Lines, max_frame_bytes),
    ));

    while let Some(frame) = frames.next().await {
        let message = match frame? {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping undecodable host frame");
                reply(host_writer, Reply::error(MALFORMED_INPUT_TEXT)).await?;
                continue;
            }
        };

        let Some(sink) = worker_lines.as_mut() else {
            reply(host_writer, Reply::error(WORKER_UNAVAILABLE_TEXT)).await?;
            continue;
        };
        tracing::trace!(kind = ?message.get("type"), "Forwarding host message");
        if let Err(e) = sink.send(message).await {
            tracing::error!(error = %e, "Worker input closed");
            worker_lines = None;
            reply(host_writer, Reply::error(WORKER_UNAVAILABLE_TEXT)).await?;
        }
    }
    Ok(())
}

/// Worker lines to host frames until worker EOF or `stop`. Returns the number
/// of forwarded messages.
pub async fn forward_worker_output<R, W>(
    worker_out: R,
    host_writer: HostWriter<W>,
    stop: CancellationToken,
    max_line_bytes: usize,
) -> usize
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = FramedRead::new(worker_out, WorkerLines::new(max_line_bytes));
    let mut forwarded = 0;

    loop {
        let line = tokio::select! {
            biased;
            line = lines.next() => line,
            _ = stop.cancelled() => break,
        };
        let bytes = match line {
            Some(Ok(WorkerLine::Line(bytes))) => bytes,
            Some(Ok(WorkerLine::Overlong)) => {
                tracing::warn!(max_line_bytes, "Dropping overlong worker output line");
                continue;
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Worker output unreadable, no longer forwarding");
                break;
            }
            None => break,
        };

        let Some(message) = parse_worker_line(&bytes) else {
            tracing::debug!(len = bytes.len(), "Dropping worker output that is not a message");
            continue;
        };
        if let Err(e) = host_writer.lock().await.send(message).await {
            tracing::error!(error = %e, "Host output closed");
            break;
        }
        forwarded += 1;
    }

    tracing::debug!(forwarded, "Stopped forwarding worker output");
    forwarded
}

enum WorkerLine {
    Line(Bytes),
    /// A line past the length limit. Its bytes are skipped up to the next newline.
    Overlong,
}

/// Newline splitter for worker stdout that survives overlong lines.
struct WorkerLines {
    inner: AnyDelimiterCodec,
}

impl WorkerLines {
    fn new(max_line_bytes: usize) -> Self {
        Self {
            inner: AnyDelimiterCodec::new_with_max_length(
                b"\n".to_vec(),
                Vec::new(),
                max_line_bytes,
            ),
        }
    }

    fn map(
        line: Result<Option<Bytes>, AnyDelimiterCodecError>,
    ) -> std::io::Result<Option<WorkerLine>> {
        match line {
            Ok(line) => Ok(line.map(WorkerLine::Line)),
            // the inner codec keeps discarding until the next delimiter
            Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => Ok(Some(WorkerLine::Overlong)),
            Err(AnyDelimiterCodecError::Io(e)) => Err(e),
        }
    }
}

impl Decoder for WorkerLines {
    type Item = WorkerLine;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<WorkerLine>, Self::Error> {
        Self::map(self.inner.decode(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<WorkerLine>, Self::Error> {
        Self::map(self.inner.decode_eof(src))
    }
}

/// A worker line is forwarded only if it is a JSON object carrying `type`.
fn parse_worker_line(bytes: &[u8]) -> Option<Value> {
    let text = std::str::from_utf8(bytes).ok()?.trim();
    if text.is_empty() {
        return None;
    }
    let value: Value = serde_json::from_str(text).ok()?;
    value.get("type")?;
    Some(value)
}

async fn reply<W>(host_writer: &HostWriter<W>, reply: Reply) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
{
    host_writer.lock().await.send(reply).await
}
