//! Worker dispatcher - runs inside the worker subprocess.
//!
//! Reads requests from the input channel, validates them and runs each
//! accepted request as a generation session on its own task. A new request
//! cancels whatever session is still streaming before the new one starts.
//!
//! Replies go through one shared writer. A session checks its cancellation
//! token while holding the writer lock, right before each send, so once a
//! newer session has started writing nothing from an older one follows.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::answer::{AnswerExtractor, Markers};
use crate::bridge::codec::{DEFAULT_MAX_FRAME_BYTES, DecodeError, Framing, FramingError, JsonCodec};
use crate::bridge::protocol::{Reply, Request};
use crate::generator::Generator;
use crate::session::{
    CancellationToken, Session, SessionCompletion, SessionOutcome, SessionRegistry,
};

pub const READY_TEXT: &str = "Worker ready";
pub const EXITING_TEXT: &str = "Worker exiting";
pub const MALFORMED_INPUT_TEXT: &str = "Error in parsing the input";

/// Default pause after each streamed word.
pub const DEFAULT_PACE: Duration = Duration::from_millis(100);

type ReplyWriter<W> = Arc<Mutex<FramedWrite<W, JsonCodec<Reply>>>>;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub markers: Markers,
    /// Pause after each emitted word, for a steady streaming cadence.
    pub pace: Duration,
    /// Framing on both of the worker's streams.
    pub framing: Framing,
    pub max_frame_bytes: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            markers: Markers::default(),
            pace: DEFAULT_PACE,
            framing: Framing::Lines,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl WorkerConfig {
    pub fn with_markers(mut self, markers: Markers) -> Self {
        self.markers = markers;
        self
    }

    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = pace;
        self
    }

    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("input channel failed: {0}")]
    Input(#[source] FramingError),
    #[error("output channel failed: {0}")]
    Output(#[source] FramingError),
}

/// Run the worker event loop until the input closes or `shutdown` fires.
///
/// Setup failure is reported to the host as an `error` reply and is not an
/// `Err`: the worker did its job by telling the host why it cannot serve.
pub async fn run_worker<R, W>(
    generator: Arc<dyn Generator>,
    config: WorkerConfig,
    input: R,
    output: W,
    shutdown: CancellationToken,
) -> Result<(), WorkerError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut reader = FramedRead::new(
        input,
        JsonCodec::<Value>::with_framing(config.framing, config.max_frame_bytes),
    );
    let writer: ReplyWriter<W> = Arc::new(Mutex::new(FramedWrite::new(
        output,
        JsonCodec::with_framing(config.framing, config.max_frame_bytes),
    )));

    tracing::info!("Worker starting setup");
    if let Err(e) = generator.setup().await {
        tracing::error!(error = %e, "Setup failed");
        send(&writer, Reply::error(format!("Setup failed: {e}"))).await?;
        return Ok(());
    }
    send(&writer, Reply::info(READY_TEXT)).await?;

    let (completion_tx, mut completion_rx) = mpsc::unbounded_channel::<SessionCompletion>();
    let mut dispatcher = Dispatcher {
        generator,
        config,
        writer: Arc::clone(&writer),
        registry: SessionRegistry::new(),
        completion_tx,
        shutdown: shutdown.clone(),
    };

    let result = loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                tracing::info!("Shutdown requested");
                break Ok(());
            }

            Some(completion) = completion_rx.recv() => {
                dispatcher.complete(completion);
            }

            msg = reader.next() => {
                match msg {
                    Some(Ok(frame)) => {
                        if let Err(e) = dispatcher.handle(frame).await {
                            tracing::error!(error = %e, "Output channel failed");
                            break Err(e);
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Input channel error");
                        break Err(WorkerError::Input(e));
                    }
                    None => {
                        tracing::info!("Input channel closed");
                        break Ok(());
                    }
                }
            }
        }
    };

    dispatcher.registry.shutdown().await;
    if !matches!(result, Err(WorkerError::Output(_))) {
        send(&writer, Reply::info(EXITING_TEXT)).await?;
    }
    tracing::info!("Worker exiting");
    result
}

/// Per-process dispatch state: the loaded generator and the live sessions.
struct Dispatcher<W> {
    generator: Arc<dyn Generator>,
    config: WorkerConfig,
    writer: ReplyWriter<W>,
    registry: SessionRegistry,
    completion_tx: mpsc::UnboundedSender<SessionCompletion>,
    shutdown: CancellationToken,
}

impl<W> Dispatcher<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Validate one decoded frame and start a session for it. Only an output
    /// failure is returned; everything else is answered on the channel.
    async fn handle(&mut self, frame: Result<Value, DecodeError>) -> Result<(), WorkerError> {
        let message = match frame {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed request");
                return send(&self.writer, Reply::error(MALFORMED_INPUT_TEXT)).await;
            }
        };
        let request = match Request::from_message(&message) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = ?e, "Rejected request");
                return send(&self.writer, Reply::error(e.to_string())).await;
            }
        };

        let superseded = self.registry.cancel_all();
        if superseded > 0 {
            tracing::debug!(superseded, "Cancelled in-flight session");
        }

        let session = Session::child_of(&self.shutdown);
        let id = session.id();
        tracing::info!(session = %id, kind = request.kind(), "Starting session");

        let task = tokio::spawn(run_session(
            session.clone(),
            request,
            Arc::clone(&self.generator),
            self.config.clone(),
            Arc::clone(&self.writer),
            self.completion_tx.clone(),
        ));
        self.registry.register(session, task);
        Ok(())
    }

    fn complete(&mut self, completion: SessionCompletion) {
        self.registry.complete(completion.id);
        match &completion.outcome {
            SessionOutcome::Failed(error) => {
                tracing::warn!(session = %completion.id, %error, "Session failed");
            }
            outcome => {
                tracing::debug!(session = %completion.id, outcome = outcome.as_str(), "Session finished");
            }
        }
    }
}

async fn send<W>(writer: &ReplyWriter<W>, reply: Reply) -> Result<(), WorkerError>
where
    W: AsyncWrite + Unpin,
{
    let mut w = writer.lock().await;
    w.send(reply).await.map_err(WorkerError::Output)
}

/// Send unless the session has been cancelled. Returns false when suppressed.
async fn emit<W>(
    writer: &ReplyWriter<W>,
    token: &CancellationToken,
    reply: Reply,
) -> Result<bool, FramingError>
where
    W: AsyncWrite + Unpin,
{
    let mut w = writer.lock().await;
    if token.is_cancelled() {
        return Ok(false);
    }
    w.send(reply).await?;
    Ok(true)
}

async fn run_session<W>(
    session: Session,
    request: Request,
    generator: Arc<dyn Generator>,
    config: WorkerConfig,
    writer: ReplyWriter<W>,
    completion_tx: mpsc::UnboundedSender<SessionCompletion>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let id = session.id();
    let outcome = stream_answer(&session, &request, generator.as_ref(), &config, &writer).await;

    if let SessionOutcome::Failed(error) = &outcome {
        let token = session.cancel_token();
        if let Err(e) = emit(&writer, &token, Reply::error(format!("Error: {error}"))).await {
            tracing::error!(session = %id, error = %e, "Failed to report session error");
        }
    }

    let _ = completion_tx.send(SessionCompletion { id, outcome });
}

async fn stream_answer<W>(
    session: &Session,
    request: &Request,
    generator: &dyn Generator,
    config: &WorkerConfig,
    writer: &ReplyWriter<W>,
) -> SessionOutcome
where
    W: AsyncWrite + Unpin,
{
    let token = session.cancel_token();
    let prompt = request.prompt();
    tracing::debug!(session = %session.id(), prompt_len = prompt.len(), "Generating");

    let mut chunks = match generator.generate(&prompt) {
        Ok(chunks) => chunks,
        Err(e) => return SessionOutcome::Failed(e.to_string()),
    };
    let mut extractor = AnswerExtractor::new(config.markers.clone(), generator.chunk_mode());
    let mut emitted = 0;

    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => return SessionOutcome::Cancelled,
            next = chunks.next() => next,
        };

        let words = match next {
            Some(Ok(chunk)) => extractor.push(&chunk),
            Some(Err(e)) => return SessionOutcome::Failed(e.to_string()),
            None => extractor.finish(),
        };

        for word in words {
            let is_last = word.is_last;
            match emit(writer, &token, Reply::chunk(word.text, is_last)).await {
                Ok(true) => emitted += 1,
                Ok(false) => return SessionOutcome::Cancelled,
                Err(e) => return SessionOutcome::Failed(format!("output channel failed: {e}")),
            }
            if is_last {
                return SessionOutcome::Completed { words: emitted };
            }
            if !config.pace.is_zero() {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return SessionOutcome::Cancelled,
                    _ = tokio::time::sleep(config.pace) => {}
                }
            }
        }
    }
}
