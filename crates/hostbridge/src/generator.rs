//! Generation interface consumed by the worker.
//!
//! The model itself lives behind [`Generator`]. The worker calls `setup` once
//! at start, then `generate` once per accepted request and reads the returned
//! chunk stream until the answer closes, the stream ends, or the session is
//! cancelled. Dropping the stream must release whatever produces it.

use std::process::Stdio;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, FramedRead};

use crate::answer::ChunkMode;

/// Placeholder in command arguments replaced by the prompt.
pub const PROMPT_PLACEHOLDER: &str = "{prompt}";

pub type ChunkStream = BoxStream<'static, Result<String, GenerationError>>;

/// Setup phase errors.
///
/// These occur while the generator loads, before any request is dispatched.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    /// The model or its runtime could not be found or loaded.
    #[error("failed to load generator: {message}")]
    Load { message: String },

    /// Loading succeeded but the generator is misconfigured.
    #[error("invalid generator configuration: {message}")]
    Config { message: String },
}

impl SetupError {
    pub fn load(message: impl Into<String>) -> Self {
        Self::Load {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

/// Failure inside a single generation.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("failed to start generator: {0}")]
    Start(#[source] std::io::Error),

    #[error("generator output error: {0}")]
    Io(#[from] std::io::Error),

    #[error("generator exited with {0}")]
    Exited(String),

    #[error("{0}")]
    Failed(String),
}

/// The text-generation collaborator.
#[async_trait::async_trait]
pub trait Generator: Send + Sync + 'static {
    /// Load the model. Called once before any request is dispatched.
    async fn setup(&self) -> Result<(), SetupError> {
        Ok(())
    }

    /// Start generating for `prompt`.
    fn generate(&self, prompt: &str) -> Result<ChunkStream, GenerationError>;

    fn chunk_mode(&self) -> ChunkMode {
        ChunkMode::Cumulative
    }
}

/// Generator that runs an external program per request and streams its stdout.
///
/// The prompt is substituted into any argument containing `{prompt}`; when no
/// argument does, it is written to the program's stdin instead. The process
/// is killed when the stream is dropped.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    program: String,
    args: Vec<String>,
    mode: ChunkMode,
}

impl CommandGenerator {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            mode: ChunkMode::Incremental,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set when the program reprints its whole output on every flush.
    pub fn with_chunk_mode(mut self, mode: ChunkMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn takes_prompt_as_arg(&self) -> bool {
        self.args.iter().any(|a| a.contains(PROMPT_PLACEHOLDER))
    }
}

#[async_trait::async_trait]
impl Generator for CommandGenerator {
    async fn setup(&self) -> Result<(), SetupError> {
        if self.program.is_empty() {
            return Err(SetupError::config("no generator command configured"));
        }
        let path = std::path::Path::new(&self.program);
        if path.components().count() > 1 && !path.exists() {
            return Err(SetupError::load(format!("{} does not exist", self.program)));
        }
        tracing::info!(program = %self.program, args = self.args.len(), "Command generator ready");
        Ok(())
    }

    fn generate(&self, prompt: &str) -> Result<ChunkStream, GenerationError> {
        let via_arg = self.takes_prompt_as_arg();
        let args = self.args.iter().map(|a| a.replace(PROMPT_PLACEHOLDER, prompt));

        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(if via_arg { Stdio::null() } else { Stdio::piped() })
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(GenerationError::Start)?;
        tracing::debug!(program = %self.program, pid = ?child.id(), "Generator process started");

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = prompt.to_string();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                    tracing::warn!(error = %e, "Failed to write prompt to generator");
                }
                // stdin dropped here so the program sees EOF
            });
        }

        let stdout = child.stdout.take().ok_or_else(|| {
            GenerationError::Start(std::io::Error::other("generator stdout not captured"))
        })?;

        let chunks = FramedRead::new(stdout, Utf8Chunks).map_err(GenerationError::Io);
        let exit = stream::once(async move {
            let failure: Option<Result<String, GenerationError>> = match child.wait().await {
                Ok(status) if status.success() => None,
                Ok(status) => Some(Err(GenerationError::Exited(status.to_string()))),
                Err(e) => Some(Err(GenerationError::Io(e))),
            };
            failure
        })
        .filter_map(futures::future::ready);

        Ok(chunks.chain(exit).boxed())
    }

    fn chunk_mode(&self) -> ChunkMode {
        self.mode
    }
}

/// Splits a byte stream into UTF-8 strings without cutting a code point.
struct Utf8Chunks;

impl Decoder for Utf8Chunks {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        let valid = match std::str::from_utf8(&src[..]) {
            Ok(s) => s.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(e) => return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        };
        if valid == 0 {
            return Ok(None);
        }
        let bytes = src.split_to(valid);
        Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
    }
}
