//! hostbridge: a browser native-messaging host that streams text generation.
//!
//! The relay binary is what the browser launches. It spawns the worker binary
//! and translates between the browser's length-prefixed frames and the
//! worker's JSON lines. The worker validates requests, runs one generation at
//! a time and streams the answer back word by word.

pub mod answer;
pub mod bridge;
pub mod config;
pub mod generator;
pub mod logging;
pub mod relay;
pub mod session;
pub mod supervisor;
pub mod worker;

pub use answer::{AnswerExtractor, ChunkMode, Markers};
pub use bridge::{DecodeError, Framing, FramingError, JsonCodec, Reply, Request, RequestError};
pub use config::{BridgeConfig, ConfigError, GenerationConfig};
pub use generator::{ChunkStream, CommandGenerator, GenerationError, Generator, SetupError};
pub use relay::{RelayConfig, RelayError, run_relay};
pub use session::{CancellationToken, Session, SessionId, SessionOutcome, SessionRegistry};
pub use supervisor::{CommandSpawner, SpawnError, WorkerCommand, WorkerProcess, WorkerSpawner};
pub use worker::{WorkerConfig, WorkerError, run_worker};
