//! File configuration shared by the relay and the worker.
//!
//! Resolution order (first hit wins):
//! 1. `--config` on the command line
//! 2. `HOSTBRIDGE_CONFIG`
//! 3. `hostbridge.toml` next to the running executable
//! 4. Compiled defaults
//!
//! ```toml
//! [relay]
//! worker = "/opt/hostbridge/hostbridge-worker"
//! shutdown_grace_ms = 5000
//!
//! [generation]
//! pace_ms = 100
//! chunk_mode = "incremental"
//! command = { program = "/opt/llm/generate", args = ["--prompt", "{prompt}"] }
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::answer::{ChunkMode, DEFAULT_END_MARKER, DEFAULT_START_MARKER, Markers};
use crate::bridge::codec::DEFAULT_MAX_FRAME_BYTES;
use crate::generator::CommandGenerator;
use crate::relay::DEFAULT_SHUTDOWN_GRACE;
use crate::supervisor::WorkerCommand;
use crate::worker::{DEFAULT_PACE, WorkerConfig};

pub const CONFIG_ENV: &str = "HOSTBRIDGE_CONFIG";
pub const CONFIG_FILE_NAME: &str = "hostbridge.toml";
pub const WORKER_BINARY: &str = "hostbridge-worker";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file {} not found", .path.display())]
    NotFound { path: PathBuf },

    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config in {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub relay: RelaySettings,
    pub generation: GenerationConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Worker executable. Defaults to `hostbridge-worker` beside the relay.
    pub worker: Option<PathBuf>,
    pub worker_args: Vec<String>,
    pub max_frame_bytes: usize,
    pub shutdown_grace_ms: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            worker: None,
            worker_args: Vec::new(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE.as_millis() as u64,
        }
    }
}

impl RelaySettings {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// The configured worker, else the sibling of the current executable.
    pub fn worker_program(&self) -> PathBuf {
        if let Some(worker) = &self.worker {
            return worker.clone();
        }
        match exe_dir() {
            Some(dir) => dir.join(worker_file_name()),
            None => PathBuf::from(worker_file_name()),
        }
    }

    pub fn worker_command(&self) -> WorkerCommand {
        WorkerCommand::new(self.worker_program()).with_args(self.worker_args.iter().cloned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Empty means the answer starts with the first generated word.
    pub start_marker: String,
    pub end_marker: String,
    pub pace_ms: u64,
    /// Overrides the generator's own notion of how chunks relate.
    pub chunk_mode: Option<ChunkMode>,
    pub command: Option<CommandConfig>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            start_marker: DEFAULT_START_MARKER.to_string(),
            end_marker: DEFAULT_END_MARKER.to_string(),
            pace_ms: DEFAULT_PACE.as_millis() as u64,
            chunk_mode: None,
            command: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl GenerationConfig {
    pub fn markers(&self) -> Markers {
        Markers::new(&self.start_marker, &self.end_marker)
    }

    pub fn pace(&self) -> Duration {
        Duration::from_millis(self.pace_ms)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::default()
            .with_markers(self.markers())
            .with_pace(self.pace())
    }

    /// Generator for the configured command. With no command configured the
    /// generator has an empty program and fails setup.
    pub fn command_generator(&self) -> CommandGenerator {
        let mut generator = match &self.command {
            Some(cmd) => CommandGenerator::new(&cmd.program).with_args(cmd.args.iter().cloned()),
            None => CommandGenerator::new(""),
        };
        if let Some(mode) = self.chunk_mode {
            generator = generator.with_chunk_mode(mode);
        }
        generator
    }
}

impl BridgeConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound {
                    path: path.to_path_buf(),
                }
            } else {
                ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load from the first configured source, or defaults when there is none.
    ///
    /// Returns the path that was loaded so callers can hand it on.
    pub fn discover(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        let exe_dir = exe_dir();
        match resolve_path(explicit, std::env::var_os(CONFIG_ENV), exe_dir.as_deref()) {
            Some(path) => {
                let config = Self::load(&path)?;
                tracing::debug!(path = %path.display(), "Loaded configuration");
                Ok((config, Some(path)))
            }
            None => {
                tracing::debug!("No configuration file, using defaults");
                Ok((Self::default(), None))
            }
        }
    }
}

/// Pick the config file to load. Explicit and environment paths are returned
/// even if missing so a typo is reported instead of silently ignored.
fn resolve_path(
    explicit: Option<&Path>,
    env_value: Option<OsString>,
    exe_dir: Option<&Path>,
) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(value) = env_value.filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(value));
    }
    exe_dir
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .filter(|path| path.is_file())
}

fn exe_dir() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
}

fn worker_file_name() -> String {
    format!("{WORKER_BINARY}{}", std::env::consts::EXE_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_config_uses_defaults() {
        let config = BridgeConfig::from_toml_str("").unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.generation.markers(), Markers::default());
        assert_eq!(config.generation.pace(), Duration::from_millis(100));
        assert_eq!(config.relay.shutdown_grace(), Duration::from_secs(5));
        assert_eq!(config.relay.max_frame_bytes, DEFAULT_MAX_FRAME_BYTES);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = BridgeConfig::from_toml_str(
            r#"
            [generation]
            pace_ms = 0
            start_marker = ""
            chunk_mode = "cumulative"
            command = { program = "/opt/llm/run", args = ["--prompt", "{prompt}"] }
            "#,
        )
        .unwrap();

        assert_eq!(config.generation.pace(), Duration::ZERO);
        assert_eq!(config.generation.end_marker, DEFAULT_END_MARKER);
        assert_eq!(config.generation.markers(), Markers::new("", DEFAULT_END_MARKER));
        assert_eq!(config.relay, RelaySettings::default());

        let generator = config.generation.command_generator();
        assert_eq!(generator.program(), "/opt/llm/run");
        assert_eq!(
            crate::generator::Generator::chunk_mode(&generator),
            ChunkMode::Cumulative
        );
    }

    #[test]
    fn relay_section_builds_worker_command() {
        let config = BridgeConfig::from_toml_str(
            r#"
            [relay]
            worker = "/opt/hostbridge/worker"
            worker_args = ["--framing", "lines"]
            shutdown_grace_ms = 250
            "#,
        )
        .unwrap();

        let command = config.relay.worker_command();
        assert_eq!(command.program, PathBuf::from("/opt/hostbridge/worker"));
        assert_eq!(command.args, vec!["--framing", "lines"]);
        assert_eq!(config.relay.shutdown_grace(), Duration::from_millis(250));
    }

    #[test]
    fn default_worker_is_sibling_binary() {
        let program = RelaySettings::default().worker_program();
        assert!(program.ends_with(worker_file_name()));
    }

    #[test]
    fn invalid_toml_is_a_parse_error() {
        let err = BridgeConfig::from_toml_str("[generation]\npace_ms = \"fast\"").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn load_reads_file_and_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[generation]\nend_marker = \"</s>\"").unwrap();

        let config = BridgeConfig::load(file.path()).unwrap();
        assert_eq!(config.generation.end_marker, "</s>");

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        writeln!(bad, "[relay\n").unwrap();
        let err = BridgeConfig::load(bad.path()).unwrap_err();
        assert!(err.to_string().contains(&bad.path().display().to_string()));
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = BridgeConfig::load(Path::new("/nonexistent/hostbridge.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }

    #[test]
    fn resolution_order() {
        let dir = tempfile::tempdir().unwrap();
        let beside_exe = dir.path().join(CONFIG_FILE_NAME);

        // nothing configured, nothing beside the executable
        assert_eq!(resolve_path(None, None, Some(dir.path())), None);

        std::fs::write(&beside_exe, "").unwrap();
        assert_eq!(resolve_path(None, None, Some(dir.path())), Some(beside_exe));

        let from_env = resolve_path(None, Some("/etc/hb.toml".into()), Some(dir.path()));
        assert_eq!(from_env, Some(PathBuf::from("/etc/hb.toml")));

        let explicit = resolve_path(
            Some(Path::new("/cli.toml")),
            Some("/etc/hb.toml".into()),
            Some(dir.path()),
        );
        assert_eq!(explicit, Some(PathBuf::from("/cli.toml")));

        // an empty variable counts as unset
        assert_eq!(resolve_path(None, Some(OsString::new()), None), None);
    }
}
