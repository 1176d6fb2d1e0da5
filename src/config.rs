//! Inkread configuration. Every key has a built-in default, so the service
//! starts without a config file; a TOML file and `INKREAD__` environment
//! variables are layered on top, in that order.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Config file read when no path is given on the command line
pub const DEFAULT_CONFIG_FILE: &str = "inkread.toml";

/// Prefix of the environment variables that override config keys, e.g.
/// `INKREAD__SERVER__PORT=8080`
pub const ENV_PREFIX: &str = "INKREAD";

/// Default tracing directive, used when `RUST_LOG` is not set
pub const RUST_LOG: &str = "info,actix_web=debug,actix_server=debug";

/// Hard ceiling on the generated sequence length, start token included
pub const MAX_LENGTH: usize = 64;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub model: ModelSettings,

    /// Tracing filter directive
    pub log: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,

    /// Number of actix workers; actix picks one per physical core when unset
    pub workers: Option<usize>,

    /// Largest accepted upload, in bytes
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Hub repository holding the weights, model config and preprocessor config
    pub name: String,
    pub revision: String,

    /// Hub repository holding a `tokenizer.json` for the model's vocabulary
    pub tokenizer_repo: String,
    pub tokenizer_revision: String,

    pub hub_url: String,

    /// Where fetched artifacts are cached between runs
    pub cache_dir: PathBuf,

    /// Cap on the generated sequence length. Values above [`MAX_LENGTH`] are
    /// clamped.
    pub max_length: usize,

    /// Skip accelerator detection and run on the CPU
    pub force_cpu: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            server: ServerSettings::default(),
            model: ModelSettings::default(),
            log: RUST_LOG.into(),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            host: "0.0.0.0".into(),
            port: 5000,
            workers: None,
            max_upload_bytes: 32 * 1024 * 1024,
        }
    }
}

impl Default for ModelSettings {
    fn default() -> Self {
        ModelSettings {
            name: "microsoft/trocr-base-handwritten".into(),
            // The main branch only ships pickled weights
            revision: "refs/pr/3".into(),
            tokenizer_repo: "ToluClassics/candle-trocr-tokenizer".into(),
            tokenizer_revision: "main".into(),
            hub_url: "https://huggingface.co".into(),
            cache_dir: PathBuf::from("models"),
            max_length: MAX_LENGTH,
            force_cpu: false,
        }
    }
}

impl ModelSettings {
    /// The generation length cap actually applied
    pub fn max_length(&self) -> usize {
        self.max_length.clamp(1, MAX_LENGTH)
    }
}

impl Settings {
    /// Load settings from `path` (or [`DEFAULT_CONFIG_FILE`] if it exists)
    /// and the environment. An explicitly given file must exist.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::with_name(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to read configuration")?
            .try_deserialize()
            .context("invalid configuration")
    }

    /// The address the HTTP server binds to
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
