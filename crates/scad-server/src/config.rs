use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use scad_ai::openai::{DEFAULT_API_BASE, DEFAULT_MAX_COMPLETION_TOKENS, DEFAULT_MODEL};
use scad_ai::{ApiKey, OpenAiConfig};
use scad_compiler::{CompilerConfig, default_work_dir};
use scad_mesh::MeshFormat;

use crate::session::{DEFAULT_HISTORY_LIMIT, DEFAULT_MAX_SESSIONS, SessionLimits};

#[derive(Clone, Parser)]
#[command(
    name = "scad-server",
    version,
    about = "Turns text prompts into printable meshes via OpenSCAD"
)]
pub struct ServerConfig {
    #[arg(long, env = "SCAD_HOST", default_value = "127.0.0.1")]
    pub host: IpAddr,

    #[arg(long, env = "SCAD_PORT", default_value_t = 8501)]
    pub port: u16,

    /// OpenSCAD executable, looked up on PATH when not absolute.
    #[arg(long, env = "SCAD_COMPILER", default_value = "openscad")]
    pub compiler: PathBuf,

    /// Root for per-request script and mesh directories.
    #[arg(long, env = "SCAD_WORK_DIR")]
    pub work_dir: Option<PathBuf>,

    #[arg(long, default_value_t = 120)]
    pub compile_timeout_secs: u64,

    #[arg(long, default_value = "binstl")]
    pub format: MeshFormat,

    #[arg(long, env = "OPENAI_MODEL", default_value = DEFAULT_MODEL)]
    pub model: String,

    #[arg(long, env = "OPENAI_BASE_URL", default_value = DEFAULT_API_BASE)]
    pub api_base: String,

    #[arg(long, default_value_t = DEFAULT_MAX_COMPLETION_TOKENS)]
    pub max_completion_tokens: u32,

    #[arg(long, default_value_t = 120)]
    pub request_timeout_secs: u64,

    /// Finished requests kept per session before the oldest is dropped.
    #[arg(long, default_value_t = DEFAULT_HISTORY_LIMIT)]
    pub history_limit: usize,

    /// Live sessions kept; the least recently active one is ended past this.
    #[arg(long, env = "SCAD_MAX_SESSIONS", default_value_t = DEFAULT_MAX_SESSIONS)]
    pub max_sessions: usize,

    /// Sessions untouched for this long are ended along with their meshes.
    #[arg(long, env = "SCAD_SESSION_IDLE_SECS", default_value_t = 3600)]
    pub session_idle_secs: u64,

    /// Used when a request does not carry its own key.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn compiler_config(&self) -> CompilerConfig {
        CompilerConfig {
            program: self.compiler.clone(),
            work_dir: self.work_dir.clone().unwrap_or_else(default_work_dir),
            format: self.format,
            timeout: Duration::from_secs(self.compile_timeout_secs),
        }
    }

    pub fn openai_config(&self) -> OpenAiConfig {
        OpenAiConfig {
            api_base: self.api_base.clone(),
            model: self.model.clone(),
            max_completion_tokens: self.max_completion_tokens,
            timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }

    pub fn default_key(&self) -> Option<ApiKey> {
        self.api_key.clone().and_then(ApiKey::new)
    }

    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            history: self.history_limit,
            max_sessions: self.max_sessions,
            idle_timeout: Duration::from_secs(self.session_idle_secs),
        }
    }

    /// How often idle sessions are looked for: a quarter of the idle
    /// timeout, between one second and one minute.
    pub fn reap_interval(&self) -> Duration {
        (Duration::from_secs(self.session_idle_secs) / 4)
            .clamp(Duration::from_secs(1), Duration::from_secs(60))
    }
}
