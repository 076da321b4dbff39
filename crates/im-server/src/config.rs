//! Server configuration: TOML file + CLI overrides.

use im_core::{ImError, ImResult};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub log: LogSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    /// Shared HS256 secret for device tokens and bind keys.
    #[serde(default = "default_token")]
    pub token: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            token: default_token(),
        }
    }
}

/// `[transport]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransportSection {
    #[serde(default)]
    pub websocket: WebSocketSection,
    #[serde(default)]
    pub bus: BusSection,
}

/// `[transport.websocket]`: client-facing listener.
#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketSection {
    #[serde(default = "default_ip")]
    pub ip: String,
    #[serde(default = "default_ws_port")]
    pub port: u16,
    /// Accept admission metadata as query parameters.
    #[serde(default = "default_true")]
    pub browser: bool,
}

impl Default for WebSocketSection {
    fn default() -> Self {
        Self {
            ip: default_ip(),
            port: default_ws_port(),
            browser: true,
        }
    }
}

/// `[transport.bus]`: upstream bus listener.
#[derive(Debug, Clone, Deserialize)]
pub struct BusSection {
    #[serde(default = "default_ip")]
    pub ip: String,
    #[serde(default = "default_bus_port")]
    pub port: u16,
    /// How long admission waits for the bus before answering 503.
    #[serde(default = "default_admission_timeout_ms")]
    pub admission_timeout_ms: u64,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            ip: default_ip(),
            port: default_bus_port(),
            admission_timeout_ms: default_admission_timeout_ms(),
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    /// Lifetime of device tokens issued by the bind API, in seconds.
    #[serde(default = "default_device_token_ttl")]
    pub device_token_ttl: u64,
    /// Accept expired device tokens. Signatures are still checked.
    #[serde(default)]
    pub skip_expiry: bool,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            device_token_ttl: default_device_token_ttl(),
            skip_expiry: false,
        }
    }
}

/// `[log]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct LogSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory for the rolling log file; console only when unset.
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default = "default_log_file")]
    pub file: String,
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
            file: default_log_file(),
            max_files: default_max_files(),
        }
    }
}

fn default_token() -> String {
    "your_token".to_string()
}
fn default_ip() -> String {
    "0.0.0.0".to_string()
}
fn default_ws_port() -> u16 {
    9000
}
fn default_bus_port() -> u16 {
    9001
}
fn default_admission_timeout_ms() -> u64 {
    2000
}
fn default_device_token_ttl() -> u64 {
    30 * 24 * 3600
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_file() -> String {
    "im-server.log".to_string()
}
fn default_max_files() -> usize {
    7
}
fn default_true() -> bool {
    true
}

/// CLI values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub ws_port: Option<u16>,
    pub bus_port: Option<u16>,
    pub token: Option<String>,
    pub log_level: Option<String>,
}

/// Logging settings after overrides.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub dir: Option<PathBuf>,
    pub file: String,
    pub max_files: usize,
}

/// Resolved server configuration (addresses parsed, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub secret: String,
    pub ws_addr: SocketAddr,
    pub bus_addr: SocketAddr,
    pub browser: bool,
    pub admission_timeout: Duration,
    pub device_token_ttl: u64,
    pub skip_expiry: bool,
    pub log: LogConfig,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> ImResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    Self::parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, cli)
    }

    /// Parse a config TOML document.
    pub fn parse(content: &str) -> ImResult<ConfigFile> {
        toml::from_str::<ConfigFile>(content)
            .map_err(|e| ImError::Config(format!("config parse error: {e}")))
    }

    /// Merge CLI overrides into a parsed file and validate the result.
    pub fn resolve(file: ConfigFile, cli: CliOverrides) -> ImResult<Self> {
        let secret = cli.token.unwrap_or(file.server.token);
        if secret.is_empty() {
            return Err(ImError::Config("server.token must not be empty".into()));
        }

        let ws_port = cli.ws_port.unwrap_or(file.transport.websocket.port);
        let bus_port = cli.bus_port.unwrap_or(file.transport.bus.port);

        Ok(Self {
            secret,
            ws_addr: parse_addr(&file.transport.websocket.ip, ws_port)?,
            bus_addr: parse_addr(&file.transport.bus.ip, bus_port)?,
            browser: file.transport.websocket.browser,
            admission_timeout: Duration::from_millis(file.transport.bus.admission_timeout_ms),
            device_token_ttl: file.auth.device_token_ttl,
            skip_expiry: file.auth.skip_expiry,
            log: LogConfig {
                level: cli.log_level.unwrap_or(file.log.level),
                dir: file.log.dir.as_deref().map(expand_tilde_str),
                file: file.log.file,
                max_files: file.log.max_files,
            },
        })
    }
}

fn parse_addr(ip: &str, port: u16) -> ImResult<SocketAddr> {
    format!("{ip}:{port}")
        .parse()
        .map_err(|e| ImError::Config(format!("invalid address {ip}:{port}: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
