//! Gateway configuration.
//!
//! Loaded from a TOML file with `$VAR` / `${VAR}` environment-variable
//! expansion in string values. Server entries accept either a tagged
//! `transport` table or the legacy top-level `command`/`args` form,
//! which is coerced into a stdio descriptor once at load time — the
//! rest of the gateway never sees the legacy shape.
//!
//! # Example
//!
//! ```toml
//! name = "mcplex"
//!
//! [settings]
//! log_level = "info"
//! health_check_interval = 60
//!
//! [payment]
//! enabled = true
//! recipient = "0xA0Cf798816D4b9b9866b5330EEa46a18382f251e"
//! network = "base-sepolia"
//! facilitator_url = "https://x402.org/facilitator"
//! api_keys = [{ key = "$PREMIUM_KEY", tier = "premium" }]
//!
//! [[servers]]
//! id = "fs"
//! namespace = "fs"
//! command = "npx"
//! args = ["-y", "@modelcontextprotocol/server-filesystem", "/data"]
//!
//! [[servers]]
//! id = "search"
//! [servers.transport]
//! type = "http"
//! url = "https://search.example/mcp"
//! [servers.payment]
//! mode = "passthrough"
//! ```

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mcplex::policy::{PaymentPolicy, UpstreamPaymentPolicy};
use mcplex_mcp::manager::{ManagerSettings, UpstreamSpec};
use mcplex_mcp::registry::ConflictResolution;
use mcplex_mcp::transport::TransportDescriptor;
use serde::{Deserialize, Serialize};

/// Errors produced while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Path that failed to load.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// A server entry is structurally unusable.
    #[error("server {id:?}: {message}")]
    Server {
        /// The offending server id.
        id: String,
        /// What is wrong with the entry.
        message: String,
    },
}

/// Log verbosity for the process-wide subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Errors only.
    Error,
    /// Errors and warnings.
    Warn,
    /// Normal operational logging.
    #[default]
    Info,
    /// Everything, including per-call detail.
    Debug,
}

impl LogLevel {
    /// The `EnvFilter` directive for this level.
    #[must_use]
    pub const fn as_filter(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
        }
    }
}

/// Gateway-wide tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// Rename colliding tool names instead of dropping them.
    pub enable_tool_conflict_resolution: bool,
    /// Rename colliding resource URIs instead of dropping them.
    pub enable_resource_conflict_resolution: bool,
    /// Rename colliding prompt names instead of dropping them.
    pub enable_prompt_conflict_resolution: bool,
    /// Subscriber verbosity (overridable via `RUST_LOG`).
    pub log_level: LogLevel,
    /// Fan-out cap for parallel connects and probes.
    pub max_concurrent_connections: usize,
    /// Seconds between health passes.
    pub health_check_interval: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            enable_tool_conflict_resolution: true,
            enable_resource_conflict_resolution: true,
            enable_prompt_conflict_resolution: true,
            log_level: LogLevel::default(),
            max_concurrent_connections: 10,
            health_check_interval: 60,
        }
    }
}

impl GatewaySettings {
    /// Connection-manager view of these settings.
    #[must_use]
    pub const fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            max_concurrent_connections: self.max_concurrent_connections,
            health_check_interval: Duration::from_secs(self.health_check_interval),
        }
    }

    /// Registry view of these settings.
    #[must_use]
    pub const fn conflict_resolution(&self) -> ConflictResolution {
        ConflictResolution {
            tools: self.enable_tool_conflict_resolution,
            resources: self.enable_resource_conflict_resolution,
            prompts: self.enable_prompt_conflict_resolution,
        }
    }
}

/// Bind settings for the optional HTTP wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    /// Bind address.
    pub host: IpAddr,
    /// Bind port.
    pub port: u16,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0)),
            port: 3333,
        }
    }
}

/// One server entry as written in the file; the legacy
/// `command`/`args` form is accepted alongside the tagged transport.
#[derive(Debug, Clone, Deserialize)]
struct RawServer {
    id: String,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    transport: Option<TransportDescriptor>,
    // Legacy stdio form.
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default = "default_connect_timeout_ms")]
    connect_timeout_ms: u64,
    #[serde(default = "default_retry_attempts")]
    retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    retry_delay_ms: u64,
    #[serde(default)]
    payment: Option<UpstreamPaymentPolicy>,
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

impl RawServer {
    /// Normalizes into an [`UpstreamSpec`], coercing the legacy form.
    fn into_spec(self) -> Result<UpstreamSpec, ConfigError> {
        let transport = match (self.transport, self.command) {
            (Some(transport), legacy) => {
                if legacy.is_some() {
                    tracing::warn!(
                        id = %self.id,
                        "both transport and legacy command given; using transport"
                    );
                }
                transport
            }
            (None, Some(command)) => TransportDescriptor::Stdio {
                command,
                args: self.args,
                env: self.env,
                cwd: self.cwd,
            },
            (None, None) => {
                return Err(ConfigError::Server {
                    id: self.id,
                    message: "needs either a transport table or a command".to_owned(),
                });
            }
        };
        Ok(UpstreamSpec {
            id: self.id,
            namespace: self.namespace,
            enabled: self.enabled,
            transport,
            connect_timeout_ms: self.connect_timeout_ms,
            retry_attempts: self.retry_attempts,
            retry_delay_ms: self.retry_delay_ms,
            payment: self.payment,
        })
    }
}

/// On-disk configuration schema.
#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
    #[serde(default = "default_name")]
    name: String,
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    settings: GatewaySettings,
    #[serde(default)]
    http: HttpSettings,
    #[serde(default)]
    payment: PaymentPolicy,
    #[serde(default)]
    servers: Vec<RawServer>,
}

fn default_name() -> String {
    "mcplex".to_owned()
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_owned()
}

/// Fully loaded and normalized gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Gateway name announced to downstream clients.
    pub name: String,
    /// Gateway version announced to downstream clients.
    pub version: String,
    /// Optional human-readable description.
    pub description: Option<String>,
    /// Gateway-wide tunables.
    pub settings: GatewaySettings,
    /// HTTP wrapper bind settings.
    pub http: HttpSettings,
    /// Gateway-wide payment policy.
    pub payment: PaymentPolicy,
    /// Normalized upstream specs.
    pub servers: Vec<UpstreamSpec>,
}

impl GatewayConfig {
    /// Loads and normalizes configuration from a file.
    ///
    /// `HOST` and `PORT` environment variables override the HTTP bind
    /// settings after the file is read.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on read, parse, or normalization failure.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        let mut config = Self::from_toml(&content)?;
        if let Ok(host) = std::env::var("HOST")
            && let Ok(addr) = host.parse()
        {
            config.http.host = addr;
        }
        if let Ok(port) = std::env::var("PORT")
            && let Ok(port) = port.parse()
        {
            config.http.port = port;
        }
        Ok(config)
    }

    /// Parses a TOML document after environment-variable expansion.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on parse or normalization failure.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(content);
        let raw: RawConfig = toml::from_str(&expanded)?;
        let servers = raw
            .servers
            .into_iter()
            .map(RawServer::into_spec)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            name: raw.name,
            version: raw.version,
            description: raw.description,
            settings: raw.settings,
            http: raw.http,
            payment: raw.payment,
            servers,
        })
    }

    /// Runs per-server validation and returns all findings at once.
    #[must_use]
    pub fn validate_servers(&self) -> Vec<(String, Vec<mcplex_mcp::ValidationIssue>)> {
        self.servers
            .iter()
            .filter_map(|spec| {
                let issues = spec.validate();
                (!issues.is_empty()).then(|| (spec.id.clone(), issues))
            })
            .collect()
    }
}

/// `$VAR` / `${VAR}` expansion from the process environment.
///
/// Unresolved references are left as-is so validation can point at
/// them.
fn expand_env_vars(input: &str) -> String {
    static PATTERN: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
        regex::Regex::new(r"\$(?:\{([A-Za-z0-9_]+)\}|([A-Za-z0-9_]+))")
            .expect("static pattern compiles")
    });
    PATTERN
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            std::env::var(name).unwrap_or_else(|_| caps[0].to_owned())
        })
        .into_owned()
}
