//! Proxy configuration.
//!
//! The configuration is a YAML document; every section has defaults so an
//! empty file (or no file at all) yields a usable forward proxy listening on
//! `127.0.0.1:3128`. The process-wide value lives in a [`SharedConfig`] and a
//! transaction works from one immutable snapshot of it.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Deserialize;
use thiserror::Error;

use crate::callout::checklist::ChecklistName;
use crate::callout::rules::RuleChecklist;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:3128";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    pub listener: ListenerConfig,
    pub parser: ParserConfig,
    pub host_verify: HostVerifyConfig,
    pub follow_x_forwarded_for: XffConfig,
    pub access: AccessConfig,
    pub redirector: Option<HelperConfig>,
    pub store_id: Option<HelperConfig>,
    pub upstream: UpstreamConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            listener: ListenerConfig::default(),
            parser: ParserConfig::default(),
            host_verify: HostVerifyConfig::default(),
            follow_x_forwarded_for: XffConfig::default(),
            access: AccessConfig::default(),
            redirector: None,
            store_id: None,
            upstream: UpstreamConfig::default(),
        }
    }
}

/// How the listening port receives its traffic.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Connections arrive through transparent interception.
    pub intercepted: bool,
    /// Reverse-proxy (accelerator) port.
    pub accel: bool,
    /// CONNECT requests on this port go through the bump decision.
    pub ssl_bump: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    /// Tolerate common protocol violations (extra whitespace, bare LF,
    /// leading blank lines, header folding).
    pub relaxed: bool,
    /// Limit for the request line plus header block, in bytes.
    pub max_request_header_size: usize,
    pub max_uri_length: usize,
    pub max_method_length: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            relaxed: true,
            max_request_header_size: 64 * 1024,
            max_uri_length: 8 * 1024,
            max_method_length: 32,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HostVerifyConfig {
    /// Deny on a Host mismatch instead of continuing uncacheable.
    pub strict: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct XffConfig {
    pub enabled: bool,
    /// Later checklists see the indirect client as the source address.
    pub acl_uses_indirect_client: bool,
}

/// One named checklist: ordered rules plus the answer when none matches.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChecklistConfig {
    pub default: String,
    pub rules: Vec<RuleConfig>,
}

impl Default for ChecklistConfig {
    fn default() -> Self {
        Self {
            default: "deny".to_string(),
            rules: Vec::new(),
        }
    }
}

/// A single rule. Omitted criteria match anything.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    /// `allow`, `deny`, `auth` or `bump:<mode>`.
    pub action: String,
    /// Source network in CIDR notation.
    pub src: Option<String>,
    /// Destination domain suffix, e.g. `.example.com`.
    pub dstdomain: Option<String>,
    pub methods: Vec<String>,
}

/// Checklists that are configured. An absent list means "not configured",
/// which each pipeline step interprets on its own.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    pub http_access: Option<ChecklistConfig>,
    pub adapted_http_access: Option<ChecklistConfig>,
    pub follow_x_forwarded_for: Option<ChecklistConfig>,
    pub redirector_access: Option<ChecklistConfig>,
    pub store_id_access: Option<ChecklistConfig>,
    pub no_cache: Option<ChecklistConfig>,
    pub ssl_bump: Option<ChecklistConfig>,
}

impl AccessConfig {
    pub fn get(&self, name: ChecklistName) -> Option<&ChecklistConfig> {
        match name {
            ChecklistName::HttpAccess => self.http_access.as_ref(),
            ChecklistName::AdaptedHttpAccess => self.adapted_http_access.as_ref(),
            ChecklistName::FollowXForwardedFor => self.follow_x_forwarded_for.as_ref(),
            ChecklistName::RedirectorAccess => self.redirector_access.as_ref(),
            ChecklistName::StoreIdAccess => self.store_id_access.as_ref(),
            ChecklistName::NoCache => self.no_cache.as_ref(),
            ChecklistName::SslBump => self.ssl_bump.as_ref(),
        }
    }

    pub fn is_configured(&self, name: ChecklistName) -> bool {
        self.get(name).is_some()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Continue as if the helper had not been consulted.
    #[default]
    Bypass,
    /// Deny the request with a gateway failure.
    Fail,
}

/// An external URL rewrite or store-ID helper.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HelperConfig {
    /// Program and arguments.
    pub program: Vec<String>,
    pub timeout_ms: u64,
    pub on_timeout: TimeoutPolicy,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            program: Vec::new(),
            timeout_ms: 30_000,
            on_timeout: TimeoutPolicy::Bypass,
        }
    }
}

impl HelperConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            request_timeout_ms: 60_000,
        }
    }
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Config {
    /// Loads the configuration named by `FRONTGATE_CONFIG`, or the defaults.
    ///
    /// `LISTEN` overrides the listening address either way.
    pub fn load() -> Result<Self, ConfigError> {
        let mut cfg = match std::env::var("FRONTGATE_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };

        if let Ok(listen) = std::env::var("LISTEN") {
            cfg.listen_addr = listen;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Rejects values the proxy cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr.parse::<SocketAddr>().map_err(|_| {
            ConfigError::Invalid(format!("listen_addr {:?} is not host:port", self.listen_addr))
        })?;

        let parser = &self.parser;
        if parser.max_method_length == 0 || parser.max_uri_length == 0 {
            return Err(ConfigError::Invalid(
                "parser limits must be greater than zero".to_string(),
            ));
        }
        if parser.max_uri_length >= parser.max_request_header_size {
            return Err(ConfigError::Invalid(format!(
                "max_uri_length ({}) must be below max_request_header_size ({})",
                parser.max_uri_length, parser.max_request_header_size
            )));
        }

        for (name, helper) in [("redirector", &self.redirector), ("store_id", &self.store_id)] {
            if let Some(helper) = helper {
                if helper.program.is_empty() {
                    return Err(ConfigError::Invalid(format!("{} has no program", name)));
                }
                if helper.timeout_ms == 0 {
                    return Err(ConfigError::Invalid(format!("{} timeout must be positive", name)));
                }
            }
        }

        RuleChecklist::from_config(&self.access)?;
        Ok(())
    }
}

/// The process-wide configuration.
///
/// Readers take a snapshot and keep it for as long as they need a
/// consistent view; `replace` never disturbs snapshots already handed out.
#[derive(Debug, Clone)]
pub struct SharedConfig {
    current: Arc<ArcSwap<Config>>,
}

impl SharedConfig {
    pub fn new(cfg: Config) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(cfg)),
        }
    }

    pub fn snapshot(&self) -> Arc<Config> {
        self.current.load_full()
    }

    pub fn replace(&self, cfg: Config) {
        self.current.store(Arc::new(cfg));
    }

    /// Re-reads the environment and configuration file.
    ///
    /// On failure the current configuration stays in place.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let cfg = Config::load()?;
        self.replace(cfg);
        Ok(())
    }
}
