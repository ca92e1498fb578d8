use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable consulted when no tunnel credential is configured.
pub const TUNNEL_TOKEN_ENV: &str = "NGROK_AUTHTOKEN";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub locator: LocatorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Path prefix for every API route.
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            prefix: default_prefix(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:5173".to_string()
}
fn default_prefix() -> String {
    "/api".to_string()
}

impl ServerConfig {
    /// Port part of `bind`, if it parses.
    pub fn port(&self) -> Option<u16> {
        self.bind.rsplit_once(':').and_then(|(_, p)| p.parse().ok())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("annotations.json")
}

#[derive(Debug, Deserialize, Clone)]
pub struct TunnelConfig {
    #[serde(default)]
    pub authtoken: Option<String>,
    /// Defaults to "on" exactly when a credential is available.
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default = "default_tunnel_binary")]
    pub binary: String,
    #[serde(default = "default_agent_api")]
    pub agent_api: String,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            authtoken: None,
            enabled: None,
            binary: default_tunnel_binary(),
            agent_api: default_agent_api(),
            startup_timeout_secs: default_startup_timeout_secs(),
        }
    }
}

fn default_tunnel_binary() -> String {
    "ngrok".to_string()
}
fn default_agent_api() -> String {
    "http://127.0.0.1:4040".to_string()
}
fn default_startup_timeout_secs() -> u64 {
    15
}

impl TunnelConfig {
    /// The credential to open a tunnel with, or `None` when tunneling is off.
    ///
    /// `env_token` is the value of [`TUNNEL_TOKEN_ENV`], passed in so the
    /// decision stays a pure function of its inputs.
    pub fn resolve_token(&self, env_token: Option<String>) -> Option<String> {
        let token = self
            .authtoken
            .clone()
            .filter(|t| !t.is_empty())
            .or_else(|| env_token.filter(|t| !t.is_empty()));
        let enabled = self.enabled.unwrap_or(token.is_some());
        if enabled {
            token
        } else {
            None
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LocatorConfig {
    #[serde(default = "default_locator_root")]
    pub root: PathBuf,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            root: default_locator_root(),
            extensions: default_extensions(),
            exclude_globs: Vec::new(),
        }
    }
}

fn default_locator_root() -> PathBuf {
    PathBuf::from(".")
}
fn default_extensions() -> Vec<String> {
    ["js", "jsx", "ts", "tsx"].iter().map(|s| s.to_string()).collect()
}

impl LocatorConfig {
    /// Dependency directories are always excluded; user globs are appended.
    pub fn all_exclude_globs(&self) -> Vec<String> {
        let mut globs = vec!["**/node_modules/**".to_string()];
        globs.extend(self.exclude_globs.clone());
        globs
    }
}

pub fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(config)
}

/// Loads `path` if it exists; a missing file yields the defaults.
pub fn load_config_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        validate(Config::default())
    }
}

fn validate(mut config: Config) -> Result<Config> {
    if config.server.bind.trim().is_empty() {
        bail!("server.bind must not be empty");
    }

    if !config.server.prefix.is_empty() && !config.server.prefix.starts_with('/') {
        bail!(
            "server.prefix must start with '/': '{}'",
            config.server.prefix
        );
    }
    let trimmed = config.server.prefix.trim_end_matches('/').to_string();
    config.server.prefix = trimmed;

    if config.locator.extensions.is_empty() {
        bail!("locator.extensions must list at least one extension");
    }
    build_globset(&config.locator.all_exclude_globs())?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        validate(toml::from_str(toml_src)?)
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg = parse("").unwrap();
        assert_eq!(cfg.server.bind, "127.0.0.1:5173");
        assert_eq!(cfg.server.prefix, "/api");
        assert_eq!(cfg.server.port(), Some(5173));
        assert_eq!(cfg.store.path, PathBuf::from("annotations.json"));
        assert_eq!(cfg.locator.extensions, vec!["js", "jsx", "ts", "tsx"]);
        assert!(cfg.tunnel.authtoken.is_none());
    }

    #[test]
    fn test_prefix_normalized_and_validated() {
        let cfg = parse("[server]\nprefix = \"/dev/\"\n").unwrap();
        assert_eq!(cfg.server.prefix, "/dev");

        let cfg = parse("[server]\nprefix = \"/\"\n").unwrap();
        assert_eq!(cfg.server.prefix, "");

        assert!(parse("[server]\nprefix = \"api\"\n").is_err());
    }

    #[test]
    fn test_invalid_glob_rejected() {
        assert!(parse("[locator]\nexclude_globs = [\"a/[\"]\n").is_err());
    }

    #[test]
    fn test_empty_extensions_rejected() {
        assert!(parse("[locator]\nextensions = []\n").is_err());
    }

    #[test]
    fn test_tunnel_enabled_only_with_credential() {
        let tunnel = TunnelConfig::default();
        assert_eq!(tunnel.resolve_token(None), None);
        assert_eq!(tunnel.resolve_token(Some("env".into())), Some("env".into()));
        assert_eq!(tunnel.resolve_token(Some(String::new())), None);
    }

    #[test]
    fn test_tunnel_explicit_token_wins() {
        let tunnel = TunnelConfig {
            authtoken: Some("cfg".into()),
            ..TunnelConfig::default()
        };
        assert_eq!(tunnel.resolve_token(Some("env".into())), Some("cfg".into()));
    }

    #[test]
    fn test_tunnel_explicitly_disabled() {
        let tunnel = TunnelConfig {
            authtoken: Some("cfg".into()),
            enabled: Some(false),
            ..TunnelConfig::default()
        };
        assert_eq!(tunnel.resolve_token(None), None);
    }

    #[test]
    fn test_tunnel_enabled_without_credential_stays_off() {
        let tunnel = TunnelConfig {
            enabled: Some(true),
            ..TunnelConfig::default()
        };
        assert_eq!(tunnel.resolve_token(None), None);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let cfg = load_config_or_default(Path::new("/definitely/not/here.toml")).unwrap();
        assert_eq!(cfg.server.bind, "127.0.0.1:5173");
        assert!(load_config(Path::new("/definitely/not/here.toml")).is_err());
    }
}
