//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;
use vless_core::relay::{DEFAULT_BACKPRESSURE_PAUSE, DEFAULT_BACKPRESSURE_THRESHOLD};
use vless_core::{RelayConfig, RelayError, RelayResult, EDGE_FALLBACK_HOST};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub vless: VlessSection,
    #[serde(default)]
    pub dns: DnsSection,
    #[serde(default)]
    pub relay: RelaySection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cert: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
            cert: None,
            key: None,
        }
    }
}

/// `[vless]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VlessSection {
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DnsMode {
    /// DNS-over-HTTPS JSON API.
    Doh,
    /// The operating system resolver.
    System,
}

/// `[dns]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct DnsSection {
    #[serde(default = "default_dns_mode")]
    pub mode: DnsMode,
    #[serde(default = "default_doh_url")]
    pub doh_url: String,
    #[serde(default = "default_dns_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_fallback_host")]
    pub fallback_host: String,
}

impl Default for DnsSection {
    fn default() -> Self {
        Self {
            mode: default_dns_mode(),
            doh_url: default_doh_url(),
            timeout_secs: default_dns_timeout(),
            fallback_host: default_fallback_host(),
        }
    }
}

/// `[relay]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct RelaySection {
    #[serde(default = "default_backpressure_threshold")]
    pub backpressure_threshold: u64,
    #[serde(default = "default_backpressure_pause_ms")]
    pub backpressure_pause_ms: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            backpressure_threshold: default_backpressure_threshold(),
            backpressure_pause_ms: default_backpressure_pause_ms(),
            connect_timeout_secs: default_connect_timeout(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

fn default_listen() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}
fn default_port() -> u16 {
    8080
}
fn default_dns_mode() -> DnsMode {
    DnsMode::Doh
}
fn default_doh_url() -> String {
    "https://mozilla.cloudflare-dns.com/dns-query".to_string()
}
fn default_dns_timeout() -> u64 {
    5
}
fn default_fallback_host() -> String {
    EDGE_FALLBACK_HOST.to_string()
}
fn default_backpressure_threshold() -> u64 {
    DEFAULT_BACKPRESSURE_THRESHOLD
}
fn default_backpressure_pause_ms() -> u64 {
    DEFAULT_BACKPRESSURE_PAUSE.as_millis() as u64
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_idle_timeout() -> u64 {
    300
}

/// Values given on the command line. `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub listen: Option<IpAddr>,
    pub port: Option<u16>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub uuid: Option<String>,
    pub path: Option<String>,
    pub dns_mode: Option<DnsMode>,
}

/// Resolved DNS settings.
#[derive(Debug, Clone)]
pub struct DnsSettings {
    pub mode: DnsMode,
    pub doh_url: String,
    pub timeout: Duration,
    pub fallback_host: String,
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: IpAddr,
    pub port: u16,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    /// Only upgrade requests for this path are accepted.
    pub path: String,
    pub dns: DnsSettings,
    pub relay: RelayConfig,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> RelayResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse_config_file(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, overrides)
    }

    /// Merge a parsed file with CLI overrides and validate the result.
    pub fn resolve(file_config: ConfigFile, overrides: ConfigOverrides) -> RelayResult<Self> {
        let uuid_str = overrides
            .uuid
            .or(file_config.vless.uuid)
            .ok_or_else(|| RelayError::Config("a VLESS uuid is required".into()))?;
        let identity = Uuid::parse_str(uuid_str.trim())
            .map_err(|e| RelayError::Config(format!("invalid uuid {uuid_str:?}: {e}")))?;

        let path = overrides
            .path
            .or(file_config.vless.path)
            .unwrap_or_else(|| format!("/vless/{identity}"));
        if !path.starts_with('/') {
            return Err(RelayError::Config(format!(
                "websocket path must start with '/': {path:?}"
            )));
        }

        let cert_path = overrides
            .cert
            .or(file_config.server.cert)
            .map(|s| expand_tilde_str(&s));
        let key_path = overrides
            .key
            .or(file_config.server.key)
            .map(|s| expand_tilde_str(&s));
        if cert_path.is_some() != key_path.is_some() {
            return Err(RelayError::Config(
                "TLS needs both cert and key".into(),
            ));
        }

        let dns = DnsSettings {
            mode: overrides.dns_mode.unwrap_or(file_config.dns.mode),
            doh_url: file_config.dns.doh_url,
            timeout: Duration::from_secs(file_config.dns.timeout_secs),
            fallback_host: file_config.dns.fallback_host,
        };

        let relay = RelayConfig {
            identity,
            backpressure_threshold: file_config.relay.backpressure_threshold,
            backpressure_pause: Duration::from_millis(file_config.relay.backpressure_pause_ms),
            connect_timeout: nonzero_secs(file_config.relay.connect_timeout_secs),
            idle_timeout: nonzero_secs(file_config.relay.idle_timeout_secs),
        };

        Ok(Self {
            listen: overrides.listen.unwrap_or(file_config.server.listen),
            port: overrides.port.unwrap_or(file_config.server.port),
            cert_path,
            key_path,
            path,
            dns,
            relay,
        })
    }

    /// Cert and key paths, when TLS is configured.
    pub fn tls_paths(&self) -> Option<(&Path, &Path)> {
        match (&self.cert_path, &self.key_path) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }
}

pub fn parse_config_file(content: &str) -> RelayResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| RelayError::Config(format!("config parse error: {e}")))
}

/// `0` disables the timeout.
fn nonzero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
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

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "d342d11e-d424-4583-b36e-524ab1f0afa4";

    fn with_uuid() -> ConfigOverrides {
        ConfigOverrides {
            uuid: Some(ID.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn defaults() {
        let cfg = ServerConfig::resolve(ConfigFile::default(), with_uuid()).unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.listen, IpAddr::from([0, 0, 0, 0]));
        assert_eq!(cfg.path, format!("/vless/{ID}"));
        assert!(cfg.tls_paths().is_none());
        assert_eq!(cfg.dns.mode, DnsMode::Doh);
        assert_eq!(cfg.dns.fallback_host, "dns2.easydns.com");
        assert_eq!(cfg.dns.timeout, Duration::from_secs(5));
        assert_eq!(cfg.relay.backpressure_threshold, 20_000);
        assert_eq!(cfg.relay.backpressure_pause, Duration::from_millis(1));
        assert_eq!(cfg.relay.connect_timeout, Some(Duration::from_secs(10)));
        assert_eq!(cfg.relay.idle_timeout, Some(Duration::from_secs(300)));
    }

    #[test]
    fn file_values_and_cli_precedence() {
        let file = parse_config_file(
            r#"
            [server]
            listen = "127.0.0.1"
            port = 9000

            [vless]
            uuid = "00000000-0000-0000-0000-000000000001"
            path = "/ws"

            [dns]
            mode = "system"

            [relay]
            backpressure_threshold = 5
            idle_timeout_secs = 0
            "#,
        )
        .unwrap();

        let cfg = ServerConfig::resolve(
            file,
            ConfigOverrides {
                port: Some(9443),
                uuid: Some(ID.to_string()),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(cfg.listen, IpAddr::from([127, 0, 0, 1]));
        assert_eq!(cfg.port, 9443);
        assert_eq!(cfg.relay.identity, Uuid::parse_str(ID).unwrap());
        assert_eq!(cfg.path, "/ws");
        assert_eq!(cfg.dns.mode, DnsMode::System);
        assert_eq!(cfg.relay.backpressure_threshold, 5);
        assert_eq!(cfg.relay.idle_timeout, None);
    }

    #[test]
    fn uuid_is_required_and_validated() {
        let err = ServerConfig::resolve(ConfigFile::default(), ConfigOverrides::default())
            .unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));

        let err = ServerConfig::resolve(
            ConfigFile::default(),
            ConfigOverrides {
                uuid: Some("not-a-uuid".into()),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn tls_needs_both_files() {
        let err = ServerConfig::resolve(
            ConfigFile::default(),
            ConfigOverrides {
                cert: Some("/tmp/cert.pem".into()),
                ..with_uuid()
            },
        )
        .unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));

        let cfg = ServerConfig::resolve(
            ConfigFile::default(),
            ConfigOverrides {
                cert: Some("/tmp/cert.pem".into()),
                key: Some("/tmp/key.pem".into()),
                ..with_uuid()
            },
        )
        .unwrap();
        let (cert, key) = cfg.tls_paths().unwrap();
        assert_eq!(cert, Path::new("/tmp/cert.pem"));
        assert_eq!(key, Path::new("/tmp/key.pem"));
    }

    #[test]
    fn rejects_relative_path_and_bad_toml() {
        let err = ServerConfig::resolve(
            ConfigFile::default(),
            ConfigOverrides {
                path: Some("vless".into()),
                ..with_uuid()
            },
        )
        .unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));

        assert!(parse_config_file("[server]\nport = \"x\"").is_err());
        assert!(parse_config_file("[dns]\nmode = \"carrier-pigeon\"").is_err());
    }

    #[test]
    fn missing_file_uses_defaults() {
        let cfg = ServerConfig::load(
            Some(Path::new("/nonexistent/vless/config.toml")),
            with_uuid(),
        )
        .unwrap();
        assert_eq!(cfg.port, 8080);
    }

    #[test]
    fn tilde_expansion() {
        let expanded = expand_tilde_str("~/certs/cert.pem");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, home.join("certs/cert.pem"));
        }
        assert_eq!(expand_tilde_str("/abs/key.pem"), PathBuf::from("/abs/key.pem"));
    }
}
