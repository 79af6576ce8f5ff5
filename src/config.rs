//! Configuration module for the node agent
//!
//! This module handles CLI argument parsing with environment variable support.
//! The node descriptor itself is fetched from the panel; only local options
//! (fallbacks, DNS strategy, certificate handling) live here.

use anyhow::{anyhow, Result};
use clap::Parser;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Parse duration string (e.g., "60s", "2m", "1h") or plain seconds
fn parse_duration(s: &str) -> Result<Duration, String> {
    // Try parsing as humantime duration first (e.g., "60s", "2m", "1h30m")
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    // Fall back to parsing as plain seconds for backwards compatibility
    s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
        format!(
            "Invalid duration '{}'. Use formats like '60s', '2m', '1h' or plain seconds",
            s
        )
    })
}

/// Default certificate directory
const DEFAULT_CERT_DIR: &str = "/etc/server-node-r/cert";

/// Default ACME client executable
pub(crate) const DEFAULT_CERT_COMMAND: &str = "lego";

/// CLI arguments for the node agent
///
/// Supports environment variables with X_PANDA_NODE_ prefix
#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "Proxy node agent synchronised with a remote panel"
)]
#[command(rename_all = "snake_case")]
pub struct CliArgs {
    /// Panel base URL (e.g., "https://panel.example.com")
    #[arg(long = "api_host", env = "X_PANDA_NODE_API_HOST")]
    pub api_host: String,

    /// Panel API key
    #[arg(long = "api_key", env = "X_PANDA_NODE_API_KEY")]
    pub api_key: String,

    /// Node ID from the panel (required)
    #[arg(long, env = "X_PANDA_NODE_NODE")]
    pub node: u32,

    /// Panel request timeout (e.g., "15s", default: 15s)
    #[arg(long = "api_timeout", env = "X_PANDA_NODE_API_TIMEOUT", default_value = "15s", value_parser = parse_duration)]
    pub api_timeout: Duration,

    /// Log mode: trace, debug, info, warn, error (default: info)
    #[arg(long, env = "X_PANDA_NODE_LOG_MODE", default_value = "info")]
    pub log_mode: String,

    /// Node options file (.toml format)
    #[arg(long = "config_file", env = "X_PANDA_NODE_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Certificate directory (default: /etc/server-node-r/cert)
    #[arg(long = "cert_dir", env = "X_PANDA_NODE_CERT_DIR", default_value = DEFAULT_CERT_DIR)]
    pub cert_dir: PathBuf,

    /// ACME account e-mail; enables automatic certificate renewal
    #[arg(long = "cert_email", env = "X_PANDA_NODE_CERT_EMAIL")]
    pub cert_email: Option<String>,

    /// ACME client executable (default: lego)
    #[arg(long = "cert_command", env = "X_PANDA_NODE_CERT_COMMAND", default_value = DEFAULT_CERT_COMMAND)]
    pub cert_command: String,

    /// DNS provider name for DNS-01 challenges
    #[arg(long = "dns_provider", env = "X_PANDA_NODE_DNS_PROVIDER")]
    pub dns_provider: Option<String>,
}

impl CliArgs {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the CLI arguments
    pub fn validate(&self) -> Result<()> {
        if self.api_host.trim().is_empty() {
            return Err(anyhow!("Panel API host is required"));
        }
        if !self.api_host.starts_with("http://") && !self.api_host.starts_with("https://") {
            return Err(anyhow!(
                "Panel API host must start with http:// or https://: {}",
                self.api_host
            ));
        }
        if self.api_key.is_empty() {
            return Err(anyhow!("Panel API key is required"));
        }
        if self.node == 0 {
            return Err(anyhow!("Node ID must be a positive integer"));
        }
        if self.api_timeout.is_zero() {
            return Err(anyhow!("api_timeout must be greater than 0"));
        }

        if let Some(ref path) = self.config_file {
            if !path.exists() {
                return Err(anyhow!("Config file not found: {}", path.display()));
            }
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if !ext.eq_ignore_ascii_case("toml") {
                return Err(anyhow!(
                    "Invalid config file format: expected .toml extension"
                ));
            }
        }

        if let Some(ref email) = self.cert_email {
            if !email.contains('@') {
                return Err(anyhow!("Invalid cert_email: {}", email));
            }
        }

        Ok(())
    }
}

/// Fallback destination attached to vless and trojan listeners
#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Fallback {
    pub sni: String,
    pub alpn: String,
    pub path: String,
    pub dest: String,
    pub proxy_protocol_ver: u64,
}

/// Local node options, read from the optional TOML file
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeOptions {
    /// Domain strategy of the direct outbound (AsIs, UseIP, UseIPv4, UseIPv6)
    pub dns_strategy: String,
    /// Local egress address for outbounds
    pub send_through: Option<IpAddr>,
    pub fallbacks: Vec<Fallback>,
    /// Certificate directory, taken from the CLI
    #[serde(skip)]
    pub cert_dir: PathBuf,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            dns_strategy: "AsIs".to_string(),
            send_through: None,
            fallbacks: Vec::new(),
            cert_dir: PathBuf::from(DEFAULT_CERT_DIR),
        }
    }
}

impl NodeOptions {
    /// Build options from CLI args and the optional TOML file
    pub fn load(cli: &CliArgs) -> crate::error::Result<Self> {
        let mut options = match cli.config_file {
            Some(ref path) => Self::from_file(path)?,
            None => Self::default(),
        };
        options.cert_dir = cli.cert_dir.clone();
        Ok(options)
    }

    pub fn from_file(path: &Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let options: NodeOptions = toml::from_str(&content)?;
        Ok(options)
    }

    /// Certificate and key paths for a domain under the certificate directory
    pub fn certificate_paths(&self, domain: &str) -> (PathBuf, PathBuf) {
        certificate_paths(&self.cert_dir, domain)
    }
}

/// `<dir>/certificates/<domain>.crt` and `.key`, the ACME client's layout
pub fn certificate_paths(cert_dir: &Path, domain: &str) -> (PathBuf, PathBuf) {
    let base = cert_dir.join("certificates");
    (
        base.join(format!("{}.crt", domain)),
        base.join(format!("{}.key", domain)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_cli_args() -> CliArgs {
        CliArgs {
            api_host: "https://panel.example.com".to_string(),
            api_key: "secret-key".to_string(),
            node: 1,
            api_timeout: Duration::from_secs(15),
            log_mode: "info".to_string(),
            config_file: None,
            cert_dir: PathBuf::from(DEFAULT_CERT_DIR),
            cert_email: None,
            cert_command: DEFAULT_CERT_COMMAND.to_string(),
            dns_provider: None,
        }
    }

    #[test]
    fn test_cli_args_validate_success() {
        let cli = create_test_cli_args();
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_cli_args_validate_empty_api_host() {
        let mut cli = create_test_cli_args();
        cli.api_host = "".to_string();
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_cli_args_validate_api_host_scheme() {
        let mut cli = create_test_cli_args();
        cli.api_host = "panel.example.com".to_string();
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_cli_args_validate_empty_api_key() {
        let mut cli = create_test_cli_args();
        cli.api_key = "".to_string();
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_cli_args_validate_invalid_node_id() {
        let mut cli = create_test_cli_args();
        cli.node = 0;
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_cli_args_validate_zero_timeout() {
        let mut cli = create_test_cli_args();
        cli.api_timeout = Duration::ZERO;
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_cli_args_validate_config_file() {
        let temp_dir = tempfile::tempdir().unwrap();

        let mut cli = create_test_cli_args();
        cli.config_file = Some(temp_dir.path().join("missing.toml"));
        assert!(cli.validate().is_err());

        let yaml = temp_dir.path().join("node.yaml");
        std::fs::write(&yaml, "").unwrap();
        cli.config_file = Some(yaml);
        assert!(cli.validate().is_err());

        let toml_path = temp_dir.path().join("node.toml");
        std::fs::write(&toml_path, "").unwrap();
        cli.config_file = Some(toml_path);
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_cli_args_validate_cert_email() {
        let mut cli = create_test_cli_args();
        cli.cert_email = Some("not-an-email".to_string());
        assert!(cli.validate().is_err());
        cli.cert_email = Some("ops@example.com".to_string());
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("60s").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("15").unwrap(), Duration::from_secs(15));
        assert!(parse_duration("invalid").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_node_options_default() {
        let options = NodeOptions::default();
        assert_eq!(options.dns_strategy, "AsIs");
        assert!(options.fallbacks.is_empty());
        assert!(options.send_through.is_none());
    }

    #[test]
    fn test_node_options_load_from_toml() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("node.toml");
        std::fs::write(
            &path,
            r#"
dns_strategy = "UseIPv4"
send_through = "10.0.0.2"

[[fallbacks]]
dest = "80"
path = "/ws"

[[fallbacks]]
sni = "example.com"
dest = "127.0.0.1:8443"
proxy_protocol_ver = 1
"#,
        )
        .unwrap();

        let mut cli = create_test_cli_args();
        cli.config_file = Some(path);
        cli.cert_dir = temp_dir.path().to_path_buf();

        let options = NodeOptions::load(&cli).unwrap();
        assert_eq!(options.dns_strategy, "UseIPv4");
        assert_eq!(options.send_through, Some("10.0.0.2".parse().unwrap()));
        assert_eq!(options.fallbacks.len(), 2);
        assert_eq!(options.fallbacks[0].path, "/ws");
        assert_eq!(options.fallbacks[1].proxy_protocol_ver, 1);
        assert_eq!(options.cert_dir, temp_dir.path());
    }

    #[test]
    fn test_node_options_invalid_toml() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("node.toml");
        std::fs::write(&path, "dns_strategy = [").unwrap();
        assert!(NodeOptions::from_file(&path).is_err());
    }

    #[test]
    fn test_certificate_paths() {
        let (cert, key) = certificate_paths(Path::new("/etc/cert"), "node.example.com");
        assert_eq!(cert, PathBuf::from("/etc/cert/certificates/node.example.com.crt"));
        assert_eq!(key, PathBuf::from("/etc/cert/certificates/node.example.com.key"));
    }
}
