//! ACME certificate renewal through an external client command

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::process::Command;

use crate::config::{certificate_paths, CliArgs, DEFAULT_CERT_COMMAND};
use crate::core::hooks::{CertRenewer, RenewedCert};
use crate::error::{NodeError, Result};
use crate::logger::log;

/// Days before expiry at which `renew` actually renews
const RENEW_DAYS: u32 = 30;

/// Runs a lego-compatible ACME client
pub struct CommandCertRenewer {
    command: String,
    email: String,
    cert_dir: PathBuf,
    dns_provider: Option<String>,
}

impl CommandCertRenewer {
    pub fn new(email: impl Into<String>, cert_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: DEFAULT_CERT_COMMAND.to_string(),
            email: email.into(),
            cert_dir: cert_dir.into(),
            dns_provider: None,
        }
    }

    /// `None` unless a contact email was configured
    pub fn from_cli(cli: &CliArgs) -> Option<Self> {
        let email = cli.cert_email.as_ref()?;
        let mut renewer = Self::new(email.clone(), cli.cert_dir.clone());
        renewer.command = cli.cert_command.clone();
        renewer.dns_provider = cli.dns_provider.clone();
        Some(renewer)
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    pub fn with_dns_provider(mut self, provider: impl Into<String>) -> Self {
        self.dns_provider = Some(provider.into());
        self
    }

    /// Command line for one run; `run` issues, `renew` refreshes an existing cert
    fn args(&self, challenge: &str, domain: &str, exists: bool) -> Result<Vec<String>> {
        let mut args = vec![
            "--accept-tos".to_string(),
            "--email".to_string(),
            self.email.clone(),
            "--domains".to_string(),
            domain.to_string(),
            "--path".to_string(),
            self.cert_dir.display().to_string(),
        ];
        match challenge {
            "http" => args.push("--http".to_string()),
            "dns" => {
                let provider = self.dns_provider.as_ref().ok_or_else(|| {
                    NodeError::Cert("dns challenge requested but no dns provider set".to_string())
                })?;
                args.push("--dns".to_string());
                args.push(provider.clone());
            }
            other => {
                return Err(NodeError::Cert(format!(
                    "unsupported challenge type: {}",
                    other
                )))
            }
        }
        if exists {
            args.extend([
                "renew".to_string(),
                "--days".to_string(),
                RENEW_DAYS.to_string(),
            ]);
        } else {
            args.push("run".to_string());
        }
        Ok(args)
    }
}

async fn modified_at(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

#[async_trait]
impl CertRenewer for CommandCertRenewer {
    async fn renew_cert(&self, challenge: &str, domain: &str) -> Result<RenewedCert> {
        let (cert_path, key_path) = certificate_paths(&self.cert_dir, domain);
        let before = modified_at(&cert_path).await;
        let args = self.args(challenge, domain, before.is_some())?;

        log::debug!(command = %self.command, domain = domain, "Running ACME client");
        let output = Command::new(&self.command)
            .args(&args)
            .output()
            .await
            .map_err(|e| NodeError::Cert(format!("failed to run {}: {}", self.command, e)))?;
        if !output.status.success() {
            return Err(NodeError::Cert(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let after = modified_at(&cert_path).await;
        if after.is_none() {
            return Err(NodeError::Cert(format!(
                "{} left no certificate at {}",
                self.command,
                cert_path.display()
            )));
        }
        Ok(RenewedCert {
            cert_path,
            key_path,
            renewed: after != before,
        })
    }
}
