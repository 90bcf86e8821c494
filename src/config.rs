//! Campaign settings and persistence

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Number of recipients processed by a default batch run
pub const DEFAULT_BATCH_SIZE: usize = 5000;

/// Flat pause between two consecutive sends
pub const SEND_DELAY: Duration = Duration::from_secs(2);

const DEFAULT_SENDER_NAME: &str = "John Doe";
const DEFAULT_CSV_FILE: &str = "final_emails_master.csv";
const DEFAULT_SENDGRID_URL: &str = "https://api.sendgrid.com";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Read(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Failed to write config: {0}")]
    Write(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Cannot find config directory")]
    NoConfigDir,
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Which transport delivers the campaign messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GatewayKind {
    /// SendGrid v3 HTTP API
    #[default]
    SendGrid,
    /// Authenticated SMTP relay
    Smtp,
}

impl std::fmt::Display for GatewayKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayKind::SendGrid => write!(f, "SendGrid"),
            GatewayKind::Smtp => write!(f, "SMTP"),
        }
    }
}

/// SMTP relay settings, only read when `gateway = "smtp"`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpSettings {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Implicit TLS instead of STARTTLS
    pub implicit_tls: bool,
    pub timeout_secs: u64,
}

impl Default for SmtpSettings {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: 587,
            username: String::new(),
            password: String::new(),
            implicit_tls: false,
            timeout_secs: 30,
        }
    }
}

/// Everything a campaign run needs to know about its environment.
///
/// Loaded once by the front end and passed explicitly into the driver and
/// the gateway constructors. [`CampaignConfig::set_source`] is the reload
/// path used when the operator switches to another recipient list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CampaignConfig {
    /// Verified sender address
    pub sender_email: String,

    /// Display name shown next to the sender address
    pub sender_name: String,

    /// Provider API key (SendGrid)
    pub sendgrid_api_key: String,

    /// SendGrid API base URL
    pub sendgrid_base_url: String,

    /// Active recipient list
    pub csv_file: PathBuf,

    /// Directory holding one progress ledger per recipient list
    pub progress_dir: PathBuf,

    /// Directory searched for `email.html` / `email.txt`
    pub content_dir: PathBuf,

    /// Transport used for delivery
    pub gateway: GatewayKind,

    /// HTTP request timeout in seconds
    pub request_timeout_secs: u64,

    /// Relay settings for the SMTP transport
    pub smtp: SmtpSettings,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            sender_email: String::new(),
            sender_name: DEFAULT_SENDER_NAME.to_string(),
            sendgrid_api_key: String::new(),
            sendgrid_base_url: DEFAULT_SENDGRID_URL.to_string(),
            csv_file: PathBuf::from(DEFAULT_CSV_FILE),
            progress_dir: PathBuf::from("progress"),
            content_dir: PathBuf::from("."),
            gateway: GatewayKind::default(),
            request_timeout_secs: 30,
            smtp: SmtpSettings::default(),
        }
    }
}

impl CampaignConfig {
    /// Default settings file location (XDG compliant)
    pub fn default_path() -> ConfigResult<PathBuf> {
        Ok(dirs::config_dir()
            .ok_or(ConfigError::NoConfigDir)?
            .join("mailcampaign")
            .join("settings.toml"))
    }

    /// Load configuration from file, falling back to defaults when absent
    pub async fn load_from_file(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            tracing::debug!("Config file {} does not exist, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::Read(e.to_string()))?;

        let config: CampaignConfig =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save_to_file(&self, path: &Path) -> ConfigResult<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Write(e.to_string()))?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ConfigError::Write(e.to_string()))?;
            }
        }

        tokio::fs::write(path, content)
            .await
            .map_err(|e| ConfigError::Write(e.to_string()))?;

        tracing::info!("Settings saved to {}", path.display());
        Ok(())
    }

    /// Check that a campaign can be sent with these settings
    pub fn validate(&self) -> ConfigResult<()> {
        if self.sender_email.trim().is_empty() || !self.sender_email.contains('@') {
            return Err(ConfigError::Invalid(format!(
                "Invalid sender email: '{}'",
                self.sender_email
            )));
        }

        match self.gateway {
            GatewayKind::SendGrid => {
                if self.sendgrid_api_key.trim().is_empty() {
                    return Err(ConfigError::Invalid(
                        "SendGrid API key is required".to_string(),
                    ));
                }
            }
            GatewayKind::Smtp => {
                if self.smtp.server.trim().is_empty() {
                    return Err(ConfigError::Invalid("SMTP server is required".to_string()));
                }
                if self.smtp.username.is_empty() || self.smtp.password.is_empty() {
                    return Err(ConfigError::Invalid(
                        "SMTP credentials are required".to_string(),
                    ));
                }
            }
        }

        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "Request timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Switch the active recipient list
    pub fn set_source(&mut self, csv_file: impl Into<PathBuf>) {
        self.csv_file = csv_file.into();
        tracing::info!("Active recipient source set to {}", self.csv_file.display());
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Optional display name, `None` when blank
    pub fn sender_display_name(&self) -> Option<&str> {
        let name = self.sender_name.trim();
        (!name.is_empty()).then_some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sendgrid_config() -> CampaignConfig {
        CampaignConfig {
            sender_email: "news@example.com".to_string(),
            sendgrid_api_key: "SG.key".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = CampaignConfig::default();
        assert_eq!(config.sender_name, "John Doe");
        assert_eq!(config.gateway, GatewayKind::SendGrid);
        assert_eq!(config.progress_dir, PathBuf::from("progress"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate() {
        assert!(sendgrid_config().validate().is_ok());

        let mut config = sendgrid_config();
        config.sendgrid_api_key.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = sendgrid_config();
        config.sender_email = "not-an-address".to_string();
        assert!(config.validate().is_err());

        let mut config = sendgrid_config();
        config.gateway = GatewayKind::Smtp;
        assert!(config.validate().is_err());
        config.smtp.server = "smtp.example.com".to_string();
        config.smtp.username = "user".to_string();
        config.smtp.password = "secret".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sender_display_name() {
        let mut config = sendgrid_config();
        assert_eq!(config.sender_display_name(), Some("John Doe"));
        config.sender_name = "   ".to_string();
        assert_eq!(config.sender_display_name(), None);
    }

    #[tokio::test]
    async fn test_missing_file_yields_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = CampaignConfig::load_from_file(&temp_dir.path().join("nope.toml"))
            .await
            .unwrap();
        assert_eq!(config, CampaignConfig::default());
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("settings.toml");

        let mut config = sendgrid_config();
        config.set_source("lists/customers.csv");
        config.save_to_file(&path).await.unwrap();

        let loaded = CampaignConfig::load_from_file(&path).await.unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.csv_file, PathBuf::from("lists/customers.csv"));
    }

    #[tokio::test]
    async fn test_partial_file_fills_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settings.toml");
        tokio::fs::write(&path, "sender_email = \"a@b.com\"\ngateway = \"smtp\"\n")
            .await
            .unwrap();

        let config = CampaignConfig::load_from_file(&path).await.unwrap();
        assert_eq!(config.sender_email, "a@b.com");
        assert_eq!(config.gateway, GatewayKind::Smtp);
        assert_eq!(config.smtp.port, 587);
        assert_eq!(config.request_timeout_secs, 30);
    }

    #[tokio::test]
    async fn test_garbage_file_is_parse_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settings.toml");
        tokio::fs::write(&path, "this is = = not toml").await.unwrap();

        let result = CampaignConfig::load_from_file(&path).await;
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
