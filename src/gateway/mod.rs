pub mod sendgrid;
pub mod smtp;

pub use sendgrid::SendGridGateway;
pub use smtp::SmtpGateway;

use crate::config::{CampaignConfig, GatewayKind};
use crate::content::MessageContent;
use crate::recipients::is_valid_address;
use async_trait::async_trait;
use thiserror::Error;

/// Gateway errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid gateway configuration: {0}")]
    InvalidConfig(String),

    #[error("Message build error: {0}")]
    MessageBuild(String),

    #[error("Send failed: {0}")]
    SendFailed(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// A message ready to hand to a gateway
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub from_address: String,
    pub from_name: Option<String>,
    pub to: Vec<String>,
    pub subject: String,
    pub plain_text: Option<String>,
    pub html: Option<String>,
}

impl OutgoingMessage {
    /// Campaign message for a single recipient
    pub fn for_recipient(
        from_address: &str,
        from_name: Option<&str>,
        recipient: &str,
        content: &MessageContent,
    ) -> Self {
        Self {
            from_address: from_address.trim().to_string(),
            from_name: from_name.map(str::to_string),
            to: vec![recipient.to_string()],
            subject: content.subject.clone(),
            plain_text: content.plain_text.clone(),
            html: content.html.clone(),
        }
    }

    pub fn plain_text(&self) -> Option<&str> {
        self.plain_text.as_deref().filter(|body| !body.is_empty())
    }

    pub fn html(&self) -> Option<&str> {
        self.html.as_deref().filter(|body| !body.is_empty())
    }

    /// Local checks that must pass before any network call
    pub fn validate(&self) -> GatewayResult<()> {
        if !is_valid_address(&self.from_address) {
            return Err(GatewayError::Validation(format!(
                "Invalid sender email: {}",
                self.from_address
            )));
        }

        if self.to.is_empty() {
            return Err(GatewayError::Validation(
                "At least one recipient email is required".to_string(),
            ));
        }

        if let Some(bad) = self.to.iter().find(|to| !is_valid_address(to)) {
            return Err(GatewayError::Validation(format!("Invalid recipient email: {}", bad)));
        }

        if self.subject.trim().is_empty() {
            return Err(GatewayError::Validation("Email subject cannot be empty".to_string()));
        }

        if self.plain_text().is_none() && self.html().is_none() {
            return Err(GatewayError::Validation(
                "Either plain text or HTML content is required".to_string(),
            ));
        }

        Ok(())
    }
}

/// Result of one send through a gateway
#[derive(Debug, Clone, PartialEq)]
pub struct SendOutcome {
    pub success: bool,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

impl SendOutcome {
    pub fn delivered(status_code: Option<u16>) -> Self {
        Self {
            success: true,
            status_code,
            error: None,
        }
    }

    pub fn rejected(status_code: u16, error: impl Into<String>) -> Self {
        Self {
            success: false,
            status_code: Some(status_code),
            error: Some(error.into()),
        }
    }

    pub fn failed(error: &GatewayError) -> Self {
        Self {
            success: false,
            status_code: None,
            error: Some(error.to_string()),
        }
    }

    /// Diagnostic suitable for a status line or a ledger record
    pub fn diagnostic(&self) -> String {
        match (&self.error, self.status_code) {
            (Some(error), _) => error.clone(),
            (None, Some(code)) if !self.success => format!("status code {}", code),
            _ if self.success => "Email sent successfully".to_string(),
            _ => "Unknown error".to_string(),
        }
    }
}

/// Outbound transport for campaign messages
#[async_trait]
pub trait SendGateway: Send + Sync {
    /// Gateway name for log lines
    fn name(&self) -> &str;

    /// Hand an already validated message to the transport
    async fn deliver(&self, message: &OutgoingMessage) -> SendOutcome;

    /// Validate locally, then deliver.
    ///
    /// Never returns an error: every failure is folded into the outcome.
    async fn send(&self, message: &OutgoingMessage) -> SendOutcome {
        if let Err(e) = message.validate() {
            tracing::warn!("Not sending to {:?}: {}", message.to, e);
            return SendOutcome::failed(&e);
        }

        tracing::info!("Sending email to {} recipient(s) via {}", message.to.len(), self.name());
        let outcome = self.deliver(message).await;
        if outcome.success {
            tracing::info!("Email sent successfully! Status code: {:?}", outcome.status_code);
        } else {
            tracing::error!("Email sending failed: {}", outcome.diagnostic());
        }
        outcome
    }
}

/// Build the gateway selected by the configuration
pub fn build_gateway(config: &CampaignConfig) -> GatewayResult<Box<dyn SendGateway>> {
    match config.gateway {
        GatewayKind::SendGrid => Ok(Box::new(SendGridGateway::new(
            &config.sendgrid_api_key,
            &config.sendgrid_base_url,
            config.request_timeout(),
        )?)),
        GatewayKind::Smtp => Ok(Box::new(SmtpGateway::new(&config.smtp)?)),
    }
}
