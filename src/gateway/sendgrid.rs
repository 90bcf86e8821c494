//! SendGrid v3 mail send gateway

use crate::gateway::{GatewayError, GatewayResult, OutgoingMessage, SendGateway, SendOutcome};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

const SEND_PATH: &str = "/v3/mail/send";

/// Mail send request body
#[derive(Debug, Clone, Serialize)]
struct SendGridRequest {
    personalizations: Vec<SendGridPersonalization>,
    from: SendGridAddress,
    subject: String,
    content: Vec<SendGridContent>,
}

#[derive(Debug, Clone, Serialize)]
struct SendGridPersonalization {
    to: Vec<SendGridAddress>,
}

#[derive(Debug, Clone, Serialize)]
struct SendGridAddress {
    email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct SendGridContent {
    #[serde(rename = "type")]
    content_type: &'static str,
    value: String,
}

impl From<&OutgoingMessage> for SendGridRequest {
    fn from(message: &OutgoingMessage) -> Self {
        // The API requires text/plain to precede text/html
        let mut content = Vec::new();
        if let Some(text) = message.plain_text() {
            content.push(SendGridContent {
                content_type: "text/plain",
                value: text.to_string(),
            });
        }
        if let Some(html) = message.html() {
            content.push(SendGridContent {
                content_type: "text/html",
                value: html.to_string(),
            });
        }

        Self {
            personalizations: vec![SendGridPersonalization {
                to: message
                    .to
                    .iter()
                    .map(|email| SendGridAddress {
                        email: email.clone(),
                        name: None,
                    })
                    .collect(),
            }],
            from: SendGridAddress {
                email: message.from_address.clone(),
                name: message.from_name.clone().filter(|name| !name.is_empty()),
            },
            subject: message.subject.clone(),
            content,
        }
    }
}

/// Gateway backed by the SendGrid HTTP API
pub struct SendGridGateway {
    client: Client,
    api_key: String,
    endpoint: String,
}

impl SendGridGateway {
    pub fn new(api_key: &str, base_url: &str, request_timeout: Duration) -> GatewayResult<Self> {
        if api_key.trim().is_empty() {
            return Err(GatewayError::InvalidConfig(
                "SendGrid API key is required.".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| GatewayError::InvalidConfig(format!("HTTP client setup failed: {}", e)))?;

        tracing::info!("SendGrid client initialized successfully");
        Ok(Self {
            client,
            api_key: api_key.trim().to_string(),
            endpoint: format!("{}{}", base_url.trim_end_matches('/'), SEND_PATH),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl SendGateway for SendGridGateway {
    fn name(&self) -> &str {
        "SendGrid"
    }

    async fn deliver(&self, message: &OutgoingMessage) -> SendOutcome {
        let body = SendGridRequest::from(message);

        let response = match self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return SendOutcome::failed(&GatewayError::SendFailed(e.to_string())),
        };

        let status = response.status().as_u16();
        if matches!(status, 200..=202) {
            return SendOutcome::delivered(Some(status));
        }

        let detail = response.text().await.unwrap_or_default();
        let mut error = format!("Email sending failed with status code: {}", status);
        if !detail.trim().is_empty() {
            error.push_str(&format!(" ({})", detail.trim()));
        }
        SendOutcome::rejected(status, error)
    }
}
