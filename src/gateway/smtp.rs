//! SMTP relay gateway

use crate::config::SmtpSettings;
use crate::gateway::{GatewayError, GatewayResult, OutgoingMessage, SendGateway, SendOutcome};
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox, MultiPart},
    transport::smtp::{
        authentication::{Credentials, Mechanism},
        client::{Tls, TlsParameters},
    },
    Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::time::Duration;

/// Gateway delivering through an authenticated SMTP relay
pub struct SmtpGateway {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    server: String,
}

impl SmtpGateway {
    pub fn new(settings: &SmtpSettings) -> GatewayResult<Self> {
        if settings.server.trim().is_empty() {
            return Err(GatewayError::InvalidConfig("SMTP server is required".to_string()));
        }
        if settings.username.is_empty() || settings.password.is_empty() {
            return Err(GatewayError::InvalidConfig(
                "SMTP credentials are required".to_string(),
            ));
        }

        let tls_parameters = TlsParameters::new(settings.server.clone())
            .map_err(|e| GatewayError::InvalidConfig(format!("TLS configuration failed: {}", e)))?;
        let tls = if settings.implicit_tls {
            Tls::Wrapper(tls_parameters)
        } else {
            Tls::Required(tls_parameters)
        };

        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.server)
            .port(settings.port)
            .timeout(Some(Duration::from_secs(settings.timeout_secs)))
            .tls(tls)
            .credentials(Credentials::new(
                settings.username.clone(),
                settings.password.clone(),
            ))
            .authentication(vec![Mechanism::Plain, Mechanism::Login])
            .build();

        tracing::info!("SMTP transport configured for {}:{}", settings.server, settings.port);
        Ok(Self {
            transport,
            server: settings.server.clone(),
        })
    }
}

/// Convert an outgoing message into a MIME message
pub fn build_message(message: &OutgoingMessage) -> GatewayResult<Message> {
    let from_address: Address = message
        .from_address
        .parse()
        .map_err(|e| GatewayError::Validation(format!("Invalid sender email: {}", e)))?;
    let mut builder = Message::builder()
        .from(Mailbox::new(message.from_name.clone(), from_address))
        .subject(message.subject.clone());

    for to in &message.to {
        let address: Address = to
            .parse()
            .map_err(|e| GatewayError::Validation(format!("Invalid recipient email {}: {}", to, e)))?;
        builder = builder.to(Mailbox::new(None, address));
    }

    let built = match (message.plain_text(), message.html()) {
        (Some(text), Some(html)) => {
            builder.multipart(MultiPart::alternative_plain_html(text.to_string(), html.to_string()))
        }
        (Some(text), None) => builder.header(ContentType::TEXT_PLAIN).body(text.to_string()),
        (None, Some(html)) => builder.header(ContentType::TEXT_HTML).body(html.to_string()),
        (None, None) => {
            return Err(GatewayError::Validation(
                "Either plain text or HTML content is required".to_string(),
            ))
        }
    };

    built.map_err(|e| GatewayError::MessageBuild(e.to_string()))
}

#[async_trait]
impl SendGateway for SmtpGateway {
    fn name(&self) -> &str {
        "SMTP"
    }

    async fn deliver(&self, message: &OutgoingMessage) -> SendOutcome {
        let mime = match build_message(message) {
            Ok(mime) => mime,
            Err(e) => return SendOutcome::failed(&e),
        };

        match self.transport.send(mime).await {
            Ok(response) => {
                let code = response.code().to_string().parse::<u16>().ok();
                if response.is_positive() {
                    SendOutcome::delivered(code)
                } else {
                    let detail = response.message().collect::<Vec<_>>().join(" ");
                    SendOutcome::rejected(code.unwrap_or_default(), detail)
                }
            }
            Err(e) => {
                tracing::debug!("SMTP send via {} failed: {}", self.server, e);
                SendOutcome::failed(&GatewayError::SendFailed(e.to_string()))
            }
        }
    }
}
