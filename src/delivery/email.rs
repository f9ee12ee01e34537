use std::time::Duration;

use async_trait::async_trait;
use lettre::message::{Mailbox, header::ContentType};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::debug;

use super::{DeliveryGateway, DeliveryMessage, DeliveryOutcome};
use crate::config::EmailConfig;
use crate::error::AppError;
use crate::models::{DeliveryMethod, DeliveryTarget};

const SMTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Plain-text reminder mail over an authenticated STARTTLS relay.
pub struct EmailGateway {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailGateway {
    pub fn new(config: &EmailConfig) -> Result<Self, AppError> {
        let from: Mailbox = config
            .from
            .parse()
            .map_err(|e| AppError::Config(format!("FROM_EMAIL is not a valid mailbox: {}", e)))?;
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            .map_err(|e| AppError::Config(format!("SMTP relay {} is unusable: {}", config.smtp_host, e)))?
            .port(config.smtp_port)
            .credentials(Credentials::new(config.username.clone(), config.password.clone()))
            .timeout(Some(SMTP_TIMEOUT))
            .build();
        Ok(Self { transport, from })
    }

    fn compose(&self, address: &str, message: &DeliveryMessage) -> Result<Message, String> {
        let to: Mailbox = address
            .parse()
            .map_err(|e| format!("recipient {} is invalid: {}", address, e))?;
        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(message.title.clone())
            .header(ContentType::TEXT_PLAIN)
            .body(message.body.clone())
            .map_err(|e| format!("email could not be built: {}", e))
    }
}

#[async_trait]
impl DeliveryGateway for EmailGateway {
    async fn deliver(&self, message: &DeliveryMessage) -> DeliveryOutcome {
        let DeliveryTarget::Email(address) = &message.target else {
            return DeliveryOutcome::Failed("email delivery requires an address".to_string());
        };
        let email = match self.compose(address, message) {
            Ok(email) => email,
            Err(reason) => return DeliveryOutcome::Failed(reason),
        };

        match self.transport.send(email).await {
            Ok(response) => {
                debug!(
                    "email sent for notification {}: {}",
                    message.notification_id,
                    response.code()
                );
                DeliveryOutcome::Delivered
            }
            Err(e) => DeliveryOutcome::Failed(format!("smtp error: {}", e)),
        }
    }

    fn supports(&self, method: DeliveryMethod) -> bool {
        method == DeliveryMethod::Email
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn config(from: &str) -> EmailConfig {
        EmailConfig {
            smtp_host: "smtp.example.com".to_string(),
            smtp_port: 587,
            username: "mailer".to_string(),
            password: "secret".to_string(),
            from: from.to_string(),
        }
    }

    fn message(target: DeliveryTarget) -> DeliveryMessage {
        DeliveryMessage {
            notification_id: "n1".to_string(),
            owner: "alice".to_string(),
            method: DeliveryMethod::Email,
            target,
            title: "Task Reminder: Pay rent".to_string(),
            body: "Pay rent is due 2025-07-15 09:00 (high priority)".to_string(),
            data: BTreeMap::new(),
        }
    }

    #[test]
    fn sender_must_be_a_mailbox() {
        assert!(EmailGateway::new(&config("TaskReminder <noreply@example.com>")).is_ok());
        assert!(matches!(
            EmailGateway::new(&config("not an address")),
            Err(AppError::Config(_))
        ));
    }

    #[tokio::test]
    async fn non_email_targets_fail_without_connecting() {
        let gateway = EmailGateway::new(&config("noreply@example.com")).unwrap();
        assert!(gateway.supports(DeliveryMethod::Email));
        assert!(!gateway.supports(DeliveryMethod::Push));

        let outcome = gateway
            .deliver(&message(DeliveryTarget::InApp("alice".to_string())))
            .await;
        assert_eq!(
            outcome,
            DeliveryOutcome::Failed("email delivery requires an address".to_string())
        );
    }

    #[test]
    fn compose_rejects_a_bad_recipient() {
        let gateway = EmailGateway::new(&config("noreply@example.com")).unwrap();
        let msg = message(DeliveryTarget::Email("alice@example.com".to_string()));
        assert!(gateway.compose("alice@example.com", &msg).is_ok());
        assert!(gateway.compose("alice", &msg).is_err());
    }
}
