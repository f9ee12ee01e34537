pub mod dto;
pub mod email;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info};

use crate::config::{EmailConfig, PushConfig};
use crate::error::AppError;
use crate::models::{DeliveryMethod, DeliveryTarget, Notification};

pub use email::EmailGateway;

const PUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Payload handed to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryMessage {
    pub notification_id: String,
    pub owner: String,
    pub method: DeliveryMethod,
    pub target: DeliveryTarget,
    pub title: String,
    pub body: String,
    pub data: BTreeMap<String, String>,
}

impl DeliveryMessage {
    pub fn for_notification(notification: &Notification, target: DeliveryTarget) -> Self {
        let mut data = BTreeMap::new();
        data.insert("type".to_string(), notification.kind.to_string());
        data.insert("notificationId".to_string(), notification.id.clone());
        if let Some(task_id) = &notification.task_id {
            data.insert("taskId".to_string(), task_id.clone());
        }

        Self {
            notification_id: notification.id.clone(),
            owner: notification.owner.clone(),
            method: notification.delivery_method,
            target,
            title: notification.title.clone(),
            body: notification.message.clone(),
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Failed(String),
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered)
    }
}

/// Transport for a single notification. Failures are reported as
/// [`DeliveryOutcome::Failed`], never as errors or panics.
#[async_trait]
pub trait DeliveryGateway: Send + Sync {
    async fn deliver(&self, message: &DeliveryMessage) -> DeliveryOutcome;

    /// Whether notifications of this method can be served at all.
    fn supports(&self, method: DeliveryMethod) -> bool {
        method == DeliveryMethod::InApp
    }
}

/// Firebase Cloud Messaging over its HTTP API.
pub struct FcmGateway {
    client: Client,
    config: PushConfig,
}

impl FcmGateway {
    pub fn new(config: PushConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(PUSH_TIMEOUT)
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build http client: {}", e)))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl DeliveryGateway for FcmGateway {
    async fn deliver(&self, message: &DeliveryMessage) -> DeliveryOutcome {
        let DeliveryTarget::Device(token) = &message.target else {
            return DeliveryOutcome::Failed("push delivery requires a device token".to_string());
        };

        let request_body = dto::SendRequest {
            message: dto::Message {
                token,
                notification: dto::NotificationPayload {
                    title: &message.title,
                    body: &message.body,
                },
                data: &message.data,
                android: dto::AndroidConfig::default(),
                apns: dto::ApnsConfig::default(),
            },
        };

        let response = match self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.access_token)
            .json(&request_body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return DeliveryOutcome::Failed(format!("push transport error: {}", e)),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return DeliveryOutcome::Failed(format!("push rejected {}: {}", status, body));
        }

        match response.json::<dto::SendResponse>().await {
            Ok(sent) => debug!(
                "push sent for notification {}: {:?}",
                message.notification_id, sent.name
            ),
            Err(e) => debug!("push accepted with unreadable body: {}", e),
        }
        DeliveryOutcome::Delivered
    }

    fn supports(&self, method: DeliveryMethod) -> bool {
        method == DeliveryMethod::Push
    }
}

/// The stored notification row is the in-app delivery.
pub struct InAppGateway;

#[async_trait]
impl DeliveryGateway for InAppGateway {
    async fn deliver(&self, _message: &DeliveryMessage) -> DeliveryOutcome {
        DeliveryOutcome::Delivered
    }
}

/// Dispatches on the notification's delivery method.
pub struct RoutingGateway {
    push: Option<Arc<dyn DeliveryGateway>>,
    email: Option<Arc<dyn DeliveryGateway>>,
    in_app: Arc<dyn DeliveryGateway>,
}

impl RoutingGateway {
    pub fn new(push: Option<Arc<dyn DeliveryGateway>>) -> Self {
        Self {
            push,
            email: None,
            in_app: Arc::new(InAppGateway),
        }
    }

    pub fn with_email(mut self, email: Arc<dyn DeliveryGateway>) -> Self {
        self.email = Some(email);
        self
    }

    /// Builds the transports once at startup. Push and email each stay
    /// disabled without credentials.
    pub fn from_config(push: Option<&PushConfig>, email: Option<&EmailConfig>) -> Result<Self, AppError> {
        let push: Option<Arc<dyn DeliveryGateway>> = match push {
            Some(config) => {
                info!("push delivery enabled via {}", config.endpoint);
                Some(Arc::new(FcmGateway::new(config.clone())?))
            }
            None => {
                info!("push credentials not configured; reminders fall back to in-app delivery");
                None
            }
        };
        let gateway = Self::new(push);
        match email {
            Some(config) => {
                info!("email delivery enabled via {}:{}", config.smtp_host, config.smtp_port);
                Ok(gateway.with_email(Arc::new(EmailGateway::new(config)?)))
            }
            None => {
                info!("smtp credentials not configured; email reminders are disabled");
                Ok(gateway)
            }
        }
    }
}

#[async_trait]
impl DeliveryGateway for RoutingGateway {
    async fn deliver(&self, message: &DeliveryMessage) -> DeliveryOutcome {
        match message.method {
            DeliveryMethod::Push => match &self.push {
                Some(push) => push.deliver(message).await,
                None => DeliveryOutcome::Failed("push transport not configured".to_string()),
            },
            DeliveryMethod::Email => match &self.email {
                Some(email) => email.deliver(message).await,
                None => DeliveryOutcome::Failed("email transport not configured".to_string()),
            },
            DeliveryMethod::InApp => self.in_app.deliver(message).await,
            DeliveryMethod::Sms => DeliveryOutcome::Failed(format!(
                "no transport configured for {}",
                message.method
            )),
        }
    }

    fn supports(&self, method: DeliveryMethod) -> bool {
        let transport = match method {
            DeliveryMethod::Push => &self.push,
            DeliveryMethod::Email => &self.email,
            DeliveryMethod::InApp => return true,
            DeliveryMethod::Sms => return false,
        };
        transport.as_ref().is_some_and(|t| t.supports(method))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(method: DeliveryMethod) -> DeliveryMessage {
        DeliveryMessage {
            notification_id: "n1".to_string(),
            owner: "alice".to_string(),
            method,
            target: DeliveryTarget::InApp("alice".to_string()),
            title: "Task Reminder".to_string(),
            body: "Pay rent".to_string(),
            data: BTreeMap::new(),
        }
    }

    struct Recording(DeliveryMethod);

    #[async_trait]
    impl DeliveryGateway for Recording {
        async fn deliver(&self, message: &DeliveryMessage) -> DeliveryOutcome {
            if message.method == self.0 {
                DeliveryOutcome::Delivered
            } else {
                DeliveryOutcome::Failed("wrong transport".to_string())
            }
        }

        fn supports(&self, method: DeliveryMethod) -> bool {
            method == self.0
        }
    }

    #[tokio::test]
    async fn routing_without_push_falls_back_to_failure_for_push() {
        let gateway = RoutingGateway::new(None);
        assert!(!gateway.supports(DeliveryMethod::Push));
        assert!(!gateway.supports(DeliveryMethod::Email));
        assert!(gateway.supports(DeliveryMethod::InApp));
        assert!(gateway.deliver(&message(DeliveryMethod::InApp)).await.is_delivered());
        assert!(!gateway.deliver(&message(DeliveryMethod::Push)).await.is_delivered());
        assert!(!gateway.deliver(&message(DeliveryMethod::Email)).await.is_delivered());
    }

    #[tokio::test]
    async fn routing_hands_email_to_the_email_transport() {
        let gateway = RoutingGateway::new(None).with_email(Arc::new(Recording(DeliveryMethod::Email)));
        assert!(gateway.supports(DeliveryMethod::Email));
        assert!(!gateway.supports(DeliveryMethod::Push));
        assert!(!gateway.supports(DeliveryMethod::Sms));
        assert!(gateway.deliver(&message(DeliveryMethod::Email)).await.is_delivered());
        assert!(!gateway.deliver(&message(DeliveryMethod::Sms)).await.is_delivered());
    }

    #[tokio::test]
    async fn fcm_rejects_non_device_targets_without_a_request() {
        let gateway = FcmGateway::new(PushConfig {
            endpoint: "http://127.0.0.1:9/send".to_string(),
            access_token: "token".to_string(),
        })
        .unwrap();
        let outcome = gateway.deliver(&message(DeliveryMethod::Push)).await;
        assert_eq!(
            outcome,
            DeliveryOutcome::Failed("push delivery requires a device token".to_string())
        );
    }
}
