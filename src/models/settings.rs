use serde::{Deserialize, Serialize};

use super::DeliveryMethod;

/// Per-user delivery preferences and registered devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSettings {
    pub owner: String,
    pub push_enabled: bool,
    pub email_enabled: bool,
    pub email: Option<String>,
    pub device_tokens: Vec<String>,
}

impl UserSettings {
    /// Defaults for a user who never saved settings.
    pub fn defaults_for(owner: &str) -> Self {
        Self {
            owner: owner.to_string(),
            push_enabled: true,
            email_enabled: false,
            email: None,
            device_tokens: Vec::new(),
        }
    }

    /// Push when it is enabled, a device is registered and a push transport
    /// exists. Otherwise email when it is enabled, an address is set and an
    /// email transport exists. In-app last.
    pub fn delivery_target(
        &self,
        supports: impl Fn(DeliveryMethod) -> bool,
    ) -> (DeliveryMethod, DeliveryTarget) {
        if self.push_enabled && supports(DeliveryMethod::Push) {
            if let Some(token) = self.device_tokens.last() {
                return (DeliveryMethod::Push, DeliveryTarget::Device(token.clone()));
            }
        }
        if self.email_enabled && supports(DeliveryMethod::Email) {
            if let Some(email) = &self.email {
                return (DeliveryMethod::Email, DeliveryTarget::Email(email.clone()));
            }
        }
        (DeliveryMethod::InApp, DeliveryTarget::InApp(self.owner.clone()))
    }

    /// Where a notification with an already chosen method goes today.
    /// Devices and addresses may have changed since it was created.
    pub fn target_for(&self, method: DeliveryMethod) -> DeliveryTarget {
        match method {
            DeliveryMethod::Push => match self.device_tokens.last() {
                Some(token) => DeliveryTarget::Device(token.clone()),
                None => DeliveryTarget::InApp(self.owner.clone()),
            },
            DeliveryMethod::Email => match &self.email {
                Some(email) => DeliveryTarget::Email(email.clone()),
                None => DeliveryTarget::InApp(self.owner.clone()),
            },
            DeliveryMethod::Sms | DeliveryMethod::InApp => DeliveryTarget::InApp(self.owner.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum DeliveryTarget {
    Device(String),
    Email(String),
    InApp(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateSettingsRequest {
    pub push_enabled: Option<bool>,
    pub email_enabled: Option<bool>,
    pub email: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn everything(_: DeliveryMethod) -> bool {
        true
    }

    fn in_app_only(method: DeliveryMethod) -> bool {
        method == DeliveryMethod::InApp
    }

    #[test]
    fn push_requires_a_token_and_an_enabled_transport() {
        let mut settings = UserSettings::defaults_for("alice");
        assert_eq!(settings.delivery_target(everything).0, DeliveryMethod::InApp);

        settings.device_tokens.push("token-1".to_string());
        assert_eq!(
            settings.delivery_target(everything),
            (DeliveryMethod::Push, DeliveryTarget::Device("token-1".to_string()))
        );
        assert_eq!(settings.delivery_target(in_app_only).0, DeliveryMethod::InApp);

        settings.push_enabled = false;
        assert_eq!(settings.delivery_target(everything).0, DeliveryMethod::InApp);
    }

    #[test]
    fn email_is_used_when_push_cannot_be() {
        let mut settings = UserSettings::defaults_for("alice");
        settings.email_enabled = true;
        assert_eq!(settings.delivery_target(everything).0, DeliveryMethod::InApp);

        settings.email = Some("alice@example.com".to_string());
        assert_eq!(
            settings.delivery_target(everything),
            (DeliveryMethod::Email, DeliveryTarget::Email("alice@example.com".to_string()))
        );
        assert_eq!(settings.delivery_target(in_app_only).0, DeliveryMethod::InApp);

        // a usable push device still wins
        settings.device_tokens.push("token-1".to_string());
        assert_eq!(settings.delivery_target(everything).0, DeliveryMethod::Push);

        settings.email_enabled = false;
        settings.push_enabled = false;
        assert_eq!(settings.delivery_target(everything).0, DeliveryMethod::InApp);
    }
}
