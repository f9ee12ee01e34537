use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct SendRequest<'a> {
    pub message: Message<'a>,
}

#[derive(Debug, Serialize)]
pub struct Message<'a> {
    pub token: &'a str,
    pub notification: NotificationPayload<'a>,
    pub data: &'a BTreeMap<String, String>,
    pub android: AndroidConfig,
    pub apns: ApnsConfig,
}

#[derive(Debug, Serialize)]
pub struct NotificationPayload<'a> {
    pub title: &'a str,
    pub body: &'a str,
}

#[derive(Debug, Serialize)]
pub struct AndroidConfig {
    pub notification: AndroidNotification,
}

#[derive(Debug, Serialize)]
pub struct AndroidNotification {
    pub icon: &'static str,
    pub color: &'static str,
    pub sound: &'static str,
}

impl Default for AndroidConfig {
    fn default() -> Self {
        Self {
            notification: AndroidNotification {
                icon: "ic_notification",
                color: "#2563eb",
                sound: "default",
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApnsConfig {
    pub payload: serde_json::Value,
}

impl Default for ApnsConfig {
    fn default() -> Self {
        Self {
            payload: serde_json::json!({ "aps": { "sound": "default" } }),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SendResponse {
    #[serde(default)]
    pub name: Option<String>,
}
