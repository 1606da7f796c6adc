//! SendGrid v3 mail API transport.

use super::{MailTransport, Message};
use crate::utils::errors::NotifyError;
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

pub const DEFAULT_ENDPOINT: &str = "https://api.sendgrid.com/v3/mail/send";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct SendGridTransport {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
}

impl SendGridTransport {
    pub fn new(api_key: String, endpoint: Option<String>) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| NotifyError::Setup(e.to_string()))?;

        Ok(Self {
            client,
            api_key,
            endpoint: endpoint.unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
        })
    }
}

/// Request body for a single plain-text message
pub fn payload(message: &Message) -> serde_json::Value {
    json!({
        "personalizations": [{ "to": [{ "email": message.to }] }],
        "from": { "email": message.from },
        "subject": message.subject,
        "content": [{ "type": "text/plain", "value": message.body }],
    })
}

#[async_trait]
impl MailTransport for SendGridTransport {
    async fn send(&self, message: &Message) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload(message))
            .send()
            .await
            .map_err(|e| NotifyError::Delivery {
                recipient: message.to.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                recipient: message.to.clone(),
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }
}
