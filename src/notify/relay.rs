// src/notify/relay.rs
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use super::{token_hash, Notification, Platform, PushSender};
use crate::error::IngestError;

/// Hands each notification to an HTTP push relay (APNs/FCM/WebPush live
/// behind it). Retries transport and 5xx failures with exponential backoff.
#[derive(Clone)]
pub struct RelayPushSender {
    endpoint: String,
    client: Client,
    timeout: Duration,
    max_retries: u8,
}

impl RelayPushSender {
    pub fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            client: Client::new(),
            timeout: Duration::from_secs(5),
            max_retries: 3,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    pub fn with_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries.max(1);
        self
    }
}

#[derive(Serialize)]
struct RelayRequest<'a> {
    platform: &'a str,
    token: &'a str,
    notification: &'a Notification,
}

#[async_trait::async_trait]
impl PushSender for RelayPushSender {
    async fn send(&self, platform: Platform, token: &str, notification: &Notification) -> Result<(), IngestError> {
        let payload = RelayRequest {
            platform: platform.as_str(),
            token,
            notification,
        };
        let fail = |reason: String| IngestError::Delivery {
            token: token_hash(token),
            reason,
        };

        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let res = self
                .client
                .post(&self.endpoint)
                .timeout(self.timeout)
                .json(&payload)
                .send()
                .await;

            let retryable = match res {
                Ok(rsp) => match rsp.error_for_status_ref() {
                    Ok(_) => return Ok(()),
                    // 4xx means the relay rejected this token; retrying won't help
                    Err(e) if rsp.status().is_client_error() => {
                        return Err(fail(format!("relay HTTP error: {e}")))
                    }
                    Err(e) => format!("relay HTTP error: {e}"),
                },
                Err(e) => format!("relay request failed: {e}"),
            };
            if attempt >= self.max_retries {
                return Err(fail(retryable));
            }
            tokio::time::sleep(Duration::from_millis(500u64 << (attempt - 1))).await;
        }
    }
}
