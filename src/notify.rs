use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    /// The channel watched by whoever runs this host.
    Operator,
    User(i64),
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::Operator => f.write_str("operator"),
            Recipient::User(id) => write!(f, "user {id}"),
        }
    }
}

/// Fire-and-forget message delivery. Implementations must not block and
/// must never fail the caller.
pub trait Notifier: Send + Sync {
    fn notify(&self, to: Recipient, message: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, to: Recipient, message: &str) {
        tracing::info!(recipient = %to, "{message}");
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    recipient: &'static str,
    user_id: Option<i64>,
    message: &'a str,
}

/// Posts every message as JSON to a configured URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, to: Recipient, message: &str) {
        LogNotifier.notify(to, message);

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(url = %self.url, "no runtime available, webhook skipped");
            return;
        };
        let (recipient, user_id) = match to {
            Recipient::Operator => ("operator", None),
            Recipient::User(id) => ("user", Some(id)),
        };
        let body = match serde_json::to_value(WebhookPayload {
            recipient,
            user_id,
            message,
        }) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode webhook payload");
                return;
            }
        };
        let client = self.client.clone();
        let url = self.url.clone();
        handle.spawn(async move {
            match client.post(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => {
                    tracing::warn!(%url, status = %resp.status(), "webhook returned error status")
                }
                Err(e) => tracing::warn!(%url, error = %e, "failed to send webhook"),
            }
        });
    }
}
