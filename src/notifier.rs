//! Admission confirmations.
//!
//! The engine hands a [`Confirmation`] to a [`Notifier`] after the admitting transaction
//! commits. Delivery runs on a spawned task; failures are logged and dropped, never returned
//! to the caller.

use crate::types::{OrderId, OrderKind, User};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// What the owner is told when their order enters the queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Confirmation {
    pub order_id: OrderId,
    pub kind: OrderKind,
    pub position: u32,
    pub owner: User,
}

/// Rendered email body for a [`Confirmation`].
#[derive(Clone, Debug, Serialize)]
pub struct ConfirmationEmail {
    pub to: String,
    pub subject: String,
    pub html: String,
}

impl Confirmation {
    pub fn render(&self) -> ConfirmationEmail {
        let html = format!(
            "<!DOCTYPE html>\n<html>\n<body style=\"font-family:Arial,Helvetica,sans-serif;\">\n\
             <h1>Order confirmed</h1>\n\
             <p>Hello {name},</p>\n\
             <p>We received your {kind} request (order #{id}). You are number {position} in the queue.</p>\n\
             <p>This is an automated message. Please do not reply.</p>\n\
             </body>\n</html>\n",
            name = html_escape(&self.owner.display_name),
            kind = self.kind.as_str().to_lowercase(),
            id = self.order_id,
            position = self.position,
        );
        ConfirmationEmail {
            to: self.owner.email.clone(),
            subject: "Your order has been received".to_string(),
            html,
        }
    }
}

fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn order_confirmed(&self, confirmation: &Confirmation) -> Result<(), NotifyError>;
}

/// Logs the rendered email instead of sending it. Used when no delivery endpoint is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn order_confirmed(&self, confirmation: &Confirmation) -> Result<(), NotifyError> {
        let email = confirmation.render();
        log::info!(
            "confirmation email to={} subject={:?} order_id={} position={}",
            email.to,
            email.subject,
            confirmation.order_id,
            confirmation.position
        );
        Ok(())
    }
}

/// POSTs the rendered email as JSON to a mail relay.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn order_confirmed(&self, confirmation: &Confirmation) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(&confirmation.render())
            .send()
            .await
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;
        if !response.status().is_success() {
            return Err(NotifyError::Delivery(format!("relay answered {}", response.status())));
        }
        Ok(())
    }
}

/// Keeps every confirmation in memory. Clone shares the same buffer.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<Confirmation>>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records like [`RecordingNotifier::new`] but reports every delivery as failed.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<Confirmation> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn order_confirmed(&self, confirmation: &Confirmation) -> Result<(), NotifyError> {
        self.sent.lock().push(confirmation.clone());
        if self.fail {
            return Err(NotifyError::Delivery("recording notifier set to fail".into()));
        }
        Ok(())
    }
}

/// Fire-and-forget delivery on the current tokio runtime.
///
/// Outside a runtime (plain unit tests, CLI) the confirmation is dropped with a warning.
pub fn dispatch(notifier: Arc<dyn Notifier>, confirmation: Confirmation) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(e) = notifier.order_confirmed(&confirmation).await {
                    log::warn!(
                        "confirmation not delivered order_id={} to={} error={}",
                        confirmation.order_id,
                        confirmation.owner.email,
                        e
                    );
                }
            });
        }
        Err(_) => log::warn!(
            "no async runtime; confirmation dropped order_id={}",
            confirmation.order_id
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Role, UserId};

    fn confirmation() -> Confirmation {
        Confirmation {
            order_id: OrderId(9),
            kind: OrderKind::Support,
            position: 3,
            owner: User {
                id: UserId(1),
                display_name: "Ana <admin>".into(),
                email: "ana@example.com".into(),
                role: Role::User,
            },
        }
    }

    #[test]
    fn render_addresses_owner_and_escapes_name() {
        let email = confirmation().render();
        assert_eq!(email.to, "ana@example.com");
        assert!(email.html.contains("Ana &lt;admin&gt;"));
        assert!(email.html.contains("order #9"));
        assert!(email.html.contains("number 3"));
    }

    #[tokio::test]
    async fn dispatch_delivers_in_background() {
        let recorder = RecordingNotifier::new();
        dispatch(Arc::new(recorder.clone()), confirmation());
        for _ in 0..50 {
            if !recorder.sent().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(recorder.sent(), vec![confirmation()]);
    }

    #[tokio::test]
    async fn failed_delivery_is_swallowed() {
        let recorder = RecordingNotifier::failing();
        assert!(recorder.order_confirmed(&confirmation()).await.is_err());
        dispatch(Arc::new(recorder.clone()), confirmation());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(recorder.sent().len(), 2);
    }

    #[test]
    fn dispatch_without_runtime_does_not_panic() {
        let recorder = RecordingNotifier::new();
        dispatch(Arc::new(recorder.clone()), confirmation());
        assert!(recorder.sent().is_empty());
    }
}
