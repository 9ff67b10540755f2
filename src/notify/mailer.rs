use std::future::Future;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// A rendered message ready for a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    /// "Name <address>" of the sender; also used as reply-to
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub body: String,
}

/// Mail transport used by the notification worker.
pub trait Mailer: Send + Sync + 'static {
    fn send(&self, message: &EmailMessage) -> impl Future<Output = Result<()>> + Send;
}

/// Transport that writes messages to the log instead of sending them.
#[derive(Debug, Clone, Default)]
pub struct LogMailer;

impl Mailer for LogMailer {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        tracing::info!(
            from = %message.from,
            to = ?message.to,
            cc = ?message.cc,
            subject = %message.subject,
            "Outgoing email"
        );
        tracing::debug!(body = %message.body, "Outgoing email body");
        Ok(())
    }
}
