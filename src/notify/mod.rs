//! Repayment confirmation notifications.
//!
//! The ledger hands a [`RepaymentPosted`] value to a [`RepaymentNotifier`] and
//! moves on. A background task renders the confirmation, sends it through a
//! [`Mailer`] and owns retries. Delivery problems are logged and never reach
//! the code that posted the repayment.

mod mailer;
mod message;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::domain::{Branch, Client, Loan, LoanSummary, Repayment};

pub use mailer::*;
pub use message::*;

/// Emitted after a repayment has been committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepaymentPosted {
    /// Loan as it stands after the posting (status already updated)
    pub loan: Loan,
    pub repayment: Repayment,
    pub client: Client,
    pub branch: Option<Branch>,
    pub summary: LoanSummary,
}

/// Sender identity, admin copy address and delivery policy.
#[derive(Debug, Clone)]
pub struct MailConfig {
    pub from_address: String,
    pub from_name: String,
    /// Copied on every confirmation
    pub cc_address: Option<String>,
    /// Delivery attempts per message, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt; grows linearly
    pub retry_backoff: Duration,
    /// Events waiting for delivery before new ones are dropped
    pub queue_capacity: usize,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            from_address: "no-reply@microlend.local".to_string(),
            from_name: "Microlend".to_string(),
            cc_address: None,
            max_attempts: 3,
            retry_backoff: Duration::from_secs(2),
            queue_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent { attempts: u32 },
    NoRecipients,
    Failed { attempts: u32 },
}

/// Handle for queueing confirmations. Cheap to clone.
///
/// The worker stops once every handle has been dropped and the queue drained.
#[derive(Debug, Clone)]
pub struct RepaymentNotifier {
    tx: mpsc::Sender<RepaymentPosted>,
}

impl RepaymentNotifier {
    /// Start the delivery worker on the current tokio runtime.
    pub fn spawn<M: Mailer>(mailer: M, config: MailConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let handle = tokio::spawn(run_worker(rx, mailer, config));
        (Self { tx }, handle)
    }

    /// Queue a confirmation without waiting. A full or closed queue drops the event.
    pub fn notify(&self, event: RepaymentPosted) {
        let repayment_id = event.repayment.id;
        match self.tx.try_send(event) {
            Ok(()) => tracing::debug!(%repayment_id, "Queued repayment confirmation"),
            Err(TrySendError::Full(_)) => tracing::warn!(
                %repayment_id,
                "Notification queue full, dropping repayment confirmation"
            ),
            Err(TrySendError::Closed(_)) => tracing::warn!(
                %repayment_id,
                "Notification worker stopped, dropping repayment confirmation"
            ),
        }
    }
}

async fn run_worker<M: Mailer>(
    mut rx: mpsc::Receiver<RepaymentPosted>,
    mailer: M,
    config: MailConfig,
) {
    tracing::info!("Repayment notification worker started");
    while let Some(event) = rx.recv().await {
        deliver_confirmation(&mailer, &config, &event).await;
    }
    tracing::info!("Repayment notification worker stopped");
}

/// Render and send one confirmation, retrying per `config`.
pub async fn deliver_confirmation<M: Mailer>(
    mailer: &M,
    config: &MailConfig,
    event: &RepaymentPosted,
) -> DeliveryOutcome {
    let repayment_id = event.repayment.id;

    let Some(message) = render_confirmation(event, config) else {
        tracing::warn!(
            %repayment_id,
            client_id = %event.client.id,
            "No email recipients found for repayment notification"
        );
        return DeliveryOutcome::NoRecipients;
    };

    let max_attempts = config.max_attempts.max(1);
    for attempt in 1..=max_attempts {
        match mailer.send(&message).await {
            Ok(()) => {
                tracing::info!(
                    %repayment_id,
                    client_id = %event.client.id,
                    amount_cents = event.repayment.amount_cents,
                    reference = ?event.repayment.reference,
                    recipients = ?message.to,
                    cc = ?message.cc,
                    "Repayment confirmation email sent"
                );
                return DeliveryOutcome::Sent { attempts: attempt };
            }
            Err(e) if attempt < max_attempts => {
                tracing::warn!(
                    %repayment_id,
                    attempt,
                    error = %e,
                    "Repayment confirmation failed, retrying"
                );
                tokio::time::sleep(config.retry_backoff * attempt).await;
            }
            Err(e) => {
                tracing::error!(
                    %repayment_id,
                    attempts = attempt,
                    error = ?e,
                    "Failed to send repayment confirmation email"
                );
            }
        }
    }
    DeliveryOutcome::Failed {
        attempts: max_attempts,
    }
}
