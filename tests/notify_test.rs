mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use common::{date, repay, test_service, Borrower};
use microlend::application::{ClientUpdate, NewRepayment};
use microlend::domain::{LoanStatus, PaymentMode};
use microlend::notify::{
    deliver_confirmation, DeliveryOutcome, EmailMessage, MailConfig, Mailer, RepaymentNotifier,
};

/// Keeps every message it is asked to send
#[derive(Clone, Default)]
struct RecordingMailer {
    sent: Arc<Mutex<Vec<EmailMessage>>>,
}

impl RecordingMailer {
    fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().unwrap().clone()
    }
}

impl Mailer for RecordingMailer {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// Fails the first `failures` sends, then succeeds
#[derive(Clone, Default)]
struct FlakyMailer {
    failures: u32,
    calls: Arc<AtomicU32>,
}

impl Mailer for FlakyMailer {
    async fn send(&self, _message: &EmailMessage) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            bail!("smtp unavailable (attempt {})", call);
        }
        Ok(())
    }
}

fn fast_config(cc: Option<&str>) -> MailConfig {
    MailConfig {
        cc_address: cc.map(String::from),
        retry_backoff: Duration::from_millis(1),
        ..MailConfig::default()
    }
}

#[tokio::test]
async fn test_posting_sends_confirmation() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let mailer = RecordingMailer::default();
    let (notifier, worker) =
        RepaymentNotifier::spawn(mailer.clone(), fast_config(Some("admin@microlend.local")));
    let service = service.with_notifier(notifier);

    let borrower = Borrower::create(&service).await?;
    let loan = borrower.loan(&service, 1_000_000, 1000, 12).await?;
    service
        .post_repayment(NewRepayment {
            loan_id: loan.id,
            amount_cents: 1_100_000,
            payment_date: date("2025-06-10"),
            payment_mode: PaymentMode::Bank,
            reference: Some("TX-77".into()),
        })
        .await?;

    // Dropping the service closes the queue; the worker drains and exits
    drop(service);
    worker.await?;

    let sent = mailer.sent();
    assert_eq!(sent.len(), 1);
    let message = &sent[0];
    assert_eq!(message.to, vec!["amina@example.com"]);
    assert_eq!(message.cc, vec!["admin@microlend.local"]);
    assert_eq!(
        message.subject,
        "Loan Repayment Confirmation - Reference: TX-77"
    );
    assert_eq!(message.from, "Microlend <no-reply@microlend.local>");
    assert!(message.body.contains("Dear Amina,"));
    assert!(message.body.contains("Loan status:    CLOSED"));
    assert!(message.body.contains("Branch:         Central"));

    Ok(())
}

#[tokio::test]
async fn test_no_recipients_sends_nothing() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let mailer = RecordingMailer::default();
    let (notifier, worker) = RepaymentNotifier::spawn(mailer.clone(), fast_config(None));
    let service = service.with_notifier(notifier);

    let borrower = Borrower::create(&service).await?;
    service
        .update_client(
            borrower.client.id,
            ClientUpdate {
                email: Some(String::new()),
                ..ClientUpdate::default()
            },
        )
        .await?;
    let loan = borrower.loan(&service, 1_000_000, 1000, 12).await?;
    repay(&service, &loan, 100_000).await?;

    drop(service);
    worker.await?;
    assert!(mailer.sent().is_empty());

    Ok(())
}

#[tokio::test]
async fn test_mail_failure_does_not_affect_posting() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let mailer = FlakyMailer {
        failures: u32::MAX,
        ..FlakyMailer::default()
    };
    let calls = mailer.calls.clone();
    let (notifier, worker) = RepaymentNotifier::spawn(mailer, fast_config(None));
    let service = service.with_notifier(notifier);

    let borrower = Borrower::create(&service).await?;
    let loan = borrower.loan(&service, 1_000_000, 1000, 12).await?;
    let result = repay(&service, &loan, 1_100_000).await?;
    assert_eq!(result.loan.status, LoanStatus::Closed);
    assert_eq!(service.loan_summary(loan.id).await?.total_repaid, 1_100_000);

    drop(service);
    worker.await?;
    assert_eq!(calls.load(Ordering::SeqCst), MailConfig::default().max_attempts);

    Ok(())
}

#[tokio::test]
async fn test_delivery_retries_until_sent() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let borrower = Borrower::create(&service).await?;
    let loan = borrower.loan(&service, 1_000_000, 1000, 12).await?;
    let result = repay(&service, &loan, 100_000).await?;
    let event = service.repayment_event(result.repayment).await?;

    let mailer = FlakyMailer {
        failures: 1,
        ..FlakyMailer::default()
    };
    let outcome = deliver_confirmation(&mailer, &fast_config(None), &event).await;
    assert_eq!(outcome, DeliveryOutcome::Sent { attempts: 2 });

    let broken = FlakyMailer {
        failures: u32::MAX,
        ..FlakyMailer::default()
    };
    let outcome = deliver_confirmation(&broken, &fast_config(None), &event).await;
    assert_eq!(outcome, DeliveryOutcome::Failed { attempts: 3 });

    Ok(())
}

#[tokio::test]
async fn test_stopped_worker_drops_events() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let (notifier, worker) =
        RepaymentNotifier::spawn(RecordingMailer::default(), fast_config(None));
    worker.abort();
    let _ = worker.await;
    let service = service.with_notifier(notifier);

    let borrower = Borrower::create(&service).await?;
    let loan = borrower.loan(&service, 1_000_000, 1000, 12).await?;
    let result = repay(&service, &loan, 100_000).await?;
    assert_eq!(result.summary.total_repaid, 100_000);

    Ok(())
}
