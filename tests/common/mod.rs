// Allow dead_code because these helpers are used across different test files
// which are compiled separately
#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use chrono::NaiveDate;
use microlend::application::{
    FixedClock, LoanService, NewClient, NewLoan, NewRepayment, RepaymentResult,
};
use microlend::domain::{Branch, Cents, Client, Gender, Loan, PaymentMode, RateBps};
use tempfile::TempDir;

/// The date every test service treats as today
pub const TODAY: &str = "2025-06-15";

/// Helper to create a test service with a temporary database and a pinned clock
pub async fn test_service() -> Result<(LoanService, TempDir)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("test.db");
    let service = LoanService::init(db_path.to_str().unwrap())
        .await?
        .with_clock(Arc::new(FixedClock(date(TODAY))));
    Ok((service, temp_dir))
}

/// Helper to parse a YYYY-MM-DD string
pub fn date(date_str: &str) -> NaiveDate {
    NaiveDate::parse_from_str(date_str, "%Y-%m-%d").unwrap()
}

/// Test fixture: one branch with one client
pub struct Borrower {
    pub branch: Branch,
    pub client: Client,
}

impl Borrower {
    /// Branch "Central" and client "Amina" with an email address
    pub async fn create(service: &LoanService) -> Result<Self> {
        let branch = service
            .create_branch("Central".into(), "Gulshan".into(), "Dhaka".into())
            .await?;
        let client = service
            .create_client(NewClient {
                name: "Amina".into(),
                email: Some("amina@example.com".into()),
                phone: None,
                gender: Gender::Female,
                branch_id: branch.id,
                registration_date: date("2025-01-10"),
            })
            .await?;
        Ok(Self { branch, client })
    }

    /// Issue a loan to this borrower on 2025-06-01
    pub async fn loan(
        &self,
        service: &LoanService,
        principal_cents: Cents,
        rate_bps: RateBps,
        tenure_months: u32,
    ) -> Result<Loan> {
        self.loan_on(service, principal_cents, rate_bps, tenure_months, "2025-06-01")
            .await
    }

    pub async fn loan_on(
        &self,
        service: &LoanService,
        principal_cents: Cents,
        rate_bps: RateBps,
        tenure_months: u32,
        issue_date: &str,
    ) -> Result<Loan> {
        Ok(service
            .create_loan(NewLoan {
                client_id: self.client.id,
                branch_id: self.branch.id,
                principal_cents,
                rate_bps,
                tenure_months,
                issue_date: date(issue_date),
            })
            .await?)
    }
}

/// Post a cash repayment dated 2025-06-10
pub async fn repay(
    service: &LoanService,
    loan: &Loan,
    amount_cents: Cents,
) -> Result<RepaymentResult> {
    repay_with(service, loan, amount_cents, PaymentMode::Cash, "2025-06-10").await
}

pub async fn repay_with(
    service: &LoanService,
    loan: &Loan,
    amount_cents: Cents,
    payment_mode: PaymentMode,
    payment_date: &str,
) -> Result<RepaymentResult> {
    Ok(service
        .post_repayment(NewRepayment {
            loan_id: loan.id,
            amount_cents,
            payment_date: date(payment_date),
            payment_mode,
            reference: None,
        })
        .await?)
}
