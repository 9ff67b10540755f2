use chrono::NaiveDate;
use thiserror::Error;

use crate::domain::{Cents, LoanStatus, RepaymentError, TermsError};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Loan not found: {0}")]
    LoanNotFound(String),

    #[error("Repayment not found: {0}")]
    RepaymentNotFound(String),

    #[error("Branch not found: {0}")]
    BranchNotFound(String),

    #[error("Client not found: {0}")]
    ClientNotFound(String),

    #[error("Loan is {status}: {reason}")]
    InvalidLoanState { status: LoanStatus, reason: String },

    #[error("Payment amount exceeds reasonable limit: {amount} requested, {limit} allowed (outstanding {outstanding})")]
    AmountExceedsLimit {
        amount: Cents,
        outstanding: Cents,
        limit: Cents,
    },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Payment date {payment_date} is in the future (today is {today})")]
    PaymentDateInFuture {
        payment_date: NaiveDate,
        today: NaiveDate,
    },

    #[error("Invalid loan terms: {0}")]
    InvalidLoanTerms(#[from] TermsError),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("Cannot delete {entity}: {reason}")]
    HasDependents { entity: String, reason: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] anyhow::Error),
}

impl From<RepaymentError> for AppError {
    fn from(err: RepaymentError) -> Self {
        match err {
            RepaymentError::InvalidLoanState { status } => AppError::InvalidLoanState {
                status,
                reason: "cannot add repayment to inactive loan".to_string(),
            },
            RepaymentError::NonPositiveAmount(amount) => {
                AppError::InvalidAmount(format!("repayment must be positive, got {}", amount))
            }
            RepaymentError::BelowMinimum { amount, minimum } => AppError::InvalidAmount(format!(
                "repayment of {} is below the minimum of {}",
                amount, minimum
            )),
            RepaymentError::DateInFuture {
                payment_date,
                today,
            } => AppError::PaymentDateInFuture {
                payment_date,
                today,
            },
            RepaymentError::ExceedsLimit {
                amount,
                outstanding,
                limit,
            } => AppError::AmountExceedsLimit {
                amount,
                outstanding,
                limit,
            },
        }
    }
}
