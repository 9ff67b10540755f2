use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Cents, LoanId};

pub type RepaymentId = Uuid;

/// Maximum length of a repayment reference.
pub const MAX_REFERENCE_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentMode {
    Cash,
    Bank,
    Mobile,
}

impl PaymentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMode::Cash => "CASH",
            PaymentMode::Bank => "BANK",
            PaymentMode::Mobile => "MOBILE",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "CASH" => Some(PaymentMode::Cash),
            "BANK" => Some(PaymentMode::Bank),
            "MOBILE" => Some(PaymentMode::Mobile),
            _ => None,
        }
    }
}

impl std::fmt::Display for PaymentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// A payment received against a loan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repayment {
    pub id: RepaymentId,
    pub loan_id: LoanId,
    /// When the money was received; never later than today
    pub payment_date: NaiveDate,
    /// Amount in cents (always positive)
    pub amount_cents: Cents,
    pub payment_mode: PaymentMode,
    /// Receipt number, bank transaction ID, mobile wallet TxID, etc.
    pub reference: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Repayment {
    pub fn new(
        loan_id: LoanId,
        amount_cents: Cents,
        payment_date: NaiveDate,
        payment_mode: PaymentMode,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            loan_id,
            payment_date,
            amount_cents,
            payment_mode,
            reference: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payment_mode_parsing() {
        assert_eq!(PaymentMode::from_str("mobile"), Some(PaymentMode::Mobile));
        assert_eq!(PaymentMode::from_str("BANK"), Some(PaymentMode::Bank));
        assert_eq!(PaymentMode::from_str("cheque"), None);
    }

    #[test]
    fn test_repayment_with_reference() {
        let date = NaiveDate::from_ymd_opt(2025, 5, 2).unwrap();
        let repayment = Repayment::new(Uuid::new_v4(), 5000, date, PaymentMode::Cash)
            .with_reference("RCPT-001");

        assert_eq!(repayment.reference.as_deref(), Some("RCPT-001"));
        assert_eq!(repayment.amount_cents, 5000);
    }
}
