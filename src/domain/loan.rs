use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{BranchId, Cents, ClientId, RateBps};

pub type LoanId = Uuid;

/// Smallest principal a loan may be issued for (1 000.00).
pub const MIN_PRINCIPAL: Cents = 100_000;
/// Largest principal a loan may be issued for (1 000 000.00).
pub const MAX_PRINCIPAL: Cents = 100_000_000;
/// Annual rate ceiling: 50%.
pub const MAX_RATE: RateBps = 5_000;
pub const MIN_TENURE_MONTHS: u32 = 1;
pub const MAX_TENURE_MONTHS: u32 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LoanStatus {
    Active,
    Closed,
    /// Set administratively; the ledger never moves a loan out of this state.
    Defaulted,
}

impl LoanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoanStatus::Active => "ACTIVE",
            LoanStatus::Closed => "CLOSED",
            LoanStatus::Defaulted => "DEFAULTED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "ACTIVE" => Some(LoanStatus::Active),
            "CLOSED" => Some(LoanStatus::Closed),
            "DEFAULTED" => Some(LoanStatus::Defaulted),
            _ => None,
        }
    }
}

impl std::fmt::Display for LoanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Loan {
    pub id: LoanId,
    pub client_id: ClientId,
    pub branch_id: BranchId,
    pub principal_cents: Cents,
    pub rate_bps: RateBps,
    pub tenure_months: u32,
    pub issue_date: NaiveDate,
    pub status: LoanStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Loan {
    /// Create a new active loan. Terms are not validated here; see [`validate_terms`].
    pub fn new(
        client_id: ClientId,
        branch_id: BranchId,
        principal_cents: Cents,
        rate_bps: RateBps,
        tenure_months: u32,
        issue_date: NaiveDate,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            client_id,
            branch_id,
            principal_cents,
            rate_bps,
            tenure_months,
            issue_date,
            status: LoanStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == LoanStatus::Active
    }
}

/// Check principal, rate and tenure against the lending policy bounds.
pub fn validate_terms(
    principal_cents: Cents,
    rate_bps: RateBps,
    tenure_months: u32,
) -> Result<(), TermsError> {
    if !(MIN_PRINCIPAL..=MAX_PRINCIPAL).contains(&principal_cents) {
        return Err(TermsError::PrincipalOutOfRange(principal_cents));
    }
    if !(0..=MAX_RATE).contains(&rate_bps) {
        return Err(TermsError::RateOutOfRange(rate_bps));
    }
    if !(MIN_TENURE_MONTHS..=MAX_TENURE_MONTHS).contains(&tenure_months) {
        return Err(TermsError::TenureOutOfRange(tenure_months));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TermsError {
    PrincipalOutOfRange(Cents),
    RateOutOfRange(RateBps),
    TenureOutOfRange(u32),
}

impl std::fmt::Display for TermsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TermsError::PrincipalOutOfRange(p) => write!(
                f,
                "principal {} outside {}..={}",
                super::format_cents(*p),
                super::format_cents(MIN_PRINCIPAL),
                super::format_cents(MAX_PRINCIPAL)
            ),
            TermsError::RateOutOfRange(r) => write!(
                f,
                "interest rate {}% outside 0..={}%",
                super::format_rate(*r),
                super::format_rate(MAX_RATE)
            ),
            TermsError::TenureOutOfRange(t) => write!(
                f,
                "tenure of {} months outside {}..={}",
                t, MIN_TENURE_MONTHS, MAX_TENURE_MONTHS
            ),
        }
    }
}

impl std::error::Error for TermsError {}
