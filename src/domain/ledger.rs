use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::{Cents, Loan, LoanStatus, RateBps, Repayment};

/// Denominator for [`RateBps`]: 10_000 = 100%.
const RATE_SCALE: i128 = 10_000;

/// Smallest payment accepted, unless the payment settles the balance.
pub const MIN_REPAYMENT_CENTS: Cents = 100;

/// Total amount a borrower owes: principal plus one flat interest charge.
/// totalDue = principal * (1 + rate/100), rounded half-up to the cent.
pub fn total_due(principal_cents: Cents, rate_bps: RateBps) -> Cents {
    let gross = principal_cents as i128 * (RATE_SCALE + rate_bps as i128);
    ((gross + RATE_SCALE / 2) / RATE_SCALE) as Cents
}

/// Sum of repayment amounts.
pub fn total_repaid(repayments: &[Repayment]) -> Cents {
    repayments.iter().map(|r| r.amount_cents).sum()
}

/// Largest single payment accepted against an outstanding balance:
/// the balance plus a 10% tolerance band.
pub fn repayment_limit(outstanding: Cents) -> Cents {
    outstanding.saturating_mul(11) / 10
}

/// Returns true when `amount` is above `outstanding * 1.1`.
/// Compared in integers so that exactly `outstanding * 1.1` is accepted.
pub fn exceeds_limit(amount: Cents, outstanding: Cents) -> bool {
    (amount as i128) * 10 > (outstanding as i128) * 11
}

/// Returns true when `amount` is under [`MIN_REPAYMENT_CENTS`] and still
/// leaves part of `outstanding` unpaid.
pub fn below_minimum(amount: Cents, outstanding: Cents) -> bool {
    amount < MIN_REPAYMENT_CENTS && amount < outstanding
}

/// Validate a payment before it is written.
pub fn check_repayment(
    loan: &Loan,
    already_repaid: Cents,
    amount: Cents,
    payment_date: NaiveDate,
    today: NaiveDate,
) -> Result<(), RepaymentError> {
    if loan.status != LoanStatus::Active {
        return Err(RepaymentError::InvalidLoanState {
            status: loan.status,
        });
    }
    if amount <= 0 {
        return Err(RepaymentError::NonPositiveAmount(amount));
    }
    if payment_date > today {
        return Err(RepaymentError::DateInFuture {
            payment_date,
            today,
        });
    }

    let outstanding = total_due(loan.principal_cents, loan.rate_bps) - already_repaid;
    if below_minimum(amount, outstanding) {
        return Err(RepaymentError::BelowMinimum {
            amount,
            minimum: MIN_REPAYMENT_CENTS,
        });
    }
    if exceeds_limit(amount, outstanding) {
        return Err(RepaymentError::ExceedsLimit {
            amount,
            outstanding,
            limit: repayment_limit(outstanding),
        });
    }
    Ok(())
}

/// Status after a repayment is added: ACTIVE closes once the total due is covered.
pub fn status_after_posting(current: LoanStatus, repaid: Cents, due: Cents) -> LoanStatus {
    match current {
        LoanStatus::Active if repaid >= due => LoanStatus::Closed,
        other => other,
    }
}

/// Status after a repayment is removed: CLOSED reopens once the total due is no longer covered.
pub fn status_after_removal(current: LoanStatus, repaid: Cents, due: Cents) -> LoanStatus {
    match current {
        LoanStatus::Closed if repaid < due => LoanStatus::Active,
        other => other,
    }
}

/// Status a loan should have once repayments total `repaid`, in either direction.
/// DEFAULTED is never moved.
pub fn reconcile_status(current: LoanStatus, repaid: Cents, due: Cents) -> LoanStatus {
    status_after_removal(status_after_posting(current, repaid, due), repaid, due)
}

/// Derived view of a loan's position. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanSummary {
    pub total_due: Cents,
    pub total_repaid: Cents,
    /// Due minus repaid; negative after an overpayment within tolerance
    pub outstanding: Cents,
    /// Outstanding floored at zero, for display
    pub remaining_balance: Cents,
    pub status: LoanStatus,
}

impl LoanSummary {
    pub fn from_totals(loan: &Loan, total_repaid: Cents) -> Self {
        let total_due = total_due(loan.principal_cents, loan.rate_bps);
        let outstanding = total_due - total_repaid;
        Self {
            total_due,
            total_repaid,
            outstanding,
            remaining_balance: outstanding.max(0),
            status: loan.status,
        }
    }

    pub fn is_fully_repaid(&self) -> bool {
        self.outstanding <= 0
    }
}

pub fn compute_loan_summary(loan: &Loan, repayments: &[Repayment]) -> LoanSummary {
    LoanSummary::from_totals(loan, total_repaid(repayments))
}

/// Estimated monthly installment of an amortizing loan, rounded to the cent.
///
/// Informational only: closure is driven by [`total_due`], which charges
/// interest once rather than per period. Returns None for a zero tenure.
pub fn installment_preview(principal_cents: Cents, rate_bps: RateBps, months: u32) -> Option<Cents> {
    if months == 0 {
        return None;
    }
    let principal = principal_cents as f64;

    if rate_bps == 0 {
        return Some((principal / months as f64).round() as Cents);
    }

    let monthly_rate = rate_bps as f64 / RATE_SCALE as f64 / 12.0;
    let growth = (1.0 + monthly_rate).powi(months as i32);
    let payment = principal * monthly_rate * growth / (growth - 1.0);
    Some(payment.round() as Cents)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepaymentError {
    InvalidLoanState {
        status: LoanStatus,
    },
    NonPositiveAmount(Cents),
    BelowMinimum {
        amount: Cents,
        minimum: Cents,
    },
    DateInFuture {
        payment_date: NaiveDate,
        today: NaiveDate,
    },
    ExceedsLimit {
        amount: Cents,
        outstanding: Cents,
        limit: Cents,
    },
}

impl std::fmt::Display for RepaymentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RepaymentError::InvalidLoanState { status } => {
                write!(f, "Cannot add repayment to {} loan", status)
            }
            RepaymentError::NonPositiveAmount(amount) => {
                write!(f, "Repayment amount must be positive, got {} cents", amount)
            }
            RepaymentError::BelowMinimum { amount, minimum } => write!(
                f,
                "Repayment of {} cents is below the minimum of {} cents",
                amount, minimum
            ),
            RepaymentError::DateInFuture {
                payment_date,
                today,
            } => write!(f, "Payment date {} is after today ({})", payment_date, today),
            RepaymentError::ExceedsLimit {
                amount,
                outstanding,
                limit,
            } => write!(
                f,
                "Payment of {} cents exceeds limit of {} cents (outstanding {} cents)",
                amount, limit, outstanding
            ),
        }
    }
}

impl std::error::Error for RepaymentError {}
