use std::collections::{BTreeMap, HashSet};

use chrono::{Datelike, Days, Months, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::domain::{
    compute_loan_summary, installment_preview, BranchId, Cents, ClientId, Gender, LoanId,
    LoanStatus, LoanSummary, PaymentMode, RateBps,
};
use crate::storage::{LoanFilter, RepaymentFilter};

use super::{AppError, LoanService};

/// Window for "recent registrations" in client statistics.
pub const RECENT_REGISTRATION_DAYS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSummary {
    pub as_of: NaiveDate,
    pub total_loans: i64,
    pub total_disbursed: Cents,
    pub by_status: Vec<StatusBreakdown>,
    pub average_principal: Cents,
    /// Average annual rate in percent
    pub average_rate: f64,
    pub loans_this_month: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusBreakdown {
    pub status: LoanStatus,
    pub count: i64,
    pub total_principal: Cents,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchPerformance {
    pub branch_id: BranchId,
    pub name: String,
    pub district: String,
    pub region: String,
    pub clients_count: i64,
    pub loans_count: i64,
    pub total_disbursed: Cents,
    pub active_loans: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientStatistics {
    pub total_clients: i64,
    pub by_gender: Vec<GenderCount>,
    pub by_branch: Vec<BranchClientCount>,
    /// Registrations on or after `recent_since`
    pub recent_registrations: i64,
    pub recent_since: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenderCount {
    pub gender: Gender,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchClientCount {
    pub branch_id: BranchId,
    pub branch_name: String,
    pub count: i64,
}

/// Narrows client repayment analytics.
#[derive(Debug, Clone, Default)]
pub struct AnalyticsFilter {
    pub loan_id: Option<LoanId>,
    pub from_date: Option<NaiveDate>,
    pub to_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRepaymentAnalytics {
    pub client_id: ClientId,
    pub client_name: String,
    pub total_payments: i64,
    pub total_amount_paid: Cents,
    pub average_payment: Cents,
    pub payment_modes: Vec<PaymentModeBreakdown>,
    /// Oldest month first
    pub monthly_trends: Vec<MonthlyTrend>,
    pub loans_with_payments: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentModeBreakdown {
    pub mode: PaymentMode,
    pub count: i64,
    pub total_amount: Cents,
    /// Share of payments by count, two decimals
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonthlyTrend {
    /// YYYY-MM
    pub month: String,
    pub payments_count: i64,
    pub total_amount: Cents,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientActiveLoans {
    pub client_id: ClientId,
    pub client_name: String,
    pub loans: Vec<ActiveLoanPosition>,
    pub total_active_loans: i64,
    pub total_outstanding: Cents,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveLoanPosition {
    pub loan_id: LoanId,
    pub principal_cents: Cents,
    pub rate_bps: RateBps,
    pub tenure_months: u32,
    pub issue_date: NaiveDate,
    pub summary: LoanSummary,
    pub monthly_installment: Option<Cents>,
    pub repayments_count: i64,
    pub last_payment_date: Option<NaiveDate>,
}

impl LoanService {
    /// Portfolio-wide totals, per-status breakdown and this month's disbursements.
    pub async fn portfolio_summary(&self) -> Result<PortfolioSummary, AppError> {
        let today = self.clock.today();
        let aggregate = self.repo.loan_aggregate().await?;
        let by_status = self
            .repo
            .loans_by_status()
            .await?
            .into_iter()
            .map(|s| StatusBreakdown {
                status: s.status,
                count: s.count,
                total_principal: s.total_principal,
            })
            .collect();

        let month_start = today.with_day(1).ok_or_else(|| {
            AppError::Validation(format!("cannot compute month start for {}", today))
        })?;
        let next_month = month_start
            .checked_add_months(Months::new(1))
            .ok_or_else(|| AppError::Validation(format!("date out of range: {}", today)))?;
        let loans_this_month = self
            .repo
            .count_loans_issued_between(month_start, next_month)
            .await?;

        Ok(PortfolioSummary {
            as_of: today,
            total_loans: aggregate.total_loans,
            total_disbursed: aggregate.total_disbursed,
            by_status,
            average_principal: aggregate.average_principal.map_or(0, |avg| avg.round() as Cents),
            average_rate: aggregate
                .average_rate_bps
                .map_or(0.0, |avg| round2(avg / 100.0)),
            loans_this_month,
        })
    }

    pub async fn branch_performance(&self) -> Result<Vec<BranchPerformance>, AppError> {
        let aggregates = self.repo.branch_aggregates().await?;
        Ok(aggregates
            .into_iter()
            .map(|a| BranchPerformance {
                branch_id: a.branch.id,
                name: a.branch.name,
                district: a.branch.district,
                region: a.branch.region,
                clients_count: a.clients_count,
                loans_count: a.loans_count,
                total_disbursed: a.total_disbursed,
                active_loans: a.active_loans,
            })
            .collect())
    }

    pub async fn client_statistics(&self) -> Result<ClientStatistics, AppError> {
        let recent_since = self
            .clock
            .today()
            .checked_sub_days(Days::new(RECENT_REGISTRATION_DAYS))
            .unwrap_or(NaiveDate::MIN);

        let by_gender = self
            .repo
            .count_clients_by_gender()
            .await?
            .into_iter()
            .map(|(gender, count)| GenderCount { gender, count })
            .collect();
        let by_branch = self
            .repo
            .count_clients_by_branch()
            .await?
            .into_iter()
            .map(|(branch_id, branch_name, count)| BranchClientCount {
                branch_id,
                branch_name,
                count,
            })
            .collect();

        Ok(ClientStatistics {
            total_clients: self.repo.count_clients().await?,
            by_gender,
            by_branch,
            recent_registrations: self.repo.count_clients_registered_since(recent_since).await?,
            recent_since,
        })
    }

    /// Payment behaviour of one client across their loans.
    pub async fn client_repayment_analytics(
        &self,
        client_id: ClientId,
        filter: &AnalyticsFilter,
    ) -> Result<ClientRepaymentAnalytics, AppError> {
        let client = self.get_client(client_id).await?;
        let repayments = self
            .repo
            .list_repayments(&RepaymentFilter {
                loan_id: filter.loan_id,
                client_id: Some(client_id),
                from_date: filter.from_date,
                to_date: filter.to_date,
                ..RepaymentFilter::default()
            })
            .await?;

        let total_payments = repayments.len() as i64;
        let total_amount_paid: Cents = repayments.iter().map(|r| r.amount_cents).sum();
        let average_payment = if total_payments > 0 {
            (total_amount_paid as f64 / total_payments as f64).round() as Cents
        } else {
            0
        };

        let payment_modes = [PaymentMode::Cash, PaymentMode::Bank, PaymentMode::Mobile]
            .into_iter()
            .filter_map(|mode| {
                let (count, total_amount) = repayments
                    .iter()
                    .filter(|r| r.payment_mode == mode)
                    .fold((0i64, 0), |(n, sum), r| (n + 1, sum + r.amount_cents));
                (count > 0).then(|| PaymentModeBreakdown {
                    mode,
                    count,
                    total_amount,
                    percentage: round2(count as f64 / total_payments as f64 * 100.0),
                })
            })
            .collect();

        let mut months: BTreeMap<String, (i64, Cents)> = BTreeMap::new();
        for repayment in &repayments {
            let entry = months
                .entry(repayment.payment_date.format("%Y-%m").to_string())
                .or_default();
            entry.0 += 1;
            entry.1 += repayment.amount_cents;
        }
        let monthly_trends = months
            .into_iter()
            .map(|(month, (payments_count, total_amount))| MonthlyTrend {
                month,
                payments_count,
                total_amount,
            })
            .collect();

        let loans_with_payments = repayments
            .iter()
            .map(|r| r.loan_id)
            .collect::<HashSet<_>>()
            .len() as i64;

        Ok(ClientRepaymentAnalytics {
            client_id,
            client_name: client.name,
            total_payments,
            total_amount_paid,
            average_payment,
            payment_modes,
            monthly_trends,
            loans_with_payments,
        })
    }

    /// Every ACTIVE loan of a client with its balance and repayment activity.
    pub async fn client_active_loans(
        &self,
        client_id: ClientId,
    ) -> Result<ClientActiveLoans, AppError> {
        let client = self.get_client(client_id).await?;
        let loans = self
            .repo
            .list_loans(&LoanFilter {
                client_id: Some(client_id),
                status: Some(LoanStatus::Active),
                ..LoanFilter::default()
            })
            .await?;

        let mut positions = Vec::with_capacity(loans.len());
        for loan in loans {
            let repayments = self
                .repo
                .list_repayments(&RepaymentFilter {
                    loan_id: Some(loan.id),
                    ..RepaymentFilter::default()
                })
                .await?;
            let summary = compute_loan_summary(&loan, &repayments);

            positions.push(ActiveLoanPosition {
                loan_id: loan.id,
                principal_cents: loan.principal_cents,
                rate_bps: loan.rate_bps,
                tenure_months: loan.tenure_months,
                issue_date: loan.issue_date,
                summary,
                monthly_installment: installment_preview(
                    loan.principal_cents,
                    loan.rate_bps,
                    loan.tenure_months,
                ),
                repayments_count: repayments.len() as i64,
                // Newest first
                last_payment_date: repayments.first().map(|r| r.payment_date),
            });
        }

        Ok(ClientActiveLoans {
            client_id,
            client_name: client.name,
            total_active_loans: positions.len() as i64,
            total_outstanding: positions.iter().map(|p| p.summary.remaining_balance).sum(),
            loans: positions,
        })
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round2() {
        assert_eq!(round2(33.3333), 33.33);
        assert_eq!(round2(66.6666), 66.67);
        assert_eq!(round2(100.0), 100.0);
    }
}
