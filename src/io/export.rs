use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;

use crate::application::{BranchFilter, ClientFilter, LoanFilter, LoanService, RepaymentFilter};
use crate::domain::{format_cents, format_rate, Branch, Client, Loan, LoanSummary, Repayment};

/// Database snapshot for full export
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSnapshot {
    pub version: String,
    pub exported_at: DateTime<Utc>,
    pub branches: Vec<Branch>,
    pub clients: Vec<Client>,
    pub loans: Vec<Loan>,
    pub repayments: Vec<Repayment>,
}

/// Exporter for converting ledger data to various formats
pub struct Exporter<'a> {
    service: &'a LoanService,
}

impl<'a> Exporter<'a> {
    pub fn new(service: &'a LoanService) -> Self {
        Self { service }
    }

    /// Export loans with their current balances to CSV
    pub async fn export_loans_csv<W: Write>(&self, writer: W, filter: &LoanFilter) -> Result<usize> {
        let loans = self.service.list_loans(filter).await?;
        let mut csv_writer = csv::Writer::from_writer(writer);

        csv_writer.write_record([
            "id",
            "client_id",
            "branch_id",
            "principal",
            "interest_rate",
            "tenure_months",
            "issue_date",
            "status",
            "total_due",
            "total_repaid",
            "remaining_balance",
        ])?;

        let mut count = 0;
        for loan in &loans {
            let LoanSummary {
                total_due,
                total_repaid,
                remaining_balance,
                ..
            } = self.service.loan_summary(loan.id).await?;

            csv_writer.write_record([
                loan.id.to_string(),
                loan.client_id.to_string(),
                loan.branch_id.to_string(),
                format_cents(loan.principal_cents),
                format_rate(loan.rate_bps),
                loan.tenure_months.to_string(),
                loan.issue_date.to_string(),
                loan.status.to_string(),
                format_cents(total_due),
                format_cents(total_repaid),
                format_cents(remaining_balance),
            ])?;
            count += 1;
        }

        csv_writer.flush()?;
        Ok(count)
    }

    /// Export repayments to CSV
    pub async fn export_repayments_csv<W: Write>(
        &self,
        writer: W,
        filter: &RepaymentFilter,
    ) -> Result<usize> {
        let repayments = self.service.list_repayments(filter).await?;
        let mut csv_writer = csv::Writer::from_writer(writer);

        csv_writer.write_record([
            "id",
            "loan_id",
            "payment_date",
            "amount",
            "payment_mode",
            "reference",
            "created_at",
        ])?;

        let mut count = 0;
        for repayment in &repayments {
            csv_writer.write_record([
                repayment.id.to_string(),
                repayment.loan_id.to_string(),
                repayment.payment_date.to_string(),
                format_cents(repayment.amount_cents),
                repayment.payment_mode.to_string(),
                repayment.reference.clone().unwrap_or_default(),
                repayment.created_at.to_rfc3339(),
            ])?;
            count += 1;
        }

        csv_writer.flush()?;
        Ok(count)
    }

    /// Export full database as JSON snapshot
    pub async fn export_full_json<W: Write>(&self, mut writer: W) -> Result<DatabaseSnapshot> {
        let snapshot = DatabaseSnapshot {
            version: env!("CARGO_PKG_VERSION").to_string(),
            exported_at: Utc::now(),
            branches: self.service.list_branches(&BranchFilter::default()).await?,
            clients: self.service.list_clients(&ClientFilter::default()).await?,
            loans: self.service.list_loans(&LoanFilter::default()).await?,
            repayments: self
                .service
                .list_repayments(&RepaymentFilter::default())
                .await?,
        };

        let json = serde_json::to_string_pretty(&snapshot)?;
        writer.write_all(json.as_bytes())?;
        writer.flush()?;

        Ok(snapshot)
    }
}
