use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::domain::{
    Branch, BranchId, Cents, Client, ClientId, Gender, Loan, LoanId, LoanStatus, PaymentMode,
    Repayment, RepaymentId,
};

use super::{MIGRATION_001_INITIAL, MIGRATION_002_LOANS, MIGRATION_003_REPAYMENTS};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// How long a connection waits for another writer before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const BRANCH_COLUMNS: &str = "id, name, district, region, created_at";
const CLIENT_COLUMNS: &str =
    "id, name, email, phone, gender, branch_id, registration_date, created_at";
const LOAN_COLUMNS: &str = "id, client_id, branch_id, principal_cents, rate_bps, tenure_months, issue_date, status, created_at, updated_at";
const REPAYMENT_COLUMNS: &str =
    "id, loan_id, payment_date, amount_cents, payment_mode, reference, created_at";

/// Filters for listing branches. Text filters match substrings.
#[derive(Debug, Clone, Default)]
pub struct BranchFilter {
    pub region: Option<String>,
    pub district: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ClientFilter {
    pub branch_id: Option<BranchId>,
    pub gender: Option<Gender>,
    pub from_date: Option<NaiveDate>,
    pub to_date: Option<NaiveDate>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct LoanFilter {
    pub status: Option<LoanStatus>,
    pub branch_id: Option<BranchId>,
    pub client_id: Option<ClientId>,
    pub from_date: Option<NaiveDate>,
    pub to_date: Option<NaiveDate>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct RepaymentFilter {
    pub loan_id: Option<LoanId>,
    /// Restrict to repayments on loans held by this client
    pub client_id: Option<ClientId>,
    pub payment_mode: Option<PaymentMode>,
    pub from_date: Option<NaiveDate>,
    pub to_date: Option<NaiveDate>,
    pub limit: Option<usize>,
}

/// Count and principal total for one loan status.
#[derive(Debug, Clone)]
pub struct StatusAggregate {
    pub status: LoanStatus,
    pub count: i64,
    pub total_principal: Cents,
}

/// Portfolio-wide loan aggregates.
#[derive(Debug, Clone)]
pub struct LoanAggregate {
    pub total_loans: i64,
    pub total_disbursed: Cents,
    pub average_principal: Option<f64>,
    pub average_rate_bps: Option<f64>,
}

/// Per-branch counts and totals.
#[derive(Debug, Clone)]
pub struct BranchAggregate {
    pub branch: Branch,
    pub clients_count: i64,
    pub loans_count: i64,
    pub total_disbursed: Cents,
    pub active_loans: i64,
}

/// Repository for persisting and querying branches, clients, loans and repayments.
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    /// Create a new repository with the given SQLite connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a SQLite database at the given URL.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database URL: {}", database_url))?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to database")?;
        Ok(Self::new(pool))
    }

    /// Run database migrations. Safe to run more than once.
    pub async fn migrate(&self) -> Result<()> {
        for (name, sql) in [
            ("001", MIGRATION_001_INITIAL),
            ("002", MIGRATION_002_LOANS),
            ("003", MIGRATION_003_REPAYMENTS),
        ] {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to run migration {}", name))?;
        }
        Ok(())
    }

    /// Initialize a new database (connect + migrate).
    pub async fn init(database_url: &str) -> Result<Self> {
        let repo = Self::connect(database_url).await?;
        repo.migrate().await?;
        Ok(repo)
    }

    /// Start an atomic unit of ledger writes.
    ///
    /// The write lock is taken up front, so concurrent ledger transactions
    /// queue on the busy timeout instead of failing on a lock upgrade.
    pub async fn begin(&self) -> Result<LedgerTx> {
        let tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .context("Failed to begin transaction")?;
        Ok(LedgerTx { tx })
    }

    // ========================
    // Branch operations
    // ========================

    pub async fn save_branch(&self, branch: &Branch) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO branches (id, name, district, region, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(branch.id.to_string())
        .bind(&branch.name)
        .bind(&branch.district)
        .bind(&branch.region)
        .bind(branch.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to save branch")?;
        Ok(())
    }

    pub async fn update_branch(&self, branch: &Branch) -> Result<()> {
        sqlx::query("UPDATE branches SET name = ?, district = ?, region = ? WHERE id = ?")
            .bind(&branch.name)
            .bind(&branch.district)
            .bind(&branch.region)
            .bind(branch.id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to update branch")?;
        Ok(())
    }

    pub async fn get_branch(&self, id: BranchId) -> Result<Option<Branch>> {
        let row = sqlx::query(&format!("SELECT {} FROM branches WHERE id = ?", BRANCH_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch branch")?;

        row.as_ref().map(Self::row_to_branch).transpose()
    }

    pub async fn get_branch_by_name(&self, name: &str) -> Result<Option<Branch>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM branches WHERE name = ?",
            BRANCH_COLUMNS
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch branch by name")?;

        row.as_ref().map(Self::row_to_branch).transpose()
    }

    pub async fn list_branches(&self, filter: &BranchFilter) -> Result<Vec<Branch>> {
        let mut query = format!("SELECT {} FROM branches WHERE 1=1", BRANCH_COLUMNS);
        if filter.region.is_some() {
            query.push_str(" AND region LIKE ?");
        }
        if filter.district.is_some() {
            query.push_str(" AND district LIKE ?");
        }
        query.push_str(" ORDER BY name");

        let mut sql_query = sqlx::query(&query);
        if let Some(region) = &filter.region {
            sql_query = sql_query.bind(format!("%{}%", region));
        }
        if let Some(district) = &filter.district {
            sql_query = sql_query.bind(format!("%{}%", district));
        }

        let rows = sql_query
            .fetch_all(&self.pool)
            .await
            .context("Failed to list branches")?;

        rows.iter().map(Self::row_to_branch).collect()
    }

    pub async fn delete_branch(&self, id: BranchId) -> Result<()> {
        sqlx::query("DELETE FROM branches WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to delete branch")?;
        Ok(())
    }

    /// Count clients and loans referencing a branch.
    pub async fn count_branch_dependents(&self, id: BranchId) -> Result<(i64, i64)> {
        let id_str = id.to_string();
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM clients WHERE branch_id = ?) as clients,
                (SELECT COUNT(*) FROM loans WHERE branch_id = ?) as loans
            "#,
        )
        .bind(&id_str)
        .bind(&id_str)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count branch dependents")?;

        Ok((row.get("clients"), row.get("loans")))
    }

    fn row_to_branch(row: &sqlx::sqlite::SqliteRow) -> Result<Branch> {
        let id_str: String = row.get("id");
        let created_at_str: String = row.get("created_at");

        Ok(Branch {
            id: Uuid::parse_str(&id_str).context("Invalid branch ID")?,
            name: row.get("name"),
            district: row.get("district"),
            region: row.get("region"),
            created_at: parse_timestamp(&created_at_str)?,
        })
    }

    // ========================
    // Client operations
    // ========================

    pub async fn save_client(&self, client: &Client) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO clients (id, name, email, phone, gender, branch_id, registration_date, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(client.id.to_string())
        .bind(&client.name)
        .bind(&client.email)
        .bind(&client.phone)
        .bind(client.gender.as_str())
        .bind(client.branch_id.to_string())
        .bind(format_date(client.registration_date))
        .bind(client.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to save client")?;
        Ok(())
    }

    pub async fn update_client(&self, client: &Client) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE clients
            SET name = ?, email = ?, phone = ?, gender = ?, branch_id = ?, registration_date = ?
            WHERE id = ?
            "#,
        )
        .bind(&client.name)
        .bind(&client.email)
        .bind(&client.phone)
        .bind(client.gender.as_str())
        .bind(client.branch_id.to_string())
        .bind(format_date(client.registration_date))
        .bind(client.id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to update client")?;
        Ok(())
    }

    pub async fn get_client(&self, id: ClientId) -> Result<Option<Client>> {
        let row = sqlx::query(&format!("SELECT {} FROM clients WHERE id = ?", CLIENT_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch client")?;

        row.as_ref().map(Self::row_to_client).transpose()
    }

    pub async fn get_client_by_email(&self, email: &str) -> Result<Option<Client>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM clients WHERE email = ?",
            CLIENT_COLUMNS
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch client by email")?;

        row.as_ref().map(Self::row_to_client).transpose()
    }

    pub async fn list_clients(&self, filter: &ClientFilter) -> Result<Vec<Client>> {
        let mut query = format!("SELECT {} FROM clients WHERE 1=1", CLIENT_COLUMNS);

        let branch_str = filter.branch_id.map(|id| id.to_string());
        let from_str = filter.from_date.map(format_date);
        let to_str = filter.to_date.map(format_date);

        if branch_str.is_some() {
            query.push_str(" AND branch_id = ?");
        }
        if filter.gender.is_some() {
            query.push_str(" AND gender = ?");
        }
        if from_str.is_some() {
            query.push_str(" AND registration_date >= ?");
        }
        if to_str.is_some() {
            query.push_str(" AND registration_date <= ?");
        }
        query.push_str(" ORDER BY name");
        if let Some(lim) = filter.limit {
            query.push_str(&format!(" LIMIT {}", lim));
        }

        let mut sql_query = sqlx::query(&query);
        if let Some(ref b) = branch_str {
            sql_query = sql_query.bind(b);
        }
        if let Some(gender) = filter.gender {
            sql_query = sql_query.bind(gender.as_str());
        }
        if let Some(ref f) = from_str {
            sql_query = sql_query.bind(f);
        }
        if let Some(ref t) = to_str {
            sql_query = sql_query.bind(t);
        }

        let rows = sql_query
            .fetch_all(&self.pool)
            .await
            .context("Failed to list clients")?;

        rows.iter().map(Self::row_to_client).collect()
    }

    pub async fn delete_client(&self, id: ClientId) -> Result<()> {
        sqlx::query("DELETE FROM clients WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to delete client")?;
        Ok(())
    }

    pub async fn count_loans_for_client(&self, id: ClientId) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM loans WHERE client_id = ?")
            .bind(id.to_string())
            .fetch_one(&self.pool)
            .await
            .context("Failed to count client loans")?;
        Ok(row.get("count"))
    }

    /// Client counts grouped by gender.
    pub async fn count_clients_by_gender(&self) -> Result<Vec<(Gender, i64)>> {
        let rows = sqlx::query(
            "SELECT gender, COUNT(*) as count FROM clients GROUP BY gender ORDER BY gender",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to count clients by gender")?;

        rows.iter()
            .map(|row| {
                let gender_str: String = row.get("gender");
                let gender = Gender::from_str(&gender_str)
                    .ok_or_else(|| anyhow::anyhow!("Invalid gender: {}", gender_str))?;
                Ok((gender, row.get("count")))
            })
            .collect()
    }

    /// Client counts grouped by branch, with the branch name.
    pub async fn count_clients_by_branch(&self) -> Result<Vec<(BranchId, String, i64)>> {
        let rows = sqlx::query(
            r#"
            SELECT c.branch_id as branch_id, b.name as branch_name, COUNT(*) as count
            FROM clients c
            JOIN branches b ON b.id = c.branch_id
            GROUP BY c.branch_id, b.name
            ORDER BY b.name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to count clients by branch")?;

        rows.iter()
            .map(|row| {
                let id_str: String = row.get("branch_id");
                Ok((
                    Uuid::parse_str(&id_str).context("Invalid branch ID")?,
                    row.get("branch_name"),
                    row.get("count"),
                ))
            })
            .collect()
    }

    pub async fn count_clients(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM clients")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count clients")?;
        Ok(row.get("count"))
    }

    /// Clients registered on or after the given date.
    pub async fn count_clients_registered_since(&self, since: NaiveDate) -> Result<i64> {
        let row =
            sqlx::query("SELECT COUNT(*) as count FROM clients WHERE registration_date >= ?")
                .bind(format_date(since))
                .fetch_one(&self.pool)
                .await
                .context("Failed to count recent registrations")?;
        Ok(row.get("count"))
    }

    fn row_to_client(row: &sqlx::sqlite::SqliteRow) -> Result<Client> {
        let id_str: String = row.get("id");
        let branch_str: String = row.get("branch_id");
        let gender_str: String = row.get("gender");
        let registration_str: String = row.get("registration_date");
        let created_at_str: String = row.get("created_at");

        Ok(Client {
            id: Uuid::parse_str(&id_str).context("Invalid client ID")?,
            name: row.get("name"),
            email: row.get("email"),
            phone: row.get("phone"),
            gender: Gender::from_str(&gender_str)
                .ok_or_else(|| anyhow::anyhow!("Invalid gender: {}", gender_str))?,
            branch_id: Uuid::parse_str(&branch_str).context("Invalid branch ID")?,
            registration_date: parse_date(&registration_str)?,
            created_at: parse_timestamp(&created_at_str)?,
        })
    }

    // ========================
    // Loan operations
    // ========================

    pub async fn save_loan(&self, loan: &Loan) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO loans (id, client_id, branch_id, principal_cents, rate_bps, tenure_months, issue_date, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(loan.id.to_string())
        .bind(loan.client_id.to_string())
        .bind(loan.branch_id.to_string())
        .bind(loan.principal_cents)
        .bind(loan.rate_bps)
        .bind(i64::from(loan.tenure_months))
        .bind(format_date(loan.issue_date))
        .bind(loan.status.as_str())
        .bind(loan.created_at.to_rfc3339())
        .bind(loan.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to save loan")?;
        Ok(())
    }

    /// Overwrite a loan's status outside of any ledger transaction.
    pub async fn set_loan_status(&self, id: LoanId, status: LoanStatus) -> Result<()> {
        sqlx::query("UPDATE loans SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to update loan status")?;
        Ok(())
    }

    pub async fn find_loan(&self, id: LoanId) -> Result<Option<Loan>> {
        let row = sqlx::query(&format!("SELECT {} FROM loans WHERE id = ?", LOAN_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch loan")?;

        row.as_ref().map(row_to_loan).transpose()
    }

    /// List loans, newest issue date first.
    pub async fn list_loans(&self, filter: &LoanFilter) -> Result<Vec<Loan>> {
        let mut query = format!("SELECT {} FROM loans WHERE 1=1", LOAN_COLUMNS);

        let branch_str = filter.branch_id.map(|id| id.to_string());
        let client_str = filter.client_id.map(|id| id.to_string());
        let from_str = filter.from_date.map(format_date);
        let to_str = filter.to_date.map(format_date);

        if filter.status.is_some() {
            query.push_str(" AND status = ?");
        }
        if branch_str.is_some() {
            query.push_str(" AND branch_id = ?");
        }
        if client_str.is_some() {
            query.push_str(" AND client_id = ?");
        }
        if from_str.is_some() {
            query.push_str(" AND issue_date >= ?");
        }
        if to_str.is_some() {
            query.push_str(" AND issue_date <= ?");
        }
        query.push_str(" ORDER BY issue_date DESC, created_at DESC");
        if let Some(lim) = filter.limit {
            query.push_str(&format!(" LIMIT {}", lim));
        }

        let mut sql_query = sqlx::query(&query);
        if let Some(status) = filter.status {
            sql_query = sql_query.bind(status.as_str());
        }
        if let Some(ref b) = branch_str {
            sql_query = sql_query.bind(b);
        }
        if let Some(ref c) = client_str {
            sql_query = sql_query.bind(c);
        }
        if let Some(ref f) = from_str {
            sql_query = sql_query.bind(f);
        }
        if let Some(ref t) = to_str {
            sql_query = sql_query.bind(t);
        }

        let rows = sql_query
            .fetch_all(&self.pool)
            .await
            .context("Failed to list loans")?;

        rows.iter().map(row_to_loan).collect()
    }

    pub async fn delete_loan(&self, id: LoanId) -> Result<()> {
        sqlx::query("DELETE FROM loans WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to delete loan")?;
        Ok(())
    }

    pub async fn count_repayments_for_loan(&self, id: LoanId) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM repayments WHERE loan_id = ?")
            .bind(id.to_string())
            .fetch_one(&self.pool)
            .await
            .context("Failed to count loan repayments")?;
        Ok(row.get("count"))
    }

    pub async fn loan_aggregate(&self) -> Result<LoanAggregate> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) as total_loans,
                COALESCE(SUM(principal_cents), 0) as total_disbursed,
                AVG(principal_cents) as average_principal,
                AVG(rate_bps) as average_rate
            FROM loans
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to aggregate loans")?;

        Ok(LoanAggregate {
            total_loans: row.get("total_loans"),
            total_disbursed: row.get("total_disbursed"),
            average_principal: row.get("average_principal"),
            average_rate_bps: row.get("average_rate"),
        })
    }

    pub async fn loans_by_status(&self) -> Result<Vec<StatusAggregate>> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) as count, COALESCE(SUM(principal_cents), 0) as total
            FROM loans
            GROUP BY status
            ORDER BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to group loans by status")?;

        rows.iter()
            .map(|row| {
                let status_str: String = row.get("status");
                Ok(StatusAggregate {
                    status: LoanStatus::from_str(&status_str)
                        .ok_or_else(|| anyhow::anyhow!("Invalid loan status: {}", status_str))?,
                    count: row.get("count"),
                    total_principal: row.get("total"),
                })
            })
            .collect()
    }

    /// Loans issued within [from, to).
    pub async fn count_loans_issued_between(&self, from: NaiveDate, to: NaiveDate) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) as count FROM loans WHERE issue_date >= ? AND issue_date < ?",
        )
        .bind(format_date(from))
        .bind(format_date(to))
        .fetch_one(&self.pool)
        .await
        .context("Failed to count loans issued in range")?;
        Ok(row.get("count"))
    }

    pub async fn branch_aggregates(&self) -> Result<Vec<BranchAggregate>> {
        let rows = sqlx::query(
            r#"
            SELECT
                b.id, b.name, b.district, b.region, b.created_at,
                (SELECT COUNT(*) FROM clients c WHERE c.branch_id = b.id) as clients_count,
                (SELECT COUNT(*) FROM loans l WHERE l.branch_id = b.id) as loans_count,
                (SELECT COALESCE(SUM(l.principal_cents), 0) FROM loans l WHERE l.branch_id = b.id) as total_disbursed,
                (SELECT COUNT(*) FROM loans l WHERE l.branch_id = b.id AND l.status = 'ACTIVE') as active_loans
            FROM branches b
            ORDER BY b.name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to aggregate branches")?;

        rows.iter()
            .map(|row| {
                Ok(BranchAggregate {
                    branch: Self::row_to_branch(row)?,
                    clients_count: row.get("clients_count"),
                    loans_count: row.get("loans_count"),
                    total_disbursed: row.get("total_disbursed"),
                    active_loans: row.get("active_loans"),
                })
            })
            .collect()
    }

    // ========================
    // Repayment operations
    // ========================

    pub async fn get_repayment(&self, id: RepaymentId) -> Result<Option<Repayment>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM repayments WHERE id = ?",
            REPAYMENT_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch repayment")?;

        row.as_ref().map(row_to_repayment).transpose()
    }

    /// The most recently recorded repayment, if any.
    pub async fn latest_repayment(&self) -> Result<Option<Repayment>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM repayments ORDER BY created_at DESC LIMIT 1",
            REPAYMENT_COLUMNS
        ))
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch latest repayment")?;

        row.as_ref().map(row_to_repayment).transpose()
    }

    /// List repayments, newest payment date first.
    pub async fn list_repayments(&self, filter: &RepaymentFilter) -> Result<Vec<Repayment>> {
        let columns = REPAYMENT_COLUMNS
            .split(", ")
            .map(|c| format!("r.{}", c))
            .collect::<Vec<_>>()
            .join(", ");
        let mut query = format!(
            "SELECT {} FROM repayments r JOIN loans l ON l.id = r.loan_id WHERE 1=1",
            columns
        );

        let loan_str = filter.loan_id.map(|id| id.to_string());
        let client_str = filter.client_id.map(|id| id.to_string());
        let from_str = filter.from_date.map(format_date);
        let to_str = filter.to_date.map(format_date);

        if loan_str.is_some() {
            query.push_str(" AND r.loan_id = ?");
        }
        if client_str.is_some() {
            query.push_str(" AND l.client_id = ?");
        }
        if filter.payment_mode.is_some() {
            query.push_str(" AND r.payment_mode = ?");
        }
        if from_str.is_some() {
            query.push_str(" AND r.payment_date >= ?");
        }
        if to_str.is_some() {
            query.push_str(" AND r.payment_date <= ?");
        }
        query.push_str(" ORDER BY r.payment_date DESC, r.created_at DESC");
        if let Some(lim) = filter.limit {
            query.push_str(&format!(" LIMIT {}", lim));
        }

        let mut sql_query = sqlx::query(&query);
        if let Some(ref l) = loan_str {
            sql_query = sql_query.bind(l);
        }
        if let Some(ref c) = client_str {
            sql_query = sql_query.bind(c);
        }
        if let Some(mode) = filter.payment_mode {
            sql_query = sql_query.bind(mode.as_str());
        }
        if let Some(ref f) = from_str {
            sql_query = sql_query.bind(f);
        }
        if let Some(ref t) = to_str {
            sql_query = sql_query.bind(t);
        }

        let rows = sql_query
            .fetch_all(&self.pool)
            .await
            .context("Failed to list repayments")?;

        rows.iter().map(row_to_repayment).collect()
    }

    /// Sum of repayment amounts for a loan, using SQL aggregation.
    pub async fn sum_repayments(&self, loan_id: LoanId) -> Result<Cents> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(amount_cents), 0) as total FROM repayments WHERE loan_id = ?",
        )
        .bind(loan_id.to_string())
        .fetch_one(&self.pool)
        .await
        .context("Failed to sum repayments")?;

        Ok(row.get("total"))
    }

    /// Repayment totals for every loan that has at least one repayment.
    pub async fn sum_repayments_by_loan(&self) -> Result<HashMap<LoanId, Cents>> {
        let rows = sqlx::query(
            "SELECT loan_id, SUM(amount_cents) as total FROM repayments GROUP BY loan_id",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to sum repayments by loan")?;

        let mut totals = HashMap::new();
        for row in rows {
            let loan_str: String = row.get("loan_id");
            let loan_id = Uuid::parse_str(&loan_str).context("Invalid loan ID")?;
            totals.insert(loan_id, row.get("total"));
        }
        Ok(totals)
    }
}

/// An open database transaction over the ledger tables.
///
/// Dropping it without calling [`LedgerTx::commit`] rolls every write back.
pub struct LedgerTx {
    tx: Transaction<'static, Sqlite>,
}

impl LedgerTx {
    pub async fn find_loan(&mut self, id: LoanId) -> Result<Option<Loan>> {
        let row = sqlx::query(&format!("SELECT {} FROM loans WHERE id = ?", LOAN_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&mut *self.tx)
            .await
            .context("Failed to fetch loan")?;

        row.as_ref().map(row_to_loan).transpose()
    }

    /// Persist changed principal, rate and tenure.
    pub async fn update_loan_terms(&mut self, loan: &Loan) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE loans
            SET principal_cents = ?, rate_bps = ?, tenure_months = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(loan.principal_cents)
        .bind(loan.rate_bps)
        .bind(i64::from(loan.tenure_months))
        .bind(Utc::now().to_rfc3339())
        .bind(loan.id.to_string())
        .execute(&mut *self.tx)
        .await
        .context("Failed to update loan terms")?;
        Ok(())
    }

    pub async fn get_repayment(&mut self, id: RepaymentId) -> Result<Option<Repayment>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM repayments WHERE id = ?",
            REPAYMENT_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&mut *self.tx)
        .await
        .context("Failed to fetch repayment")?;

        row.as_ref().map(row_to_repayment).transpose()
    }

    pub async fn sum_repayments(&mut self, loan_id: LoanId) -> Result<Cents> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(amount_cents), 0) as total FROM repayments WHERE loan_id = ?",
        )
        .bind(loan_id.to_string())
        .fetch_one(&mut *self.tx)
        .await
        .context("Failed to sum repayments")?;

        Ok(row.get("total"))
    }

    pub async fn insert_repayment(&mut self, repayment: &Repayment) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO repayments (id, loan_id, payment_date, amount_cents, payment_mode, reference, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(repayment.id.to_string())
        .bind(repayment.loan_id.to_string())
        .bind(format_date(repayment.payment_date))
        .bind(repayment.amount_cents)
        .bind(repayment.payment_mode.as_str())
        .bind(&repayment.reference)
        .bind(repayment.created_at.to_rfc3339())
        .execute(&mut *self.tx)
        .await
        .context("Failed to save repayment")?;
        Ok(())
    }

    pub async fn update_repayment(&mut self, repayment: &Repayment) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE repayments
            SET payment_date = ?, amount_cents = ?, payment_mode = ?, reference = ?
            WHERE id = ?
            "#,
        )
        .bind(format_date(repayment.payment_date))
        .bind(repayment.amount_cents)
        .bind(repayment.payment_mode.as_str())
        .bind(&repayment.reference)
        .bind(repayment.id.to_string())
        .execute(&mut *self.tx)
        .await
        .context("Failed to update repayment")?;
        Ok(())
    }

    pub async fn delete_repayment(&mut self, id: RepaymentId) -> Result<()> {
        sqlx::query("DELETE FROM repayments WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *self.tx)
            .await
            .context("Failed to delete repayment")?;
        Ok(())
    }

    pub async fn set_loan_status(&mut self, id: LoanId, status: LoanStatus) -> Result<()> {
        sqlx::query("UPDATE loans SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&mut *self.tx)
            .await
            .context("Failed to update loan status")?;
        Ok(())
    }

    pub async fn commit(self) -> Result<()> {
        self.tx
            .commit()
            .await
            .context("Failed to commit transaction")
    }
}

fn row_to_loan(row: &sqlx::sqlite::SqliteRow) -> Result<Loan> {
    let id_str: String = row.get("id");
    let client_str: String = row.get("client_id");
    let branch_str: String = row.get("branch_id");
    let issue_date_str: String = row.get("issue_date");
    let status_str: String = row.get("status");
    let created_at_str: String = row.get("created_at");
    let updated_at_str: String = row.get("updated_at");
    let tenure: i64 = row.get("tenure_months");

    Ok(Loan {
        id: Uuid::parse_str(&id_str).context("Invalid loan ID")?,
        client_id: Uuid::parse_str(&client_str).context("Invalid client ID")?,
        branch_id: Uuid::parse_str(&branch_str).context("Invalid branch ID")?,
        principal_cents: row.get("principal_cents"),
        rate_bps: row.get("rate_bps"),
        tenure_months: u32::try_from(tenure).context("Invalid tenure")?,
        issue_date: parse_date(&issue_date_str)?,
        status: LoanStatus::from_str(&status_str)
            .ok_or_else(|| anyhow::anyhow!("Invalid loan status: {}", status_str))?,
        created_at: parse_timestamp(&created_at_str)?,
        updated_at: parse_timestamp(&updated_at_str)?,
    })
}

fn row_to_repayment(row: &sqlx::sqlite::SqliteRow) -> Result<Repayment> {
    let id_str: String = row.get("id");
    let loan_str: String = row.get("loan_id");
    let payment_date_str: String = row.get("payment_date");
    let mode_str: String = row.get("payment_mode");
    let created_at_str: String = row.get("created_at");

    Ok(Repayment {
        id: Uuid::parse_str(&id_str).context("Invalid repayment ID")?,
        loan_id: Uuid::parse_str(&loan_str).context("Invalid loan ID")?,
        payment_date: parse_date(&payment_date_str)?,
        amount_cents: row.get("amount_cents"),
        payment_mode: PaymentMode::from_str(&mode_str)
            .ok_or_else(|| anyhow::anyhow!("Invalid payment mode: {}", mode_str))?,
        reference: row.get("reference"),
        created_at: parse_timestamp(&created_at_str)?,
    })
}

fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, DATE_FORMAT).with_context(|| format!("Invalid date: {}", s))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp: {}", s))?
        .with_timezone(&Utc))
}
