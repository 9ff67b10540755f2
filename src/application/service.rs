use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::domain::{
    below_minimum, check_repayment, compute_loan_summary, exceeds_limit, installment_preview,
    reconcile_status, repayment_limit, status_after_posting, status_after_removal, total_due,
    validate_terms, Branch, BranchId, Cents, Client, ClientId, Gender, Loan, LoanId, LoanStatus,
    LoanSummary, PaymentMode, RateBps, Repayment, RepaymentId, MAX_REFERENCE_LEN,
    MIN_REPAYMENT_CENTS,
};
use crate::notify::{RepaymentNotifier, RepaymentPosted};
use crate::storage::{BranchFilter, ClientFilter, LoanFilter, RepaymentFilter, Repository};

use super::{AppError, Clock, SystemClock};

/// Application service providing the loan ledger use cases.
/// This is the primary interface for any client (CLI, API, TUI, etc.).
pub struct LoanService {
    pub(super) repo: Repository,
    pub(super) clock: Arc<dyn Clock>,
    notifier: Option<RepaymentNotifier>,
    loan_locks: LoanLocks,
}

/// Input for registering a client
#[derive(Debug, Clone)]
pub struct NewClient {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub gender: Gender,
    pub branch_id: BranchId,
    pub registration_date: NaiveDate,
}

/// Changes to a client; None leaves a field as it is
#[derive(Debug, Clone, Default)]
pub struct ClientUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub gender: Option<Gender>,
    pub branch_id: Option<BranchId>,
}

/// Input for disbursing a loan
#[derive(Debug, Clone)]
pub struct NewLoan {
    pub client_id: ClientId,
    pub branch_id: BranchId,
    pub principal_cents: Cents,
    pub rate_bps: RateBps,
    pub tenure_months: u32,
    pub issue_date: NaiveDate,
}

#[derive(Debug, Clone, Default)]
pub struct LoanTermsUpdate {
    pub principal_cents: Option<Cents>,
    pub rate_bps: Option<RateBps>,
    pub tenure_months: Option<u32>,
}

/// Input for posting a repayment
#[derive(Debug, Clone)]
pub struct NewRepayment {
    pub loan_id: LoanId,
    pub amount_cents: Cents,
    pub payment_date: NaiveDate,
    pub payment_mode: PaymentMode,
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RepaymentUpdate {
    pub amount_cents: Option<Cents>,
    pub payment_date: Option<NaiveDate>,
    pub payment_mode: Option<PaymentMode>,
    pub reference: Option<String>,
}

/// Result of posting, updating or deleting a repayment
#[derive(Debug, Clone)]
pub struct RepaymentResult {
    pub repayment: Repayment,
    /// Parent loan after the change
    pub loan: Loan,
    pub summary: LoanSummary,
    /// Status before the change
    pub previous_status: LoanStatus,
}

impl RepaymentResult {
    pub fn status_changed(&self) -> bool {
        self.previous_status != self.loan.status
    }
}

/// Detailed branch information
pub struct BranchInfo {
    pub branch: Branch,
    pub clients_count: i64,
    pub loans_count: i64,
}

/// Detailed client information
pub struct ClientInfo {
    pub client: Client,
    pub branch: Option<Branch>,
    pub loans: Vec<(Loan, LoanSummary)>,
}

/// Detailed loan information
pub struct LoanDetails {
    pub loan: Loan,
    pub client: Option<Client>,
    pub branch: Option<Branch>,
    pub summary: LoanSummary,
    pub repayments: Vec<Repayment>,
    /// Estimated monthly installment
    pub installment: Option<Cents>,
}

/// A loan's repayments with its balance
pub struct LoanRepayments {
    pub loan: Loan,
    pub summary: LoanSummary,
    pub repayments: Vec<Repayment>,
}

/// One async mutex per loan, so that check-then-write on a loan never interleaves.
#[derive(Default)]
struct LoanLocks {
    locks: Mutex<HashMap<LoanId, Arc<Mutex<()>>>>,
}

impl LoanLocks {
    async fn acquire(&self, loan_id: LoanId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Drop entries nobody holds or waits on
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(loan_id).or_default().clone()
        };
        lock.lock_owned().await
    }
}

impl LoanService {
    /// Create a new loan service with the given repository.
    pub fn new(repo: Repository) -> Self {
        Self {
            repo,
            clock: Arc::new(SystemClock),
            notifier: None,
            loan_locks: LoanLocks::default(),
        }
    }

    /// Initialize a new database at the given path.
    pub async fn init(database_path: &str) -> Result<Self, AppError> {
        let db_url = format!("sqlite:{}?mode=rwc", database_path);
        let repo = Repository::init(&db_url).await?;
        Ok(Self::new(repo))
    }

    /// Connect to an existing database.
    pub async fn connect(database_path: &str) -> Result<Self, AppError> {
        let db_url = format!("sqlite:{}", database_path);
        let repo = Repository::connect(&db_url).await?;
        Ok(Self::new(repo))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Send a confirmation through `notifier` after every posted repayment.
    pub fn with_notifier(mut self, notifier: RepaymentNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    // ========================
    // Branch operations
    // ========================

    pub async fn create_branch(
        &self,
        name: String,
        district: String,
        region: String,
    ) -> Result<Branch, AppError> {
        let name = required("branch name", name)?;
        let district = required("district", district)?;
        let region = required("region", region)?;

        if self.repo.get_branch_by_name(&name).await?.is_some() {
            return Err(AppError::AlreadyExists(format!("Branch '{}'", name)));
        }

        let branch = Branch::new(name, district, region);
        self.repo.save_branch(&branch).await?;
        tracing::info!(branch_id = %branch.id, name = %branch.name, "Created branch");
        Ok(branch)
    }

    pub async fn get_branch(&self, id: BranchId) -> Result<Branch, AppError> {
        self.repo
            .get_branch(id)
            .await?
            .ok_or_else(|| AppError::BranchNotFound(id.to_string()))
    }

    /// Look a branch up by ID or, failing that, by exact name.
    pub async fn resolve_branch(&self, id_or_name: &str) -> Result<Branch, AppError> {
        if let Ok(id) = Uuid::parse_str(id_or_name) {
            if let Some(branch) = self.repo.get_branch(id).await? {
                return Ok(branch);
            }
        }
        self.repo
            .get_branch_by_name(id_or_name)
            .await?
            .ok_or_else(|| AppError::BranchNotFound(id_or_name.to_string()))
    }

    pub async fn update_branch(
        &self,
        id: BranchId,
        name: Option<String>,
        district: Option<String>,
        region: Option<String>,
    ) -> Result<Branch, AppError> {
        let mut branch = self.get_branch(id).await?;

        if let Some(name) = name {
            let name = required("branch name", name)?;
            if name != branch.name && self.repo.get_branch_by_name(&name).await?.is_some() {
                return Err(AppError::AlreadyExists(format!("Branch '{}'", name)));
            }
            branch.name = name;
        }
        if let Some(district) = district {
            branch.district = required("district", district)?;
        }
        if let Some(region) = region {
            branch.region = required("region", region)?;
        }

        self.repo.update_branch(&branch).await?;
        tracing::info!(branch_id = %branch.id, "Updated branch");
        Ok(branch)
    }

    pub async fn list_branches(&self, filter: &BranchFilter) -> Result<Vec<Branch>, AppError> {
        Ok(self.repo.list_branches(filter).await?)
    }

    pub async fn get_branch_info(&self, id: BranchId) -> Result<BranchInfo, AppError> {
        let branch = self.get_branch(id).await?;
        let (clients_count, loans_count) = self.repo.count_branch_dependents(id).await?;
        Ok(BranchInfo {
            branch,
            clients_count,
            loans_count,
        })
    }

    /// Delete a branch. Refused while clients or loans reference it.
    pub async fn delete_branch(&self, id: BranchId) -> Result<(), AppError> {
        let branch = self.get_branch(id).await?;
        let (clients, loans) = self.repo.count_branch_dependents(id).await?;
        if clients > 0 || loans > 0 {
            return Err(AppError::HasDependents {
                entity: format!("branch '{}'", branch.name),
                reason: format!("{} client(s) and {} loan(s) reference it", clients, loans),
            });
        }

        self.repo.delete_branch(id).await?;
        tracing::info!(branch_id = %id, "Deleted branch");
        Ok(())
    }

    // ========================
    // Client operations
    // ========================

    pub async fn create_client(&self, input: NewClient) -> Result<Client, AppError> {
        let name = required("client name", input.name)?;
        self.get_branch(input.branch_id).await?;

        let mut client = Client::new(name, input.gender, input.branch_id, input.registration_date);
        if let Some(email) = optional(input.email) {
            self.ensure_email_available(&email, None).await?;
            client = client.with_email(email);
        }
        if let Some(phone) = optional(input.phone) {
            client = client.with_phone(validate_phone(phone)?);
        }

        self.repo.save_client(&client).await?;
        tracing::info!(client_id = %client.id, branch_id = %client.branch_id, "Registered client");
        Ok(client)
    }

    pub async fn get_client(&self, id: ClientId) -> Result<Client, AppError> {
        self.repo
            .get_client(id)
            .await?
            .ok_or_else(|| AppError::ClientNotFound(id.to_string()))
    }

    pub async fn update_client(&self, id: ClientId, update: ClientUpdate) -> Result<Client, AppError> {
        let mut client = self.get_client(id).await?;

        if let Some(name) = update.name {
            client.name = required("client name", name)?;
        }
        if let Some(email) = update.email {
            client.email = optional(Some(email));
            if let Some(email) = &client.email {
                self.ensure_email_available(email, Some(id)).await?;
            }
        }
        if let Some(phone) = update.phone {
            client.phone = optional(Some(phone)).map(validate_phone).transpose()?;
        }
        if let Some(gender) = update.gender {
            client.gender = gender;
        }
        if let Some(branch_id) = update.branch_id {
            self.get_branch(branch_id).await?;
            client.branch_id = branch_id;
        }

        self.repo.update_client(&client).await?;
        tracing::info!(client_id = %client.id, "Updated client");
        Ok(client)
    }

    pub async fn list_clients(&self, filter: &ClientFilter) -> Result<Vec<Client>, AppError> {
        Ok(self.repo.list_clients(filter).await?)
    }

    pub async fn clients_by_branch(&self, branch_id: BranchId) -> Result<Vec<Client>, AppError> {
        self.get_branch(branch_id).await?;
        self.list_clients(&ClientFilter {
            branch_id: Some(branch_id),
            ..ClientFilter::default()
        })
        .await
    }

    /// Client with their branch and every loan's balance.
    pub async fn get_client_info(&self, id: ClientId) -> Result<ClientInfo, AppError> {
        let client = self.get_client(id).await?;
        let branch = self.repo.get_branch(client.branch_id).await?;
        let loans = self.loans_by_client(id).await?;
        let totals = self.repo.sum_repayments_by_loan().await?;

        let loans = loans
            .into_iter()
            .map(|loan| {
                let repaid = totals.get(&loan.id).copied().unwrap_or(0);
                let summary = LoanSummary::from_totals(&loan, repaid);
                (loan, summary)
            })
            .collect();

        Ok(ClientInfo {
            client,
            branch,
            loans,
        })
    }

    /// Delete a client. Refused while loans reference them.
    pub async fn delete_client(&self, id: ClientId) -> Result<(), AppError> {
        let client = self.get_client(id).await?;
        let loans = self.repo.count_loans_for_client(id).await?;
        if loans > 0 {
            return Err(AppError::HasDependents {
                entity: format!("client '{}'", client.name),
                reason: format!("{} loan(s) reference them", loans),
            });
        }

        self.repo.delete_client(id).await?;
        tracing::info!(client_id = %id, "Deleted client");
        Ok(())
    }

    async fn ensure_email_available(
        &self,
        email: &str,
        owner: Option<ClientId>,
    ) -> Result<(), AppError> {
        if !email.contains('@') {
            return Err(AppError::Validation(format!("invalid email address '{}'", email)));
        }
        match self.repo.get_client_by_email(email).await? {
            Some(existing) if Some(existing.id) != owner => Err(AppError::AlreadyExists(
                format!("Client with email '{}'", email),
            )),
            _ => Ok(()),
        }
    }

    // ========================
    // Loan operations
    // ========================

    /// Disburse a new loan. New loans are ACTIVE.
    pub async fn create_loan(&self, input: NewLoan) -> Result<Loan, AppError> {
        validate_terms(input.principal_cents, input.rate_bps, input.tenure_months)?;
        self.get_client(input.client_id).await?;
        self.get_branch(input.branch_id).await?;

        let loan = Loan::new(
            input.client_id,
            input.branch_id,
            input.principal_cents,
            input.rate_bps,
            input.tenure_months,
            input.issue_date,
        );
        self.repo.save_loan(&loan).await?;

        tracing::info!(
            loan_id = %loan.id,
            client_id = %loan.client_id,
            principal_cents = loan.principal_cents,
            rate_bps = loan.rate_bps,
            tenure_months = loan.tenure_months,
            "Created loan"
        );
        Ok(loan)
    }

    pub async fn get_loan(&self, id: LoanId) -> Result<Loan, AppError> {
        self.repo
            .find_loan(id)
            .await?
            .ok_or_else(|| AppError::LoanNotFound(id.to_string()))
    }

    /// Change principal, rate or tenure of an ACTIVE loan.
    ///
    /// A lower total due may leave the loan covered, in which case it closes.
    pub async fn update_loan_terms(
        &self,
        id: LoanId,
        update: LoanTermsUpdate,
    ) -> Result<Loan, AppError> {
        let _guard = self.loan_locks.acquire(id).await;
        let mut tx = self.repo.begin().await?;

        let mut loan = tx
            .find_loan(id)
            .await?
            .ok_or_else(|| AppError::LoanNotFound(id.to_string()))?;
        if !loan.is_active() {
            return Err(AppError::InvalidLoanState {
                status: loan.status,
                reason: "cannot update closed or defaulted loans".to_string(),
            });
        }

        if let Some(principal) = update.principal_cents {
            loan.principal_cents = principal;
        }
        if let Some(rate) = update.rate_bps {
            loan.rate_bps = rate;
        }
        if let Some(tenure) = update.tenure_months {
            loan.tenure_months = tenure;
        }
        validate_terms(loan.principal_cents, loan.rate_bps, loan.tenure_months)?;

        tx.update_loan_terms(&loan).await?;
        let repaid = tx.sum_repayments(id).await?;
        let status = status_after_posting(
            loan.status,
            repaid,
            total_due(loan.principal_cents, loan.rate_bps),
        );
        if status != loan.status {
            tx.set_loan_status(id, status).await?;
            loan.status = status;
        }
        tx.commit().await?;

        tracing::info!(loan_id = %id, status = %loan.status, "Updated loan terms");
        Ok(loan)
    }

    /// Administrative status override. Any transition is allowed and logged.
    pub async fn set_loan_status(&self, id: LoanId, status: LoanStatus) -> Result<Loan, AppError> {
        let _guard = self.loan_locks.acquire(id).await;
        let mut loan = self.get_loan(id).await?;
        if loan.status == status {
            return Ok(loan);
        }

        self.repo.set_loan_status(id, status).await?;
        if loan.status == LoanStatus::Defaulted {
            tracing::warn!(loan_id = %id, from = %loan.status, to = %status, "Loan status override leaves DEFAULTED");
        } else {
            tracing::info!(loan_id = %id, from = %loan.status, to = %status, "Loan status override");
        }
        loan.status = status;
        Ok(loan)
    }

    /// Delete a loan. Refused while repayments exist.
    pub async fn delete_loan(&self, id: LoanId) -> Result<(), AppError> {
        let _guard = self.loan_locks.acquire(id).await;
        self.get_loan(id).await?;
        let repayments = self.repo.count_repayments_for_loan(id).await?;
        if repayments > 0 {
            return Err(AppError::HasDependents {
                entity: format!("loan {}", id),
                reason: format!("{} repayment(s) recorded", repayments),
            });
        }

        self.repo.delete_loan(id).await?;
        tracing::info!(loan_id = %id, "Deleted loan");
        Ok(())
    }

    pub async fn list_loans(&self, filter: &LoanFilter) -> Result<Vec<Loan>, AppError> {
        Ok(self.repo.list_loans(filter).await?)
    }

    pub async fn loans_by_client(&self, client_id: ClientId) -> Result<Vec<Loan>, AppError> {
        self.list_loans(&LoanFilter {
            client_id: Some(client_id),
            ..LoanFilter::default()
        })
        .await
    }

    pub async fn loans_by_branch(&self, branch_id: BranchId) -> Result<Vec<Loan>, AppError> {
        self.get_branch(branch_id).await?;
        self.list_loans(&LoanFilter {
            branch_id: Some(branch_id),
            ..LoanFilter::default()
        })
        .await
    }

    pub async fn loan_summary(&self, id: LoanId) -> Result<LoanSummary, AppError> {
        let loan = self.get_loan(id).await?;
        let repaid = self.repo.sum_repayments(id).await?;
        Ok(LoanSummary::from_totals(&loan, repaid))
    }

    pub async fn get_loan_details(&self, id: LoanId) -> Result<LoanDetails, AppError> {
        let LoanRepayments {
            loan,
            summary,
            repayments,
        } = self.loan_repayments(id).await?;
        let client = self.repo.get_client(loan.client_id).await?;
        let branch = self.repo.get_branch(loan.branch_id).await?;
        let installment =
            installment_preview(loan.principal_cents, loan.rate_bps, loan.tenure_months);

        Ok(LoanDetails {
            loan,
            client,
            branch,
            summary,
            repayments,
            installment,
        })
    }

    /// Estimated monthly installment for arbitrary terms.
    pub fn installment_preview(
        &self,
        principal_cents: Cents,
        rate_bps: RateBps,
        months: u32,
    ) -> Result<Cents, AppError> {
        installment_preview(principal_cents, rate_bps, months)
            .ok_or_else(|| AppError::Validation("tenure must be at least one month".to_string()))
    }

    // ========================
    // Repayment operations
    // ========================

    /// Record a repayment against an ACTIVE loan and close the loan once covered.
    ///
    /// The balance check, insert and status change commit together. A
    /// confirmation is queued afterwards; its outcome never affects the result.
    pub async fn post_repayment(&self, input: NewRepayment) -> Result<RepaymentResult, AppError> {
        let reference = optional(input.reference).map(validate_reference).transpose()?;
        let today = self.today();

        let guard = self.loan_locks.acquire(input.loan_id).await;
        let mut tx = self.repo.begin().await?;

        let mut loan = tx
            .find_loan(input.loan_id)
            .await?
            .ok_or_else(|| AppError::LoanNotFound(input.loan_id.to_string()))?;
        let repaid = tx.sum_repayments(loan.id).await?;
        check_repayment(&loan, repaid, input.amount_cents, input.payment_date, today)?;

        let mut repayment = Repayment::new(
            loan.id,
            input.amount_cents,
            input.payment_date,
            input.payment_mode,
        );
        repayment.reference = reference;
        tx.insert_repayment(&repayment).await?;

        let total_repaid = tx.sum_repayments(loan.id).await?;
        let previous_status = loan.status;
        let status = status_after_posting(
            loan.status,
            total_repaid,
            total_due(loan.principal_cents, loan.rate_bps),
        );
        if status != previous_status {
            tx.set_loan_status(loan.id, status).await?;
            loan.status = status;
        }
        tx.commit().await?;
        drop(guard);

        let summary = LoanSummary::from_totals(&loan, total_repaid);
        tracing::info!(
            repayment_id = %repayment.id,
            loan_id = %loan.id,
            amount_cents = repayment.amount_cents,
            total_repaid,
            status = %loan.status,
            "Posted repayment"
        );
        if status != previous_status {
            tracing::info!(loan_id = %loan.id, "Loan fully repaid, closed");
        }

        self.queue_confirmation(&loan, &repayment, summary).await;

        Ok(RepaymentResult {
            repayment,
            loan,
            summary,
            previous_status,
        })
    }

    /// Change a recorded repayment and re-run the ledger for its loan.
    ///
    /// Refused for DEFAULTED loans. An increased amount must stay within the
    /// tolerance band of what was outstanding without this repayment.
    pub async fn update_repayment(
        &self,
        id: RepaymentId,
        update: RepaymentUpdate,
    ) -> Result<RepaymentResult, AppError> {
        let loan_id = self.get_repayment(id).await?.loan_id;
        let today = self.today();

        let _guard = self.loan_locks.acquire(loan_id).await;
        let mut tx = self.repo.begin().await?;

        let mut repayment = tx
            .get_repayment(id)
            .await?
            .ok_or_else(|| AppError::RepaymentNotFound(id.to_string()))?;
        let mut loan = tx
            .find_loan(repayment.loan_id)
            .await?
            .ok_or_else(|| AppError::LoanNotFound(repayment.loan_id.to_string()))?;
        if loan.status == LoanStatus::Defaulted {
            return Err(AppError::InvalidLoanState {
                status: loan.status,
                reason: "cannot modify repayments of a defaulted loan".to_string(),
            });
        }

        let previous_amount = repayment.amount_cents;
        if let Some(amount) = update.amount_cents {
            if amount <= 0 {
                return Err(AppError::InvalidAmount(format!(
                    "repayment must be positive, got {}",
                    amount
                )));
            }
            repayment.amount_cents = amount;
        }
        if let Some(date) = update.payment_date {
            if date > today {
                return Err(AppError::PaymentDateInFuture {
                    payment_date: date,
                    today,
                });
            }
            repayment.payment_date = date;
        }
        if let Some(mode) = update.payment_mode {
            repayment.payment_mode = mode;
        }
        if let Some(reference) = update.reference {
            repayment.reference = optional(Some(reference))
                .map(validate_reference)
                .transpose()?;
        }

        let due = total_due(loan.principal_cents, loan.rate_bps);
        let repaid_by_others = tx.sum_repayments(loan.id).await? - previous_amount;
        if repayment.amount_cents != previous_amount
            && below_minimum(repayment.amount_cents, due - repaid_by_others)
        {
            return Err(AppError::InvalidAmount(format!(
                "repayment of {} is below the minimum of {}",
                repayment.amount_cents, MIN_REPAYMENT_CENTS
            )));
        }
        if repayment.amount_cents > previous_amount {
            let outstanding = due - repaid_by_others;
            if exceeds_limit(repayment.amount_cents, outstanding) {
                return Err(AppError::AmountExceedsLimit {
                    amount: repayment.amount_cents,
                    outstanding,
                    limit: repayment_limit(outstanding),
                });
            }
        }
        tx.update_repayment(&repayment).await?;

        let total_repaid = repaid_by_others + repayment.amount_cents;
        let previous_status = loan.status;
        let status = reconcile_status(loan.status, total_repaid, due);
        if status != previous_status {
            tx.set_loan_status(loan.id, status).await?;
            loan.status = status;
        }
        tx.commit().await?;

        tracing::info!(
            repayment_id = %id,
            loan_id = %loan.id,
            from_cents = previous_amount,
            to_cents = repayment.amount_cents,
            status = %loan.status,
            "Updated repayment"
        );

        Ok(RepaymentResult {
            summary: LoanSummary::from_totals(&loan, total_repaid),
            repayment,
            loan,
            previous_status,
        })
    }

    /// Remove a repayment and reopen its loan if it is no longer covered.
    pub async fn delete_repayment(&self, id: RepaymentId) -> Result<RepaymentResult, AppError> {
        let loan_id = self.get_repayment(id).await?.loan_id;

        let _guard = self.loan_locks.acquire(loan_id).await;
        let mut tx = self.repo.begin().await?;

        let repayment = tx
            .get_repayment(id)
            .await?
            .ok_or_else(|| AppError::RepaymentNotFound(id.to_string()))?;
        let mut loan = tx
            .find_loan(repayment.loan_id)
            .await?
            .ok_or_else(|| AppError::LoanNotFound(repayment.loan_id.to_string()))?;

        tx.delete_repayment(id).await?;
        let total_repaid = tx.sum_repayments(loan.id).await?;
        let previous_status = loan.status;
        let status = status_after_removal(
            loan.status,
            total_repaid,
            total_due(loan.principal_cents, loan.rate_bps),
        );
        if status != previous_status {
            tx.set_loan_status(loan.id, status).await?;
            loan.status = status;
        }
        tx.commit().await?;

        tracing::info!(
            repayment_id = %id,
            loan_id = %loan.id,
            amount_cents = repayment.amount_cents,
            status = %loan.status,
            "Deleted repayment"
        );
        if status != previous_status {
            tracing::info!(loan_id = %loan.id, "Loan reopened after repayment removal");
        }

        Ok(RepaymentResult {
            summary: LoanSummary::from_totals(&loan, total_repaid),
            repayment,
            loan,
            previous_status,
        })
    }

    pub async fn get_repayment(&self, id: RepaymentId) -> Result<Repayment, AppError> {
        self.repo
            .get_repayment(id)
            .await?
            .ok_or_else(|| AppError::RepaymentNotFound(id.to_string()))
    }

    pub async fn latest_repayment(&self) -> Result<Option<Repayment>, AppError> {
        Ok(self.repo.latest_repayment().await?)
    }

    pub async fn list_repayments(
        &self,
        filter: &RepaymentFilter,
    ) -> Result<Vec<Repayment>, AppError> {
        Ok(self.repo.list_repayments(filter).await?)
    }

    pub async fn loan_repayments(&self, loan_id: LoanId) -> Result<LoanRepayments, AppError> {
        let loan = self.get_loan(loan_id).await?;
        let repayments = self
            .list_repayments(&RepaymentFilter {
                loan_id: Some(loan_id),
                ..RepaymentFilter::default()
            })
            .await?;
        let summary = compute_loan_summary(&loan, &repayments);

        Ok(LoanRepayments {
            loan,
            summary,
            repayments,
        })
    }

    /// Assemble the confirmation event for a recorded repayment as the loan stands now.
    pub async fn repayment_event(&self, repayment: Repayment) -> Result<RepaymentPosted, AppError> {
        let loan = self.get_loan(repayment.loan_id).await?;
        let client = self.get_client(loan.client_id).await?;
        let branch = self.repo.get_branch(loan.branch_id).await?;
        let summary = self.loan_summary(loan.id).await?;

        Ok(RepaymentPosted {
            loan,
            repayment,
            client,
            branch,
            summary,
        })
    }

    async fn queue_confirmation(&self, loan: &Loan, repayment: &Repayment, summary: LoanSummary) {
        let Some(notifier) = &self.notifier else {
            return;
        };

        let client = match self.repo.get_client(loan.client_id).await {
            Ok(Some(client)) => client,
            Ok(None) => {
                tracing::warn!(loan_id = %loan.id, client_id = %loan.client_id, "Client missing, skipping repayment confirmation");
                return;
            }
            Err(e) => {
                tracing::error!(loan_id = %loan.id, error = ?e, "Failed to load client for repayment confirmation");
                return;
            }
        };
        let branch = match self.repo.get_branch(loan.branch_id).await {
            Ok(branch) => branch,
            Err(e) => {
                tracing::warn!(loan_id = %loan.id, error = ?e, "Failed to load branch for repayment confirmation");
                None
            }
        };

        notifier.notify(RepaymentPosted {
            loan: loan.clone(),
            repayment: repayment.clone(),
            client,
            branch,
            summary,
        });
    }
}

fn required(field: &str, value: String) -> Result<String, AppError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(AppError::Validation(format!("{} is required", field)));
    }
    Ok(value.to_string())
}

/// Blank strings count as absent.
fn optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn validate_reference(reference: String) -> Result<String, AppError> {
    if reference.chars().count() > MAX_REFERENCE_LEN {
        return Err(AppError::Validation(format!(
            "reference longer than {} characters",
            MAX_REFERENCE_LEN
        )));
    }
    Ok(reference)
}

fn validate_phone(phone: String) -> Result<String, AppError> {
    if phone.chars().count() > 20 {
        return Err(AppError::Validation(
            "phone number longer than 20 characters".to_string(),
        ));
    }
    Ok(phone)
}
