use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use uuid::Uuid;

use crate::application::{
    AnalyticsFilter, BranchFilter, ClientFilter, ClientUpdate, LoanFilter, LoanService,
    LoanTermsUpdate, NewClient, NewLoan, NewRepayment, RepaymentFilter, RepaymentUpdate,
};
use crate::domain::{
    format_cents, format_rate, installment_preview, parse_cents, parse_rate, total_due, Gender,
    LoanStatus, PaymentMode,
};
use crate::notify::{
    deliver_confirmation, render_confirmation, DeliveryOutcome, LogMailer, MailConfig,
    RepaymentNotifier,
};

/// Microlend - Microfinance Loan Ledger
#[derive(Parser)]
#[command(name = "microlend")]
#[command(about = "Branches, clients, loans and repayments with a loan repayment ledger")]
#[command(version)]
pub struct Cli {
    /// Database file path
    #[arg(short, long, env = "MICROLEND_DATABASE", default_value = "microlend.db")]
    pub database: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(flatten)]
    pub mail: MailArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Sender and copy addresses for repayment confirmations
#[derive(Args, Debug, Clone)]
pub struct MailArgs {
    /// Sender address
    #[arg(
        long = "mail-from",
        env = "MICROLEND_MAIL_FROM",
        default_value = "no-reply@microlend.local"
    )]
    pub from_address: String,

    /// Sender display name
    #[arg(
        long = "mail-from-name",
        env = "MICROLEND_MAIL_FROM_NAME",
        default_value = "Microlend"
    )]
    pub from_name: String,

    /// Admin address copied on every confirmation
    #[arg(long = "mail-cc", env = "MICROLEND_MAIL_CC")]
    pub cc_address: Option<String>,
}

impl MailArgs {
    pub fn to_config(&self) -> MailConfig {
        MailConfig {
            from_address: self.from_address.clone(),
            from_name: self.from_name.clone(),
            cc_address: self.cc_address.clone(),
            ..MailConfig::default()
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new database
    Init,

    /// Branch management commands
    #[command(subcommand)]
    Branch(BranchCommands),

    /// Client management commands
    #[command(subcommand)]
    Client(ClientCommands),

    /// Loan management commands
    #[command(subcommand)]
    Loan(LoanCommands),

    /// Record a repayment against a loan
    Repay {
        /// Loan ID
        loan: String,

        /// Amount paid (e.g., "1500.00" or "1500")
        amount: String,

        /// Payment mode: cash, bank, mobile
        #[arg(short, long, default_value = "cash")]
        mode: String,

        /// Payment date (YYYY-MM-DD, defaults to today)
        #[arg(long)]
        date: Option<String>,

        /// Receipt number, bank transaction ID or mobile TxID
        #[arg(short, long)]
        reference: Option<String>,
    },

    /// Repayment queries and corrections
    #[command(subcommand)]
    Repayment(RepaymentCommands),

    /// Estimate the monthly installment for given terms
    Preview {
        /// Principal amount
        principal: String,

        /// Annual interest rate in percent (e.g., "12.5")
        #[arg(short, long)]
        rate: String,

        /// Tenure in months
        #[arg(short, long)]
        months: u32,
    },

    /// Generate reports and analytics
    #[command(subcommand)]
    Report(ReportCommands),

    /// Export data to CSV or JSON
    Export {
        /// What to export: loans, repayments, full
        export_type: String,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Render and send a repayment confirmation through the log mailer
    NotifyTest {
        /// Repayment ID (defaults to the most recent repayment)
        #[arg(long)]
        repayment: Option<String>,

        /// Send to this address instead of the client's
        #[arg(long)]
        email: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum BranchCommands {
    /// Create a new branch
    Create {
        /// Branch name (unique)
        name: String,

        #[arg(long)]
        district: String,

        #[arg(long)]
        region: String,
    },

    /// List branches
    List {
        /// Filter by region (substring match)
        #[arg(long)]
        region: Option<String>,

        /// Filter by district (substring match)
        #[arg(long)]
        district: Option<String>,
    },

    /// Show branch details
    Show {
        /// Branch ID or name
        branch: String,
    },

    /// Update a branch
    Update {
        /// Branch ID or name
        branch: String,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        district: Option<String>,

        #[arg(long)]
        region: Option<String>,
    },

    /// Delete a branch without clients or loans
    Delete {
        /// Branch ID or name
        branch: String,
    },
}

#[derive(Subcommand)]
pub enum ClientCommands {
    /// Register a new client
    Create {
        /// Client name
        name: String,

        /// Gender: male, female, other
        #[arg(short, long)]
        gender: String,

        /// Branch ID or name
        #[arg(short, long)]
        branch: String,

        #[arg(short, long)]
        email: Option<String>,

        #[arg(short, long)]
        phone: Option<String>,

        /// Registration date (YYYY-MM-DD, defaults to today)
        #[arg(long)]
        registered: Option<String>,
    },

    /// List clients
    List {
        /// Branch ID or name
        #[arg(long)]
        branch: Option<String>,

        /// Gender: male, female, other
        #[arg(long)]
        gender: Option<String>,

        /// Registered on or after (YYYY-MM-DD)
        #[arg(long)]
        from_date: Option<String>,

        /// Registered on or before (YYYY-MM-DD)
        #[arg(long)]
        to_date: Option<String>,

        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show client details and loans
    Show {
        /// Client ID
        id: String,
    },

    /// Update a client
    Update {
        /// Client ID
        id: String,

        #[arg(long)]
        name: Option<String>,

        /// New email (empty string clears it)
        #[arg(long)]
        email: Option<String>,

        /// New phone (empty string clears it)
        #[arg(long)]
        phone: Option<String>,

        #[arg(long)]
        gender: Option<String>,

        /// Branch ID or name
        #[arg(long)]
        branch: Option<String>,
    },

    /// Delete a client without loans
    Delete {
        /// Client ID
        id: String,
    },
}

#[derive(Subcommand)]
pub enum LoanCommands {
    /// Disburse a new loan
    Create {
        /// Client ID
        #[arg(short, long)]
        client: String,

        /// Branch ID or name (defaults to the client's branch)
        #[arg(short, long)]
        branch: Option<String>,

        /// Principal amount (e.g., "10000.00")
        principal: String,

        /// Annual interest rate in percent (e.g., "12.5")
        #[arg(short, long)]
        rate: String,

        /// Tenure in months
        #[arg(short, long)]
        tenure: u32,

        /// Issue date (YYYY-MM-DD, defaults to today)
        #[arg(long)]
        issue_date: Option<String>,
    },

    /// List loans
    List {
        /// Status: active, closed, defaulted
        #[arg(long)]
        status: Option<String>,

        /// Branch ID or name
        #[arg(long)]
        branch: Option<String>,

        /// Client ID
        #[arg(long)]
        client: Option<String>,

        /// Issued on or after (YYYY-MM-DD)
        #[arg(long)]
        from_date: Option<String>,

        /// Issued on or before (YYYY-MM-DD)
        #[arg(long)]
        to_date: Option<String>,

        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show loan details, balance and repayments
    Show {
        /// Loan ID
        id: String,
    },

    /// Change the terms of an active loan
    Update {
        /// Loan ID
        id: String,

        #[arg(long)]
        principal: Option<String>,

        #[arg(long)]
        rate: Option<String>,

        #[arg(long)]
        tenure: Option<u32>,
    },

    /// Override a loan's status
    Status {
        /// Loan ID
        id: String,

        /// New status: active, closed, defaulted
        status: String,
    },

    /// Delete a loan without repayments
    Delete {
        /// Loan ID
        id: String,
    },
}

#[derive(Subcommand)]
pub enum RepaymentCommands {
    /// List repayments
    List {
        /// Loan ID
        #[arg(long)]
        loan: Option<String>,

        /// Client ID
        #[arg(long)]
        client: Option<String>,

        /// Payment mode: cash, bank, mobile
        #[arg(long)]
        mode: Option<String>,

        /// Paid on or after (YYYY-MM-DD)
        #[arg(long)]
        from_date: Option<String>,

        /// Paid on or before (YYYY-MM-DD)
        #[arg(long)]
        to_date: Option<String>,

        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Correct a recorded repayment
    Update {
        /// Repayment ID
        id: String,

        #[arg(long)]
        amount: Option<String>,

        /// Payment date (YYYY-MM-DD)
        #[arg(long)]
        date: Option<String>,

        /// Payment mode: cash, bank, mobile
        #[arg(long)]
        mode: Option<String>,

        /// New reference (empty string clears it)
        #[arg(long)]
        reference: Option<String>,
    },

    /// Delete a repayment
    Delete {
        /// Repayment ID
        id: String,
    },
}

#[derive(Subcommand)]
pub enum ReportCommands {
    /// Loan portfolio summary
    Portfolio {
        /// Output format: table, json
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Per-branch performance
    Branches {
        /// Output format: table, json, csv
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Client statistics
    Clients {
        /// Output format: table, json
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Repayment analytics for one client
    ClientRepayments {
        /// Client ID
        client: String,

        /// Restrict to one loan
        #[arg(long)]
        loan: Option<String>,

        #[arg(long)]
        from_date: Option<String>,

        #[arg(long)]
        to_date: Option<String>,

        /// Output format: table, json
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Active loans of one client
    ClientLoans {
        /// Client ID
        client: String,

        /// Output format: table, json
        #[arg(long, default_value = "table")]
        format: String,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Init => {
                LoanService::init(&self.database).await?;
                println!("Database initialized: {}", self.database);
            }

            Commands::Branch(branch_cmd) => {
                let service = LoanService::connect(&self.database).await?;
                run_branch_command(&service, branch_cmd).await?;
            }

            Commands::Client(client_cmd) => {
                let service = LoanService::connect(&self.database).await?;
                run_client_command(&service, client_cmd).await?;
            }

            Commands::Loan(loan_cmd) => {
                let service = LoanService::connect(&self.database).await?;
                run_loan_command(&service, loan_cmd).await?;
            }

            Commands::Repay {
                loan,
                amount,
                mode,
                date,
                reference,
            } => {
                let (notifier, worker) =
                    RepaymentNotifier::spawn(LogMailer, self.mail.to_config());
                let service = LoanService::connect(&self.database)
                    .await?
                    .with_notifier(notifier);

                let amount_cents = parse_cents(&amount)
                    .context("Invalid amount format. Use '1500.00' or '1500'")?;
                let payment_date = match date {
                    Some(date_str) => parse_date(&date_str)?,
                    None => service.today(),
                };

                let result = service
                    .post_repayment(NewRepayment {
                        loan_id: parse_id(&loan, "loan")?,
                        amount_cents,
                        payment_date,
                        payment_mode: parse_mode(&mode)?,
                        reference,
                    })
                    .await?;

                println!(
                    "Recorded repayment: {} on loan {} ({})",
                    format_cents(result.repayment.amount_cents),
                    result.loan.id,
                    result.repayment.id
                );
                println!(
                    "  Repaid {} of {}, remaining {}",
                    format_cents(result.summary.total_repaid),
                    format_cents(result.summary.total_due),
                    format_cents(result.summary.remaining_balance)
                );
                if result.status_changed() {
                    println!("  Loan is now {}", result.loan.status);
                }

                // Let the queued confirmation go out before exiting
                drop(service);
                worker.await.context("Notification worker panicked")?;
            }

            Commands::Repayment(repayment_cmd) => {
                let service = LoanService::connect(&self.database).await?;
                run_repayment_command(&service, repayment_cmd).await?;
            }

            Commands::Preview {
                principal,
                rate,
                months,
            } => {
                let principal_cents =
                    parse_cents(&principal).context("Invalid principal format")?;
                let rate_bps = parse_rate(&rate).context("Invalid rate format. Use '12.5'")?;
                let installment = installment_preview(principal_cents, rate_bps, months)
                    .ok_or_else(|| anyhow::anyhow!("Tenure must be at least one month"))?;
                let total = total_due(principal_cents, rate_bps);

                println!(
                    "Principal {} at {}% over {} months",
                    format_cents(principal_cents),
                    format_rate(rate_bps),
                    months
                );
                println!("  Estimated installment: {}", format_cents(installment));
                println!("  Total due (flat):      {}", format_cents(total));
            }

            Commands::Report(report_cmd) => {
                let service = LoanService::connect(&self.database).await?;
                run_report_command(&service, report_cmd).await?;
            }

            Commands::Export {
                export_type,
                output,
            } => {
                let service = LoanService::connect(&self.database).await?;
                run_export_command(&service, &export_type, output.as_deref()).await?;
            }

            Commands::NotifyTest { repayment, email } => {
                let service = LoanService::connect(&self.database).await?;
                run_notify_test_command(&service, &self.mail.to_config(), repayment, email)
                    .await?;
            }
        }

        Ok(())
    }
}

async fn run_branch_command(service: &LoanService, cmd: BranchCommands) -> Result<()> {
    match cmd {
        BranchCommands::Create {
            name,
            district,
            region,
        } => {
            let branch = service.create_branch(name, district, region).await?;
            println!("Created branch: {} ({})", branch.name, branch.id);
        }

        BranchCommands::List { region, district } => {
            let branches = service
                .list_branches(&BranchFilter { region, district })
                .await?;
            if branches.is_empty() {
                println!("No branches found.");
            } else {
                println!("{:<24} {:<16} {:<16} ID", "NAME", "DISTRICT", "REGION");
                println!("{}", "-".repeat(96));
                for branch in branches {
                    println!(
                        "{:<24} {:<16} {:<16} {}",
                        truncate(&branch.name, 24),
                        truncate(&branch.district, 16),
                        truncate(&branch.region, 16),
                        branch.id
                    );
                }
            }
        }

        BranchCommands::Show { branch } => {
            let branch = service.resolve_branch(&branch).await?;
            let info = service.get_branch_info(branch.id).await?;

            println!("Branch: {}", info.branch.name);
            println!("  ID:        {}", info.branch.id);
            println!("  District:  {}", info.branch.district);
            println!("  Region:    {}", info.branch.region);
            println!("  Clients:   {}", info.clients_count);
            println!("  Loans:     {}", info.loans_count);
            println!(
                "  Created:   {}",
                info.branch.created_at.format("%Y-%m-%d %H:%M:%S")
            );
        }

        BranchCommands::Update {
            branch,
            name,
            district,
            region,
        } => {
            let branch = service.resolve_branch(&branch).await?;
            let updated = service
                .update_branch(branch.id, name, district, region)
                .await?;
            println!("Updated branch: {} ({})", updated.name, updated.id);
        }

        BranchCommands::Delete { branch } => {
            let branch = service.resolve_branch(&branch).await?;
            service.delete_branch(branch.id).await?;
            println!("Deleted branch: {}", branch.name);
        }
    }
    Ok(())
}

async fn run_client_command(service: &LoanService, cmd: ClientCommands) -> Result<()> {
    match cmd {
        ClientCommands::Create {
            name,
            gender,
            branch,
            email,
            phone,
            registered,
        } => {
            let branch = service.resolve_branch(&branch).await?;
            let registration_date = match registered {
                Some(date_str) => parse_date(&date_str)?,
                None => service.today(),
            };

            let client = service
                .create_client(NewClient {
                    name,
                    email,
                    phone,
                    gender: parse_gender(&gender)?,
                    branch_id: branch.id,
                    registration_date,
                })
                .await?;
            println!("Registered client: {} ({})", client.name, client.id);
        }

        ClientCommands::List {
            branch,
            gender,
            from_date,
            to_date,
            limit,
        } => {
            let branch_id = match branch {
                Some(b) => Some(service.resolve_branch(&b).await?.id),
                None => None,
            };
            let filter = ClientFilter {
                branch_id,
                gender: gender.as_deref().map(parse_gender).transpose()?,
                from_date: from_date.as_deref().map(parse_date).transpose()?,
                to_date: to_date.as_deref().map(parse_date).transpose()?,
                limit,
            };

            let clients = service.list_clients(&filter).await?;
            if clients.is_empty() {
                println!("No clients found.");
            } else {
                println!(
                    "{:<24} {:<8} {:<28} {:<12} ID",
                    "NAME", "GENDER", "EMAIL", "REGISTERED"
                );
                println!("{}", "-".repeat(112));
                for client in clients {
                    println!(
                        "{:<24} {:<8} {:<28} {:<12} {}",
                        truncate(&client.name, 24),
                        client.gender,
                        truncate(client.email.as_deref().unwrap_or("-"), 28),
                        client.registration_date,
                        client.id
                    );
                }
            }
        }

        ClientCommands::Show { id } => {
            let info = service.get_client_info(parse_id(&id, "client")?).await?;
            let client = &info.client;

            println!("Client: {}", client.name);
            println!("  ID:          {}", client.id);
            println!("  Gender:      {}", client.gender);
            if let Some(email) = &client.email {
                println!("  Email:       {}", email);
            }
            if let Some(phone) = &client.phone {
                println!("  Phone:       {}", phone);
            }
            match &info.branch {
                Some(branch) => println!("  Branch:      {}", branch.name),
                None => println!("  Branch:      {}", client.branch_id),
            }
            println!("  Registered:  {}", client.registration_date);

            if !info.loans.is_empty() {
                println!();
                println!(
                    "  {:<38} {:>12} {:>12} {:<10}",
                    "LOAN", "PRINCIPAL", "REMAINING", "STATUS"
                );
                for (loan, summary) in &info.loans {
                    println!(
                        "  {:<38} {:>12} {:>12} {:<10}",
                        loan.id.to_string(),
                        format_cents(loan.principal_cents),
                        format_cents(summary.remaining_balance),
                        loan.status
                    );
                }
            }
        }

        ClientCommands::Update {
            id,
            name,
            email,
            phone,
            gender,
            branch,
        } => {
            let branch_id = match branch {
                Some(b) => Some(service.resolve_branch(&b).await?.id),
                None => None,
            };
            let update = ClientUpdate {
                name,
                email,
                phone,
                gender: gender.as_deref().map(parse_gender).transpose()?,
                branch_id,
            };

            let client = service
                .update_client(parse_id(&id, "client")?, update)
                .await?;
            println!("Updated client: {} ({})", client.name, client.id);
        }

        ClientCommands::Delete { id } => {
            let client_id = parse_id(&id, "client")?;
            service.delete_client(client_id).await?;
            println!("Deleted client: {}", client_id);
        }
    }
    Ok(())
}

async fn run_loan_command(service: &LoanService, cmd: LoanCommands) -> Result<()> {
    match cmd {
        LoanCommands::Create {
            client,
            branch,
            principal,
            rate,
            tenure,
            issue_date,
        } => {
            let client = service.get_client(parse_id(&client, "client")?).await?;
            let branch_id = match branch {
                Some(b) => service.resolve_branch(&b).await?.id,
                None => client.branch_id,
            };
            let issue_date = match issue_date {
                Some(date_str) => parse_date(&date_str)?,
                None => service.today(),
            };

            let loan = service
                .create_loan(NewLoan {
                    client_id: client.id,
                    branch_id,
                    principal_cents: parse_cents(&principal)
                        .context("Invalid principal format")?,
                    rate_bps: parse_rate(&rate).context("Invalid rate format. Use '12.5'")?,
                    tenure_months: tenure,
                    issue_date,
                })
                .await?;
            println!(
                "Created loan: {} at {}% for {} months to {} ({})",
                format_cents(loan.principal_cents),
                format_rate(loan.rate_bps),
                loan.tenure_months,
                client.name,
                loan.id
            );
        }

        LoanCommands::List {
            status,
            branch,
            client,
            from_date,
            to_date,
            limit,
        } => {
            let branch_id = match branch {
                Some(b) => Some(service.resolve_branch(&b).await?.id),
                None => None,
            };
            let filter = LoanFilter {
                status: status.as_deref().map(parse_status).transpose()?,
                branch_id,
                client_id: client.as_deref().map(|c| parse_id(c, "client")).transpose()?,
                from_date: from_date.as_deref().map(parse_date).transpose()?,
                to_date: to_date.as_deref().map(parse_date).transpose()?,
                limit,
            };

            let loans = service.list_loans(&filter).await?;
            if loans.is_empty() {
                println!("No loans found.");
            } else {
                println!(
                    "{:<12} {:>12} {:>7} {:>6} {:<10} ID",
                    "ISSUED", "PRINCIPAL", "RATE", "MONTHS", "STATUS"
                );
                println!("{}", "-".repeat(90));
                for loan in loans {
                    println!(
                        "{:<12} {:>12} {:>6}% {:>6} {:<10} {}",
                        loan.issue_date,
                        format_cents(loan.principal_cents),
                        format_rate(loan.rate_bps),
                        loan.tenure_months,
                        loan.status,
                        loan.id
                    );
                }
            }
        }

        LoanCommands::Show { id } => {
            let details = service.get_loan_details(parse_id(&id, "loan")?).await?;
            let loan = &details.loan;

            println!("Loan: {}", loan.id);
            match &details.client {
                Some(client) => println!("  Client:       {} ({})", client.name, client.id),
                None => println!("  Client:       {}", loan.client_id),
            }
            match &details.branch {
                Some(branch) => println!("  Branch:       {}", branch.name),
                None => println!("  Branch:       {}", loan.branch_id),
            }
            println!("  Principal:    {}", format_cents(loan.principal_cents));
            println!("  Rate:         {}%", format_rate(loan.rate_bps));
            println!("  Tenure:       {} months", loan.tenure_months);
            println!("  Issued:       {}", loan.issue_date);
            println!("  Status:       {}", loan.status);
            if let Some(installment) = details.installment {
                println!("  Installment:  {} (estimate)", format_cents(installment));
            }
            println!();
            println!("  Total due:    {}", format_cents(details.summary.total_due));
            println!("  Total repaid: {}", format_cents(details.summary.total_repaid));
            println!(
                "  Remaining:    {}",
                format_cents(details.summary.remaining_balance)
            );

            if !details.repayments.is_empty() {
                println!();
                println!("  Repayments:");
                for repayment in &details.repayments {
                    println!(
                        "    - {} on {} via {}{} ({})",
                        format_cents(repayment.amount_cents),
                        repayment.payment_date,
                        repayment.payment_mode,
                        repayment
                            .reference
                            .as_ref()
                            .map(|r| format!(" ref {}", r))
                            .unwrap_or_default(),
                        repayment.id
                    );
                }
            }
        }

        LoanCommands::Update {
            id,
            principal,
            rate,
            tenure,
        } => {
            let update = LoanTermsUpdate {
                principal_cents: principal
                    .as_deref()
                    .map(parse_cents)
                    .transpose()
                    .context("Invalid principal format")?,
                rate_bps: rate
                    .as_deref()
                    .map(parse_rate)
                    .transpose()
                    .context("Invalid rate format")?,
                tenure_months: tenure,
            };

            let loan = service
                .update_loan_terms(parse_id(&id, "loan")?, update)
                .await?;
            println!(
                "Updated loan {}: {} at {}% for {} months ({})",
                loan.id,
                format_cents(loan.principal_cents),
                format_rate(loan.rate_bps),
                loan.tenure_months,
                loan.status
            );
        }

        LoanCommands::Status { id, status } => {
            let loan = service
                .set_loan_status(parse_id(&id, "loan")?, parse_status(&status)?)
                .await?;
            println!("Loan {} is now {}", loan.id, loan.status);
        }

        LoanCommands::Delete { id } => {
            let loan_id = parse_id(&id, "loan")?;
            service.delete_loan(loan_id).await?;
            println!("Deleted loan: {}", loan_id);
        }
    }
    Ok(())
}

async fn run_repayment_command(service: &LoanService, cmd: RepaymentCommands) -> Result<()> {
    match cmd {
        RepaymentCommands::List {
            loan,
            client,
            mode,
            from_date,
            to_date,
            limit,
        } => {
            let filter = RepaymentFilter {
                loan_id: loan.as_deref().map(|l| parse_id(l, "loan")).transpose()?,
                client_id: client.as_deref().map(|c| parse_id(c, "client")).transpose()?,
                payment_mode: mode.as_deref().map(parse_mode).transpose()?,
                from_date: from_date.as_deref().map(parse_date).transpose()?,
                to_date: to_date.as_deref().map(parse_date).transpose()?,
                limit,
            };

            let repayments = service.list_repayments(&filter).await?;
            if repayments.is_empty() {
                println!("No repayments found.");
            } else {
                println!(
                    "{:<12} {:>12} {:<7} {:<16} {:<38} ID",
                    "DATE", "AMOUNT", "MODE", "REFERENCE", "LOAN"
                );
                println!("{}", "-".repeat(124));
                for repayment in repayments {
                    println!(
                        "{:<12} {:>12} {:<7} {:<16} {:<38} {}",
                        repayment.payment_date,
                        format_cents(repayment.amount_cents),
                        repayment.payment_mode,
                        truncate(repayment.reference.as_deref().unwrap_or("-"), 16),
                        repayment.loan_id.to_string(),
                        repayment.id
                    );
                }
            }
        }

        RepaymentCommands::Update {
            id,
            amount,
            date,
            mode,
            reference,
        } => {
            let update = RepaymentUpdate {
                amount_cents: amount
                    .as_deref()
                    .map(parse_cents)
                    .transpose()
                    .context("Invalid amount format")?,
                payment_date: date.as_deref().map(parse_date).transpose()?,
                payment_mode: mode.as_deref().map(parse_mode).transpose()?,
                reference,
            };

            let result = service
                .update_repayment(parse_id(&id, "repayment")?, update)
                .await?;
            println!(
                "Updated repayment {}: {} on {}",
                result.repayment.id,
                format_cents(result.repayment.amount_cents),
                result.repayment.payment_date
            );
            println!(
                "  Loan {} remaining {} ({})",
                result.loan.id,
                format_cents(result.summary.remaining_balance),
                result.loan.status
            );
        }

        RepaymentCommands::Delete { id } => {
            let result = service
                .delete_repayment(parse_id(&id, "repayment")?)
                .await?;
            println!(
                "Deleted repayment: {} on loan {}",
                format_cents(result.repayment.amount_cents),
                result.loan.id
            );
            if result.status_changed() {
                println!("  Loan is now {}", result.loan.status);
            }
        }
    }
    Ok(())
}

async fn run_report_command(service: &LoanService, cmd: ReportCommands) -> Result<()> {
    match cmd {
        ReportCommands::Portfolio { format } => {
            let report = service.portfolio_summary().await?;

            match format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&report)?),
                _ => {
                    println!("Loan Portfolio Summary (as of {})", report.as_of);
                    println!();
                    println!("Total loans:       {:>15}", report.total_loans);
                    println!(
                        "Total disbursed:   {:>15}",
                        format_cents(report.total_disbursed)
                    );
                    println!(
                        "Average principal: {:>15}",
                        format_cents(report.average_principal)
                    );
                    println!("Average rate:      {:>14.2}%", report.average_rate);
                    println!("Issued this month: {:>15}", report.loans_this_month);

                    if !report.by_status.is_empty() {
                        println!();
                        println!("{:<12} {:>8} {:>15}", "STATUS", "COUNT", "PRINCIPAL");
                        println!("{}", "-".repeat(37));
                        for status in &report.by_status {
                            println!(
                                "{:<12} {:>8} {:>15}",
                                status.status,
                                status.count,
                                format_cents(status.total_principal)
                            );
                        }
                    }
                }
            }
        }

        ReportCommands::Branches { format } => {
            let branches = service.branch_performance().await?;

            match format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&branches)?),
                "csv" => {
                    let mut writer = csv::Writer::from_writer(std::io::stdout());
                    writer.write_record([
                        "branch",
                        "district",
                        "region",
                        "clients",
                        "loans",
                        "total_disbursed",
                        "active_loans",
                    ])?;
                    for b in &branches {
                        writer.write_record([
                            b.name.clone(),
                            b.district.clone(),
                            b.region.clone(),
                            b.clients_count.to_string(),
                            b.loans_count.to_string(),
                            format_cents(b.total_disbursed),
                            b.active_loans.to_string(),
                        ])?;
                    }
                    writer.flush()?;
                }
                _ => {
                    println!("Branch Performance");
                    println!();
                    println!(
                        "{:<24} {:>8} {:>8} {:>15} {:>8}",
                        "BRANCH", "CLIENTS", "LOANS", "DISBURSED", "ACTIVE"
                    );
                    println!("{}", "-".repeat(67));
                    for b in &branches {
                        println!(
                            "{:<24} {:>8} {:>8} {:>15} {:>8}",
                            truncate(&b.name, 24),
                            b.clients_count,
                            b.loans_count,
                            format_cents(b.total_disbursed),
                            b.active_loans
                        );
                    }
                }
            }
        }

        ReportCommands::Clients { format } => {
            let stats = service.client_statistics().await?;

            match format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&stats)?),
                _ => {
                    println!("Client Statistics");
                    println!();
                    println!("Total clients:        {}", stats.total_clients);
                    println!(
                        "Registered since {}: {}",
                        stats.recent_since, stats.recent_registrations
                    );
                    println!();
                    println!("By gender:");
                    for g in &stats.by_gender {
                        println!("  {:<10} {:>8}", g.gender, g.count);
                    }
                    println!();
                    println!("By branch:");
                    for b in &stats.by_branch {
                        println!("  {:<24} {:>8}", truncate(&b.branch_name, 24), b.count);
                    }
                }
            }
        }

        ReportCommands::ClientRepayments {
            client,
            loan,
            from_date,
            to_date,
            format,
        } => {
            let filter = AnalyticsFilter {
                loan_id: loan.as_deref().map(|l| parse_id(l, "loan")).transpose()?,
                from_date: from_date.as_deref().map(parse_date).transpose()?,
                to_date: to_date.as_deref().map(parse_date).transpose()?,
            };
            let report = service
                .client_repayment_analytics(parse_id(&client, "client")?, &filter)
                .await?;

            match format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&report)?),
                _ => {
                    println!("Repayment Analytics: {}", report.client_name);
                    println!();
                    println!("Payments:            {}", report.total_payments);
                    println!(
                        "Total paid:          {}",
                        format_cents(report.total_amount_paid)
                    );
                    println!(
                        "Average payment:     {}",
                        format_cents(report.average_payment)
                    );
                    println!("Loans with payments: {}", report.loans_with_payments);

                    if !report.payment_modes.is_empty() {
                        println!();
                        println!(
                            "{:<8} {:>8} {:>15} {:>8}",
                            "MODE", "COUNT", "AMOUNT", "PERCENT"
                        );
                        println!("{}", "-".repeat(42));
                        for m in &report.payment_modes {
                            println!(
                                "{:<8} {:>8} {:>15} {:>7.2}%",
                                m.mode,
                                m.count,
                                format_cents(m.total_amount),
                                m.percentage
                            );
                        }
                    }

                    if !report.monthly_trends.is_empty() {
                        println!();
                        println!("{:<8} {:>8} {:>15}", "MONTH", "COUNT", "AMOUNT");
                        println!("{}", "-".repeat(33));
                        for t in &report.monthly_trends {
                            println!(
                                "{:<8} {:>8} {:>15}",
                                t.month,
                                t.payments_count,
                                format_cents(t.total_amount)
                            );
                        }
                    }
                }
            }
        }

        ReportCommands::ClientLoans { client, format } => {
            let report = service
                .client_active_loans(parse_id(&client, "client")?)
                .await?;

            match format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&report)?),
                _ => {
                    println!("Active Loans: {}", report.client_name);
                    println!();
                    if report.loans.is_empty() {
                        println!("No active loans.");
                    } else {
                        println!(
                            "{:<12} {:>12} {:>12} {:>12} {:>12} {:>5} {:<12}",
                            "ISSUED", "PRINCIPAL", "REPAID", "REMAINING", "INSTALLMENT", "PAID", "LAST PAID"
                        );
                        println!("{}", "-".repeat(85));
                        for p in &report.loans {
                            println!(
                                "{:<12} {:>12} {:>12} {:>12} {:>12} {:>5} {:<12}",
                                p.issue_date,
                                format_cents(p.principal_cents),
                                format_cents(p.summary.total_repaid),
                                format_cents(p.summary.remaining_balance),
                                p.monthly_installment
                                    .map(format_cents)
                                    .unwrap_or_else(|| "-".to_string()),
                                p.repayments_count,
                                p.last_payment_date
                                    .map(|d| d.to_string())
                                    .unwrap_or_else(|| "-".to_string())
                            );
                        }
                        println!("{}", "-".repeat(85));
                    }
                    println!(
                        "{} active loan(s), {} outstanding",
                        report.total_active_loans,
                        format_cents(report.total_outstanding)
                    );
                }
            }
        }
    }
    Ok(())
}

async fn run_export_command(
    service: &LoanService,
    export_type: &str,
    output: Option<&str>,
) -> Result<()> {
    use crate::io::Exporter;
    use std::fs::File;
    use std::io::{stdout, Write};

    let exporter = Exporter::new(service);

    let writer: Box<dyn Write> = match output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create output file: {}", path))?;
            Box::new(file)
        }
        None => Box::new(stdout()),
    };

    match export_type {
        "loans" => {
            let count = exporter
                .export_loans_csv(writer, &LoanFilter::default())
                .await?;
            if output.is_some() {
                eprintln!("Exported {} loans", count);
            }
        }
        "repayments" => {
            let count = exporter
                .export_repayments_csv(writer, &RepaymentFilter::default())
                .await?;
            if output.is_some() {
                eprintln!("Exported {} repayments", count);
            }
        }
        "full" => {
            let snapshot = exporter.export_full_json(writer).await?;
            if output.is_some() {
                eprintln!(
                    "Exported full database: {} branches, {} clients, {} loans, {} repayments",
                    snapshot.branches.len(),
                    snapshot.clients.len(),
                    snapshot.loans.len(),
                    snapshot.repayments.len()
                );
            }
        }
        _ => {
            anyhow::bail!(
                "Invalid export type '{}'. Valid types: loans, repayments, full",
                export_type
            );
        }
    }

    Ok(())
}

async fn run_notify_test_command(
    service: &LoanService,
    config: &MailConfig,
    repayment_id: Option<String>,
    email: Option<String>,
) -> Result<()> {
    let repayment = match repayment_id {
        Some(id) => service.get_repayment(parse_id(&id, "repayment")?).await?,
        None => service
            .latest_repayment()
            .await?
            .ok_or_else(|| anyhow::anyhow!("No repayments recorded yet"))?,
    };

    let mut event = service.repayment_event(repayment).await?;
    if let Some(email) = email {
        event.client.email = Some(email);
    }

    let Some(message) = render_confirmation(&event, config) else {
        anyhow::bail!("No recipients: the client has no email and no copy address is configured");
    };
    println!("From:    {}", message.from);
    println!("To:      {}", message.to.join(", "));
    if !message.cc.is_empty() {
        println!("Cc:      {}", message.cc.join(", "));
    }
    println!("Subject: {}", message.subject);
    println!();
    println!("{}", message.body);

    match deliver_confirmation(&LogMailer, config, &event).await {
        DeliveryOutcome::Sent { attempts } => {
            println!("Sent after {} attempt(s)", attempts);
        }
        DeliveryOutcome::NoRecipients => anyhow::bail!("No recipients"),
        DeliveryOutcome::Failed { attempts } => {
            anyhow::bail!("Delivery failed after {} attempt(s)", attempts)
        }
    }
    Ok(())
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

fn parse_date(date_str: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(date_str, "%Y-%m-%d")
        .with_context(|| format!("Invalid date '{}'. Use YYYY-MM-DD", date_str))
}

fn parse_id(id: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(id).with_context(|| format!("Invalid {} ID format (expected UUID)", what))
}

fn parse_gender(s: &str) -> Result<Gender> {
    Gender::from_str(s)
        .ok_or_else(|| anyhow::anyhow!("Invalid gender '{}'. Valid: male, female, other", s))
}

fn parse_status(s: &str) -> Result<LoanStatus> {
    LoanStatus::from_str(s).ok_or_else(|| {
        anyhow::anyhow!("Invalid status '{}'. Valid: active, closed, defaulted", s)
    })
}

fn parse_mode(s: &str) -> Result<PaymentMode> {
    PaymentMode::from_str(s)
        .ok_or_else(|| anyhow::anyhow!("Invalid payment mode '{}'. Valid: cash, bank, mobile", s))
}
