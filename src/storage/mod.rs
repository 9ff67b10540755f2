mod repository;

pub use repository::*;

/// SQL migration for branches and clients
pub const MIGRATION_001_INITIAL: &str = include_str!("migrations/001_initial.sql");

/// SQL migration for loans
pub const MIGRATION_002_LOANS: &str = include_str!("migrations/002_loans.sql");

/// SQL migration for repayments
pub const MIGRATION_003_REPAYMENTS: &str = include_str!("migrations/003_repayments.sql");
