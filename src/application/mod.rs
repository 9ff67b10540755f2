// Application layer - use cases and orchestration over the repository

pub mod clock;
pub mod error;
pub mod reporting;
pub mod service;

pub use clock::*;
pub use error::*;
pub use reporting::*;
pub use service::*;

pub use crate::storage::{BranchFilter, ClientFilter, LoanFilter, RepaymentFilter};
