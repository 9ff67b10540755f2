mod branch;
mod client;
mod ledger;
mod loan;
mod money;
mod repayment;

pub use branch::*;
pub use client::*;
pub use ledger::*;
pub use loan::*;
pub use money::*;
pub use repayment::*;
