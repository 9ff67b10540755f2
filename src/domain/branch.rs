use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type BranchId = Uuid;

/// A physical branch office. Clients and loans are booked against exactly one branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub id: BranchId,
    /// Unique across all branches
    pub name: String,
    pub district: String,
    pub region: String,
    pub created_at: DateTime<Utc>,
}

impl Branch {
    pub fn new(name: String, district: String, region: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            district,
            region,
            created_at: Utc::now(),
        }
    }
}
