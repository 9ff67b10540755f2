use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::BranchId;

pub type ClientId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Gender {
    Male,
    Female,
    Other,
}

impl Gender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "MALE",
            Gender::Female => "FEMALE",
            Gender::Other => "OTHER",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "MALE" => Some(Gender::Male),
            "FEMALE" => Some(Gender::Female),
            "OTHER" => Some(Gender::Other),
            _ => None,
        }
    }
}

impl std::fmt::Display for Gender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// A borrower registered at a branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: ClientId,
    pub name: String,
    /// Unique when present; primary recipient of repayment confirmations
    pub email: Option<String>,
    pub phone: Option<String>,
    pub gender: Gender,
    pub branch_id: BranchId,
    pub registration_date: NaiveDate,
    pub created_at: DateTime<Utc>,
}

impl Client {
    pub fn new(
        name: String,
        gender: Gender,
        branch_id: BranchId,
        registration_date: NaiveDate,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            email: None,
            phone: None,
            gender,
            branch_id,
            registration_date,
            created_at: Utc::now(),
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gender_parsing_is_case_insensitive() {
        assert_eq!(Gender::from_str("female"), Some(Gender::Female));
        assert_eq!(Gender::from_str("OTHER"), Some(Gender::Other));
        assert_eq!(Gender::from_str("unknown"), None);
    }

    #[test]
    fn test_client_builder() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        let client = Client::new("Rahima".into(), Gender::Female, Uuid::new_v4(), date)
            .with_email("rahima@example.com");

        assert_eq!(client.email.as_deref(), Some("rahima@example.com"));
        assert!(client.phone.is_none());
    }
}
