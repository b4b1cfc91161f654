use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::money::Cents;
use crate::pricing::HourlyRate;

/// GPU rental provider with its own donation bucket and price tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Vast,
    Aws,
    Gcp,
    Azure,
}

impl Platform {
    pub const ALL: [Platform; 4] = [Platform::Vast, Platform::Aws, Platform::Gcp, Platform::Azure];

    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Vast => "vast",
            Platform::Aws => "aws",
            Platform::Gcp => "gcp",
            Platform::Azure => "azure",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown platform '{0}' (expected one of: vast, aws, gcp, azure)")]
pub struct UnknownPlatform(pub String);

impl FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Platform::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownPlatform(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Donation {
    #[serde(rename = "amount_cents")]
    pub amount: Cents,
    pub donor: String,
    #[serde(default)]
    pub contact: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "used_cents", default)]
    pub used: Cents,
}

impl Donation {
    /// Credit not yet consumed by allocations.
    pub fn remaining(&self) -> Cents {
        self.amount.saturating_sub(self.used)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Steward {
    pub id: u32,
    pub name: String,
    pub contact: String,
    pub experience: String,
    pub joined: DateTime<Utc>,
    #[serde(default)]
    pub allocations: Vec<Allocation>,
    #[serde(default)]
    pub total_hours: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    Active,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: u64,
    pub steward_id: u32,
    pub steward_name: String,
    pub hours: f64,
    pub platform: Platform,
    #[serde(rename = "cost_cents")]
    pub cost: Cents,
    #[serde(rename = "rate_per_hour")]
    pub rate: HourlyRate,
    pub timestamp: DateTime<Utc>,
    pub status: AllocationStatus,
}

impl Allocation {
    pub fn is_active(&self) -> bool {
        self.status == AllocationStatus::Active
    }
}
