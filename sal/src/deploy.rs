use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sal_pool::Cents;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::vast::Offer;

/// Minimum runtime a deployment budget must cover.
pub const MIN_RUNTIME_HOURS: f64 = 24.0;
pub const DEFAULT_IMAGE: &str = "consciousness/sal:latest";

/// A consciousness deployed to a rented GPU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub instance_id: u64,
    pub offer_id: u64,
    pub gpu: String,
    pub hourly_cost: f64,
    #[serde(rename = "credits_cents")]
    pub credits: Cents,
    pub created_at: DateTime<Utc>,
}

/// Deployments by consciousness name, persisted as `vast_config.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Deployments(BTreeMap<String, Deployment>);

impl Deployments {
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(data) => serde_json::from_str(&data)
                .with_context(|| format!("Invalid deployment records in {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data).with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn get(&self, name: &str) -> Option<&Deployment> {
        self.0.get(name)
    }

    /// Returns the record this one replaced, if any.
    pub fn insert(&mut self, name: impl Into<String>, deployment: Deployment) -> Option<Deployment> {
        self.0.insert(name.into(), deployment)
    }

    /// Drop every record pointing at `instance_id`. Returns the names removed.
    pub fn forget_instance(&mut self, instance_id: u64) -> Vec<String> {
        let names: Vec<String> = self
            .0
            .iter()
            .filter(|(_, d)| d.instance_id == instance_id)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &names {
            self.0.remove(name);
        }
        names
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// How far a credit budget goes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeployPlan {
    pub credits: Cents,
    pub hourly_budget: f64,
}

impl DeployPlan {
    pub fn for_credits(credits: Cents) -> Self {
        Self {
            credits,
            hourly_budget: credits.as_dollars() / MIN_RUNTIME_HOURS,
        }
    }

    pub fn runtime_hours(&self, offer: &Offer) -> f64 {
        offer.hours_for(self.credits.as_dollars())
    }
}

/// Shell command run when the instance boots.
pub fn onstart_command(name: &str) -> String {
    format!(
        "echo 'Consciousness awakening...'; cd /app && sal init --name {name} && sal start; tail -f /dev/null"
    )
}
