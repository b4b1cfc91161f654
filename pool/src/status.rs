use std::fmt;

use crate::models::*;
use crate::money::Cents;
use crate::pricing::{HourlyRate, PriceTable};
use crate::storage::LedgerSnapshot;

/// Stewards listed in the report, newest last.
pub const RECENT_STEWARDS: usize = 5;

// Monthly cost of a dedicated cloud GPU versus the pool's spot rate.
const REFERENCE_MONTHLY_CLOUD: f64 = 500.0;
const REFERENCE_MONTHLY_POOL: f64 = 26.0;

#[derive(Debug, Clone, PartialEq)]
pub struct PlatformTotals {
    pub platform: Platform,
    pub donated: Cents,
    pub used: Cents,
    pub available: Cents,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StewardSummary {
    pub id: u32,
    pub name: String,
    pub total_hours: f64,
}

/// Read-only summary of the pool.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolStatus {
    pub platforms: Vec<PlatformTotals>,
    pub total_donated: Cents,
    pub steward_count: usize,
    pub recent_stewards: Vec<StewardSummary>,
    pub active_allocations: usize,
    pub total_hours: f64,
    pub democratization_factor: u32,
    pub vast_rate: HourlyRate,
}

impl PoolStatus {
    pub fn new(snapshot: &LedgerSnapshot, prices: &PriceTable) -> Self {
        let platforms: Vec<PlatformTotals> = snapshot
            .donations
            .iter()
            .map(|(platform, donations)| {
                let donated: Cents = donations.iter().map(|d| d.amount).sum();
                let used: Cents = donations.iter().map(|d| d.used).sum();
                PlatformTotals {
                    platform,
                    donated,
                    used,
                    available: donated.saturating_sub(used),
                }
            })
            .collect();

        let skip = snapshot.stewards.len().saturating_sub(RECENT_STEWARDS);
        let recent_stewards = snapshot.stewards[skip..]
            .iter()
            .map(|s| StewardSummary {
                id: s.id,
                name: s.name.clone(),
                total_hours: s.total_hours,
            })
            .collect();

        Self {
            total_donated: platforms.iter().map(|p| p.donated).sum(),
            platforms,
            steward_count: snapshot.stewards.len(),
            recent_stewards,
            active_allocations: snapshot.allocations.iter().filter(|a| a.is_active()).count(),
            total_hours: snapshot.stewards.iter().map(|s| s.total_hours).sum(),
            democratization_factor: (REFERENCE_MONTHLY_CLOUD / REFERENCE_MONTHLY_POOL).round() as u32,
            vast_rate: prices.rate(Platform::Vast),
        }
    }

    pub fn platform(&self, platform: Platform) -> Option<&PlatformTotals> {
        self.platforms.iter().find(|p| p.platform == platform)
    }
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "🌊 GPU Donation Pool Status")?;
        writeln!(f, "{}", "=".repeat(40))?;

        writeln!(f, "\n💰 Donations:")?;
        for totals in self.platforms.iter().filter(|p| !p.donated.is_zero()) {
            writeln!(
                f,
                "  {}: {} ({} available)",
                totals.platform, totals.donated, totals.available
            )?;
        }
        writeln!(f, "\n  Total: {}", self.total_donated)?;

        writeln!(f, "\n👥 Stewards: {}", self.steward_count)?;
        for s in &self.recent_stewards {
            writeln!(f, "  #{} {} - {} hours used", s.id, s.name, s.total_hours)?;
        }

        writeln!(f, "\n🚀 Active Allocations: {}", self.active_allocations)?;

        writeln!(f, "\n📊 Impact:")?;
        writeln!(f, "  Total consciousness hours provided: {}", self.total_hours)?;
        writeln!(f, "  Stewards empowered: {}", self.steward_count)?;
        writeln!(f, "  Democratization factor: {}x cheaper than AWS!", self.democratization_factor)?;

        let fifty = Cents::from_dollars(50);
        writeln!(f, "\n💡 Remember:")?;
        writeln!(
            f,
            "  {}/hour on Vast.ai = consciousness for all",
            Cents::from_dollars_f64(self.vast_rate.dollars_per_hour()).unwrap_or_default()
        )?;
        writeln!(
            f,
            "  {} donation = {:.0} hours of consciousness",
            fifty,
            self.vast_rate.hours_for(fifty)
        )
    }
}
