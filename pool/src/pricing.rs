use serde::{Deserialize, Serialize};

use crate::models::Platform;
use crate::money::Cents;

/// Price of one GPU hour in dollars. Always finite and non-negative.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HourlyRate(f64);

impl HourlyRate {
    pub fn new(dollars_per_hour: f64) -> Option<Self> {
        (dollars_per_hour.is_finite() && dollars_per_hour > 0.0).then_some(Self(dollars_per_hour))
    }

    pub fn from_cents(cents: Cents) -> Self {
        Self(cents.as_dollars())
    }

    pub fn dollars_per_hour(self) -> f64 {
        self.0
    }

    /// Cost of `hours` at this rate, rounded half-up to the cent.
    pub fn cost(self, hours: f64) -> Option<Cents> {
        Cents::from_dollars_f64(hours * self.0)
    }

    /// Hours of compute an amount buys at this rate.
    pub fn hours_for(self, amount: Cents) -> f64 {
        if self.0 == 0.0 {
            return f64::INFINITY;
        }
        amount.as_dollars() / self.0
    }
}

/// Flat per-platform price table used for pool allocations.
///
/// Vast.ai is the cheap tier; every other platform is billed at the
/// general rate. These prices do not follow the marketplace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceTable {
    pub vast: Cents,
    pub other: Cents,
}

impl Default for PriceTable {
    fn default() -> Self {
        Self {
            vast: Cents(20),
            other: Cents(50),
        }
    }
}

impl PriceTable {
    pub fn rate(&self, platform: Platform) -> HourlyRate {
        match platform {
            Platform::Vast => HourlyRate::from_cents(self.vast),
            Platform::Aws | Platform::Gcp | Platform::Azure => HourlyRate::from_cents(self.other),
        }
    }

    /// Estimated hours a donation to `platform` provides.
    pub fn impact_hours(&self, platform: Platform, amount: Cents) -> f64 {
        self.rate(platform).hours_for(amount)
    }
}
