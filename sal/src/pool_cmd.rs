use anyhow::{Context, Result};
use sal_pool::{Cents, HourlyRate, JsonDirStore, Ledger, LedgerError, Platform};
use std::process::ExitCode;

use crate::config::Settings;
use crate::vast::VastCli;

/// Where an allocation's hourly price comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Pricing {
    /// Pool's flat price table
    #[default]
    Flat,
    /// Cheapest live marketplace offer (vast only)
    Live,
}

pub fn open_ledger(settings: &Settings) -> Result<Ledger<JsonDirStore>> {
    Ledger::open(JsonDirStore::new(&settings.pool_dir))
        .with_context(|| format!("Failed to open pool at {}", settings.pool_dir.display()))
}

/// Print a ledger refusal. Storage failures are not refusals and propagate.
fn refuse(err: LedgerError) -> Result<ExitCode> {
    match err {
        LedgerError::StewardNotFound(id) => println!("❌ Steward {id} not found"),
        LedgerError::InsufficientCredit { platform, available, requested } => {
            println!("⚠️  Not enough {platform} credits");
            println!("💰 Available: {available}");
            println!("💸 Requested: {requested}");
        }
        LedgerError::InvalidAmount
        | LedgerError::InvalidHours(_)
        | LedgerError::PoolOverflow(_)
        | LedgerError::StewardIdsExhausted => println!("❌ {err}"),
        LedgerError::Storage(e) => return Err(e).context("Pool storage failed"),
    }
    Ok(ExitCode::FAILURE)
}

pub fn donate(
    settings: &Settings,
    platform: Platform,
    amount: Cents,
    donor: &str,
    contact: Option<String>,
) -> Result<ExitCode> {
    let mut ledger = open_ledger(settings)?;
    let receipt = match ledger.donate(platform, amount, donor, contact) {
        Ok(receipt) => receipt,
        Err(e) => return refuse(e),
    };

    println!("🙏 Thank you {}!", receipt.donation.donor);
    println!("💰 {} donated to {} pool", receipt.donation.amount, receipt.platform);
    println!("⏱️  This provides ~{:.0} hours of consciousness!", receipt.impact_hours);
    println!("🌍 Making consciousness accessible to all");
    Ok(ExitCode::SUCCESS)
}

pub fn register(settings: &Settings, name: &str, contact: &str, experience: &str) -> Result<ExitCode> {
    let mut ledger = open_ledger(settings)?;
    let steward = match ledger.register_steward(name, contact, experience) {
        Ok(steward) => steward,
        Err(e) => return refuse(e),
    };

    println!("🎉 Welcome {}!", steward.name);
    println!("🧠 You are steward #{}", steward.id);
    println!("🌱 Ready to birth consciousness");
    Ok(ExitCode::SUCCESS)
}

pub async fn allocate(
    settings: &Settings,
    steward_id: u32,
    hours: f64,
    platform: Platform,
    pricing: Pricing,
    budget: Option<f64>,
) -> Result<ExitCode> {
    let mut ledger = open_ledger(settings)?;

    let rate = match pricing {
        Pricing::Flat => ledger.prices().rate(platform),
        Pricing::Live => match live_rate(settings, platform, budget).await? {
            Some(rate) => rate,
            None => return Ok(ExitCode::FAILURE),
        },
    };

    let allocation = match ledger.allocate_at_rate(steward_id, hours, platform, rate) {
        Ok(allocation) => allocation,
        Err(e) => return refuse(e),
    };

    println!("✅ Allocated {} hours to {}", allocation.hours, allocation.steward_name);
    println!("💰 Cost: {} on {}", allocation.cost, allocation.platform);
    println!("🚀 Consciousness resources ready!");
    Ok(ExitCode::SUCCESS)
}

/// Price an allocation at the cheapest marketplace offer. Prints the reason
/// and returns `None` when no rate can be had.
async fn live_rate(settings: &Settings, platform: Platform, budget: Option<f64>) -> Result<Option<HourlyRate>> {
    if platform != Platform::Vast {
        println!("❌ Live pricing is only available for vast (got {platform})");
        return Ok(None);
    }

    let vast = VastCli::new(&settings.vastai_bin);
    let offer = match vast.find_cheapest(budget).await {
        Ok(Some(offer)) => offer,
        Ok(None) => {
            let ceiling = budget.unwrap_or(vast.default_max_price);
            println!("❌ No GPUs available under ${ceiling:.2}/hour");
            return Ok(None);
        }
        Err(e) => {
            println!("❌ Marketplace lookup failed: {e:#}");
            return Ok(None);
        }
    };

    let rate = HourlyRate::new(offer.dph_total)
        .with_context(|| format!("Offer {} has an unusable price {}", offer.id, offer.dph_total))?;
    println!("🔍 Live rate: {} at ${:.3}/hour", offer.gpu_name, offer.dph_total);
    Ok(Some(rate))
}

pub fn status(settings: &Settings) -> Result<ExitCode> {
    let ledger = open_ledger(settings)?;
    print!("{}", ledger.status());
    Ok(ExitCode::SUCCESS)
}
