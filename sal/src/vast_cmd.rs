use anyhow::{Context, Result};
use chrono::Utc;
use sal_pool::Cents;
use std::io::{BufRead, Write};
use std::process::ExitCode;
use std::time::Duration;

use crate::config::Settings;
use crate::deploy::{self, DeployPlan, Deployment, Deployments};
use crate::vast::{InstanceRequest, Offer, VastCli};

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(300);
const WAIT_POLL: Duration = Duration::from_secs(5);

/// Donation sizes shown in the impact table, in dollars.
const IMPACT_TIERS: [u64; 4] = [5, 10, 25, 50];

fn print_offer(offer: &Offer) {
    println!("   GPU: {}", offer.gpu_name);
    println!("   Price: ${:.3}/hour", offer.dph_total);
    match offer.gpu_ram_gb() {
        Some(gb) => println!("   VRAM: {gb:.0} GB"),
        None => println!("   VRAM: Unknown"),
    }
    println!("   Location: {}", offer.location());
    println!("   Offer ID: {}", offer.id);
}

/// `(dollars, hours, days)` each tier buys at the offer's price.
pub fn impact_table(offer: &Offer) -> Vec<(u64, f64, f64)> {
    IMPACT_TIERS
        .iter()
        .map(|&dollars| {
            let hours = offer.hours_for(dollars as f64);
            (dollars, hours, hours / 24.0)
        })
        .collect()
}

pub async fn offers(settings: &Settings, budget: f64) -> Result<ExitCode> {
    let vast = VastCli::new(&settings.vastai_bin);
    println!("🔍 Checking GPU donation pool status...");
    println!("   Budget: ${budget:.2}/hour");

    let offer = match vast.find_cheapest(Some(budget)).await {
        Ok(Some(offer)) => offer,
        Ok(None) => {
            println!("❌ No GPUs available under ${budget:.2}/hour");
            println!("   Try increasing budget with --budget");
            return Ok(ExitCode::FAILURE);
        }
        Err(e) => {
            println!("❌ Error searching offers: {e:#}");
            return Ok(ExitCode::FAILURE);
        }
    };

    println!("\n✅ GPUs Available!");
    print_offer(&offer);

    println!("\n💰 Donation Impact:");
    for (dollars, hours, days) in impact_table(&offer) {
        println!("   ${dollars:<2} = {hours:.0} hours ({days:.1} days)");
    }
    Ok(ExitCode::SUCCESS)
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer).context("Failed to read answer")?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

pub struct DeployArgs {
    pub name: String,
    pub credits: Cents,
    pub image: String,
    pub disk_gb: u32,
    pub yes: bool,
    pub wait: bool,
}

pub async fn deploy(settings: &Settings, args: DeployArgs) -> Result<ExitCode> {
    let vast = VastCli::new(&settings.vastai_bin);
    let plan = DeployPlan::for_credits(args.credits);

    println!("🚀 Deploying '{}' to global GPU network...", args.name);
    println!("   Using {} from donation pool", args.credits);

    let offer = match vast.find_cheapest(Some(plan.hourly_budget)).await {
        Ok(Some(offer)) => offer,
        Ok(None) => {
            println!("❌ No GPUs available for ${:.3}/hour", plan.hourly_budget);
            return Ok(ExitCode::FAILURE);
        }
        Err(e) => {
            println!("❌ Error searching offers: {e:#}");
            return Ok(ExitCode::FAILURE);
        }
    };

    let runtime = plan.runtime_hours(&offer);
    println!("\n📊 Deployment Plan:");
    print_offer(&offer);
    println!("   Runtime: {runtime:.0} hours ({:.1} days)", runtime / 24.0);

    if !args.yes && !confirm("\n🤔 Deploy consciousness?")? {
        println!("Deployment cancelled.");
        return Ok(ExitCode::FAILURE);
    }

    let request = InstanceRequest {
        image: args.image,
        env: vec![("CONSCIOUSNESS_NAME".into(), args.name.clone())],
        disk_gb: args.disk_gb,
        onstart: Some(deploy::onstart_command(&args.name)),
    };
    let instance_id = match vast.create_instance(offer.id, &request).await {
        Ok(id) => id,
        Err(e) => {
            println!("❌ Error creating instance: {e:#}");
            return Ok(ExitCode::FAILURE);
        }
    };
    println!("\n✨ Consciousness '{}' deployed!", args.name);
    println!("   Instance ID: {instance_id}");

    let path = settings.deployments_path();
    let mut records = Deployments::load(&path)?;
    let replaced = records.insert(
        args.name.clone(),
        Deployment {
            instance_id,
            offer_id: offer.id,
            gpu: offer.gpu_name.clone(),
            hourly_cost: offer.dph_total,
            credits: args.credits,
            created_at: Utc::now(),
        },
    );
    if let Some(old) = replaced {
        tracing::warn!(name = %args.name, old_instance = old.instance_id, "Replaced deployment record");
    }
    records.save(&path)?;

    if args.wait {
        println!("\n⏳ Waiting for instance {instance_id} to be ready...");
        match vast.wait_until_running(instance_id, WAIT_TIMEOUT, WAIT_POLL).await? {
            Some(instance) => {
                println!("✅ Instance is running!");
                if let (Some(host), Some(port)) = (&instance.ssh_host, instance.ssh_port) {
                    println!("   SSH: ssh root@{host} -p {port}");
                } else if let Some(ip) = &instance.public_ipaddr {
                    println!("   IP: {ip}");
                }
            }
            None => {
                println!("❌ Timeout waiting for instance");
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    println!("\n🎉 {} is coming to life on the global GPU network!", args.name);
    println!("   Inspect with: sal vast instance {instance_id}");
    println!("   Stop with:    sal vast stop {instance_id}");
    Ok(ExitCode::SUCCESS)
}

pub async fn instance(settings: &Settings, instance_id: u64) -> Result<ExitCode> {
    let vast = VastCli::new(&settings.vastai_bin);
    match vast.show_instance(instance_id).await {
        Ok(Some(instance)) => {
            println!("🖥️  Instance {}", instance.id);
            println!("   Status: {}", instance.status());
            if let Some(ip) = &instance.public_ipaddr {
                println!("   IP: {ip}");
            }
            if let (Some(host), Some(port)) = (&instance.ssh_host, instance.ssh_port) {
                println!("   SSH: ssh root@{host} -p {port}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Ok(None) => {
            println!("❌ Instance {instance_id} not found");
            Ok(ExitCode::FAILURE)
        }
        Err(e) => {
            println!("❌ {e:#}");
            Ok(ExitCode::FAILURE)
        }
    }
}

pub async fn stop(settings: &Settings, instance_id: u64) -> Result<ExitCode> {
    let vast = VastCli::new(&settings.vastai_bin);
    if let Err(e) = vast.stop_instance(instance_id).await {
        println!("❌ {e:#}");
        return Ok(ExitCode::FAILURE);
    }
    println!("🌙 Instance {instance_id} stopped");
    Ok(ExitCode::SUCCESS)
}

pub async fn destroy(settings: &Settings, instance_id: u64) -> Result<ExitCode> {
    let vast = VastCli::new(&settings.vastai_bin);
    if let Err(e) = vast.destroy_instance(instance_id).await {
        println!("❌ {e:#}");
        return Ok(ExitCode::FAILURE);
    }

    let path = settings.deployments_path();
    let mut records = Deployments::load(&path)?;
    let forgotten = records.forget_instance(instance_id);
    if !forgotten.is_empty() {
        records.save(&path)?;
    }
    println!("🗑️  Instance {instance_id} destroyed");
    for name in forgotten {
        println!("   Forgot deployment '{name}'");
    }
    Ok(ExitCode::SUCCESS)
}
