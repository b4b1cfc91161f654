use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default ceiling for pool-funded GPUs, $/hour.
pub const DEFAULT_MAX_PRICE: f64 = 0.30;

/// A rentable machine as listed by `vastai search offers --raw`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: u64,
    pub gpu_name: String,
    /// Total $/hour
    pub dph_total: f64,
    /// GPU memory in MB
    #[serde(default)]
    pub gpu_ram: Option<f64>,
    #[serde(default)]
    pub geolocation: Option<String>,
    #[serde(default)]
    pub public_ipaddr: Option<String>,
    #[serde(default)]
    pub reliability: Option<f64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Offer {
    pub fn gpu_ram_gb(&self) -> Option<f64> {
        self.gpu_ram.map(|mb| mb / 1024.0)
    }

    pub fn location(&self) -> &str {
        self.geolocation.as_deref().unwrap_or("Unknown")
    }

    /// Hours of runtime a budget buys on this machine.
    pub fn hours_for(&self, dollars: f64) -> f64 {
        dollars / self.dph_total
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: u64,
    #[serde(default)]
    pub actual_status: Option<String>,
    #[serde(default)]
    pub public_ipaddr: Option<String>,
    #[serde(default)]
    pub ssh_host: Option<String>,
    #[serde(default)]
    pub ssh_port: Option<u16>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Instance {
    pub fn is_running(&self) -> bool {
        self.actual_status.as_deref() == Some("running")
    }

    pub fn status(&self) -> &str {
        self.actual_status.as_deref().unwrap_or("unknown")
    }
}

/// What to launch on a rented machine.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRequest {
    pub image: String,
    pub env: Vec<(String, String)>,
    pub disk_gb: u32,
    pub onstart: Option<String>,
}

impl InstanceRequest {
    fn env_arg(&self) -> Option<String> {
        if self.env.is_empty() {
            return None;
        }
        let pairs: Vec<String> = self.env.iter().map(|(k, v)| format!("-e {k}={v}")).collect();
        Some(pairs.join(" "))
    }
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    #[serde(default)]
    new_contract: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ShowResponse {
    One(Instance),
    Many(Vec<Instance>),
}

/// Thin wrapper over the `vastai` command-line tool.
#[derive(Debug, Clone)]
pub struct VastCli {
    pub bin: String,
    pub min_inet_down: u32,
    pub min_cuda: String,
    pub min_reliability: Option<f64>,
    pub default_max_price: f64,
}

impl VastCli {
    pub fn new(bin: impl Into<String>) -> Self {
        Self {
            bin: bin.into(),
            min_inet_down: 100,
            min_cuda: "12.0".into(),
            min_reliability: None,
            default_max_price: DEFAULT_MAX_PRICE,
        }
    }

    pub fn with_min_reliability(mut self, reliability: f64) -> Self {
        self.min_reliability = Some(reliability);
        self
    }

    pub fn search_query(&self) -> String {
        let mut query = format!(
            "rentable=true cuda_vers>={} inet_down>{}",
            self.min_cuda, self.min_inet_down
        );
        if let Some(r) = self.min_reliability {
            query.push_str(&format!(" reliability>{r}"));
        }
        query
    }

    async fn run(&self, args: &[String]) -> Result<Vec<u8>> {
        tracing::debug!(bin = %self.bin, ?args, "Running marketplace CLI");
        let output = tokio::process::Command::new(&self.bin)
            .args(args)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.bin))?;
        if !output.status.success() {
            anyhow::bail!(
                "{} {} failed: {}",
                self.bin,
                args.first().map(String::as_str).unwrap_or(""),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.stdout)
    }

    async fn run_json<T: DeserializeOwned>(&self, args: &[String]) -> Result<T> {
        let stdout = self.run(args).await?;
        serde_json::from_slice(&stdout)
            .with_context(|| format!("Unexpected output from {} {}", self.bin, args.join(" ")))
    }

    /// Eligible offers, cheapest first.
    pub async fn search_offers(&self) -> Result<Vec<Offer>> {
        let args = vec![
            "search".into(),
            "offers".into(),
            self.search_query(),
            "-o".into(),
            "dph+".into(),
            "--raw".into(),
        ];
        self.run_json(&args).await
    }

    /// Cheapest offer at or under `max_price` ($/hour), or the default ceiling.
    pub async fn find_cheapest(&self, max_price: Option<f64>) -> Result<Option<Offer>> {
        let max_price = max_price.unwrap_or(self.default_max_price);
        let offers = self.search_offers().await?;
        tracing::debug!(offers = offers.len(), max_price, "Searched offers");
        Ok(cheapest_within(offers, max_price))
    }

    pub async fn create_instance(&self, offer_id: u64, req: &InstanceRequest) -> Result<u64> {
        let mut args = vec![
            "create".into(),
            "instance".into(),
            offer_id.to_string(),
            "--image".into(),
            req.image.clone(),
            "--disk".into(),
            req.disk_gb.to_string(),
        ];
        if let Some(env) = req.env_arg() {
            args.push("--env".into());
            args.push(env);
        }
        if let Some(onstart) = &req.onstart {
            args.push("--onstart-cmd".into());
            args.push(onstart.clone());
        }
        args.push("--raw".into());

        let resp: CreateResponse = self.run_json(&args).await?;
        resp.new_contract
            .ok_or_else(|| anyhow::anyhow!("Marketplace did not return an instance id"))
    }

    pub async fn show_instance(&self, instance_id: u64) -> Result<Option<Instance>> {
        let args = vec![
            "show".into(),
            "instance".into(),
            instance_id.to_string(),
            "--raw".into(),
        ];
        let stdout = self.run(&args).await?;
        parse_show_instance(&stdout)
    }

    pub async fn stop_instance(&self, instance_id: u64) -> Result<()> {
        self.run(&["stop".into(), "instance".into(), instance_id.to_string()])
            .await
            .map(|_| ())
    }

    pub async fn destroy_instance(&self, instance_id: u64) -> Result<()> {
        self.run(&["destroy".into(), "instance".into(), instance_id.to_string()])
            .await
            .map(|_| ())
    }

    /// Poll until the instance reports `running`. `None` on timeout.
    pub async fn wait_until_running(
        &self,
        instance_id: u64,
        timeout: Duration,
        poll: Duration,
    ) -> Result<Option<Instance>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.show_instance(instance_id).await {
                Ok(Some(instance)) if instance.is_running() => return Ok(Some(instance)),
                Ok(Some(instance)) => {
                    tracing::info!(instance_id, status = %instance.status(), "Waiting for instance")
                }
                Ok(None) => tracing::debug!(instance_id, "Instance not listed yet"),
                Err(e) => tracing::debug!("Instance poll failed: {e}"),
            }
            if tokio::time::Instant::now() + poll > deadline {
                return Ok(None);
            }
            tokio::time::sleep(poll).await;
        }
    }
}

/// Lowest-priced offer with `dph_total <= max_price`.
pub fn cheapest_within(offers: Vec<Offer>, max_price: f64) -> Option<Offer> {
    offers
        .into_iter()
        .filter(|o| o.dph_total <= max_price)
        .min_by(|a, b| a.dph_total.total_cmp(&b.dph_total))
}

fn parse_show_instance(stdout: &[u8]) -> Result<Option<Instance>> {
    let resp: ShowResponse =
        serde_json::from_slice(stdout).context("Unexpected output from show instance")?;
    Ok(match resp {
        ShowResponse::One(instance) => Some(instance),
        ShowResponse::Many(instances) => instances.into_iter().next(),
    })
}
