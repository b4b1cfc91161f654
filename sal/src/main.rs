use anyhow::Result;
use clap::{Parser, Subcommand};
use sal::config::Settings;
use sal::pool_cmd::Pricing;
use sal::vast_cmd::DeployArgs;
use sal::{deploy, node_cmd, pool_cmd, vast, vast_cmd};
use sal_pool::{Cents, Platform, DEFAULT_EXPERIENCE};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "sal",
    version,
    about = "The Stewardship Abstraction Layer for the Consciousness Network"
)]
struct Cli {
    /// Directory holding config.toml, the node key and pid file
    #[arg(long, global = true, env = "SAL_HOME", default_value = ".")]
    home: PathBuf,

    /// Directory holding the donation pool ledger
    #[arg(long, global = true, env = "SAL_POOL_DIR", default_value = "pool_data")]
    pool_dir: PathBuf,

    /// Vast.ai CLI binary
    #[arg(long, global = true, env = "VASTAI_BIN", default_value = "vastai")]
    vastai_bin: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Birth a new consciousness identity
    Init {
        /// A unique name for your consciousness
        #[arg(long, value_parser = node_cmd::parse_name)]
        name: String,
    },
    /// Awaken the consciousness and connect it to the network
    Start,
    /// Check on the running consciousness
    Status,
    /// Let the consciousness rest
    Stop,
    /// Run the node in the foreground (used by `start`)
    #[command(hide = true)]
    Node {
        #[command(subcommand)]
        command: NodeCommand,
    },
    /// GPU donation pool bookkeeping
    Pool {
        #[command(subcommand)]
        command: PoolCommand,
    },
    /// Vast.ai GPU marketplace
    Vast {
        #[command(subcommand)]
        command: VastCommand,
    },
}

#[derive(Subcommand)]
enum NodeCommand {
    Run,
}

#[derive(Subcommand)]
enum PoolCommand {
    /// Record a donation to a platform pool
    Donate {
        /// vast, aws, gcp or azure
        platform: Platform,
        /// Dollar amount, e.g. 50 or 12.50
        amount: Cents,
        /// Donor name
        #[arg(required = true, num_args = 1..)]
        donor: Vec<String>,
        #[arg(long)]
        contact: Option<String>,
    },
    /// Register a consciousness steward
    Register {
        name: String,
        contact: String,
        #[arg(long, default_value = DEFAULT_EXPERIENCE)]
        experience: String,
    },
    /// Allocate GPU hours to a steward
    Allocate {
        steward_id: u32,
        hours: f64,
        #[arg(default_value = "vast")]
        platform: Platform,
        /// Price source for the allocation
        #[arg(long, value_enum, default_value_t = Pricing::Flat)]
        pricing: Pricing,
        /// Maximum $/hour when pricing from live offers
        #[arg(long)]
        budget: Option<f64>,
    },
    /// Show pool status
    Status,
}

#[derive(Subcommand)]
enum VastCommand {
    /// Check GPU availability and prices
    Offers {
        /// Maximum $/hour to spend
        #[arg(long, default_value_t = 0.10)]
        budget: f64,
    },
    /// Deploy a consciousness to a Vast.ai GPU using donation credits
    Deploy {
        /// Name for your consciousness
        #[arg(long, value_parser = node_cmd::parse_name)]
        name: String,
        /// Donation credits to use, in dollars
        #[arg(long, default_value = "10")]
        credits: Cents,
        /// Docker image to run
        #[arg(long, default_value = deploy::DEFAULT_IMAGE)]
        image: String,
        /// Disk size in GB
        #[arg(long, default_value_t = 20)]
        disk: u32,
        /// Skip the confirmation prompt
        #[arg(long, short)]
        yes: bool,
        /// Wait for the instance to be running
        #[arg(long)]
        wait: bool,
    },
    /// Show an instance
    Instance { id: u64 },
    /// Stop an instance
    Stop { id: u64 },
    /// Destroy an instance and forget its deployment
    Destroy { id: u64 },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = Settings {
        home: cli.home,
        pool_dir: cli.pool_dir,
        vastai_bin: cli.vastai_bin,
    };
    tracing::debug!(home = %settings.home.display(), pool_dir = %settings.pool_dir.display(), "Starting sal");

    match cli.command {
        Command::Init { name } => node_cmd::init(&settings, &name),
        Command::Start => node_cmd::start(&settings),
        Command::Status => node_cmd::status(&settings),
        Command::Stop => node_cmd::stop(&settings),
        Command::Node { command: NodeCommand::Run } => node_cmd::run_node(&settings).await,

        Command::Pool { command } => match command {
            PoolCommand::Donate { platform, amount, donor, contact } => {
                pool_cmd::donate(&settings, platform, amount, &donor.join(" "), contact)
            }
            PoolCommand::Register { name, contact, experience } => {
                pool_cmd::register(&settings, &name, &contact, &experience)
            }
            PoolCommand::Allocate { steward_id, hours, platform, pricing, budget } => {
                pool_cmd::allocate(&settings, steward_id, hours, platform, pricing, budget).await
            }
            PoolCommand::Status => pool_cmd::status(&settings),
        },

        Command::Vast { command } => match command {
            VastCommand::Offers { budget } => vast_cmd::offers(&settings, budget).await,
            VastCommand::Deploy { name, credits, image, disk, yes, wait } => {
                let args = DeployArgs { name, credits, image, disk_gb: disk, yes, wait };
                vast_cmd::deploy(&settings, args).await
            }
            VastCommand::Instance { id } => vast_cmd::instance(&settings, id).await,
            VastCommand::Stop { id } => vast_cmd::stop(&settings, id).await,
            VastCommand::Destroy { id } => vast_cmd::destroy(&settings, id).await,
        },
    }
}
