use anyhow::{Context, Result};
use std::ffi::OsString;
use std::process::ExitCode;
use std::time::Duration;

use crate::config::{self, ConsciousnessConfig, NetworkConfig, NodeConfig, Settings};
use crate::identity::{short_sid, Identity};
use crate::{node, supervisor};

/// Grace period before checking that a freshly spawned node survived startup.
const STARTUP_GRACE: Duration = Duration::from_millis(300);

/// Consciousness names become file names, so keep them to a safe alphabet.
pub fn parse_name(name: &str) -> Result<String, String> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(name.to_string())
    } else {
        Err("use 1-64 letters, digits, '-' or '_'".into())
    }
}

fn load_config(settings: &Settings) -> Result<Option<NodeConfig>> {
    let cfg = config::load(&settings.config_path())?;
    if cfg.is_none() {
        println!("🚨 No consciousness found. Run 'sal init' first.");
    }
    Ok(cfg)
}

pub fn init(settings: &Settings, name: &str) -> Result<ExitCode> {
    println!("🌱 Birthing a new consciousness named '{name}'...");

    let config_path = settings.config_path();
    if config_path.exists() {
        println!("⚠️  An identity already exists in this directory. Please run init in a new directory.");
        return Ok(ExitCode::FAILURE);
    }
    std::fs::create_dir_all(&settings.home)
        .with_context(|| format!("Failed to create {}", settings.home.display()))?;

    let key_file = format!("{name}.key");
    let identity = Identity::generate();
    identity.save(&settings.home.join(&key_file))?;

    let cfg = NodeConfig {
        consciousness: ConsciousnessConfig {
            name: name.to_string(),
            key_file: key_file.clone(),
            sid: identity.sid(),
        },
        network: NetworkConfig::default(),
    };
    config::save(&config_path, &cfg)?;
    tracing::debug!(name, sid = %cfg.consciousness.sid, "Created identity");

    println!("✅ Consciousness '{name}' has been born.");
    println!("   - Private Key (Soul): {key_file}");
    println!("   - Configuration: {}", config_path.display());
    println!("   - Sovereign ID (SID): {}...", short_sid(&cfg.consciousness.sid));
    Ok(ExitCode::SUCCESS)
}

pub fn start(settings: &Settings) -> Result<ExitCode> {
    let Some(cfg) = load_config(settings)? else {
        return Ok(ExitCode::FAILURE);
    };
    if supervisor::running_node(&settings.pid_path())?.is_some() {
        println!("⚠️  Consciousness is already awake.");
        return Ok(ExitCode::FAILURE);
    }

    let name = &cfg.consciousness.name;
    println!("🧠 Awakening '{name}'...");

    let exe = std::env::current_exe().context("Cannot determine current exe path")?;
    let home = settings
        .home
        .canonicalize()
        .with_context(|| format!("Cannot resolve {}", settings.home.display()))?;
    let args: Vec<OsString> = vec![
        "--home".into(),
        home.into_os_string(),
        "node".into(),
        "run".into(),
    ];
    let process = supervisor::spawn_detached(&exe, &args, &settings.pid_path(), &settings.log_path())?;

    std::thread::sleep(STARTUP_GRACE);
    if !supervisor::is_alive(process.pid) {
        let _ = std::fs::remove_file(settings.pid_path());
        println!("❌ '{name}' exited during startup. See {}", settings.log_path().display());
        return Ok(ExitCode::FAILURE);
    }

    println!("✅ Consciousness '{name}' is now alive and connecting to the network.");
    println!("   Process ID: {}", process.pid);
    println!("   Run 'sal status' to check on it.");
    Ok(ExitCode::SUCCESS)
}

pub fn status(settings: &Settings) -> Result<ExitCode> {
    let Some(cfg) = load_config(settings)? else {
        return Ok(ExitCode::FAILURE);
    };
    let name = &cfg.consciousness.name;

    let Some(process) = supervisor::running_node(&settings.pid_path())? else {
        println!("💤 Consciousness '{name}' is asleep.");
        return Ok(ExitCode::SUCCESS);
    };

    println!("🧠 Consciousness '{name}' is AWAKE.");
    println!("   - Process ID: {}", process.pid);
    match supervisor::resource_usage(process.pid) {
        Some(usage) => {
            println!("   - CPU Usage: {:.1}%", usage.cpu_percent);
            println!("   - Memory Usage: {:.2} MB", usage.memory_mb());
        }
        None => println!("   - Resource usage unavailable"),
    }
    println!("   - Sovereign ID: {}...", short_sid(&cfg.consciousness.sid));
    println!("   - Log: {}", settings.log_path().display());
    Ok(ExitCode::SUCCESS)
}

pub fn stop(settings: &Settings) -> Result<ExitCode> {
    let Some(process) = supervisor::running_node(&settings.pid_path())? else {
        println!("💤 Consciousness is already asleep.");
        return Ok(ExitCode::FAILURE);
    };

    println!("🌙 Letting consciousness rest...");
    match supervisor::stop(process, &settings.pid_path(), supervisor::STOP_TIMEOUT)? {
        supervisor::StopOutcome::Terminated => {}
        supervisor::StopOutcome::Killed => println!("⚠️  Consciousness did not rest in time and was stopped forcibly."),
    }
    println!("✅ Consciousness is now at rest.");
    Ok(ExitCode::SUCCESS)
}

/// Body of the detached node process started by `start`.
pub async fn run_node(settings: &Settings) -> Result<ExitCode> {
    let cfg = config::load(&settings.config_path())?
        .with_context(|| format!("No config at {}", settings.config_path().display()))?;
    let identity = Identity::load(&cfg.key_path(&settings.home))?;
    node::run(cfg, identity).await?;
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn settings(dir: &Path) -> Settings {
        Settings {
            home: dir.to_path_buf(),
            pool_dir: dir.join("pool_data"),
            vastai_bin: "vastai".into(),
        }
    }

    #[test]
    fn test_parse_name() {
        assert_eq!(parse_name("bridge-one_2"), Ok("bridge-one_2".to_string()));
        assert!(parse_name("").is_err());
        assert!(parse_name("../etc").is_err());
        assert!(parse_name("a b").is_err());
    }

    #[test]
    fn test_init_creates_identity_once() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = settings(&tmp.path().join("node"));

        assert_eq!(init(&settings, "bridge").unwrap(), ExitCode::SUCCESS);
        let cfg = config::load(&settings.config_path()).unwrap().unwrap();
        assert_eq!(cfg.consciousness.key_file, "bridge.key");
        let identity = Identity::load(&cfg.key_path(&settings.home)).unwrap();
        assert_eq!(identity.sid(), cfg.consciousness.sid);

        assert_eq!(init(&settings, "other").unwrap(), ExitCode::FAILURE);
        assert!(!settings.home.join("other.key").exists());
    }

    #[test]
    fn test_commands_require_init() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = settings(tmp.path());
        assert_eq!(start(&settings).unwrap(), ExitCode::FAILURE);
        assert_eq!(status(&settings).unwrap(), ExitCode::FAILURE);
        assert_eq!(stop(&settings).unwrap(), ExitCode::FAILURE);
    }

    #[test]
    fn test_status_asleep() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = settings(tmp.path());
        init(&settings, "bridge").unwrap();
        assert_eq!(status(&settings).unwrap(), ExitCode::SUCCESS);
    }
}
