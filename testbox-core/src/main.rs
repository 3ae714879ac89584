//! Testbox - Ephemeral Isolated Test Sandboxes
//!
//! Small front end over `testbox_core`: prints usage and version, and runs a
//! self-check that walks one sandbox through its whole lifecycle.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use testbox_core::{
    init, Config, EngineRegistry, EnvironmentConfig, IsolationManager, PackageCache,
};
use tracing::{info, warn};

fn print_help() {
    println!("testbox - Ephemeral isolated test sandboxes v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("USAGE:");
    println!("  testbox [OPTIONS] [COMMAND]");
    println!();
    println!("OPTIONS:");
    println!("  -h, --help            Print this help message");
    println!("  -v, --version         Print version information");
    println!("  -c, --config <FILE>   Load configuration from a JSON file");
    println!();
    println!("COMMANDS:");
    println!("  self-check            Create, activate and tear down a basic sandbox");
    println!();
    println!("ENVIRONMENT:");
    println!("  TESTBOX_LOG           Log filter (default: info)");
    println!("  TESTBOX_BASE_DIR      Root directory for sandboxes");
    println!("  TESTBOX_CACHE_DIR     Package artifact cache directory");
}

/// Load config from `path` when given, else from defaults and environment.
fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => {
            Config::from_file(&path).with_context(|| format!("cannot load config {:?}", path))?
        }
        None => Config::from_env().context("cannot load config from environment")?,
    };
    Ok(config)
}

async fn self_check(config: Config) -> Result<()> {
    let registry = Arc::new(EngineRegistry::with_builtin_engines()?);
    let order = registry.get_load_order()?;
    info!(?order, "Engine load order");

    let manager = IsolationManager::new(registry, &config);
    let health = manager.health_check().await;
    info!(healthy = health.healthy, engines = health.engines.len(), "Health check");

    let env = manager
        .create_environment(Some("basic"), EnvironmentConfig::default())
        .await?;
    env.activate().await?;
    info!(env_id = %env.id(), path = ?env.path(), status = %env.status(), "Sandbox ready");
    let port = env.allocate_port()?;
    info!(env_id = %env.id(), port, "Allocated port");
    env.release_port(port);
    manager.cleanup_environment(env.id(), false).await?;

    let cache = PackageCache::open(config.cache.clone())?;
    let stats = cache.stats();
    info!(
        entries = stats.entries,
        total_bytes = stats.total_bytes,
        root = ?cache.root(),
        "Package cache"
    );

    let report = manager.shutdown().await;
    if !report.failed.is_empty() {
        for (env_id, error) in &report.failed {
            warn!(env_id = %env_id, error = %error, "Cleanup failed at shutdown");
        }
        bail!("{} environment(s) failed to clean up", report.failed.len());
    }

    println!("self-check passed");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let mut config_path = None;
    let mut command = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(());
            }
            "-v" | "--version" => {
                println!("testbox {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "-c" | "--config" => match args.next() {
                Some(path) => config_path = Some(PathBuf::from(path)),
                None => {
                    eprintln!("error: '{}' needs a file argument", arg);
                    std::process::exit(1);
                }
            },
            "self-check" if command.is_none() => command = Some("self-check"),
            _ => {
                eprintln!("error: unrecognized argument '{}'", arg);
                eprintln!("Run 'testbox --help' for usage information.");
                std::process::exit(1);
            }
        }
    }

    init();
    let config = load_config(config_path)?;

    match command {
        Some("self-check") => self_check(config).await,
        _ => {
            info!("Nothing to do");
            info!("Run 'testbox --help' for usage information");
            Ok(())
        }
    }
}
