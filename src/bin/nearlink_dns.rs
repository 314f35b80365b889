use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use nearlink::config::{NearLinkConfig, default_config_path, write_default_config};
use nearlink::server::NearLinkDaemon;
use nearlink::telemetry::init_tracing;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "nearlink-dns",
    version,
    about = "NearLink authoritative DNS daemon",
    long_about = None
)]
struct Args {
    /// Override path to the runtime config (nearlink.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Increase logging verbosity
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,

    /// Validate the configuration, print a health report and exit
    #[arg(long, action = ArgAction::SetTrue)]
    check: bool,

    /// Write the default configuration template and exit
    #[arg(long, action = ArgAction::SetTrue)]
    write_default_config: bool,

    /// Overwrite an existing file with --write-default-config
    #[arg(long, action = ArgAction::SetTrue, requires = "write_default_config")]
    force: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = resolve_config_path(args.config.as_ref())?;

    if args.write_default_config {
        let outcome = write_default_config(&config_path, args.force)?;
        println!("{:?}: {}", outcome.action, outcome.path.display());
        return Ok(());
    }

    let config = load_or_create(&config_path)?;
    init_tracing(args.verbose, &config.logging)?;

    if args.check {
        print_health(&config, &config_path);
        return Ok(());
    }

    for issue in config.health_report().issues {
        warn!(issue = %issue, "Configuration warning");
    }

    let daemon = NearLinkDaemon::new(config)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    info!(config = %config_path.display(), "Starting NearLink daemon");
    runtime.block_on(daemon.run())
}

fn resolve_config_path(override_path: Option<&PathBuf>) -> Result<PathBuf> {
    match override_path {
        Some(path) => Ok(path.clone()),
        None => default_config_path(),
    }
}

fn load_or_create(path: &Path) -> Result<NearLinkConfig> {
    if !path.exists() {
        eprintln!(
            "NearLink config missing at {}. Writing defaults.",
            path.display()
        );
        write_default_config(path, false)?;
    }
    NearLinkConfig::load_config_file(path)
}

fn print_health(config: &NearLinkConfig, path: &Path) {
    let report = config.health_report();
    println!("config          : {}", path.display());
    println!("version         : {}", report.version);
    println!("dns_listen      : {}", report.dns_listen);
    println!(
        "doh_listen      : {}",
        report.doh_listen.as_deref().unwrap_or("(disabled)")
    );
    println!(
        "metrics_listen  : {}",
        report.metrics_listen.as_deref().unwrap_or("(disabled)")
    );
    println!("rpc_endpoint    : {}", report.rpc_endpoint);
    println!("contract_account: {}", report.contract_account);
    println!("nameservers     : {}", report.nameservers.join(", "));
    if report.zones.is_empty() {
        println!("zones           : (all names)");
    } else {
        println!("zones           : {}", report.zones.join(", "));
    }
    println!(
        "upstream        : {}",
        report.upstream.as_deref().unwrap_or("(none)")
    );
    if report.issues.is_empty() {
        println!("issues          : none");
    } else {
        println!("issues:");
        for issue in &report.issues {
            println!("  - {issue}");
        }
    }
}
