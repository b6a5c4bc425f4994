use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use sshgate::cli::{Cli, Command};
use sshgate::config;

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Command::Init { output, bind_addr }) => {
            if output.exists() {
                anyhow::bail!("refusing to overwrite {}", output.display());
            }
            std::fs::write(output, config::sample_config(bind_addr))?;
            eprintln!("Configuration written to: {}", output.display());
            eprintln!();
            eprintln!("Set security.aes_key (or export SSHGATE_AES_KEY), then start with:");
            eprintln!("  sshgate -c {}", output.display());
            return Ok(());
        }
        Some(Command::CheckConfig) => {
            let cfg = config::load_config(&cli.config)?;
            println!("Configuration is valid.");
            println!("  Bind: {}", cfg.server.bind_addr);
            println!("  Store: {} ({})", cfg.store.driver, cfg.store.url.display());
            return Ok(());
        }
        Some(Command::HealthCheck { addr, timeout }) => {
            use std::net::TcpStream;
            use std::time::Duration;

            let parsed = addr.parse().unwrap_or_else(|_| {
                eprintln!("Invalid address: {addr}");
                std::process::exit(1);
            });
            match TcpStream::connect_timeout(&parsed, Duration::from_secs(*timeout)) {
                Ok(_) => {
                    println!("OK: {addr} is reachable");
                    return Ok(());
                }
                Err(e) => {
                    eprintln!("FAIL: {addr} is not reachable: {e}");
                    std::process::exit(1);
                }
            }
        }
        None => {}
    }

    let app_config = config::load_config(&cli.config)?;

    let log_level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| app_config.logging.level.clone());
    sshgate::logging::setup_logging(&log_level, app_config.logging.format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %app_config.server.bind_addr,
        demo = app_config.server.demo,
        "Starting sshgate"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        if let Err(e) = sshgate::server::run(app_config).await {
            error!(error = %format!("{e:#}"), "Server error");
            std::process::exit(1);
        }
    });

    Ok(())
}
