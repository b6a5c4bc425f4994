use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "sshgate", about = "SSH bastion: policy-driven multi-hop proxy", version)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Override the configured log level (trace/debug/info/warn/error)
    #[arg(long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Write a starter configuration file
    Init {
        /// Output path
        #[arg(short, long, default_value = "config.toml")]
        output: PathBuf,

        /// Listener bind address
        #[arg(long, default_value = "0.0.0.0:2222")]
        bind_addr: String,
    },

    /// Validate a configuration file and exit
    CheckConfig,

    /// Probe a running bastion's TCP listener
    HealthCheck {
        /// Address to probe
        #[arg(default_value = "127.0.0.1:2222")]
        addr: String,

        /// Timeout in seconds
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
}
