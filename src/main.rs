mod cli_create;
mod cli_destroy;
mod cli_nodes;
mod cli_overlay;
mod shared;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use cli_overlay::ListFormat;
use pxrun::config::{self, Overrides, Settings};

#[derive(Parser)]
#[command(name = "pxrun", version)]
#[command(about = "pxrun - Provision LXC containers on Proxmox VE", long_about = None)]
struct Cli {
    /// Debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct CreateFlags {
    /// Container definition files; ids are allocated one file at a time,
    /// then the containers start and provision concurrently
    #[arg(value_name = "CONFIG", required = true)]
    configs: Vec<PathBuf>,

    /// Override the hostname (single definition only)
    #[arg(long)]
    hostname: Option<String>,

    /// Override the target node
    #[arg(long)]
    node: Option<String>,

    /// Override the template
    #[arg(long)]
    template: Option<String>,

    /// Override the number of CPU cores
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    cores: Option<u32>,

    /// Override memory in MB
    #[arg(long, value_name = "MB", value_parser = clap::value_parser!(u64).range(1..))]
    memory: Option<u64>,

    /// Override the root disk size in GB
    #[arg(long, value_name = "GB", value_parser = clap::value_parser!(u64).range(1..))]
    storage: Option<u64>,

    /// Override the storage pool
    #[arg(long)]
    storage_pool: Option<String>,

    /// Override the network bridge
    #[arg(long)]
    network_bridge: Option<String>,

    /// Override the address: CIDR or "dhcp"
    #[arg(long)]
    ip: Option<String>,

    /// Override the gateway
    #[arg(long)]
    gateway: Option<String>,

    /// Extra SSH public key for root (repeatable)
    #[arg(long = "ssh-key", value_name = "KEY")]
    ssh_keys: Vec<String>,

    /// Start containers after creation (default)
    #[arg(long, overrides_with = "no_start")]
    start: bool,

    /// Leave containers stopped; no provisioning step runs
    #[arg(long, overrides_with = "start")]
    no_start: bool,

    /// Run provisioning steps (default)
    #[arg(long, overrides_with = "no_provision")]
    provision: bool,

    /// Skip every provisioning step, including the Tailscale join
    #[arg(long, overrides_with = "provision")]
    no_provision: bool,

    /// Show what would be created without creating anything
    #[arg(long)]
    dry_run: bool,

    /// Overall deadline in seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Print step output
    #[arg(short, long)]
    verbose: bool,
}

impl CreateFlags {
    fn into_args(self) -> cli_create::CreateArgs {
        cli_create::CreateArgs {
            configs: self.configs,
            overrides: Overrides {
                hostname: self.hostname,
                node: self.node,
                template: self.template,
                cores: self.cores,
                memory: self.memory,
                disk: self.storage,
                storage_pool: self.storage_pool,
                network_bridge: self.network_bridge,
                ip: self.ip,
                gateway: self.gateway,
                ssh_keys: self.ssh_keys,
                skip_provisioning: self.no_provision && !self.provision,
            },
            dry_run: self.dry_run,
            no_start: self.no_start && !self.start,
            timeout: self.timeout,
            verbose: self.verbose,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create and provision containers from YAML definitions
    Create(CreateFlags),

    /// Destroy a container and its Tailscale node
    Destroy {
        /// Container id
        vmid: u32,

        /// Skip confirmation (Tailscale matches by FQDN label are still confirmed)
        #[arg(short, long)]
        force: bool,

        /// Also remove the container from backup, replication and HA jobs (default)
        #[arg(long, overrides_with = "no_purge")]
        purge: bool,

        /// Keep backup, replication and HA entries for the container
        #[arg(long, overrides_with = "purge")]
        no_purge: bool,

        /// Leave the Tailscale node in place
        #[arg(long)]
        keep_overlay: bool,
    },

    /// Show which Tailscale node a hostname would be matched to
    FindOverlay {
        hostname: String,
    },

    /// List Tailscale nodes
    ListOverlay {
        /// Only nodes currently online
        #[arg(long)]
        online_only: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = ListFormat::Table)]
        format: ListFormat,
    },

    /// Show cluster nodes ranked by load
    Nodes,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    config::load_env_files();

    let level = if cli.debug { "debug" } else { "info" };
    if let Err(e) = shared::init_logging(&config::log_dir(), "pxrun", level) {
        eprintln!("Warning: file logging unavailable: {e}");
    }

    match cli.command {
        Commands::Create(flags) => {
            let settings = Settings::from_env().context("Failed to load configuration")?;
            cli_create::create(&settings, flags.into_args()).await
        }
        Commands::Destroy {
            vmid,
            force,
            purge,
            no_purge,
            keep_overlay,
        } => {
            let settings = Settings::from_env().context("Failed to load configuration")?;
            cli_destroy::destroy(&settings, vmid, force, purge || !no_purge, keep_overlay).await
        }
        Commands::FindOverlay { hostname } => cli_overlay::find_overlay(&hostname).await,
        Commands::ListOverlay { online_only, format } => {
            cli_overlay::list_overlay(online_only, format).await
        }
        Commands::Nodes => {
            let settings = Settings::from_env().context("Failed to load configuration")?;
            cli_nodes::nodes(&settings).await
        }
    }
}
