//! `ember` command-line entry point.
//!
//! Every subcommand maps onto one [`MicroVm`] operation. Configuration starts
//! from the defaults, then `EMBER_*` environment variables, then `--set`
//! overrides and finally the typed flags.

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use ember_core::{
    CreateOutcome, DeleteOutcome, DeleteTarget, MicroVm, MicroVmConfig, PortForwardOutcome,
    RelayEnd,
};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "ember", version, about = "Manage Firecracker microVMs")]
struct Cli {
    /// Root directory for per-VM state
    #[arg(long, global = true, env = "EMBER_DATA_PATH")]
    data_path: Option<PathBuf>,

    /// Override a configuration option (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_key_value, global = true)]
    overrides: Vec<(String, String)>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create and start a microVM
    Create(CreateArgs),
    /// Delete a microVM, or all of them
    Rm {
        id: Option<String>,
        #[arg(long, conflicts_with = "id")]
        all: bool,
    },
    /// Pause a running microVM
    Pause { id: String },
    /// Resume a paused microVM
    Resume { id: String },
    /// Show the state of a microVM
    Status { id: String },
    /// Print the hypervisor's view of a microVM's configuration
    Inspect { id: String },
    /// List microVMs
    Ps,
    /// Open an SSH shell on a microVM
    Connect {
        id: String,
        /// Private key file
        #[arg(long, short = 'k')]
        key: PathBuf,
        /// Login user; defaults to the configured SSH user
        #[arg(long, short = 'u')]
        user: Option<String>,
    },
    /// Forward a host port to a microVM port
    PortForward {
        id: String,
        host_port: u16,
        dest_port: u16,
        #[arg(long)]
        remove: bool,
    },
}

#[derive(Args, Debug)]
struct CreateArgs {
    /// VM id; generated when omitted
    #[arg(long)]
    id: Option<String>,
    #[arg(long)]
    kernel: Option<PathBuf>,
    #[arg(long)]
    initrd: Option<PathBuf>,
    #[arg(long)]
    rootfs: Option<PathBuf>,
    /// Writable overlay image; the rootfs is then attached read-only
    #[arg(long)]
    overlay: Option<PathBuf>,
    #[arg(long)]
    vcpu: Option<u32>,
    /// Memory in MiB
    #[arg(long)]
    memory: Option<u32>,
    #[arg(long)]
    ip: Option<String>,
    #[arg(long)]
    hostname: Option<String>,
    /// Attach to this bridge instead of NAT
    #[arg(long)]
    bridge: Option<String>,
    /// Enable the metadata service
    #[arg(long)]
    mmds: bool,
    /// Cloud-init user data file served through the metadata service
    #[arg(long, requires = "mmds")]
    user_data_file: Option<PathBuf>,
    /// Forward HOST_PORT:DEST_PORT once the VM is running
    #[arg(long, value_name = "HOST_PORT:DEST_PORT", value_parser = parse_port_pair)]
    expose: Option<(u16, u16)>,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))
}

fn parse_port_pair(s: &str) -> Result<(u16, u16), String> {
    let (host, dest) = s
        .split_once(':')
        .ok_or_else(|| format!("expected HOST_PORT:DEST_PORT, got '{s}'"))?;
    let host = host.parse().map_err(|_| format!("invalid host port '{host}'"))?;
    let dest = dest.parse().map_err(|_| format!("invalid destination port '{dest}'"))?;
    Ok((host, dest))
}

impl CreateArgs {
    fn apply(&self, config: &mut MicroVmConfig) -> anyhow::Result<()> {
        if let Some(kernel) = &self.kernel {
            config.kernel_file = kernel.clone();
        }
        if let Some(initrd) = &self.initrd {
            config.initrd_file = Some(initrd.clone());
        }
        if let Some(rootfs) = &self.rootfs {
            config.base_rootfs = Some(rootfs.clone());
        }
        if let Some(overlay) = &self.overlay {
            config.overlayfs = true;
            config.overlayfs_file = Some(overlay.clone());
        }
        if let Some(vcpu) = self.vcpu {
            config.vcpu_count = vcpu;
        }
        if let Some(memory) = self.memory {
            config.mem_size_mib = memory;
        }
        if let Some(ip) = &self.ip {
            config.ip_addr = ip.clone();
        }
        if let Some(hostname) = &self.hostname {
            config.hostname = hostname.clone();
        }
        if let Some(bridge) = &self.bridge {
            config.bridge = true;
            config.bridge_name = bridge.clone();
        }
        if self.mmds {
            config.mmds_enabled = true;
        }
        if let Some(path) = &self.user_data_file {
            let data = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read user data from {}", path.display()))?;
            config.user_data = Some(data);
        }
        if let Some((host_port, dest_port)) = self.expose {
            config.expose_ports = true;
            config.host_port = Some(host_port);
            config.dest_port = Some(dest_port);
        }
        Ok(())
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<MicroVmConfig> {
    let mut config = MicroVmConfig::from_env()?;
    for (key, value) in &cli.overrides {
        config.apply(key, value)?;
    }
    if let Some(data_path) = &cli.data_path {
        config.data_path = data_path.clone();
    }
    if let Command::Create(args) = &cli.command {
        args.apply(&mut config)?;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries command output
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("ember=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    tracing::debug!(?config, "Configuration loaded");

    match cli.command {
        Command::Create(args) => {
            let vm = match args.id {
                Some(id) => MicroVm::with_id(id, config)?,
                None => MicroVm::new(config)?,
            };
            match vm.create().await? {
                CreateOutcome::Created(entry) => {
                    println!("{} created ({}, pid {})", entry.id, entry.ip_addr, fmt_pid(entry.pid));
                }
                CreateOutcome::AlreadyExists(id) => println!("{id} already exists"),
            }
        }
        Command::Rm { id, all } => {
            let target = match (id, all) {
                (_, true) => DeleteTarget::All,
                (Some(id), false) => DeleteTarget::One(id),
                (None, false) => bail!("specify a VM id or --all"),
            };
            match MicroVm::new(config)?.delete(target).await? {
                DeleteOutcome::Deleted(ids) => {
                    for id in ids {
                        println!("{id} deleted");
                    }
                }
                DeleteOutcome::NothingToDelete => println!("no VMs to delete"),
            }
        }
        Command::Pause { id } => {
            let entry = MicroVm::with_id(id, config)?.pause(None).await?;
            println!("{} {}", entry.id, entry.state);
        }
        Command::Resume { id } => {
            let entry = MicroVm::with_id(id, config)?.resume(None).await?;
            println!("{} {}", entry.id, entry.state);
        }
        Command::Status { id } => {
            let state = MicroVm::with_id(id, config)?.status(None).await?;
            println!("{state}");
        }
        Command::Inspect { id } => {
            let vm_config = MicroVm::with_id(id, config)?.vm_config(None).await?;
            println!("{}", serde_json::to_string_pretty(&vm_config)?);
        }
        Command::Ps => {
            let entries = MicroVm::new(config)?.list().await?;
            println!("{:<10} {:<12} {:<16} {:<8} NAME", "ID", "STATE", "IP", "PID");
            for e in entries {
                println!(
                    "{:<10} {:<12} {:<16} {:<8} {}",
                    e.id,
                    e.state.to_string(),
                    e.ip_addr,
                    fmt_pid(e.pid),
                    e.name
                );
            }
        }
        Command::Connect { id, key, user } => {
            let vm = MicroVm::with_id(id, config)?;
            match vm.connect(None, user.as_deref(), key).await? {
                RelayEnd::RemoteClosed => tracing::debug!("Remote shell closed"),
                RelayEnd::LocalClosed => tracing::debug!("Local input closed"),
            }
        }
        Command::PortForward {
            id,
            host_port,
            dest_port,
            remove,
        } => {
            let vm = MicroVm::with_id(id, config)?;
            match vm.port_forward(None, host_port, dest_port, remove).await? {
                PortForwardOutcome::Added(mapping) => println!("added {mapping}"),
                PortForwardOutcome::Removed(mapping) => println!("removed {mapping}"),
            }
        }
    }

    Ok(())
}

fn fmt_pid(pid: Option<u32>) -> String {
    pid.map_or_else(|| "-".to_string(), |p| p.to_string())
}
