/*
 * Copyright 2024 Oxide Computer Company
 */

#![allow(unused_imports)]

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod common;
mod config;
mod drives;
mod file;
mod host;
mod interfaces;
mod mdadm;
mod phase;
mod preflight;
mod zpool;
use common::*;

use config::{Backend, Config};
use host::Host;

const APT_GET: &str = "/usr/bin/apt-get";
const BLKID: &str = "/sbin/blkid";
const BLOCKDEV: &str = "/sbin/blockdev";
const CADDY: &str = "/usr/bin/caddy";
const DD: &str = "/bin/dd";
const DUMPE2FS: &str = "/sbin/dumpe2fs";
const GUNZIP: &str = "/bin/gunzip";
const IFUP: &str = "/sbin/ifup";
const IP: &str = "/sbin/ip";
const LSBLK: &str = "/bin/lsblk";
const MDADM: &str = "/sbin/mdadm";
const MKFS_EXT4: &str = "/sbin/mkfs.ext4";
const MKSWAP: &str = "/sbin/mkswap";
const MOUNT: &str = "/bin/mount";
const PARTPROBE: &str = "/sbin/partprobe";
const PVE_FIREWALL: &str = "/usr/sbin/pve-firewall";
const PVESH: &str = "/usr/bin/pvesh";
const PVESM: &str = "/usr/sbin/pvesm";
const QM: &str = "/usr/sbin/qm";
const SGDISK: &str = "/sbin/sgdisk";
const SYSCTL: &str = "/sbin/sysctl";
const SYSTEMCTL: &str = "/bin/systemctl";
const UFW: &str = "/usr/sbin/ufw";
const UPDATE_INITRAMFS: &str = "/usr/sbin/update-initramfs";
const WIPEFS: &str = "/sbin/wipefs";
const ZFS: &str = "/sbin/zfs";
const ZPOOL: &str = "/sbin/zpool";

const DEFAULT_LOG_FILE: &str = "/var/log/pvebootstrap.log";

#[derive(Parser)]
#[command(name = "pvebootstrap")]
#[command(about = "Turn a Hetzner dedicated server into a Proxmox host")]
struct Cli {
    /// Log debug messages, including every command run
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Show what would be done without changing anything
    #[arg(short = 'n', long, global = true)]
    dry_run: bool,

    /// Do not ask for confirmation before destructive steps
    #[arg(short, long, global = true)]
    force: bool,

    /// Load settings from this file instead of ./.env
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Append a copy of the log to this file
    #[arg(long, global = true, default_value = DEFAULT_LOG_FILE)]
    log_file: PathBuf,

    /// Do not write a log file
    #[arg(long, global = true)]
    no_log_file: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that this host is ready to be provisioned
    Preflight,

    /// Run every step in order
    Install {
        #[arg(long)]
        skip_network: bool,
        #[arg(long)]
        skip_storage: bool,
        #[arg(long)]
        skip_firewall: bool,
        #[arg(long)]
        skip_vm: bool,
        #[arg(long)]
        skip_proxy: bool,
    },

    /// Move the public address onto a bridge and add the internal bridges
    Network {
        /// Restore the most recent backup of /etc/network/interfaces
        #[arg(long, conflicts_with = "generate_config")]
        reset: bool,

        /// Write the additional IP file and exit
        #[arg(long)]
        generate_config: bool,
    },

    /// Inspect drives and build storage pools
    Drives {
        #[command(subcommand)]
        what: DrivesCommand,
    },

    /// Create virtual machines
    Vm {
        #[command(subcommand)]
        what: VmCommand,
    },

    /// Put Caddy in front of the Proxmox web interface
    Proxy {
        /// Public name of this host (default: DOMAIN)
        #[arg(long)]
        domain: Option<String>,

        /// ACME account email (default: EMAIL)
        #[arg(long)]
        email: Option<String>,

        /// Attempts to fetch the site over HTTPS before giving up
        #[arg(long)]
        retries: Option<u32>,
    },

    /// Enable forwarding and the host firewall
    Firewall {
        /// Use the Proxmox cluster firewall instead of ufw
        #[arg(long)]
        pve_firewall: bool,
    },
}

#[derive(Subcommand)]
enum DrivesCommand {
    /// Show drives and how they would be grouped
    List {
        #[arg(long)]
        include_existing: bool,
    },

    /// Build mirrored pools from unused drives and register them
    Setup {
        /// Storage backend (default: STORAGE_BACKEND, or zfs)
        #[arg(long, value_enum)]
        backend: Option<Backend>,

        /// Also consider drives in existing arrays and pools
        #[arg(long)]
        include_existing: bool,
    },

    /// Copy the system drive onto a second drive of the same size
    MirrorSystem {
        #[arg(long)]
        source: String,
        #[arg(long)]
        target: String,
    },
}

#[derive(clap::Args)]
struct VmArgs {
    #[arg(long)]
    vm_id: Option<u32>,
    /// Memory in MiB
    #[arg(long)]
    memory: Option<u32>,
    #[arg(long)]
    cores: Option<u32>,
    /// Disk size in GiB
    #[arg(long)]
    disk_size: Option<u32>,
    /// Attach the LAN and DMZ interfaces to SDN vnets instead of bridges
    #[arg(long)]
    sdn: bool,
    /// Install ISO to download
    #[arg(long)]
    iso_url: Option<String>,
}

impl VmArgs {
    fn apply(&self, s: &mut config::VmSettings) {
        if let Some(v) = self.vm_id {
            s.id = v;
        }
        if let Some(v) = self.memory {
            s.memory = v;
        }
        if let Some(v) = self.cores {
            s.cores = v;
        }
        if let Some(v) = self.disk_size {
            s.disk_gb = v;
        }
    }

    fn opts(&self) -> phase::vm::VmOpts {
        phase::vm::VmOpts { sdn: self.sdn, iso_url: self.iso_url.clone() }
    }
}

#[derive(Subcommand)]
enum VmCommand {
    /// Create the pfSense firewall VM
    Pfsense(VmArgs),
    /// Create the firewall administration VM on the LAN bridge
    Admin(VmArgs),
}

/**
 * Commands that every step needs.  Others are checked by the step that uses
 * them, as they may be installed along the way.
 */
const REQUIRED: &[&str] = &[IP, LSBLK, SYSTEMCTL];

fn check(host: &Host, cfg: &Config) -> Result<()> {
    let log = host.log();

    preflight::require_programs(log, REQUIRED)?;
    if !preflight::is_proxmox()? {
        if host.dry_run() {
            warn!(log, "/etc/pve is not mounted; not a Proxmox host?");
        } else {
            bail!("/etc/pve is not mounted; install Proxmox VE first");
        }
    }
    for p in preflight::missing_programs(&[QM, PVESM, MDADM, ZPOOL, SGDISK])? {
        warn!(log, "{} is not installed", p);
    }

    info!(log, "domain: {}", cfg.domain.as_deref().unwrap_or("(unset)"));
    info!(log, "storage backend: {}", cfg.storage_backend);
    info!(log, "pfSense VM: {:?}", cfg.pfsense);
    for a in cfg.additional_ips.iter() {
        info!(log, "additional IP {} gw {} mac {}", a.cidr(), a.gateway,
            a.mac.as_deref().unwrap_or("-"));
    }
    if cfg.wan_mac().is_none() {
        warn!(log, "no MAC configured for the first additional IP; the \
            pfSense step will fail");
    }

    Ok(())
}

fn install(host: &Host, cfg: &Config, cmd: &Commands) -> Result<()> {
    let log = host.log();
    let Commands::Install {
        skip_network,
        skip_storage,
        skip_firewall,
        skip_vm,
        skip_proxy,
    } = cmd
    else {
        bail!("not an install command");
    };

    check(host, cfg)?;

    if !skip_network {
        info!(log, "=== network ===");
        phase::network::run(
            host,
            cfg,
            &phase::network::NetworkOpts { reset: false, generate_config: false },
        )?;
    }
    if !skip_storage {
        info!(log, "=== storage ===");
        phase::storage::run(
            host,
            &phase::storage::StorageOpts {
                backend: cfg.storage_backend,
                include_existing: false,
            },
        )?;
    }
    if !skip_firewall {
        info!(log, "=== firewall ===");
        phase::firewall::run(
            host,
            &phase::firewall::FirewallOpts { pve_firewall: false },
        )?;
    }
    if !skip_vm {
        info!(log, "=== pfSense VM ===");
        phase::vm::pfsense(
            host,
            cfg,
            &phase::vm::VmOpts { sdn: false, iso_url: None },
        )?;
    }
    if !skip_proxy {
        if cfg.domain.is_some() && cfg.email.is_some() {
            info!(log, "=== reverse proxy ===");
            phase::proxy::run(
                host,
                cfg,
                &phase::proxy::ProxyOpts {
                    domain: None,
                    email: None,
                    retries: None,
                },
            )?;
        } else {
            warn!(log, "DOMAIN or EMAIL unset; skipping the reverse proxy");
        }
    }

    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let logfile = if cli.no_log_file || cli.dry_run {
        None
    } else {
        Some(cli.log_file.as_path())
    };
    let log = match init_run_log(cli.verbose, logfile) {
        Ok(log) => log,
        Err(e) => {
            let log = init_log();
            warn!(log, "{:?}; logging to the terminal only", e);
            log
        }
    };

    match run(&log, &cli) {
        Ok(()) => {
            info!(log, "ok, run complete");
            std::process::exit(0);
        }
        Err(e) => {
            error!(log, "fatal error: {:?}", e);
            std::process::exit(1);
        }
    }
}

fn run(log: &Logger, cli: &Cli) -> Result<()> {
    match &cli.env_file {
        Some(p) => {
            dotenvy::from_path(p)
                .with_context(|| format!("loading {}", p.display()))?;
            info!(log, "loaded settings from {}", p.display());
        }
        None => {
            if let Ok(p) = dotenvy::dotenv() {
                info!(log, "loaded settings from {}", p.display());
            }
        }
    }

    let mut cfg = Config::load(log, |k| std::env::var(k).ok())?;
    debug!(log, "configuration: {:#?}", cfg);

    if cli.dry_run {
        info!(log, "dry run: no changes will be made");
    }
    preflight::require_root(log, cli.dry_run)?;

    let host = Host::new(log, cli.dry_run, cli.force);

    match &cli.command {
        Commands::Preflight => check(&host, &cfg),
        c @ Commands::Install { .. } => install(&host, &cfg, c),
        Commands::Network { reset, generate_config } => phase::network::run(
            &host,
            &cfg,
            &phase::network::NetworkOpts {
                reset: *reset,
                generate_config: *generate_config,
            },
        ),
        Commands::Drives { what } => match what {
            DrivesCommand::List { include_existing } => {
                phase::storage::list(&host, *include_existing)
            }
            DrivesCommand::Setup { backend, include_existing } => {
                phase::storage::run(
                    &host,
                    &phase::storage::StorageOpts {
                        backend: backend.unwrap_or(cfg.storage_backend),
                        include_existing: *include_existing,
                    },
                )
            }
            DrivesCommand::MirrorSystem { source, target } => {
                phase::mirror::run(&host, source, target)
            }
        },
        Commands::Vm { what } => match what {
            VmCommand::Pfsense(args) => {
                args.apply(&mut cfg.pfsense);
                phase::vm::pfsense(&host, &cfg, &args.opts())
            }
            VmCommand::Admin(args) => {
                args.apply(&mut cfg.admin_vm);
                phase::vm::admin(&host, &cfg, &args.opts())
            }
        },
        Commands::Proxy { domain, email, retries } => phase::proxy::run(
            &host,
            &cfg,
            &phase::proxy::ProxyOpts {
                domain: domain.clone(),
                email: email.clone(),
                retries: *retries,
            },
        ),
        Commands::Firewall { pve_firewall } => phase::firewall::run(
            &host,
            &phase::firewall::FirewallOpts { pve_firewall: *pve_firewall },
        ),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn cli_parses() {
        let cli = Cli::parse_from([
            "pvebootstrap",
            "drives",
            "setup",
            "--backend",
            "mdadm",
            "--dry-run",
        ]);
        assert!(cli.dry_run);
        match cli.command {
            Commands::Drives {
                what: DrivesCommand::Setup { backend, include_existing },
            } => {
                assert_eq!(backend, Some(Backend::Mdadm));
                assert!(!include_existing);
            }
            _ => panic!("wrong command"),
        }

        let cli = Cli::parse_from([
            "pvebootstrap",
            "--force",
            "vm",
            "pfsense",
            "--vm-id",
            "200",
            "--sdn",
        ]);
        assert!(cli.force);
        let Commands::Vm { what: VmCommand::Pfsense(args) } = cli.command else {
            panic!("wrong command");
        };
        let mut s = config::VmSettings {
            id: 100,
            name: "pfsense".into(),
            memory: 2048,
            cores: 2,
            disk_gb: 32,
        };
        args.apply(&mut s);
        assert_eq!(s.id, 200);
        assert_eq!(s.memory, 2048);
        assert!(args.sdn);
    }
}
