/*
 * Copyright 2024 Oxide Computer Company
 */

use std::io::Write;
use std::net::Ipv4Addr;
use std::path::Path;

use super::prelude::*;
use crate::config::render_additional_ips;
use crate::interfaces::*;

pub const INTERFACES: &str = "/etc/network/interfaces";
pub const BACKUP_DIR: &str = "/root/network-backups";
const RESTORE_SCRIPT: &str = "/root/network-backups/restore-network.sh";

pub struct NetworkOpts {
    pub reset: bool,
    pub generate_config: bool,
}

pub fn run(host: &Host, cfg: &Config, opts: &NetworkOpts) -> Result<()> {
    if opts.generate_config {
        return generate_config(host, cfg);
    }
    if opts.reset {
        return reset(host);
    }
    configure(host, cfg)
}

/**
 * Work out which interface and address carry the current SSH session, and
 * build the plan for the new interfaces file around them.
 */
fn plan(host: &Host, cfg: &Config, existing: &[Stanza]) -> Result<NetworkPlan> {
    let log = host.log();

    let addrs = parse_ip_addr(&host.read(IP, &["-o", "-4", "addr", "show"])?)?;
    let route =
        parse_default_route(&host.read(IP, &["-4", "route", "show", "default"])?)?
            .ok_or_else(|| anyhow!("no IPv4 default route"))?;
    info!(log, "default route via {} dev {}", route.gateway, route.dev);

    let ssh = std::env::var("SSH_CONNECTION")
        .ok()
        .and_then(|s| ssh_server_addr(&s));

    let current = match ssh.and_then(|a| addrs.iter().find(|x| x.addr == a)) {
        Some(a) => {
            info!(log, "SSH session arrives on {} ({})", a.ifname, a.addr);
            a
        }
        None => {
            let a = addrs
                .iter()
                .find(|a| a.ifname == route.dev && !a.addr.is_loopback())
                .ok_or_else(|| {
                    anyhow!("no IPv4 address on default route device {}",
                        route.dev)
                })?;
            info!(log, "using address {} on {} (default route)", a.addr,
                a.ifname);
            a
        }
    };

    /*
     * If we are re-running on a host where the address has already moved to a
     * bridge, the physical NIC is whatever that bridge is built on.
     */
    let physical = match existing
        .iter()
        .find(|s| s.name == current.ifname)
        .and_then(|s| s.option("bridge-ports"))
    {
        Some(ports) => ports
            .split_whitespace()
            .find(|p| *p != "none")
            .ok_or_else(|| {
                anyhow!("bridge {} has no physical port", current.ifname)
            })?
            .to_string(),
        None => current.ifname.clone(),
    };
    info!(log, "physical interface: {}", physical);

    let physical_mac = host
        .read(IP, &["-o", "link", "show", "dev", physical.as_str()])
        .ok()
        .and_then(|s| parse_link_mac(&s));

    Ok(NetworkPlan {
        physical,
        physical_mac,
        bridge: cfg.wan_bridge.clone(),
        address: current.addr,
        prefix: current.prefix,
        gateway: route.gateway,
        additional: cfg.additional_ips.clone(),
        internal_bridges: vec![
            (cfg.lan_bridge.clone(), "pfSense LAN".to_string()),
            (cfg.dmz_bridge.clone(), "pfSense DMZ".to_string()),
        ],
    })
}

fn restore_script(backup: &Path) -> String {
    format!(
        "#!/bin/sh\n\
        # Restore the network configuration saved before pvebootstrap ran.\n\
        cp '{}' {}\n\
        systemctl restart networking\n",
        backup.display(),
        INTERFACES,
    )
}

fn configure(host: &Host, cfg: &Config) -> Result<()> {
    let log = host.log();

    let existing = read_file(INTERFACES)?.unwrap_or_default();
    let stanzas = parse_interfaces(&existing);

    let plan = plan(host, cfg, &stanzas)?;
    info!(log, "network plan: {:#?}", plan);

    let text = render_interfaces(&plan);
    let problems = validate_interfaces(&text, &plan.bridge, plan.address);
    if !problems.is_empty() {
        for p in problems.iter() {
            error!(log, "generated interfaces file: {}", p);
        }
        bail!("generated interfaces file failed validation");
    }

    if text == existing {
        info!(log, "{} is already up to date", INTERFACES);
        return Ok(());
    }

    if host.dry_run() {
        info!(log, "dry-run: would write {}:\n{}", INTERFACES, text);
        return Ok(());
    }

    if !host.confirm(&format!(
        "Replace {} and restart networking? The SSH session may drop briefly",
        INTERFACES
    ))? {
        bail!("network reconfiguration cancelled");
    }

    let backup = backup_file(log, INTERFACES, BACKUP_DIR)?;
    if let Some(backup) = &backup {
        host.write_file(RESTORE_SCRIPT, &restore_script(backup))?;
        set_mode(RESTORE_SCRIPT, 0o700)?;
        info!(log, "emergency restore script: {}", RESTORE_SCRIPT);
    }

    /*
     * Stage the new file next to the old one and give ifupdown a chance to
     * object to it before it goes live.
     */
    let mut candidate = tempfile::NamedTempFile::new_in("/etc/network")?;
    candidate.write_all(text.as_bytes())?;
    candidate.flush()?;
    let cpath = candidate
        .path()
        .to_str()
        .ok_or_else(|| anyhow!("temporary path is not UTF-8"))?
        .to_string();

    if exists_file(IFUP)? {
        let out = host.query(IFUP, &["--no-act", "-a", "-i", cpath.as_str()])?;
        if out.status.success() {
            info!(log, "ifup --no-act accepted the new configuration");
        } else {
            warn!(log, "ifup --no-act reported problems: {}", out.info());
        }
    }

    host.copy(&cpath, INTERFACES)?;

    if let Err(e) = host.run(SYSTEMCTL, &["restart", "networking"]) {
        error!(log, "network restart failed: {}", e);
        rollback(host, backup.as_deref())?;
        bail!("network reconfiguration failed and was rolled back");
    }

    /*
     * Give the bridge a moment to come up, then make sure the address the
     * session depends on is where we put it.
     */
    sleep(3_000);
    if !address_on(host, &plan.bridge, plan.address)? {
        error!(log, "{} did not come up on {}", plan.address, plan.bridge);
        rollback(host, backup.as_deref())?;
        bail!("network reconfiguration failed and was rolled back");
    }

    info!(log, "ok, {} is up on {}", plan.address, plan.bridge);
    Ok(())
}

fn address_on(host: &Host, ifname: &str, addr: Ipv4Addr) -> Result<bool> {
    let out = host.query(IP, &["-o", "-4", "addr", "show", "dev", ifname])?;
    if !out.status.success() {
        return Ok(false);
    }
    let addrs = parse_ip_addr(&String::from_utf8_lossy(&out.stdout))?;
    Ok(addrs.iter().any(|a| a.addr == addr))
}

fn rollback(host: &Host, backup: Option<&Path>) -> Result<()> {
    let log = host.log();

    let Some(backup) = backup else {
        error!(log, "no backup of {} to restore!", INTERFACES);
        return Ok(());
    };

    warn!(log, "restoring {} from {}", INTERFACES, backup.display());
    let backup = backup
        .to_str()
        .ok_or_else(|| anyhow!("backup path is not UTF-8"))?;
    host.copy(backup, INTERFACES)?;
    host.run_soft(SYSTEMCTL, &["restart", "networking"]);
    Ok(())
}

fn reset(host: &Host) -> Result<()> {
    let log = host.log();

    let Some(backup) = latest_backup(BACKUP_DIR, "interfaces")? else {
        bail!("no backup of {} found in {}", INTERFACES, BACKUP_DIR);
    };
    info!(log, "most recent backup: {}", backup.display());

    if !host.confirm(&format!(
        "Restore {} from {} and restart networking?",
        INTERFACES,
        backup.display()
    ))? {
        bail!("network reset cancelled");
    }

    let backup = backup
        .to_str()
        .ok_or_else(|| anyhow!("backup path is not UTF-8"))?;
    host.copy(backup, INTERFACES)?;
    host.run(SYSTEMCTL, &["restart", "networking"])?;

    info!(log, "ok, network configuration restored");
    Ok(())
}

fn generate_config(host: &Host, cfg: &Config) -> Result<()> {
    let log = host.log();
    let path = cfg.additional_ips_file.as_str();

    if exists_file(path)?
        && !host.confirm(&format!("{} exists; overwrite it?", path))?
    {
        info!(log, "leaving {} alone", path);
        return Ok(());
    }

    if let Some(dir) = Path::new(path).parent().and_then(|d| d.to_str()) {
        if !dir.is_empty() {
            host.ensure_dir(dir)?;
        }
    }

    host.write_file(path, &render_additional_ips(&cfg.additional_ips))?;
    info!(log, "ok, wrote {}", path);
    Ok(())
}
