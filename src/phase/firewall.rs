/*
 * Copyright 2024 Oxide Computer Company
 */

use super::prelude::*;

const SYSCTL_DROPIN: &str = "/etc/sysctl.d/99-pvebootstrap.conf";
const CLUSTER_FW: &str = "/etc/pve/firewall/cluster.fw";
const FW_BACKUP_DIR: &str = "/root/firewall-backups";

pub struct FirewallOpts {
    pub pve_firewall: bool,
}

/**
 * Ports reachable from the outside.  The Proxmox UI on 8006 is reached only
 * through the reverse proxy.
 */
const ALLOW_TCP: &[u16] = &[22, 80, 443];
const DENY_TCP: &[u16] = &[8006];

pub fn render_sysctl() -> String {
    "# Managed by pvebootstrap.\n\
    # pfSense routes between the bridges, so the host must forward.\n\
    net.ipv4.ip_forward = 1\n"
        .to_string()
}

pub fn ufw_commands() -> Vec<Vec<String>> {
    let mut out: Vec<Vec<String>> = Vec::new();
    let cmd = |args: &[&str]| -> Vec<String> {
        args.iter().map(|a| a.to_string()).collect()
    };

    for p in ALLOW_TCP {
        out.push(cmd(&["allow", &format!("{}/tcp", p)]));
    }
    for p in DENY_TCP {
        out.push(cmd(&["deny", &format!("{}/tcp", p)]));
    }
    out.push(cmd(&["default", "allow", "routed"]));
    out.push(cmd(&["--force", "enable"]));
    out
}

pub fn render_cluster_fw() -> String {
    let mut out = String::from(
        "# Managed by pvebootstrap.\n\
        [OPTIONS]\n\
        \n\
        enable: 1\n\
        policy_in: DROP\n\
        policy_out: ACCEPT\n\
        \n\
        [RULES]\n\
        \n",
    );
    for p in ALLOW_TCP {
        out.push_str(&format!("IN ACCEPT -p tcp -dport {} -log nolog\n", p));
    }
    for p in DENY_TCP {
        out.push_str(&format!("IN DROP -p tcp -dport {} -log nolog\n", p));
    }
    out.push_str("IN ACCEPT -p icmp -log nolog\n");
    out
}

fn forwarding(host: &Host) -> Result<()> {
    let text = render_sysctl();
    if read_file(SYSCTL_DROPIN)?.as_deref() == Some(text.as_str()) {
        info!(host.log(), "{} is already up to date", SYSCTL_DROPIN);
        return Ok(());
    }

    host.write_file(SYSCTL_DROPIN, &text)?;
    host.run(SYSCTL, &["--system"])
}

fn ufw(host: &Host) -> Result<()> {
    if !exists_file(UFW)? {
        info!(host.log(), "installing ufw");
        host.run(APT_GET, &["install", "-y", "ufw"])?;
    }

    for args in ufw_commands() {
        host.run(UFW, &args)?;
    }
    Ok(())
}

fn pve_firewall(host: &Host) -> Result<()> {
    let log = host.log();

    if !exists_dir("/etc/pve")? {
        bail!("/etc/pve is missing; is this a Proxmox host?");
    }

    let text = render_cluster_fw();
    if read_file(CLUSTER_FW)?.as_deref() == Some(text.as_str()) {
        info!(log, "{} is already up to date", CLUSTER_FW);
    } else {
        if !host.dry_run() {
            backup_file(log, CLUSTER_FW, FW_BACKUP_DIR)?;
        }
        host.ensure_dir("/etc/pve/firewall")?;
        host.write_file(CLUSTER_FW, &text)?;
    }

    host.run_soft(PVE_FIREWALL, &["restart"]);
    Ok(())
}

pub fn run(host: &Host, opts: &FirewallOpts) -> Result<()> {
    forwarding(host)?;

    if opts.pve_firewall {
        pve_firewall(host)?;
    } else {
        if !host.confirm("Enable ufw with SSH, HTTP and HTTPS allowed?")? {
            bail!("firewall setup cancelled");
        }
        ufw(host)?;
    }

    info!(host.log(), "ok, firewall configured");
    Ok(())
}
