/*
 * Copyright 2024 Oxide Computer Company
 */

use std::time::Duration;

use super::prelude::*;
use crate::config::VmSettings;

const ISO_DIR: &str = "/var/lib/vz/template/iso";
const SDN_DIR: &str = "/etc/pve/sdn";
const SDN_ZONE: &str = "pfzone";
const SDN_LAN: &str = "pflan";
const SDN_DMZ: &str = "pfdmz";

pub struct VmOpts {
    pub sdn: bool,
    pub iso_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nic {
    pub bridge: String,
    pub mac: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSpec {
    pub settings: VmSettings,
    pub storage: String,
    pub iso: Option<String>,
    pub nics: Vec<Nic>,
}

pub fn qm_create_args(spec: &VmSpec) -> Vec<String> {
    let s = &spec.settings;
    let mut args: Vec<String> = vec![
        "create".into(),
        s.id.to_string(),
        "--name".into(),
        s.name.clone(),
        "--memory".into(),
        s.memory.to_string(),
        "--cores".into(),
        s.cores.to_string(),
        "--sockets".into(),
        "1".into(),
        "--cpu".into(),
        "host".into(),
        "--ostype".into(),
        "other".into(),
        "--scsihw".into(),
        "virtio-scsi-pci".into(),
        "--scsi0".into(),
        format!("{}:{}", spec.storage, s.disk_gb),
        "--onboot".into(),
        "1".into(),
    ];

    if let Some(iso) = &spec.iso {
        args.push("--ide2".into());
        args.push(format!("{},media=cdrom", iso));
        args.push("--boot".into());
        args.push("order=scsi0;ide2".into());
    }

    for (i, nic) in spec.nics.iter().enumerate() {
        let model = match &nic.mac {
            Some(mac) => format!("virtio={}", mac),
            None => "virtio".to_string(),
        };
        args.push(format!("--net{}", i));
        args.push(format!("{},bridge={}", model, nic.bridge));
    }

    args
}

pub fn vm_exists(host: &Host, id: u32) -> Result<bool> {
    let out = host.query(QM, &["status", id.to_string().as_str()])?;
    Ok(out.status.success())
}

/**
 * The file name an ISO will have in the ISO directory once downloaded and, if
 * needed, decompressed.
 */
pub fn iso_name(url: &str) -> Result<String> {
    let base = url
        .split(|c: char| c == '?' || c == '#')
        .next()
        .and_then(|u| u.rsplit('/').next())
        .filter(|b| !b.is_empty())
        .ok_or_else(|| anyhow!("no file name in URL {:?}", url))?;

    Ok(base.strip_suffix(".gz").unwrap_or(base).to_string())
}

/**
 * Make sure the ISO at this URL is in the local ISO store, downloading it if
 * needed.  Returns the Proxmox volume id.
 */
fn ensure_iso(host: &Host, cfg: &Config, url: &str) -> Result<String> {
    let log = host.log();

    let name = iso_name(url)?;
    let volid = format!("{}:iso/{}", cfg.iso_storage, name);
    let path = format!("{}/{}", ISO_DIR, name);

    if exists_file(&path)? {
        info!(log, "ISO {} already present", path);
        return Ok(volid);
    }

    if host.dry_run() {
        info!(log, "dry-run: download {} -> {}", url, path);
        return Ok(volid);
    }

    host.ensure_dir(ISO_DIR)?;
    let compressed = url.split('?').next().unwrap_or(url).ends_with(".gz");
    let dest = if compressed { format!("{}.gz", path) } else { path.clone() };

    info!(log, "downloading {}", url);
    let client = reqwest::blocking::ClientBuilder::new()
        .timeout(None::<Duration>)
        .build()?;
    let mut res = client.get(url).send()?;
    if !res.status().is_success() {
        bail!("download {}: bad status {}", url, res.status());
    }

    let mut tmp = tempfile::NamedTempFile::new_in(ISO_DIR)?;
    let n = res.copy_to(&mut tmp)?;
    tmp.persist(&dest).with_context(|| format!("saving {}", dest))?;
    info!(log, "downloaded {} bytes to {}", n, dest);

    if compressed {
        host.run(GUNZIP, &["-f", dest.as_str()])?;
    }
    if !exists_file(&path)? {
        bail!("{} missing after download", path);
    }

    Ok(volid)
}

fn create(host: &Host, spec: &VmSpec) -> Result<()> {
    let log = host.log();
    let s = &spec.settings;

    if vm_exists(host, s.id)? {
        info!(log, "VM {} already exists", s.id);
        return Ok(());
    }

    host.run(QM, &qm_create_args(spec))?;
    host.run_soft(QM, &["start", s.id.to_string().as_str()]);
    info!(log, "ok, VM {} ({}) created", s.id, s.name);
    Ok(())
}

pub fn pfsense(host: &Host, cfg: &Config, opts: &VmOpts) -> Result<()> {
    let Some(mac) = cfg.wan_mac() else {
        bail!(
            "the pfSense WAN interface needs the MAC of the first additional \
            IP; set MAC= in {} or ADDITIONAL_MAC_1",
            cfg.additional_ips_file
        );
    };

    let (lan, dmz) = if opts.sdn {
        sdn(host)?;
        (SDN_LAN.to_string(), SDN_DMZ.to_string())
    } else {
        (cfg.lan_bridge.clone(), cfg.dmz_bridge.clone())
    };

    let url = opts.iso_url.as_deref().unwrap_or(&cfg.pfsense_iso_url);
    let iso = if vm_exists(host, cfg.pfsense.id)? {
        None
    } else {
        Some(ensure_iso(host, cfg, url)?)
    };

    create(
        host,
        &VmSpec {
            settings: cfg.pfsense.clone(),
            storage: cfg.vm_storage.clone(),
            iso,
            nics: vec![
                Nic { bridge: cfg.wan_bridge.clone(), mac: Some(mac.to_string()) },
                Nic { bridge: lan, mac: None },
                Nic { bridge: dmz, mac: None },
            ],
        },
    )
}

/**
 * A small VM on the LAN side, from which the pfSense web interface can be
 * reached before any rules let it out to the WAN.
 */
pub fn admin(host: &Host, cfg: &Config, opts: &VmOpts) -> Result<()> {
    let log = host.log();

    let lan = if opts.sdn { SDN_LAN.to_string() } else { cfg.lan_bridge.clone() };

    let url = opts.iso_url.clone().or_else(|| cfg.admin_iso_url.clone());
    let iso = match url {
        Some(url) if !vm_exists(host, cfg.admin_vm.id)? => {
            Some(ensure_iso(host, cfg, &url)?)
        }
        Some(_) => None,
        None => {
            warn!(log, "no ISO configured for the admin VM (ADMIN_VM_ISO_URL); \
                attach one before starting it");
            None
        }
    };

    create(
        host,
        &VmSpec {
            settings: cfg.admin_vm.clone(),
            storage: cfg.vm_storage.clone(),
            iso,
            nics: vec![Nic { bridge: lan, mac: None }],
        },
    )
}

pub fn render_sdn_zone(zone: &str) -> String {
    format!("simple: {}\n\tipam pve\n", zone)
}

pub fn render_sdn_vnets(zone: &str, vnets: &[(&str, &str)]) -> String {
    vnets
        .iter()
        .map(|(name, alias)| {
            format!("vnet: {}\n\tzone {}\n\talias {}\n", name, zone, alias)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/**
 * Append a section to a Proxmox section config file unless a section with the
 * same header is already there.
 */
fn append_section(existing: &str, section: &str) -> Option<String> {
    let header = section.lines().next()?;
    if existing.lines().any(|l| l.trim_end() == header) {
        return None;
    }

    let mut out = existing.trim_end().to_string();
    if !out.is_empty() {
        out.push_str("\n\n");
    }
    out.push_str(section);
    Some(out)
}

fn sdn(host: &Host) -> Result<()> {
    let log = host.log();

    if !exists_dir("/etc/pve")? {
        bail!("/etc/pve is missing; is this a Proxmox host?");
    }
    host.ensure_dir(SDN_DIR)?;

    let zones = format!("{}/zones.cfg", SDN_DIR);
    let mut text = read_file(&zones)?.unwrap_or_default();
    if let Some(new) = append_section(&text, &render_sdn_zone(SDN_ZONE)) {
        host.write_file(&zones, &new)?;
        text = new;
    }
    debug!(log, "zones.cfg: {}", text);

    let vnets = format!("{}/vnets.cfg", SDN_DIR);
    let before = read_file(&vnets)?.unwrap_or_default();
    let mut text = before.clone();
    let wanted = [(SDN_LAN, "pfSense LAN"), (SDN_DMZ, "pfSense DMZ")];
    for v in wanted {
        if let Some(new) =
            append_section(&text, &render_sdn_vnets(SDN_ZONE, &[v]))
        {
            text = new;
        }
    }
    if text != before {
        host.write_file(&vnets, &text)?;
    }

    /*
     * Apply the pending SDN configuration.
     */
    host.run_soft(PVESH, &["set", "/cluster/sdn"]);
    Ok(())
}
