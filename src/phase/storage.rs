/*
 * Copyright 2024 Oxide Computer Company
 */

use super::prelude::*;
use crate::config::Backend;
use crate::drives::*;
use crate::mdadm::{mdadm_create, persist_arrays};
use crate::zpool::{zfs_create, zpool_create, zpool_exists, zpool_list};
use crate::MDADM;

const FSTAB: &str = "/etc/fstab";
const MOUNT_BASE: &str = "/mnt";

pub struct StorageOpts {
    pub backend: Backend,
    pub include_existing: bool,
}

/**
 * Print the drive inventory and the mirror groups that "drives setup" would
 * build from it.
 */
pub fn list(host: &Host, include_existing: bool) -> Result<()> {
    let drives = inventory(host)?;

    println!("{:<16} {:>8} {:<28} {}", "DEVICE", "SIZE", "MODEL", "STATUS");
    for d in drives.iter() {
        let status = match &d.class {
            DriveClass::System => "system".to_string(),
            DriveClass::Member(m) => match m.kind {
                MemberKind::Raid => format!("raid member ({})", m.name),
                MemberKind::Zfs => format!("zfs member ({})", m.name),
            },
            DriveClass::Mounted => "mounted".to_string(),
            DriveClass::Available => "available".to_string(),
        };
        println!(
            "{:<16} {:>8} {:<28} {}",
            d.path,
            d.size_human(),
            d.model.as_deref().unwrap_or("-"),
            status
        );
    }

    let groups = group_mirrors(&drives, include_existing);
    println!();
    if groups.is_empty() {
        println!("no drives available for new pools");
    }
    for g in groups.iter() {
        println!(
            "{} {}: {}",
            if g.is_mirror() { "mirror" } else { "single" },
            human_size(g.size),
            g.paths().join(" ")
        );
    }

    Ok(())
}

/**
 * Parse "pvesm status" output, returning the storage ids.
 */
pub fn parse_pvesm_status(input: &str) -> Vec<String> {
    input
        .lines()
        .filter(|l| !l.starts_with("Name "))
        .filter_map(|l| l.split_whitespace().next())
        .map(|id| id.to_string())
        .collect()
}

fn storage_ids(host: &Host) -> Result<Vec<String>> {
    Ok(parse_pvesm_status(&host.read(PVESM, &["status"])?))
}

/**
 * Pick the first "dataN" name not used by any storage id, pool, or array
 * name in the list.
 */
pub fn next_name(taken: &[String]) -> String {
    (0..)
        .map(|n| format!("data{}", n))
        .find(|n| !taken.contains(n))
        .unwrap_or_else(|| "data".to_string())
}

/**
 * Return the fstab lines with an entry added for the filesystem with this
 * UUID, or None if the mount point is already listed.
 */
pub fn fstab_with_entry(
    existing: &[String],
    uuid: &str,
    mountpoint: &str,
) -> Option<Vec<String>> {
    let listed = existing.iter().any(|l| {
        let t: Vec<&str> = l.split_whitespace().collect();
        !l.trim_start().starts_with('#') && t.len() >= 2 && t[1] == mountpoint
    });
    if listed {
        return None;
    }

    let mut out = existing.to_vec();
    out.push(format!("UUID={} {} ext4 defaults,nofail 0 2", uuid, mountpoint));
    Some(out)
}

pub fn run(host: &Host, opts: &StorageOpts) -> Result<()> {
    let log = host.log();

    let drives = inventory(host)?;
    for d in drives.iter() {
        debug!(log, "drive {} {} {:?}", d.path, d.size_human(), d.class);
    }

    let members: Vec<&Drive> =
        drives.iter().filter(|d| d.membership().is_some()).collect();
    let mut include = opts.include_existing;
    if include && !members.is_empty() {
        let names: Vec<&str> = members.iter().map(|d| d.path.as_str()).collect();
        include = host.confirm(&format!(
            "Include drives that belong to existing arrays or pools ({})?",
            names.join(", ")
        ))?;
    }

    let groups = group_mirrors(&drives, include);
    if groups.is_empty() {
        info!(log, "no drives available for new pools");
        return Ok(());
    }

    /*
     * ZFS tooling may be absent on an mdadm-only host.
     */
    let registered = storage_ids(host)?;
    let mut taken = registered.clone();
    taken.extend(zpool_list(host).unwrap_or_default());
    if let Ok(ents) = std::fs::read_dir("/dev/md") {
        for ent in ents.flatten() {
            if let Some(n) = ent.file_name().to_str() {
                taken.push(n.to_string());
            }
        }
    }

    let mut failed = 0;
    for g in groups.iter() {
        let res = if let Some(m) = g.shared_membership() {
            register_existing(host, m, &registered)
        } else if g.is_available() {
            let name = next_name(&taken);
            taken.push(name.clone());
            build(host, opts.backend, g, &name)
        } else {
            release_and_build(host, opts.backend, g, &mut taken)
        };

        if let Err(e) = res {
            error!(log, "mirror group {:?}: {:?}", g.paths(), e);
            failed += 1;
        }
    }

    if failed > 0 {
        bail!("{} of {} mirror groups failed", failed, groups.len());
    }

    info!(log, "ok, storage configured");
    Ok(())
}

/**
 * The drives already make up an array or pool; make sure Proxmox knows about
 * it.
 */
fn register_existing(
    host: &Host,
    m: &Membership,
    registered: &[String],
) -> Result<()> {
    let log = host.log();

    match m.kind {
        MemberKind::Zfs => {
            if !zpool_exists(host, &m.name)? {
                host.run(crate::ZPOOL, &["import", m.name.as_str()])?;
            }
            let dataset = format!("{}/vmdata", m.name);
            zfs_create(host, &dataset)?;
            if registered.contains(&m.name) {
                info!(log, "storage {} already registered", m.name);
                return Ok(());
            }
            add_zfspool(host, &m.name, &dataset)
        }
        MemberKind::Raid => {
            let Some(mp) = &m.mountpoint else {
                bail!("array {} is not mounted; mount it first", m.name);
            };
            let id = mp.rsplit('/').next().filter(|s| !s.is_empty())
                .ok_or_else(|| anyhow!("cannot name storage for {}", mp))?;
            if registered.iter().any(|t| t == id) {
                info!(log, "storage {} already registered", id);
                return Ok(());
            }
            add_dir(host, id, mp)
        }
    }
}

/**
 * The group mixes existing members with other drives.  Tear down what can be
 * torn down safely and build a new pool from the result.
 */
fn release_and_build(
    host: &Host,
    backend: Backend,
    g: &MirrorGroup,
    taken: &mut Vec<String>,
) -> Result<()> {
    let log = host.log();

    for d in g.drives.iter() {
        let Some(m) = d.membership() else {
            continue;
        };
        match m.kind {
            MemberKind::Raid => {
                if let Some(mp) = &m.mountpoint {
                    bail!("{} belongs to {} which is mounted at {}", d.path,
                        m.name, mp);
                }
                warn!(log, "stopping array {} to release {}", m.name, d.path);
                if !host.confirm(&format!("Stop array {}?", m.name))? {
                    bail!("not releasing {}", d.path);
                }
                host.run(MDADM, &["--stop", m.name.as_str()])?;
            }
            MemberKind::Zfs => {
                let imported = zpool_list(host)?;
                check_pool_released(&d.path, &m.name, &imported)?;
            }
        }
    }

    let name = next_name(taken);
    taken.push(name.clone());
    build(host, backend, g, &name)
}

/**
 * A zfs member can only be reused once its pool is no longer imported.
 */
pub fn check_pool_released(drive: &str, pool: &str, imported: &[String]) -> Result<()> {
    if imported.iter().any(|p| p == pool) {
        bail!("{} belongs to imported pool {}", drive, pool);
    }
    Ok(())
}

fn build(host: &Host, backend: Backend, g: &MirrorGroup, name: &str) -> Result<()> {
    let log = host.log();
    let paths = g.paths();

    info!(log, "{} {} {} on {:?}",
        if g.is_mirror() { "mirror" } else { "single-drive" },
        match backend {
            Backend::Zfs => "pool",
            Backend::Mdadm => "array",
        },
        name, paths);

    if !host.confirm(&format!(
        "Erase {} and create {} {}?",
        paths.join(" "),
        backend,
        name
    ))? {
        bail!("not erasing {:?}", paths);
    }

    for p in paths.iter() {
        host.run(WIPEFS, &["-a", p])?;
    }

    match backend {
        Backend::Zfs => build_zfs(host, name, &paths),
        Backend::Mdadm => build_mdadm(host, name, &paths),
    }
}

fn build_zfs(host: &Host, name: &str, paths: &[&str]) -> Result<()> {
    zpool_create(host, name, paths)?;

    let dataset = format!("{}/vmdata", name);
    zfs_create(host, &dataset)?;
    add_zfspool(host, name, &dataset)
}

fn build_mdadm(host: &Host, name: &str, paths: &[&str]) -> Result<()> {
    let log = host.log();
    let array = format!("/dev/md/{}", name);
    let mp = format!("{}/{}", MOUNT_BASE, name);

    mdadm_create(host, &array, paths)?;
    host.run(MKFS_EXT4, &["-F", "-L", name, array.as_str()])?;
    host.ensure_dir(&mp)?;
    host.run(MOUNT, &[array.as_str(), mp.as_str()])?;

    let uuid = if host.dry_run() {
        "<uuid>".to_string()
    } else {
        host.read(BLKID, &["-s", "UUID", "-o", "value", array.as_str()])?
            .trim()
            .to_string()
    };
    if uuid.is_empty() {
        bail!("no filesystem UUID for {}", array);
    }

    let existing = read_lines_maybe(FSTAB)?;
    match fstab_with_entry(&existing, &uuid, &mp) {
        Some(lines) => {
            backup_file(log, FSTAB, "/root/fstab-backups")?;
            host.write_lines(FSTAB, &lines)?;
        }
        None => info!(log, "{} already in {}", mp, FSTAB),
    }

    persist_arrays(host)?;
    add_dir(host, name, &mp)
}

fn add_zfspool(host: &Host, id: &str, dataset: &str) -> Result<()> {
    host.run(
        PVESM,
        &[
            "add", "zfspool", id, "--pool", dataset, "--content",
            "images,rootdir", "--sparse", "1",
        ],
    )?;
    info!(host.log(), "registered zfspool storage {}", id);
    Ok(())
}

fn add_dir(host: &Host, id: &str, path: &str) -> Result<()> {
    host.run(
        PVESM,
        &[
            "add", "dir", id, "--path", path, "--content",
            "images,rootdir,iso,vztmpl,backup", "--is_mountpoint", "yes",
        ],
    )?;
    info!(host.log(), "registered dir storage {} at {}", id, path);
    Ok(())
}
