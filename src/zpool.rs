/*
 * Copyright 2024 Oxide Computer Company
 */

use crate::common::*;
use crate::host::Host;
use crate::{ZFS, ZPOOL};

pub fn zpool_list(host: &Host) -> Result<Vec<String>> {
    let out = host.read(ZPOOL, &["list", "-H", "-o", "name"])?;
    Ok(out
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .map(|l| l.to_string())
        .collect())
}

pub fn zpool_exists(host: &Host, pool: &str) -> Result<bool> {
    Ok(zpool_list(host)?.iter().any(|p| p == pool))
}

/**
 * Arguments for "zpool create".  Two devices make a mirror; a single device
 * makes a single-disk pool that can later be converted with "zpool attach".
 */
pub fn zpool_create_args(pool: &str, devices: &[&str]) -> Result<Vec<String>> {
    let mut args: Vec<String> = [
        "create", "-f", "-o", "ashift=12", "-O", "compression=lz4", "-O",
        "atime=off", "-O", "xattr=sa",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    args.push(pool.to_string());
    match devices {
        [d] => args.push(d.to_string()),
        [a, b] => {
            args.push("mirror".into());
            args.push(a.to_string());
            args.push(b.to_string());
        }
        other => bail!("a pool needs one or two devices, not {:?}", other),
    }

    Ok(args)
}

pub fn zpool_create(host: &Host, pool: &str, devices: &[&str]) -> Result<()> {
    let args = zpool_create_args(pool, devices)?;
    host.run(ZPOOL, &args)?;
    info!(host.log(), "zpool {} created on {:?}", pool, devices);
    Ok(())
}

pub fn zfs_exists(host: &Host, dataset: &str) -> Result<bool> {
    let output = host.query(ZFS, &["list", "-H", "-o", "name", dataset])?;
    Ok(output.status.success())
}

pub fn zfs_create(host: &Host, dataset: &str) -> Result<()> {
    if !host.dry_run() && zfs_exists(host, dataset)? {
        info!(host.log(), "zfs dataset {} exists", dataset);
        return Ok(());
    }

    host.run(ZFS, &["create", dataset])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn create_args() -> Result<()> {
        let args = zpool_create_args("data0", &["/dev/sda", "/dev/sdb"])?;
        assert_eq!(
            &args[args.len() - 4..],
            &["data0", "mirror", "/dev/sda", "/dev/sdb"]
        );
        assert!(args.contains(&"ashift=12".to_string()));

        let args = zpool_create_args("data1", &["/dev/sde"])?;
        assert_eq!(&args[args.len() - 2..], &["data1", "/dev/sde"]);
        assert!(!args.contains(&"mirror".to_string()));

        assert!(zpool_create_args("data2", &[]).is_err());
        Ok(())
    }
}
