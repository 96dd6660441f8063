/*
 * Copyright 2024 Oxide Computer Company
 */

use std::os::unix::fs::MetadataExt;

use crate::common::*;
use crate::file::exists_file;

/**
 * The owner of /proc/self is the effective user of this process.
 */
pub fn is_root() -> Result<bool> {
    let md = std::fs::metadata("/proc/self")
        .context("cannot determine effective user")?;
    Ok(md.uid() == 0)
}

pub fn require_root(log: &Logger, dry_run: bool) -> Result<()> {
    if is_root()? {
        return Ok(());
    }

    if dry_run {
        warn!(log, "not running as root; dry run output may be incomplete");
        return Ok(());
    }

    bail!("this program modifies the host and must be run as root");
}

/**
 * Report which of the listed programs are not installed.
 */
pub fn missing_programs<'a>(programs: &[&'a str]) -> Result<Vec<&'a str>> {
    let mut out = Vec::new();
    for p in programs {
        if !exists_file(p)? {
            out.push(*p);
        }
    }
    Ok(out)
}

pub fn require_programs(log: &Logger, programs: &[&str]) -> Result<()> {
    let missing = missing_programs(programs)?;
    if missing.is_empty() {
        debug!(log, "required programs present: {:?}", programs);
        return Ok(());
    }

    for m in missing.iter() {
        error!(log, "required program {} is not installed", m);
    }
    bail!("missing {} required program(s)", missing.len());
}

/**
 * Check that this looks like a Proxmox host: the PVE configuration file system
 * should be mounted at /etc/pve.
 */
pub fn is_proxmox() -> Result<bool> {
    exists_file("/etc/pve/.version")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn finds_missing_programs() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let present = dir.path().join("present");
        std::fs::write(&present, "")?;
        let present = present.to_str().unwrap();
        let absent = "/nonexistent/absent";

        assert_eq!(missing_programs(&[present, absent])?, vec![absent]);
        assert!(missing_programs(&[present])?.is_empty());
        Ok(())
    }
}
