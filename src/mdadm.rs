/*
 * Copyright 2024 Oxide Computer Company
 */

use crate::common::*;
use crate::file::{read_file, read_lines_maybe};
use crate::host::Host;
use crate::{MDADM, UPDATE_INITRAMFS};

pub const MDADM_CONF: &str = "/etc/mdadm/mdadm.conf";
const MDSTAT: &str = "/proc/mdstat";

/**
 * Arguments for "mdadm --create" of a RAID1 array.  With a single device, the
 * array is created degraded with a "missing" slot, so that a second disk can be
 * added later without copying any data.
 */
pub fn mdadm_create_args(array: &str, devices: &[&str]) -> Result<Vec<String>> {
    let mut args: Vec<String> = vec![
        "--create".into(),
        array.into(),
        "--run".into(),
        "--level=1".into(),
        "--metadata=1.2".into(),
        "--raid-devices=2".into(),
    ];

    match devices {
        [d] => {
            args.push(d.to_string());
            args.push("missing".into());
        }
        [a, b] => {
            args.push(a.to_string());
            args.push(b.to_string());
        }
        other => bail!("an array needs one or two devices, not {:?}", other),
    }

    Ok(args)
}

pub fn mdadm_create(host: &Host, array: &str, devices: &[&str]) -> Result<()> {
    let args = mdadm_create_args(array, devices)?;
    host.run(MDADM, &args)
}

pub fn mdadm_add(host: &Host, array: &str, device: &str) -> Result<()> {
    host.run(MDADM, &["--manage", array, "--add", device])
}

/**
 * Make sure every array reported by "mdadm --detail --scan" is listed in
 * mdadm.conf, so that it is assembled with the same name at boot.  Returns the
 * new file contents, or None if nothing needs to change.
 */
pub fn merge_array_lines(existing: &[String], scan: &str) -> Option<Vec<String>> {
    let uuid_of = |l: &str| {
        l.split_whitespace()
            .find_map(|t| t.strip_prefix("UUID="))
            .map(|u| u.to_string())
    };

    let known: Vec<String> = existing
        .iter()
        .filter(|l| l.trim_start().starts_with("ARRAY"))
        .filter_map(|l| uuid_of(l))
        .collect();

    let mut out = existing.to_vec();
    let mut dirty = false;
    for l in scan.lines().map(|l| l.trim()) {
        if !l.starts_with("ARRAY") {
            continue;
        }
        match uuid_of(l) {
            Some(u) if known.contains(&u) => continue,
            _ => {
                out.push(l.to_string());
                dirty = true;
            }
        }
    }

    if dirty {
        Some(out)
    } else {
        None
    }
}

pub fn persist_arrays(host: &Host) -> Result<()> {
    let scan = host.read(MDADM, &["--detail", "--scan"])?;
    let existing = read_lines_maybe(MDADM_CONF)?;

    if let Some(lines) = merge_array_lines(&existing, &scan) {
        info!(host.log(), "updating {}", MDADM_CONF);
        host.write_lines(MDADM_CONF, &lines)?;

        /*
         * The initramfs carries its own copy of mdadm.conf.
         */
        host.run_soft(UPDATE_INITRAMFS, &["-u"]);
    } else {
        info!(host.log(), "{} already lists all arrays", MDADM_CONF);
    }

    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdStatus {
    pub name: String,
    pub active: bool,
    pub degraded: bool,
    pub progress: Option<String>,
}

impl MdStatus {
    pub fn syncing(&self) -> bool {
        self.progress.is_some()
    }
}

/**
 * Parse /proc/mdstat.  Each array begins with a line like:
 *
 *      md0 : active raid1 sdb2[2] sda2[0]
 *
 * followed by indented detail lines that carry the member status ("[2/1]
 * [U_]") and any recovery or resync progress.
 */
pub fn parse_mdstat(input: &str) -> Vec<MdStatus> {
    let mut out: Vec<MdStatus> = Vec::new();

    for l in input.lines() {
        if l.starts_with("md") {
            let Some((name, rest)) = l.split_once(" : ") else {
                continue;
            };
            out.push(MdStatus {
                name: name.trim().to_string(),
                active: rest.trim_start().starts_with("active"),
                degraded: false,
                progress: None,
            });
            continue;
        }

        let Some(cur) = out.last_mut() else {
            continue;
        };
        if !l.starts_with(' ') && !l.starts_with('\t') {
            continue;
        }

        for t in l.split_whitespace() {
            /*
             * Look for the "[n/m]" count of configured and working members:
             */
            if let Some(inner) =
                t.strip_prefix('[').and_then(|t| t.strip_suffix(']'))
            {
                if let Some((n, m)) = inner.split_once('/') {
                    if let (Ok(n), Ok(m)) = (n.parse::<u32>(), m.parse::<u32>())
                    {
                        cur.degraded = m < n;
                    }
                }
            }
        }

        let terms: Vec<&str> = l.split_whitespace().collect();
        for w in terms.windows(3) {
            if (w[0] == "recovery" || w[0] == "resync") && w[1] == "=" {
                cur.progress = Some(w[2].to_string());
            }
        }
        if l.contains("resync=PENDING") || l.contains("resync=DELAYED") {
            cur.progress = Some("pending".into());
        }
    }

    out
}

pub fn mdstat() -> Result<Vec<MdStatus>> {
    Ok(read_file(MDSTAT)?.map(|s| parse_mdstat(&s)).unwrap_or_default())
}

/**
 * The kernel name ("md127") of an array, which may be given by a link under
 * /dev/md (e.g., "/dev/md/system1").
 */
fn kernel_name(array: &str) -> String {
    let p = std::fs::canonicalize(array).unwrap_or_else(|_| array.into());
    p.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(array)
        .to_string()
}

/**
 * Of the named arrays, return those still syncing.  An array that is missing
 * from mdstat or not active will never finish.
 */
pub fn still_syncing(status: &[MdStatus], names: &[String]) -> Result<Vec<MdStatus>> {
    let mut out = Vec::new();
    for n in names.iter() {
        let Some(s) = status.iter().find(|s| &s.name == n) else {
            bail!("array {} is not running", n);
        };
        if !s.active {
            bail!("array {} is inactive", n);
        }
        if s.syncing() {
            out.push(s.clone());
        }
    }
    Ok(out)
}

/**
 * Wait for any resync or recovery on the named arrays to finish.
 */
pub fn wait_for_resync(log: &Logger, arrays: &[String]) -> Result<()> {
    let names: Vec<String> = arrays.iter().map(|a| kernel_name(a)).collect();

    loop {
        let status = mdstat()?;
        let busy = still_syncing(&status, &names)?;

        if busy.is_empty() {
            for s in status.iter().filter(|s| names.contains(&s.name)) {
                if s.degraded {
                    warn!(log, "array {} is in sync but still degraded", s.name);
                }
            }
            info!(log, "arrays in sync: {:?}", names);
            return Ok(());
        }

        for s in busy.iter() {
            info!(log, "waiting for {} to sync: {}", s.name,
                s.progress.as_deref().unwrap_or("?"));
        }
        sleep(30_000);
    }
}
