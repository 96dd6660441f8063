/*
 * Copyright 2024 Oxide Computer Company
 */

use std::fmt;

use super::prelude::*;
use crate::drives::*;
use crate::mdadm::{mdadm_add, mdadm_create, persist_arrays, wait_for_resync};

/**
 * Partitions outside any array that may be copied byte-for-byte while they are
 * mounted.  They change rarely, and only when the bootloader is updated.
 */
const RAW_COPY_MOUNTS: &[&str] = &["/boot/efi", "/boot"];

/**
 * Filesystems that can be cloned into a new array.  Their size can be read
 * with dumpe2fs, so that only the filesystem itself is copied.
 */
const CLONE_FSTYPES: &[&str] = &["ext2", "ext3", "ext4"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    ReplicateTable { source: String, target: String },
    RandomizeGuids { target: String },
    AddToArray { array: String, partition: String },
    RawCopy { from: String, to: String },
    CreateDegraded { array: String, partition: String },
    CloneInto { from: String, array: String },
    MakeSwap { partition: String },
    PersistArrays,
    WaitResync { arrays: Vec<String> },
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::ReplicateTable { source, target } => {
                write!(f, "copy partition table {} -> {}", source, target)
            }
            Step::RandomizeGuids { target } => {
                write!(f, "randomise partition GUIDs on {}", target)
            }
            Step::AddToArray { array, partition } => {
                write!(f, "add {} to {}", partition, array)
            }
            Step::RawCopy { from, to } => write!(f, "copy {} -> {}", from, to),
            Step::CreateDegraded { array, partition } => {
                write!(f, "create degraded array {} on {}", array, partition)
            }
            Step::CloneInto { from, array } => {
                write!(f, "clone filesystem {} -> {}", from, array)
            }
            Step::MakeSwap { partition } => write!(f, "mkswap {}", partition),
            Step::PersistArrays => write!(f, "record arrays in mdadm.conf"),
            Step::WaitResync { arrays } => {
                write!(f, "wait for {} to resync", arrays.join(", "))
            }
        }
    }
}

/**
 * Partition device paths put a "p" between the disk and the number when the
 * disk name itself ends in a digit (e.g., "/dev/nvme0n1p2", but "/dev/sda2").
 */
pub fn partition_path(disk: &str, n: u32) -> String {
    if disk.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{}p{}", disk, n)
    } else {
        format!("{}{}", disk, n)
    }
}

pub fn partition_number(disk: &str, part: &str) -> Option<u32> {
    let rest = part.strip_prefix(disk)?;
    let rest = if disk.ends_with(|c: char| c.is_ascii_digit()) {
        rest.strip_prefix('p')?
    } else {
        rest
    };
    rest.parse().ok()
}

/**
 * Work out how to turn the target disk into a copy of the system disk.
 *
 * Partitions that already belong to an md array only need the matching target
 * partition added; the kernel copies the data during resync.  A mounted
 * filesystem that is not in an array gets a degraded RAID1 built on the target
 * partition, the filesystem is copied into it with dd, and then the original
 * partition is added as the second member.  Bootloader partitions and anything
 * unmounted are copied with dd as they are.
 */
pub fn mirror_plan(source: &Drive, target: &Drive) -> Result<Vec<Step>> {
    if source.class != DriveClass::System {
        bail!("{} is not the system drive", source.path);
    }
    if target.class != DriveClass::Available {
        bail!("{} is not available ({:?})", target.path, target.class);
    }
    if source.path == target.path {
        bail!("source and target are both {}", source.path);
    }
    if source.size != target.size {
        bail!(
            "{} is {} bytes but {} is {} bytes",
            source.path,
            source.size,
            target.path,
            target.size
        );
    }

    let mut steps = vec![
        Step::ReplicateTable {
            source: source.path.clone(),
            target: target.path.clone(),
        },
        Step::RandomizeGuids { target: target.path.clone() },
    ];

    let mut arrays: Vec<String> = Vec::new();
    let mut created = false;
    for p in source.partitions.iter() {
        let n = partition_number(&source.path, &p.path).ok_or_else(|| {
            anyhow!("cannot number partition {} of {}", p.path, source.path)
        })?;
        let to = partition_path(&target.path, n);

        if let Some(array) = &p.array {
            steps.push(Step::AddToArray {
                array: array.clone(),
                partition: to,
            });
            if !arrays.contains(array) {
                arrays.push(array.clone());
            }
            continue;
        }

        if p.fstype.as_deref() == Some("swap") {
            steps.push(Step::MakeSwap { partition: to });
            continue;
        }

        let Some(mp) = &p.mountpoint else {
            steps.push(Step::RawCopy { from: p.path.clone(), to });
            continue;
        };
        if RAW_COPY_MOUNTS.contains(&mp.as_str()) {
            steps.push(Step::RawCopy { from: p.path.clone(), to });
            continue;
        }

        let fstype = p.fstype.as_deref().unwrap_or("unknown");
        if !CLONE_FSTYPES.contains(&fstype) {
            bail!("{} is mounted at {} with a {} filesystem, which cannot \
                be cloned into an array", p.path, mp, fstype);
        }

        let array = format!("/dev/md/system{}", n);
        steps.push(Step::CreateDegraded {
            array: array.clone(),
            partition: to,
        });
        steps.push(Step::CloneInto {
            from: p.path.clone(),
            array: array.clone(),
        });
        steps.push(Step::AddToArray {
            array: array.clone(),
            partition: p.path.clone(),
        });
        arrays.push(array);
        created = true;
    }

    if created {
        steps.push(Step::PersistArrays);
    }
    if !arrays.is_empty() {
        steps.push(Step::WaitResync { arrays });
    }

    Ok(steps)
}

/**
 * Pull the filesystem size in bytes out of "dumpe2fs -h" output.
 */
pub fn ext_fs_bytes(dumpe2fs: &str) -> Option<u64> {
    let field = |name: &str| {
        dumpe2fs.lines().find_map(|l| {
            let (k, v) = l.split_once(':')?;
            if k.trim() == name {
                v.trim().parse::<u64>().ok()
            } else {
                None
            }
        })
    };

    Some(field("Block count")? * field("Block size")?)
}

pub fn dd_args(from: &str, to: &str, bytes: Option<u64>) -> Vec<String> {
    let mut args = vec![
        format!("if={}", from),
        format!("of={}", to),
        "bs=4M".to_string(),
        "conv=fsync".to_string(),
    ];
    if let Some(n) = bytes {
        args.push("iflag=count_bytes".to_string());
        args.push(format!("count={}", n));
    }
    args
}

/**
 * Copy a filesystem into an array that is a little smaller than the partition
 * it came from.  Only the blocks the filesystem uses are copied, and the copy
 * is refused if they would not fit.
 */
fn clone_into(host: &Host, from: &str, array: &str) -> Result<()> {
    if host.dry_run() {
        return host.run(DD, &dd_args(from, array, None));
    }

    let fs = ext_fs_bytes(&host.read(DUMPE2FS, &["-h", from])?)
        .ok_or_else(|| anyhow!("no filesystem size for {}", from))?;
    let room: u64 = host
        .read(BLOCKDEV, &["--getsize64", array])?
        .trim()
        .parse()
        .with_context(|| format!("size of {}", array))?;
    if fs > room {
        bail!("the filesystem on {} is {} bytes but {} only holds {}; \
            shrink it with resize2fs first", from, fs, array, room);
    }

    host.run(DD, &dd_args(from, array, Some(fs)))
}

fn execute(host: &Host, step: &Step) -> Result<()> {
    match step {
        Step::ReplicateTable { source, target } => {
            host.run(SGDISK, &[format!("--replicate={}", target), source.clone()])?;
            host.run_soft(PARTPROBE, &[target.as_str()]);
            Ok(())
        }
        Step::RandomizeGuids { target } => {
            host.run(SGDISK, &["--randomize-guids", target.as_str()])
        }
        Step::AddToArray { array, partition } => mdadm_add(host, array, partition),
        Step::RawCopy { from, to } => host.run(DD, &dd_args(from, to, None)),
        Step::CreateDegraded { array, partition } => {
            mdadm_create(host, array, &[partition.as_str()])
        }
        Step::CloneInto { from, array } => clone_into(host, from, array),
        Step::MakeSwap { partition } => host.run(MKSWAP, &[partition.as_str()]),
        Step::PersistArrays => persist_arrays(host),
        Step::WaitResync { arrays } => {
            if host.dry_run() {
                info!(host.log(), "dry-run: {}", step);
                return Ok(());
            }
            wait_for_resync(host.log(), arrays)
        }
    }
}

pub fn run(host: &Host, source: &str, target: &str) -> Result<()> {
    let log = host.log();

    let drives = inventory(host)?;
    let find = |p: &str| {
        drives
            .iter()
            .find(|d| d.path == p || d.name == p.trim_start_matches("/dev/"))
            .ok_or_else(|| anyhow!("no such drive: {}", p))
    };
    let src = find(source)?;
    let tgt = find(target)?;

    let steps = mirror_plan(src, tgt)?;
    info!(log, "plan to mirror {} onto {}:", src.path, tgt.path);
    for (i, s) in steps.iter().enumerate() {
        info!(log, "  {}. {}", i + 1, s);
    }

    if !host.confirm(&format!(
        "Overwrite {} ({}, {}) with a copy of {}?",
        tgt.path,
        tgt.size_human(),
        tgt.model.as_deref().unwrap_or("unknown model"),
        src.path
    ))? {
        bail!("system drive mirroring cancelled");
    }

    for s in steps.iter() {
        info!(log, "{}", s);
        execute(host, s).with_context(|| format!("{}", s))?;
    }

    info!(log, "ok, {} now mirrors {}", tgt.path, src.path);
    Ok(())
}
