/*
 * Copyright 2024 Oxide Computer Company
 */

use serde::Deserialize;

use crate::common::*;
use crate::host::Host;
use crate::LSBLK;

/**
 * A disk with anything mounted at one of these locations (even indirectly,
 * e.g., through an md array) is part of the running system.
 */
pub const SYSTEM_MOUNTS: &[&str] =
    &["/", "/boot", "/boot/efi", "/usr", "/var", "[SWAP]"];

const LSBLK_COLUMNS: &str = "NAME,PATH,SIZE,TYPE,FSTYPE,LABEL,MOUNTPOINT,MODEL";

/*
 * Older lsblk releases render every column as a string in JSON output, even
 * with -b; newer ones emit numbers.
 */
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
enum LsblkSize {
    Bytes(u64),
    Text(String),
}

impl LsblkSize {
    fn bytes(&self) -> Result<u64> {
        match self {
            LsblkSize::Bytes(b) => Ok(*b),
            LsblkSize::Text(t) => t
                .trim()
                .parse()
                .map_err(|e| anyhow!("lsblk size {:?}: {}", t, e)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Lsblk {
    blockdevices: Vec<BlockDevice>,
}

#[derive(Debug, Deserialize, Clone)]
struct BlockDevice {
    name: String,
    path: Option<String>,
    size: Option<LsblkSize>,
    #[serde(rename = "type")]
    type_: String,
    fstype: Option<String>,
    label: Option<String>,
    mountpoint: Option<String>,
    model: Option<String>,
    #[serde(default)]
    children: Vec<BlockDevice>,
}

impl BlockDevice {
    fn path(&self) -> String {
        self.path.clone().unwrap_or_else(|| format!("/dev/{}", self.name))
    }

    /**
     * This device and everything stacked on top of it, in depth-first order.
     */
    fn walk(&self) -> Vec<&BlockDevice> {
        let mut out = vec![self];
        for c in self.children.iter() {
            out.extend(c.walk());
        }
        out
    }

    fn mountpoints(&self) -> Vec<String> {
        self.walk()
            .iter()
            .filter_map(|d| d.mountpoint.as_deref())
            .filter(|m| !m.is_empty())
            .map(|m| m.to_string())
            .collect()
    }

    fn md_child(&self) -> Option<&BlockDevice> {
        self.children.iter().find(|c| c.type_.starts_with("raid"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Raid,
    Zfs,
}

/**
 * Membership of an existing md array or ZFS pool.  For md, the name is the
 * array device (e.g., "/dev/md127"); for ZFS, it is the pool name.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub kind: MemberKind,
    pub name: String,
    pub mountpoint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveClass {
    System,
    Member(Membership),
    Mounted,
    Available,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub path: String,
    pub fstype: Option<String>,
    pub mountpoint: Option<String>,
    pub array: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Drive {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub model: Option<String>,
    pub partitions: Vec<Partition>,
    pub class: DriveClass,
}

impl Drive {
    pub fn size_human(&self) -> String {
        human_size(self.size)
    }

    pub fn membership(&self) -> Option<&Membership> {
        match &self.class {
            DriveClass::Member(m) => Some(m),
            _ => None,
        }
    }
}

/**
 * Render a byte count the way lsblk does, in binary units.
 */
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "K", "M", "G", "T", "P"];

    let mut v = bytes as f64;
    let mut u = 0;
    while v >= 1024.0 && u < UNITS.len() - 1 {
        v /= 1024.0;
        u += 1;
    }

    if v.fract() == 0.0 {
        format!("{}{}", v as u64, UNITS[u])
    } else {
        format!("{:.1}{}", v, UNITS[u])
    }
}

/**
 * Decide what a disk is currently used for.  The checks are made in priority
 * order: a disk that holds part of the running system is never anything else,
 * and a disk that belongs to an existing array or pool is reported as such even
 * if that array is mounted somewhere.
 */
fn classify(dev: &BlockDevice) -> DriveClass {
    let mounts = dev.mountpoints();
    if mounts.iter().any(|m| SYSTEM_MOUNTS.contains(&m.as_str())) {
        return DriveClass::System;
    }

    for d in dev.walk() {
        match d.fstype.as_deref() {
            Some("linux_raid_member") => {
                let md = d.md_child();
                let name = md
                    .map(|md| md.path())
                    .or_else(|| d.label.clone())
                    .unwrap_or_else(|| d.path());
                let mountpoint = md.and_then(|md| {
                    md.mountpoints().into_iter().next()
                });
                return DriveClass::Member(Membership {
                    kind: MemberKind::Raid,
                    name,
                    mountpoint,
                });
            }
            Some("zfs_member") => {
                return DriveClass::Member(Membership {
                    kind: MemberKind::Zfs,
                    name: d.label.clone().unwrap_or_else(|| "unknown".into()),
                    mountpoint: None,
                });
            }
            _ => (),
        }
    }

    if !mounts.is_empty() {
        DriveClass::Mounted
    } else {
        DriveClass::Available
    }
}

pub fn parse_lsblk(input: &str) -> Result<Vec<Drive>> {
    let l: Lsblk = serde_json::from_str(input).context("parsing lsblk JSON")?;

    let mut out = Vec::new();
    for dev in l.blockdevices.iter() {
        if dev.type_ != "disk" || dev.name.starts_with("zram") {
            continue;
        }

        let size = match &dev.size {
            Some(s) => s.bytes()?,
            None => 0,
        };
        if size == 0 {
            continue;
        }

        let partitions = dev
            .children
            .iter()
            .filter(|c| c.type_ == "part")
            .map(|c| Partition {
                path: c.path(),
                fstype: c.fstype.clone(),
                mountpoint: c.mountpoint.clone().filter(|m| !m.is_empty()),
                array: c.md_child().map(|md| md.path()),
            })
            .collect();

        out.push(Drive {
            name: dev.name.clone(),
            path: dev.path(),
            size,
            model: dev.model.as_ref().map(|m| m.trim().to_string()),
            partitions,
            class: classify(dev),
        });
    }

    Ok(out)
}

pub fn inventory(host: &Host) -> Result<Vec<Drive>> {
    let out = host.read(LSBLK, &["-J", "-b", "-o", LSBLK_COLUMNS])?;
    parse_lsblk(&out)
}

/**
 * One or two drives of identical size that will become one mirror (or, for an
 * odd drive out, a single-drive pool).
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorGroup {
    pub size: u64,
    pub drives: Vec<Drive>,
}

impl MirrorGroup {
    pub fn is_mirror(&self) -> bool {
        self.drives.len() == 2
    }

    pub fn paths(&self) -> Vec<&str> {
        self.drives.iter().map(|d| d.path.as_str()).collect()
    }

    /**
     * If every drive in the group already belongs to the same array or pool,
     * return that membership.
     */
    pub fn shared_membership(&self) -> Option<&Membership> {
        let first = self.drives.first()?.membership()?;
        if self.drives.iter().all(|d| d.membership() == Some(first)) {
            Some(first)
        } else {
            None
        }
    }

    pub fn is_available(&self) -> bool {
        self.drives.iter().all(|d| d.class == DriveClass::Available)
    }
}

/**
 * Pair up drives of identical size.  Only available drives are considered,
 * plus members of existing arrays and pools if include_members is set.  Pairs
 * are formed in enumeration order within each size, and sizes are visited in
 * the order they were first seen.
 */
pub fn group_mirrors(drives: &[Drive], include_members: bool) -> Vec<MirrorGroup> {
    let mut buckets: Vec<(u64, Vec<&Drive>)> = Vec::new();

    for d in drives {
        let eligible = match d.class {
            DriveClass::Available => true,
            DriveClass::Member(_) => include_members,
            DriveClass::System | DriveClass::Mounted => false,
        };
        if !eligible {
            continue;
        }

        match buckets.iter_mut().find(|(size, _)| *size == d.size) {
            Some((_, b)) => b.push(d),
            None => buckets.push((d.size, vec![d])),
        }
    }

    buckets
        .into_iter()
        .flat_map(|(size, b)| {
            b.chunks(2)
                .map(|c| MirrorGroup {
                    size,
                    drives: c.iter().map(|d| (*d).clone()).collect(),
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    fn lsblk0() -> String {
        r#"{
            "blockdevices": [
                {"name": "nvme0n1", "path": "/dev/nvme0n1", "size": 512110190592,
                 "type": "disk", "fstype": null, "label": null, "mountpoint": null,
                 "model": "SAMSUNG MZVLB512HBJQ-00000 ",
                 "children": [
                    {"name": "nvme0n1p1", "path": "/dev/nvme0n1p1", "size": 536870912,
                     "type": "part", "fstype": "vfat", "label": null,
                     "mountpoint": "/boot/efi", "model": null},
                    {"name": "nvme0n1p2", "path": "/dev/nvme0n1p2", "size": 511571214336,
                     "type": "part", "fstype": "linux_raid_member", "label": "rescue:0",
                     "mountpoint": null, "model": null,
                     "children": [
                        {"name": "md0", "path": "/dev/md0", "size": 511436996608,
                         "type": "raid1", "fstype": "ext4", "label": null,
                         "mountpoint": "/", "model": null}
                     ]}
                 ]},
                {"name": "sda", "path": "/dev/sda", "size": 4000787030016,
                 "type": "disk", "fstype": null, "label": null, "mountpoint": null,
                 "model": "HGST HUS726T4TALA6L4"},
                {"name": "sdb", "path": "/dev/sdb", "size": 4000787030016,
                 "type": "disk", "fstype": null, "label": null, "mountpoint": null,
                 "model": "HGST HUS726T4TALA6L4"},
                {"name": "sdc", "path": "/dev/sdc", "size": 4000787030016,
                 "type": "disk", "fstype": null, "label": null, "mountpoint": null,
                 "model": "HGST HUS726T4TALA6L4",
                 "children": [
                    {"name": "sdc1", "path": "/dev/sdc1", "size": 4000776716288,
                     "type": "part", "fstype": "zfs_member", "label": "tank",
                     "mountpoint": null, "model": null}
                 ]},
                {"name": "sdd", "path": "/dev/sdd", "size": "2000398934016",
                 "type": "disk", "fstype": null, "label": null, "mountpoint": null,
                 "model": null,
                 "children": [
                    {"name": "sdd1", "path": "/dev/sdd1", "size": "2000397868544",
                     "type": "part", "fstype": "ext4", "label": null,
                     "mountpoint": "/srv", "model": null}
                 ]},
                {"name": "sde", "path": "/dev/sde", "size": 2000398934016,
                 "type": "disk", "fstype": null, "label": null, "mountpoint": null,
                 "model": null},
                {"name": "sr0", "path": "/dev/sr0", "size": 1073741312,
                 "type": "rom", "fstype": null, "label": null, "mountpoint": null,
                 "model": "DVD"},
                {"name": "zram0", "path": "/dev/zram0", "size": 4294967296,
                 "type": "disk", "fstype": null, "label": null,
                 "mountpoint": "[SWAP]", "model": null}
            ]
        }"#
        .to_string()
    }

    fn drive(name: &str, size: u64, class: DriveClass) -> Drive {
        Drive {
            name: name.to_string(),
            path: format!("/dev/{}", name),
            size,
            model: None,
            partitions: Vec::new(),
            class,
        }
    }

    #[test]
    fn parse_and_classify() -> Result<()> {
        let drives = parse_lsblk(&lsblk0())?;
        let got: Vec<(&str, &DriveClass)> =
            drives.iter().map(|d| (d.name.as_str(), &d.class)).collect();

        assert_eq!(
            got,
            vec![
                ("nvme0n1", &DriveClass::System),
                ("sda", &DriveClass::Available),
                ("sdb", &DriveClass::Available),
                (
                    "sdc",
                    &DriveClass::Member(Membership {
                        kind: MemberKind::Zfs,
                        name: "tank".into(),
                        mountpoint: None,
                    })
                ),
                ("sdd", &DriveClass::Mounted),
                ("sde", &DriveClass::Available),
            ]
        );

        assert_eq!(drives[0].model.as_deref(), Some("SAMSUNG MZVLB512HBJQ-00000"));
        assert_eq!(
            drives[0].partitions[1],
            Partition {
                path: "/dev/nvme0n1p2".into(),
                fstype: Some("linux_raid_member".into()),
                mountpoint: None,
                array: Some("/dev/md0".into()),
            }
        );
        assert_eq!(drives[4].size, 2000398934016);
        Ok(())
    }

    #[test]
    fn raid_member_not_mounted_at_system_path() -> Result<()> {
        let input = r#"{"blockdevices": [
            {"name": "sdf", "path": "/dev/sdf", "size": 1000, "type": "disk",
             "fstype": "linux_raid_member", "label": "host:data0",
             "mountpoint": null, "model": null,
             "children": [
                {"name": "md127", "path": "/dev/md127", "size": 990,
                 "type": "raid1", "fstype": "ext4", "label": null,
                 "mountpoint": "/mnt/data0", "model": null}
             ]}
        ]}"#;

        let drives = parse_lsblk(input)?;
        assert_eq!(
            drives[0].class,
            DriveClass::Member(Membership {
                kind: MemberKind::Raid,
                name: "/dev/md127".into(),
                mountpoint: Some("/mnt/data0".into()),
            })
        );
        Ok(())
    }

    #[test]
    fn group_lsblk0() -> Result<()> {
        let drives = parse_lsblk(&lsblk0())?;

        let groups = group_mirrors(&drives, false);
        let got: Vec<Vec<&str>> = groups.iter().map(|g| g.paths()).collect();
        assert_eq!(got, vec![vec!["/dev/sda", "/dev/sdb"], vec!["/dev/sde"]]);
        assert!(groups[0].is_mirror());
        assert!(groups[0].is_available());

        /*
         * Including pool members pulls in the third 4TB drive, which is left
         * over after the first pair:
         */
        let groups = group_mirrors(&drives, true);
        let got: Vec<Vec<&str>> = groups.iter().map(|g| g.paths()).collect();
        assert_eq!(
            got,
            vec![
                vec!["/dev/sda", "/dev/sdb"],
                vec!["/dev/sdc"],
                vec!["/dev/sde"],
            ]
        );
        assert_eq!(groups[1].shared_membership().map(|m| m.name.as_str()),
            Some("tank"));
        Ok(())
    }

    #[test]
    fn shared_membership_requires_same_pool() {
        let m = |n: &str| {
            DriveClass::Member(Membership {
                kind: MemberKind::Zfs,
                name: n.into(),
                mountpoint: None,
            })
        };
        let same = MirrorGroup {
            size: 10,
            drives: vec![drive("sda", 10, m("tank")), drive("sdb", 10, m("tank"))],
        };
        assert!(same.shared_membership().is_some());

        let different = MirrorGroup {
            size: 10,
            drives: vec![drive("sda", 10, m("tank")), drive("sdb", 10, m("data"))],
        };
        assert!(different.shared_membership().is_none());

        let mixed = MirrorGroup {
            size: 10,
            drives: vec![
                drive("sda", 10, m("tank")),
                drive("sdb", 10, DriveClass::Available),
            ],
        };
        assert!(mixed.shared_membership().is_none());
        assert!(!mixed.is_available());
    }

    #[test]
    fn sizes() {
        assert_eq!(human_size(512), "512B");
        assert_eq!(human_size(500 * 1024 * 1024 * 1024), "500G");
        assert_eq!(human_size(512110190592), "476.9G");
        assert_eq!(human_size(4000787030016), "3.6T");
    }

    proptest! {
        #[test]
        fn grouping_invariants(sizes in prop::collection::vec(1u64..4, 0..12)) {
            let drives: Vec<Drive> = sizes
                .iter()
                .enumerate()
                .map(|(i, s)| drive(&format!("sd{}", i), *s, DriveClass::Available))
                .collect();

            let groups = group_mirrors(&drives, false);

            for g in groups.iter() {
                prop_assert!(g.drives.len() == 1 || g.drives.len() == 2);
                prop_assert!(g.drives.iter().all(|d| d.size == g.size));
            }

            for size in 1u64..4 {
                let n = sizes.iter().filter(|s| **s == size).count();
                let pairs = groups
                    .iter()
                    .filter(|g| g.size == size && g.is_mirror())
                    .count();
                let singles = groups
                    .iter()
                    .filter(|g| g.size == size && !g.is_mirror())
                    .count();
                prop_assert_eq!(pairs, n / 2);
                prop_assert_eq!(singles, n % 2);
            }

            /*
             * Within a size, drives are paired in enumeration order:
             */
            for size in 1u64..4 {
                let expect: Vec<&str> = drives
                    .iter()
                    .filter(|d| d.size == size)
                    .map(|d| d.path.as_str())
                    .collect();
                let got: Vec<&str> = groups
                    .iter()
                    .filter(|g| g.size == size)
                    .flat_map(|g| g.paths())
                    .collect();
                prop_assert_eq!(expect, got);
            }
        }

        #[test]
        fn unavailable_drives_never_grouped(n in 0usize..8) {
            let drives: Vec<Drive> = (0..n)
                .map(|i| {
                    let class = if i % 2 == 0 {
                        DriveClass::System
                    } else {
                        DriveClass::Mounted
                    };
                    drive(&format!("sd{}", i), 100, class)
                })
                .collect();
            prop_assert!(group_mirrors(&drives, true).is_empty());
        }
    }
}
