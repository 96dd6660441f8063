/*
 * Copyright 2024 Oxide Computer Company
 */

pub mod firewall;
pub mod mirror;
pub mod network;
pub mod proxy;
pub mod storage;
pub mod vm;

mod prelude {
    pub(crate) use crate::common::*;
    pub(crate) use crate::config::Config;
    pub(crate) use crate::file::{
        backup_file, exists_dir, exists_file, latest_backup, read_file,
        read_lines_maybe, set_mode,
    };
    pub(crate) use crate::host::Host;
    pub(crate) use crate::{
        APT_GET, BLKID, BLOCKDEV, CADDY, DD, DUMPE2FS, GUNZIP, IFUP, IP,
        MKFS_EXT4, MKSWAP, MOUNT, PARTPROBE, PVESH, PVESM, PVE_FIREWALL, QM,
        SGDISK, SYSCTL, SYSTEMCTL, UFW, WIPEFS,
    };
}
