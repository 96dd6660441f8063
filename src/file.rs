/*
 * Copyright 2024 Oxide Computer Company
 */

use crate::common::*;
use std::fs::{DirBuilder, File};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};

pub fn ensure_dir(log: &Logger, path: &str) -> Result<()> {
    ensure_dir_mode(log, path, 0o700)
}

pub fn ensure_dir_mode(log: &Logger, path: &str, mode: u32) -> Result<()> {
    if !exists_dir(path)? {
        info!(log, "mkdir {}", path);
        DirBuilder::new().mode(mode).recursive(true).create(path)?;
    }
    Ok(())
}

pub fn exists_dir(p: &str) -> Result<bool> {
    let md = match std::fs::metadata(p) {
        Ok(md) => md,
        Err(e) => match e.kind() {
            ErrorKind::NotFound => return Ok(false),
            _ => bail!("checking {}: {}", p, e),
        },
    };

    if !md.is_dir() {
        bail!("\"{}\" exists but is not a directory", p);
    }

    Ok(true)
}

pub fn exists_file(p: &str) -> Result<bool> {
    let md = match std::fs::metadata(p) {
        Ok(md) => md,
        Err(e) => match e.kind() {
            ErrorKind::NotFound => return Ok(false),
            _ => bail!("checking {}: {}", p, e),
        },
    };

    if !md.is_file() {
        bail!("\"{}\" exists but is not a file", p);
    }

    Ok(true)
}

pub fn read_lines(p: &str) -> Result<Option<Vec<String>>> {
    Ok(read_file(p)?.map(|data| data.lines().map(|a| a.to_string()).collect()))
}

pub fn read_lines_maybe(p: &str) -> Result<Vec<String>> {
    Ok(match read_lines(p)? {
        None => Vec::new(),
        Some(l) => l,
    })
}

pub fn read_file(p: &str) -> Result<Option<String>> {
    let f = match File::open(p) {
        Ok(f) => f,
        Err(e) => {
            match e.kind() {
                std::io::ErrorKind::NotFound => return Ok(None),
                _ => bail!("open \"{}\": {}", p, e),
            };
        }
    };
    let mut r = std::io::BufReader::new(f);
    let mut out = String::new();
    r.read_to_string(&mut out)?;
    Ok(Some(out))
}

pub fn write_file(p: &str, data: &str) -> Result<()> {
    let f = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(p)
        .with_context(|| format!("open \"{}\" for write", p))?;
    let mut w = std::io::BufWriter::new(f);
    w.write_all(data.as_bytes())?;
    w.flush()?;
    Ok(())
}

pub fn join_lines<L: AsRef<str>>(lines: &[L]) -> String {
    let mut out = String::new();
    for l in lines {
        out.push_str(l.as_ref());
        out.push('\n');
    }
    out
}

pub fn set_mode(p: &str, mode: u32) -> Result<()> {
    let mut perms = std::fs::metadata(p)?.permissions();
    perms.set_mode(mode);
    std::fs::set_permissions(p, perms)?;
    Ok(())
}

pub fn timestamp() -> String {
    chrono::Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/**
 * Copy a file into the backup directory with a timestamp suffix, e.g.,
 * "/etc/network/interfaces" becomes "<dir>/interfaces.20240102_030405".
 * Returns None if there was no file to back up.
 */
pub fn backup_file(log: &Logger, src: &str, dir: &str) -> Result<Option<PathBuf>> {
    if !exists_file(src)? {
        info!(log, "no {} to back up", src);
        return Ok(None);
    }

    ensure_dir(log, dir)?;

    let base = Path::new(src)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("backup source {:?} has no file name", src))?;
    let dst = Path::new(dir).join(format!("{}.{}", base, timestamp()));

    std::fs::copy(src, &dst)
        .with_context(|| format!("copy {} -> {}", src, dst.display()))?;
    info!(log, "backed up {} to {}", src, dst.display());

    Ok(Some(dst))
}

/**
 * Locate the most recent timestamped backup of a file created by
 * backup_file().  The timestamp format sorts lexically.
 */
pub fn latest_backup(dir: &str, base: &str) -> Result<Option<PathBuf>> {
    if !exists_dir(dir)? {
        return Ok(None);
    }

    let prefix = format!("{}.", base);
    let mut found = Vec::new();
    for ent in std::fs::read_dir(dir)? {
        let ent = ent?;
        if let Some(name) = ent.file_name().to_str() {
            let Some(ts) = name.strip_prefix(&prefix) else {
                continue;
            };
            if !ts.is_empty() && ts.chars().all(|c| c.is_ascii_digit() || c == '_')
            {
                found.push(ent.path());
            }
        }
    }

    found.sort();
    Ok(found.pop())
}
