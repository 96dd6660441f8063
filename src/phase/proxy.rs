/*
 * Copyright 2024 Oxide Computer Company
 */

use std::path::Path;
use std::time::Duration;

use super::prelude::*;

const CADDYFILE: &str = "/etc/caddy/Caddyfile";
const CADDY_BACKUP_DIR: &str = "/root/caddy-backups";
const PVE_UPSTREAM: &str = "https://127.0.0.1:8006";

pub struct ProxyOpts {
    pub domain: Option<String>,
    pub email: Option<String>,
    pub retries: Option<u32>,
}

pub fn render_caddyfile(domain: &str, email: &str) -> String {
    format!(
        "# Managed by pvebootstrap.\n\
        {{\n\
        \temail {email}\n\
        }}\n\
        \n\
        {domain} {{\n\
        \treverse_proxy {up} {{\n\
        \t\ttransport http {{\n\
        \t\t\ttls_insecure_skip_verify\n\
        \t\t}}\n\
        \t}}\n\
        }}\n",
        email = email,
        domain = domain,
        up = PVE_UPSTREAM,
    )
}

fn install(host: &Host) -> Result<()> {
    if exists_file(CADDY)? {
        return Ok(());
    }

    info!(host.log(), "installing caddy");
    host.run(APT_GET, &["update"])?;
    host.run(APT_GET, &["install", "-y", "caddy"])
}

pub fn run(host: &Host, cfg: &Config, opts: &ProxyOpts) -> Result<()> {
    let log = host.log();

    let domain = opts
        .domain
        .clone()
        .or_else(|| cfg.domain.clone())
        .ok_or_else(|| anyhow!("no domain; set DOMAIN or use --domain"))?;
    let email = opts
        .email
        .clone()
        .or_else(|| cfg.email.clone())
        .ok_or_else(|| anyhow!("no ACME email; set EMAIL or use --email"))?;

    install(host)?;

    let text = render_caddyfile(&domain, &email);
    let existing = read_file(CADDYFILE)?;
    if existing.as_deref() == Some(text.as_str()) {
        info!(log, "{} is already up to date", CADDYFILE);
    } else {
        let backup = if host.dry_run() {
            None
        } else {
            backup_file(log, CADDYFILE, CADDY_BACKUP_DIR)?
        };
        host.ensure_dir("/etc/caddy")?;
        host.write_file(CADDYFILE, &text)?;

        if let Err(e) = host.run(
            CADDY,
            &["validate", "--config", CADDYFILE, "--adapter", "caddyfile"],
        ) {
            undo_write(host, CADDYFILE, existing.is_some(), backup.as_deref())?;
            return Err(e.context("generated Caddyfile did not validate"));
        }
    }

    host.run_soft(SYSTEMCTL, &["enable", "caddy"]);
    if !host.run_soft(SYSTEMCTL, &["reload", "caddy"]) {
        host.run_soft(SYSTEMCTL, &["restart", "caddy"]);
    }

    if host.dry_run() {
        info!(log, "dry-run: would wait for a certificate for {}", domain);
        return Ok(());
    }

    let retries = opts.retries.unwrap_or(cfg.cert_retries);
    if wait_for_certificate(log, &domain, retries, cfg.cert_interval_secs)? {
        info!(log, "ok, https://{}/ is serving the Proxmox UI", domain);
    } else {
        warn!(log, "no certificate for {} after {} attempts; check that DNS \
            points here and ports 80/443 are open", domain, retries);
    }
    Ok(())
}

/**
 * Put back what was at the path before a rejected write: the backup if there
 * is one, or nothing if the file did not exist.
 */
fn undo_write(
    host: &Host,
    path: &str,
    existed: bool,
    backup: Option<&Path>,
) -> Result<()> {
    let log = host.log();

    if let Some(b) = backup.and_then(|b| b.to_str()) {
        warn!(log, "restoring {} from {}", path, b);
        host.copy(b, path)
    } else if !existed {
        warn!(log, "removing invalid {}", path);
        host.remove(path)
    } else {
        warn!(log, "no backup of {}; leaving it in place", path);
        Ok(())
    }
}

/**
 * Poll the site until it answers over HTTPS with a certificate the system
 * trusts, i.e., until Caddy has obtained one from the ACME CA.
 */
fn wait_for_certificate(
    log: &Logger,
    domain: &str,
    retries: u32,
    interval_secs: u64,
) -> Result<bool> {
    let url = format!("https://{}/", domain);

    let cb = reqwest::blocking::ClientBuilder::new()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(10))
        .build()?;

    for attempt in 1..=retries {
        match cb.get(&url).send() {
            Ok(res) => {
                info!(log, "{}: status {}", url, res.status());
                return Ok(true);
            }
            Err(e) => {
                info!(log, "waiting for certificate ({}/{}): {}", attempt,
                    retries, e);
            }
        }

        sleep(interval_secs * 1000);
    }

    Ok(false)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn caddyfile() {
        let text = render_caddyfile("pve.example.com", "admin@example.com");
        assert!(text.contains("\temail admin@example.com\n"));
        assert!(text.contains("pve.example.com {\n"));
        assert!(text.contains("reverse_proxy https://127.0.0.1:8006 {"));
        assert!(text.contains("tls_insecure_skip_verify"));

        let opens = text.matches('{').count();
        let closes = text.matches('}').count();
        assert_eq!(opens, closes);
    }

    #[test]
    fn undo_rejected_write() -> Result<()> {
        let log = init_log();
        let dir = tempfile::tempdir()?;
        let host = Host::new(&log, false, false);
        let path = dir.path().join("Caddyfile");
        let p = path.to_str().unwrap();

        std::fs::write(p, "broken {\n")?;
        undo_write(&host, p, false, None)?;
        assert!(!path.exists());

        let backup = dir.path().join("Caddyfile.bak");
        std::fs::write(&backup, "good\n")?;
        std::fs::write(p, "broken {\n")?;
        undo_write(&host, p, true, Some(backup.as_path()))?;
        assert_eq!(std::fs::read_to_string(p)?, "good\n");
        Ok(())
    }
}
