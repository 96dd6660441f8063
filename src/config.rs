/*
 * Copyright 2024 Oxide Computer Company
 */

use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::common::*;
use crate::file::read_file;

pub const DEFAULT_PREFIX_LEN: u32 = 24;

/**
 * Netmasks with contiguous bits, indexed by prefix length.
 */
const NETMASKS: [&str; 33] = [
    "0.0.0.0",
    "128.0.0.0",
    "192.0.0.0",
    "224.0.0.0",
    "240.0.0.0",
    "248.0.0.0",
    "252.0.0.0",
    "254.0.0.0",
    "255.0.0.0",
    "255.128.0.0",
    "255.192.0.0",
    "255.224.0.0",
    "255.240.0.0",
    "255.248.0.0",
    "255.252.0.0",
    "255.254.0.0",
    "255.255.0.0",
    "255.255.128.0",
    "255.255.192.0",
    "255.255.224.0",
    "255.255.240.0",
    "255.255.248.0",
    "255.255.252.0",
    "255.255.254.0",
    "255.255.255.0",
    "255.255.255.128",
    "255.255.255.192",
    "255.255.255.224",
    "255.255.255.240",
    "255.255.255.248",
    "255.255.255.252",
    "255.255.255.254",
    "255.255.255.255",
];

pub fn netmask_to_prefix_len(nm: Ipv4Addr) -> Result<u32> {
    let bits = u32::from(nm);
    let len = bits.leading_ones();
    if bits.checked_shl(len).unwrap_or(0) != 0 {
        bail!("netmask {} is not contiguous", nm);
    }
    Ok(len)
}

/**
 * Look up the prefix length for a dotted-quad netmask.  A bare prefix length
 * (e.g., "26" or "/26") is also accepted.
 */
pub fn netmask_to_cidr(netmask: &str) -> Option<u32> {
    let nm = netmask.trim();
    if let Some(i) = NETMASKS.iter().position(|m| *m == nm) {
        return Some(i as u32);
    }
    if let Ok(addr) = nm.parse::<Ipv4Addr>() {
        return netmask_to_prefix_len(addr).ok();
    }

    match nm.trim_start_matches('/').parse::<u32>() {
        Ok(n) if n <= 32 => Some(n),
        _ => None,
    }
}

/**
 * Convert a MAC address to the canonical lower case, colon-separated,
 * zero-padded form used in Proxmox VM configuration.
 */
pub fn mac_sanitise(input: &str) -> Option<String> {
    let octets: Vec<&str> =
        input.trim().split(|c: char| c == ':' || c == '-').collect();
    if octets.len() != 6 {
        return None;
    }

    let mut out = String::new();
    for octet in octets {
        if octet.is_empty()
            || octet.len() > 2
            || !octet.chars().all(|c| c.is_ascii_hexdigit())
        {
            return None;
        }
        if !out.is_empty() {
            out.push(':');
        }
        if octet.len() < 2 {
            /*
             * Use a leading zero to pad any single-digit octets:
             */
            out.push('0');
        }
        out.push_str(&octet.to_ascii_lowercase());
    }

    Some(out)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdditionalIp {
    pub ip: Ipv4Addr,
    pub mac: Option<String>,
    pub gateway: Ipv4Addr,
    pub netmask: String,
    pub prefix: u32,
}

impl AdditionalIp {
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.ip, self.prefix)
    }
}

#[derive(Default)]
struct AdditionalIpFields {
    ip: Option<String>,
    mac: Option<String>,
    gateway: Option<String>,
    netmask: Option<String>,
}

impl AdditionalIpFields {
    fn build(self, log: &Logger, source: &str) -> Option<AdditionalIp> {
        let (Some(ip), Some(gateway), Some(netmask)) =
            (self.ip, self.gateway, self.netmask)
        else {
            warn!(log, "{}: IP, GATEWAY and NETMASK are required, skipping",
                source);
            return None;
        };

        let Ok(ip) = ip.parse::<Ipv4Addr>() else {
            warn!(log, "{}: invalid IP {:?}, skipping", source, ip);
            return None;
        };
        let Ok(gateway) = gateway.parse::<Ipv4Addr>() else {
            warn!(log, "{}: invalid GATEWAY {:?}, skipping", source, gateway);
            return None;
        };

        let mac = match self.mac.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(m) => match mac_sanitise(m) {
                Some(m) => Some(m),
                None => {
                    warn!(log, "{}: invalid MAC {:?}, skipping", source, m);
                    return None;
                }
            },
        };

        let prefix = match netmask_to_cidr(&netmask) {
            Some(p) => p,
            None => {
                warn!(log, "{}: unrecognised NETMASK {:?}, assuming /{}",
                    source, netmask, DEFAULT_PREFIX_LEN);
                DEFAULT_PREFIX_LEN
            }
        };

        Some(AdditionalIp { ip, mac, gateway, netmask, prefix })
    }
}

fn unquote(v: &str) -> &str {
    let v = v.trim();
    for q in ['"', '\''] {
        if v.len() >= 2 && v.starts_with(q) && v.ends_with(q) {
            return &v[1..v.len() - 1];
        }
    }
    v
}

/**
 * Parse the additional IP file format: one address per line, written as
 * whitespace-separated KEY=VALUE terms, e.g.,
 *
 *      IP=203.0.113.10 MAC=00:50:56:00:01:02 GATEWAY=203.0.113.1 NETMASK=255.255.255.192
 *
 * Blank lines and lines starting with "#" are ignored.  Lines that lack an IP,
 * gateway or netmask are skipped with a warning.
 */
pub fn parse_additional_ips(log: &Logger, input: &str) -> Vec<AdditionalIp> {
    let mut out = Vec::new();

    for (n, l) in input.lines().enumerate() {
        let l = l.trim();
        if l.is_empty() || l.starts_with('#') {
            continue;
        }

        let mut f = AdditionalIpFields::default();
        for term in l.split_whitespace() {
            let Some((k, v)) = term.split_once('=') else {
                warn!(log, "line {}: ignoring term {:?}", n + 1, term);
                continue;
            };
            let v = unquote(v).to_string();
            match k.to_ascii_uppercase().as_str() {
                "IP" => f.ip = Some(v),
                "MAC" => f.mac = Some(v),
                "GATEWAY" => f.gateway = Some(v),
                "NETMASK" => f.netmask = Some(v),
                other => {
                    warn!(log, "line {}: unknown key {:?}", n + 1, other);
                }
            }
        }

        if let Some(a) = f.build(log, &format!("line {}", n + 1)) {
            out.push(a);
        }
    }

    out
}

/**
 * Collect additional IPs from numbered variables: ADDITIONAL_IP_1,
 * ADDITIONAL_MAC_1, ADDITIONAL_GATEWAY_1, ADDITIONAL_NETMASK_1, then _2, and
 * so on until an index has no ADDITIONAL_IP_n.
 */
pub fn additional_ips_from_env<F>(log: &Logger, lookup: F) -> Vec<AdditionalIp>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = Vec::new();

    for n in 1.. {
        let get = |k: &str| {
            lookup(&format!("ADDITIONAL_{}_{}", k, n))
                .map(|v| unquote(&v).to_string())
                .filter(|v| !v.is_empty())
        };

        let Some(ip) = get("IP") else {
            break;
        };

        let f = AdditionalIpFields {
            ip: Some(ip),
            mac: get("MAC"),
            gateway: get("GATEWAY"),
            netmask: get("NETMASK"),
        };
        if let Some(a) = f.build(log, &format!("ADDITIONAL_IP_{}", n)) {
            out.push(a);
        }
    }

    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    Zfs,
    Mdadm,
}

impl FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zfs" => Ok(Backend::Zfs),
            "mdadm" | "raid" | "md" => Ok(Backend::Mdadm),
            other => bail!("unknown storage backend {:?}", other),
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Backend::Zfs => "zfs",
            Backend::Mdadm => "mdadm",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSettings {
    pub id: u32,
    pub name: String,
    pub memory: u32,
    pub cores: u32,
    pub disk_gb: u32,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub domain: Option<String>,
    pub email: Option<String>,
    pub pfsense: VmSettings,
    pub pfsense_iso_url: String,
    pub admin_vm: VmSettings,
    pub admin_iso_url: Option<String>,
    pub vm_storage: String,
    pub iso_storage: String,
    pub storage_backend: Backend,
    pub wan_bridge: String,
    pub lan_bridge: String,
    pub dmz_bridge: String,
    pub additional_ips_file: String,
    pub additional_ips: Vec<AdditionalIp>,
    pub cert_retries: u32,
    pub cert_interval_secs: u64,
}

pub const DEFAULT_PFSENSE_ISO_URL: &str =
    "https://atxfiles.netgate.com/mirror/downloads/pfSense-CE-2.7.2-RELEASE-amd64.iso.gz";

fn lookup_num<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|v| unquote(&v).to_string()) {
        None => Ok(default),
        Some(v) if v.is_empty() => Ok(default),
        Some(v) => v
            .parse::<T>()
            .map_err(|e| anyhow!("{}={:?}: {}", key, v, e)),
    }
}

fn lookup_str<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| unquote(&v).to_string())
        .filter(|v| !v.is_empty())
}

impl Config {
    /**
     * Build the run configuration from variables, which will normally have
     * been loaded from the .env file into the process environment.  The
     * additional IP file, if present, takes precedence over numbered
     * ADDITIONAL_IP_n variables.
     */
    pub fn load<F>(log: &Logger, lookup: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let additional_ips_file = lookup_str(&lookup, "ADDITIONAL_IPS_FILE")
            .unwrap_or_else(|| "config/additional-ips.conf".to_string());

        let additional_ips = match read_file(&additional_ips_file)? {
            Some(data) => {
                info!(log, "reading additional IPs from {}",
                    additional_ips_file);
                parse_additional_ips(log, &data)
            }
            None => additional_ips_from_env(log, &lookup),
        };
        info!(log, "{} additional IP(s) configured", additional_ips.len());

        let storage_backend = match lookup_str(&lookup, "STORAGE_BACKEND") {
            Some(b) => b.parse()?,
            None => Backend::Zfs,
        };

        Ok(Config {
            domain: lookup_str(&lookup, "DOMAIN"),
            email: lookup_str(&lookup, "EMAIL"),
            pfsense: VmSettings {
                id: lookup_num(&lookup, "PFSENSE_VM_ID", 100)?,
                name: lookup_str(&lookup, "PFSENSE_VM_NAME")
                    .unwrap_or_else(|| "pfsense".to_string()),
                memory: lookup_num(&lookup, "PFSENSE_MEMORY", 2048)?,
                cores: lookup_num(&lookup, "PFSENSE_CORES", 2)?,
                disk_gb: lookup_num(&lookup, "PFSENSE_DISK_SIZE", 32)?,
            },
            pfsense_iso_url: lookup_str(&lookup, "PFSENSE_ISO_URL")
                .unwrap_or_else(|| DEFAULT_PFSENSE_ISO_URL.to_string()),
            admin_vm: VmSettings {
                id: lookup_num(&lookup, "ADMIN_VM_ID", 101)?,
                name: lookup_str(&lookup, "ADMIN_VM_NAME")
                    .unwrap_or_else(|| "fw-admin".to_string()),
                memory: lookup_num(&lookup, "ADMIN_VM_MEMORY", 1024)?,
                cores: lookup_num(&lookup, "ADMIN_VM_CORES", 1)?,
                disk_gb: lookup_num(&lookup, "ADMIN_VM_DISK_SIZE", 16)?,
            },
            admin_iso_url: lookup_str(&lookup, "ADMIN_VM_ISO_URL"),
            vm_storage: lookup_str(&lookup, "VM_STORAGE")
                .unwrap_or_else(|| "local-lvm".to_string()),
            iso_storage: lookup_str(&lookup, "ISO_STORAGE")
                .unwrap_or_else(|| "local".to_string()),
            storage_backend,
            wan_bridge: lookup_str(&lookup, "WAN_BRIDGE")
                .unwrap_or_else(|| "vmbr0".to_string()),
            lan_bridge: lookup_str(&lookup, "LAN_BRIDGE")
                .unwrap_or_else(|| "vmbr1".to_string()),
            dmz_bridge: lookup_str(&lookup, "DMZ_BRIDGE")
                .unwrap_or_else(|| "vmbr2".to_string()),
            additional_ips_file,
            additional_ips,
            cert_retries: lookup_num(&lookup, "CERT_RETRIES", 30)?,
            cert_interval_secs: lookup_num(&lookup, "CERT_RETRY_INTERVAL", 10)?,
        })
    }

    /**
     * The MAC address Hetzner expects to see traffic for the first additional
     * IP come from.  The pfSense WAN NIC must use it.
     */
    pub fn wan_mac(&self) -> Option<&str> {
        self.additional_ips.first().and_then(|a| a.mac.as_deref())
    }
}

pub const SAMPLE_ADDITIONAL_IPS: &str = "\
# Additional IP addresses routed to this server.
#
# One address per line.  IP, GATEWAY and NETMASK are required.  MAC is the
# virtual MAC assigned to the address in the Hetzner Robot panel; the first
# MAC listed is given to the pfSense WAN interface.
#
#IP=203.0.113.10 MAC=00:50:56:00:01:02 GATEWAY=203.0.113.1 NETMASK=255.255.255.192
";

/**
 * Render addresses in the additional IP file format, e.g., to move addresses
 * configured through numbered variables into the file.
 */
pub fn render_additional_ips(ips: &[AdditionalIp]) -> String {
    if ips.is_empty() {
        return SAMPLE_ADDITIONAL_IPS.to_string();
    }

    let mut out = String::from("# Additional IP addresses routed to this server.\n");
    for a in ips {
        out.push_str(&format!("IP={}", a.ip));
        if let Some(mac) = &a.mac {
            out.push_str(&format!(" MAC={}", mac));
        }
        out.push_str(&format!(" GATEWAY={} NETMASK={}\n", a.gateway, a.netmask));
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn render_and_reparse() {
        let log = init_log();
        assert!(parse_additional_ips(&log, &render_additional_ips(&[])).is_empty());

        let ips = parse_additional_ips(
            &log,
            "IP=203.0.113.10 MAC=00:50:56:00:01:02 GATEWAY=203.0.113.1 \
                NETMASK=255.255.255.192\n\
            IP=203.0.113.11 GATEWAY=203.0.113.1 NETMASK=255.255.255.192\n",
        );
        assert_eq!(ips.len(), 2);
        assert_eq!(parse_additional_ips(&log, &render_additional_ips(&ips)), ips);
    }

    #[test]
    fn netmask_table() {
        assert_eq!(netmask_to_cidr("255.255.255.0"), Some(24));
        assert_eq!(netmask_to_cidr("255.255.0.0"), Some(16));
        assert_eq!(netmask_to_cidr("255.255.255.192"), Some(26));
        assert_eq!(netmask_to_cidr("255.255.255.255"), Some(32));
        assert_eq!(netmask_to_cidr("0.0.0.0"), Some(0));
        assert_eq!(netmask_to_cidr("/29"), Some(29));
        assert_eq!(netmask_to_cidr("255.0.255.0"), None);
        assert_eq!(netmask_to_cidr("bogus"), None);
    }

    #[test]
    fn netmask_table_agrees_with_bits() -> Result<()> {
        for (len, nm) in NETMASKS.iter().enumerate() {
            let nm: Ipv4Addr = nm.parse()?;
            assert_eq!(netmask_to_prefix_len(nm)?, len as u32);
        }
        assert!(netmask_to_prefix_len("255.0.255.0".parse()?).is_err());
        Ok(())
    }

    #[test]
    fn mac_forms() {
        assert_eq!(
            mac_sanitise("0:50:56:A:1:2").as_deref(),
            Some("00:50:56:0a:01:02")
        );
        assert_eq!(
            mac_sanitise("00-50-56-00-01-02").as_deref(),
            Some("00:50:56:00:01:02")
        );
        assert_eq!(mac_sanitise("00:50:56:00:01"), None);
        assert_eq!(mac_sanitise("00:50:56:00:01:zz"), None);
    }

    #[test]
    fn additional_ips_file() {
        let log = init_log();
        let input = [
            "# comment",
            "",
            "IP=203.0.113.10 MAC=00:50:56:00:01:02 GATEWAY=203.0.113.1 \
                NETMASK=255.255.255.192",
            "IP=203.0.113.11 GATEWAY=203.0.113.1",
            "MAC=00:50:56:00:01:03 GATEWAY=203.0.113.1 NETMASK=255.255.255.0",
            "IP=\"198.51.100.7\" GATEWAY=198.51.100.1 NETMASK=255.255.255.248",
        ]
        .join("\n");

        let got = parse_additional_ips(&log, &input);
        assert_eq!(
            got,
            vec![
                AdditionalIp {
                    ip: "203.0.113.10".parse().unwrap(),
                    mac: Some("00:50:56:00:01:02".into()),
                    gateway: "203.0.113.1".parse().unwrap(),
                    netmask: "255.255.255.192".into(),
                    prefix: 26,
                },
                AdditionalIp {
                    ip: "198.51.100.7".parse().unwrap(),
                    mac: None,
                    gateway: "198.51.100.1".parse().unwrap(),
                    netmask: "255.255.255.248".into(),
                    prefix: 29,
                },
            ]
        );
    }

    #[test]
    fn additional_ips_unknown_netmask_falls_back() {
        let log = init_log();
        let got = parse_additional_ips(
            &log,
            "IP=203.0.113.10 GATEWAY=203.0.113.1 NETMASK=255.0.255.0\n",
        );
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].prefix, DEFAULT_PREFIX_LEN);
        assert_eq!(got[0].cidr(), "203.0.113.10/24");
    }

    #[test]
    fn additional_ips_env() {
        let log = init_log();
        let vars: HashMap<&str, &str> = [
            ("ADDITIONAL_IP_1", "203.0.113.10"),
            ("ADDITIONAL_GATEWAY_1", "203.0.113.1"),
            ("ADDITIONAL_NETMASK_1", "255.255.255.192"),
            ("ADDITIONAL_IP_2", "203.0.113.11"),
            ("ADDITIONAL_MAC_2", "00:50:56:00:01:03"),
            ("ADDITIONAL_GATEWAY_2", "203.0.113.1"),
            ("ADDITIONAL_NETMASK_2", "255.255.255.192"),
            /*
             * Numbering stops at the first gap:
             */
            ("ADDITIONAL_IP_4", "203.0.113.13"),
            ("ADDITIONAL_GATEWAY_4", "203.0.113.1"),
            ("ADDITIONAL_NETMASK_4", "255.255.255.192"),
        ]
        .into_iter()
        .collect();

        let got =
            additional_ips_from_env(&log, |k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].cidr(), "203.0.113.10/26");
        assert_eq!(got[0].mac, None);
        assert_eq!(got[1].mac.as_deref(), Some("00:50:56:00:01:03"));
    }

    #[test]
    fn config_defaults_and_overrides() -> Result<()> {
        let log = init_log();
        let dir = tempfile::tempdir()?;
        let missing = dir.path().join("additional-ips.conf");
        let missing = missing.to_str().unwrap().to_string();

        let vars: HashMap<String, String> = [
            ("ADDITIONAL_IPS_FILE", missing.as_str()),
            ("DOMAIN", "pve.example.com"),
            ("PFSENSE_MEMORY", "4096"),
            ("STORAGE_BACKEND", "mdadm"),
            ("ADDITIONAL_IP_1", "203.0.113.10"),
            ("ADDITIONAL_MAC_1", "00:50:56:00:01:02"),
            ("ADDITIONAL_GATEWAY_1", "203.0.113.1"),
            ("ADDITIONAL_NETMASK_1", "255.255.255.192"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let c = Config::load(&log, |k| vars.get(k).cloned())?;
        assert_eq!(c.domain.as_deref(), Some("pve.example.com"));
        assert_eq!(c.email, None);
        assert_eq!(c.pfsense.id, 100);
        assert_eq!(c.pfsense.memory, 4096);
        assert_eq!(c.storage_backend, Backend::Mdadm);
        assert_eq!(c.wan_bridge, "vmbr0");
        assert_eq!(c.wan_mac(), Some("00:50:56:00:01:02"));
        Ok(())
    }

    #[test]
    fn wan_mac_is_first_ip_only() -> Result<()> {
        let log = init_log();
        let dir = tempfile::tempdir()?;
        let missing = dir.path().join("additional-ips.conf");
        let missing = missing.to_str().unwrap().to_string();

        let vars: HashMap<String, String> = [
            ("ADDITIONAL_IPS_FILE", missing.as_str()),
            ("ADDITIONAL_IP_1", "203.0.113.10"),
            ("ADDITIONAL_GATEWAY_1", "203.0.113.1"),
            ("ADDITIONAL_NETMASK_1", "255.255.255.192"),
            ("ADDITIONAL_IP_2", "203.0.113.11"),
            ("ADDITIONAL_MAC_2", "00:50:56:00:01:03"),
            ("ADDITIONAL_GATEWAY_2", "203.0.113.1"),
            ("ADDITIONAL_NETMASK_2", "255.255.255.192"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let c = Config::load(&log, |k| vars.get(k).cloned())?;
        assert_eq!(c.additional_ips.len(), 2);
        assert_eq!(c.wan_mac(), None);
        Ok(())
    }

    #[test]
    fn config_file_takes_precedence() -> Result<()> {
        let log = init_log();
        let dir = tempfile::tempdir()?;
        let f = dir.path().join("additional-ips.conf");
        std::fs::write(
            &f,
            "IP=198.51.100.7 GATEWAY=198.51.100.1 NETMASK=255.255.255.248\n",
        )?;
        let f = f.to_str().unwrap().to_string();

        let c = Config::load(&log, |k| match k {
            "ADDITIONAL_IPS_FILE" => Some(f.clone()),
            "ADDITIONAL_IP_1" => Some("203.0.113.10".into()),
            "ADDITIONAL_GATEWAY_1" => Some("203.0.113.1".into()),
            "ADDITIONAL_NETMASK_1" => Some("255.255.255.192".into()),
            _ => None,
        })?;
        assert_eq!(c.additional_ips.len(), 1);
        assert_eq!(c.additional_ips[0].cidr(), "198.51.100.7/29");
        Ok(())
    }

    #[test]
    fn config_bad_number() {
        let log = init_log();
        let r = Config::load(&log, |k| match k {
            "ADDITIONAL_IPS_FILE" => Some("/nonexistent/additional-ips".into()),
            "PFSENSE_VM_ID" => Some("abc".into()),
            _ => None,
        });
        assert!(r.is_err());
    }
}
