/*
 * Copyright 2024 Oxide Computer Company
 */

use std::net::Ipv4Addr;

use crate::common::*;
use crate::config::AdditionalIp;

pub const INDENT: &str = "    ";

/**
 * An IPv4 address assigned to an interface, as reported by
 * "ip -o -4 addr show".
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfAddr {
    pub ifname: String,
    pub addr: Ipv4Addr,
    pub prefix: u32,
}

/**
 * Parse the one-line-per-address output of "ip -o -4 addr show", e.g.:
 *
 *      2: enp0s31f6    inet 198.51.100.20/26 brd 198.51.100.63 scope global enp0s31f6\       valid_lft forever preferred_lft forever
 */
pub fn parse_ip_addr(input: &str) -> Result<Vec<IfAddr>> {
    let mut out = Vec::new();

    for l in input.lines() {
        let t: Vec<&str> = l.split_whitespace().collect();
        if t.len() < 4 || t[2] != "inet" {
            continue;
        }

        /*
         * Secondary addresses on a VLAN or alias carry an "@" suffix on the
         * interface name (e.g., "eth0.4000@eth0").
         */
        let ifname = t[1].split('@').next().unwrap_or(t[1]);

        let Some((addr, prefix)) = t[3].split_once('/') else {
            bail!("unexpected address {:?} in line {:?}", t[3], l);
        };

        out.push(IfAddr {
            ifname: ifname.to_string(),
            addr: addr.parse()?,
            prefix: prefix.parse()?,
        });
    }

    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultRoute {
    pub gateway: Ipv4Addr,
    pub dev: String,
}

/**
 * Parse "ip -4 route show default", e.g.:
 *
 *      default via 198.51.100.1 dev enp0s31f6 proto static onlink
 */
pub fn parse_default_route(input: &str) -> Result<Option<DefaultRoute>> {
    for l in input.lines() {
        let t: Vec<&str> = l.split_whitespace().collect();
        if t.first() != Some(&"default") {
            continue;
        }

        let via = t.windows(2).find(|w| w[0] == "via").map(|w| w[1]);
        let dev = t.windows(2).find(|w| w[0] == "dev").map(|w| w[1]);

        if let (Some(via), Some(dev)) = (via, dev) {
            return Ok(Some(DefaultRoute {
                gateway: via.parse()?,
                dev: dev.to_string(),
            }));
        }
    }

    Ok(None)
}

/**
 * Parse "ip -o link show dev <ifname>" to obtain the hardware address.
 */
pub fn parse_link_mac(input: &str) -> Option<String> {
    let t: Vec<&str> = input.split_whitespace().collect();
    t.windows(2)
        .find(|w| w[0] == "link/ether")
        .map(|w| w[1].to_ascii_lowercase())
}

/**
 * The server address of the current SSH session, from the SSH_CONNECTION
 * variable ("client_ip client_port server_ip server_port").
 */
pub fn ssh_server_addr(ssh_connection: &str) -> Option<Ipv4Addr> {
    let t: Vec<&str> = ssh_connection.split_whitespace().collect();
    if t.len() != 4 {
        return None;
    }
    t[2].parse().ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stanza {
    pub name: String,
    pub method: String,
    pub options: Vec<(String, String)>,
}

impl Stanza {
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

/**
 * Read the "iface" stanzas from an ifupdown interfaces file.  Only the parts we
 * need to carry forward are interpreted: the interface name, the method
 * (static, manual, etc) and the option lines.
 */
pub fn parse_interfaces(input: &str) -> Vec<Stanza> {
    let mut out: Vec<Stanza> = Vec::new();
    let mut in_iface = false;

    for l in input.lines() {
        let trimmed = l.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let t: Vec<&str> = trimmed.split_whitespace().collect();
        match t[0] {
            "iface" => {
                if t.len() >= 2 {
                    out.push(Stanza {
                        name: t[1].to_string(),
                        method: t.get(3).unwrap_or(&"").to_string(),
                        options: Vec::new(),
                    });
                    in_iface = true;
                } else {
                    in_iface = false;
                }
            }
            "auto" | "allow-hotplug" | "source" | "source-directory"
            | "mapping" => {
                in_iface = false;
            }
            key => {
                if in_iface {
                    if let Some(cur) = out.last_mut() {
                        let value = trimmed[key.len()..].trim().to_string();
                        cur.options.push((key.to_string(), value));
                    }
                }
            }
        }
    }

    out
}

/**
 * Everything needed to render the new interfaces file.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPlan {
    pub physical: String,
    pub physical_mac: Option<String>,
    pub bridge: String,
    pub address: Ipv4Addr,
    pub prefix: u32,
    pub gateway: Ipv4Addr,
    pub additional: Vec<AdditionalIp>,
    pub internal_bridges: Vec<(String, String)>,
}

fn push_opt(out: &mut Vec<String>, opt: String) {
    out.push(format!("{}{}", INDENT, opt));
}

/**
 * Render /etc/network/interfaces.  The public address stays on the main
 * bridge, with the physical NIC as its only port, so that the host keeps the
 * address the SSH session is using.  Hetzner only accepts traffic from the
 * physical MAC, so the bridge is pinned to it when it is known.
 */
pub fn render_interfaces(plan: &NetworkPlan) -> String {
    let mut out: Vec<String> = vec![
        "# network interface settings; autogenerated by pvebootstrap".into(),
        "# Please do NOT modify this file directly, unless you know what".into(),
        "# you're doing.".into(),
        "".into(),
        "source /etc/network/interfaces.d/*".into(),
        "".into(),
        "auto lo".into(),
        "iface lo inet loopback".into(),
        "".into(),
        format!("iface {} inet manual", plan.physical),
        "".into(),
        format!("auto {}", plan.bridge),
        format!("iface {} inet static", plan.bridge),
    ];

    push_opt(&mut out, format!("address {}/{}", plan.address, plan.prefix));
    push_opt(&mut out, format!("gateway {}", plan.gateway));
    push_opt(&mut out, format!("bridge-ports {}", plan.physical));
    push_opt(&mut out, "bridge-stp off".into());
    push_opt(&mut out, "bridge-fd 0".into());
    if let Some(mac) = &plan.physical_mac {
        push_opt(&mut out, format!("hwaddress ether {}", mac));
    }

    for a in plan.additional.iter() {
        push_opt(
            &mut out,
            format!("post-up ip addr add {} dev {}", a.cidr(), plan.bridge),
        );
        push_opt(
            &mut out,
            format!("post-down ip addr del {} dev {}", a.cidr(), plan.bridge),
        );
    }

    for (name, comment) in plan.internal_bridges.iter() {
        out.push("".into());
        out.push(format!("# {}", comment));
        out.push(format!("auto {}", name));
        out.push(format!("iface {} inet manual", name));
        push_opt(&mut out, "bridge-ports none".into());
        push_opt(&mut out, "bridge-stp off".into());
        push_opt(&mut out, "bridge-fd 0".into());
    }

    let mut s = out.join("\n");
    s.push('\n');
    s
}

/**
 * Check a generated interfaces file before it is put in place.  This is a
 * textual check only; it cannot prove the file will bring the network up, but
 * it does catch the mistakes that would cut off the SSH session outright.
 * Returns a list of problems, which is empty if the file looks sound.
 */
pub fn validate_interfaces(
    text: &str,
    bridge: &str,
    current_ip: Ipv4Addr,
) -> Vec<String> {
    let mut problems = Vec::new();
    let lines: Vec<&str> = text.lines().collect();
    let has = |want: &str| lines.iter().any(|l| l.trim() == want);

    for want in [
        "auto lo".to_string(),
        "iface lo inet loopback".to_string(),
        format!("auto {}", bridge),
        format!("iface {} inet static", bridge),
    ] {
        if !has(want.as_str()) {
            problems.push(format!("missing \"{}\"", want));
        }
    }

    let ip = current_ip.to_string();
    let carries_ip = lines.iter().any(|l| {
        let t: Vec<&str> = l.split_whitespace().collect();
        t.len() == 2
            && t[0] == "address"
            && t[1].split('/').next() == Some(ip.as_str())
    });
    if !carries_ip {
        problems.push(format!("current address {} is not configured", ip));
    }

    let count = |key: &str| {
        lines
            .iter()
            .filter(|l| l.trim_start().starts_with(key))
            .count()
    };
    let (up, down) = (count("post-up "), count("post-down "));
    if up != down {
        problems.push(format!(
            "{} post-up commands but {} post-down commands",
            up, down
        ));
    }

    for (n, l) in lines.iter().enumerate() {
        let trimmed = l.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let first = trimmed.split_whitespace().next().unwrap_or("");
        let top_level = matches!(
            first,
            "auto" | "iface" | "source" | "source-directory" | "allow-hotplug"
        );

        let indent = &l[..l.len() - trimmed.len()];
        if top_level {
            if !indent.is_empty() {
                problems.push(format!("line {}: \"{}\" is indented", n + 1,
                    first));
            }
        } else if indent != INDENT {
            problems.push(format!(
                "line {}: option lines must be indented with 4 spaces",
                n + 1
            ));
        }
    }

    problems
}

#[cfg(test)]
mod test {
    use super::*;

    fn plan0() -> NetworkPlan {
        NetworkPlan {
            physical: "enp0s31f6".into(),
            physical_mac: Some("90:1b:0e:aa:bb:cc".into()),
            bridge: "vmbr0".into(),
            address: "198.51.100.20".parse().unwrap(),
            prefix: 26,
            gateway: "198.51.100.1".parse().unwrap(),
            additional: vec![AdditionalIp {
                ip: "203.0.113.10".parse().unwrap(),
                mac: None,
                gateway: "203.0.113.1".parse().unwrap(),
                netmask: "255.255.255.192".into(),
                prefix: 26,
            }],
            internal_bridges: vec![
                ("vmbr1".into(), "pfSense LAN".into()),
                ("vmbr2".into(), "pfSense DMZ".into()),
            ],
        }
    }

    #[test]
    fn additional_ip_from_env_reaches_interfaces() {
        let log = crate::common::init_log();
        let vars: std::collections::HashMap<&str, &str> = [
            ("ADDITIONAL_IP_1", "203.0.113.10"),
            ("ADDITIONAL_GATEWAY_1", "203.0.113.1"),
            ("ADDITIONAL_NETMASK_1", "255.255.255.192"),
        ]
        .into_iter()
        .collect();

        let additional = crate::config::additional_ips_from_env(&log, |k| {
            vars.get(k).map(|v| v.to_string())
        });
        let plan = NetworkPlan { additional, ..plan0() };

        let text = render_interfaces(&plan);
        assert!(text.contains("post-up ip addr add 203.0.113.10/26 dev vmbr0\n"));
        assert!(text.contains("post-down ip addr del 203.0.113.10/26 dev vmbr0\n"));
    }

    #[test]
    fn ip_addr_output() -> Result<()> {
        let input = "\
1: lo    inet 127.0.0.1/8 scope host lo\\       valid_lft forever preferred_lft forever
2: enp0s31f6    inet 198.51.100.20/26 brd 198.51.100.63 scope global enp0s31f6\\       valid_lft forever preferred_lft forever
5: eth0.4000@eth0    inet 10.0.0.2/24 scope global eth0.4000\\       valid_lft forever preferred_lft forever
";
        let got = parse_ip_addr(input)?;
        assert_eq!(got.len(), 3);
        assert_eq!(
            got[1],
            IfAddr {
                ifname: "enp0s31f6".into(),
                addr: "198.51.100.20".parse()?,
                prefix: 26,
            }
        );
        assert_eq!(got[2].ifname, "eth0.4000");
        Ok(())
    }

    #[test]
    fn default_route() -> Result<()> {
        let got = parse_default_route(
            "default via 198.51.100.1 dev enp0s31f6 proto static onlink \n",
        )?;
        assert_eq!(
            got,
            Some(DefaultRoute {
                gateway: "198.51.100.1".parse()?,
                dev: "enp0s31f6".into(),
            })
        );
        assert_eq!(parse_default_route("")?, None);
        Ok(())
    }

    #[test]
    fn link_mac() {
        let input = "2: enp0s31f6: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 \
            qdisc pfifo_fast master vmbr0 state UP mode DEFAULT group default \
            qlen 1000\\    link/ether 90:1B:0E:AA:BB:CC brd ff:ff:ff:ff:ff:ff";
        assert_eq!(parse_link_mac(input).as_deref(), Some("90:1b:0e:aa:bb:cc"));
        assert_eq!(parse_link_mac("1: lo: <LOOPBACK> link/loopback"), None);
    }

    #[test]
    fn ssh_connection() {
        assert_eq!(
            ssh_server_addr("192.0.2.5 51234 198.51.100.20 22"),
            Some("198.51.100.20".parse().unwrap())
        );
        assert_eq!(ssh_server_addr(""), None);
    }

    #[test]
    fn existing_interfaces() {
        let input = "\
source /etc/network/interfaces.d/*

auto lo
iface lo inet loopback

iface enp0s31f6 inet manual

auto vmbr0
iface vmbr0 inet static
\taddress 198.51.100.20/26
\tgateway 198.51.100.1
\tbridge-ports enp0s31f6
\tbridge-stp off
";
        let got = parse_interfaces(input);
        assert_eq!(got.len(), 3);
        assert_eq!(got[1].name, "enp0s31f6");
        assert_eq!(got[1].method, "manual");
        assert_eq!(got[2].option("bridge-ports"), Some("enp0s31f6"));
        assert_eq!(got[2].option("address"), Some("198.51.100.20/26"));
        assert_eq!(got[2].option("mtu"), None);
    }

    #[test]
    fn rendered_file_keeps_primary_address() {
        let text = render_interfaces(&plan0());
        assert!(text.lines().any(|l| l == "auto vmbr0"));
        assert!(text.contains("    address 198.51.100.20/26\n"));
        assert!(text.contains("    gateway 198.51.100.1\n"));
        assert!(text.contains("    bridge-ports enp0s31f6\n"));
        assert!(text.contains("    hwaddress ether 90:1b:0e:aa:bb:cc\n"));
        assert!(text.contains("iface vmbr2 inet manual\n    bridge-ports none\n"));
        assert!(validate_interfaces(&text, "vmbr0", plan0().address).is_empty());
    }

    #[test]
    fn additional_ip_post_up() {
        let text = render_interfaces(&plan0());
        assert!(text.contains("    post-up ip addr add 203.0.113.10/26 dev vmbr0\n"));
        assert!(text.contains("    post-down ip addr del 203.0.113.10/26 dev vmbr0\n"));
    }

    #[test]
    fn validation_failures() {
        let ip: Ipv4Addr = "198.51.100.20".parse().unwrap();

        let text = render_interfaces(&plan0());
        let other: Ipv4Addr = "198.51.100.21".parse().unwrap();
        assert_eq!(
            validate_interfaces(&text, "vmbr0", other),
            vec!["current address 198.51.100.21 is not configured".to_string()]
        );

        let text = render_interfaces(&plan0()).replace("auto vmbr0\n", "");
        assert_eq!(
            validate_interfaces(&text, "vmbr0", ip),
            vec!["missing \"auto vmbr0\"".to_string()]
        );

        let text = render_interfaces(&plan0())
            .replace("    post-down ip addr del 203.0.113.10/26 dev vmbr0\n", "");
        assert_eq!(
            validate_interfaces(&text, "vmbr0", ip),
            vec!["1 post-up commands but 0 post-down commands".to_string()]
        );

        let text =
            render_interfaces(&plan0()).replace("    bridge-fd 0", "\tbridge-fd 0");
        let problems = validate_interfaces(&text, "vmbr0", ip);
        assert_eq!(problems.len(), 3);
        assert!(problems.iter().all(|p| p.contains("indented with 4 spaces")));
    }
}
