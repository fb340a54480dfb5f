//! Traceroute post-processing.

use std::net::IpAddr;
use std::sync::OnceLock;

use ipnet::IpNet;

static PRIVATE_RANGES: OnceLock<Vec<IpNet>> = OnceLock::new();

fn private_ranges() -> &'static [IpNet] {
    PRIVATE_RANGES.get_or_init(|| {
        [
            "10.0.0.0/8",
            "172.16.0.0/12",
            "192.168.0.0/16",
            "100.64.0.0/10",
            "127.0.0.0/8",
            "169.254.0.0/16",
            "fc00::/7",
            "fe80::/10",
            "::1/128",
        ]
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect()
    })
}

fn is_private(ip: &IpAddr) -> bool {
    private_ranges().iter().any(|net| net.contains(ip))
}

/// Clean a raw traceroute and prepend the attested public IP as the first
/// hop. Private-range hops say nothing about the path outside the local
/// network and are dropped; hop lines left empty disappear entirely. The
/// public IP goes first because that is where an interceptor at a poisoned
/// access point would sit.
pub fn prepend_public_ip_strip_private(public_ip: &IpAddr, raw: &str) -> String {
    let mut cleaned = Vec::new();
    for line in raw.lines() {
        let kept: Vec<&str> = line
            .split('|')
            .map(|e| e.trim())
            .filter(|e| !e.is_empty())
            .filter(|e| e.parse::<IpAddr>().map_or(true, |ip| !is_private(&ip)))
            .collect();
        if !kept.is_empty() {
            cleaned.push(kept.join("|"));
        }
    }
    format!("{}\n{}", public_ip, cleaned.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn strips_private_hops_and_prepends_public_ip() {
        let public = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));
        let raw = "192.168.1.1\n10.0.0.1|82.1.2.3\n93.184.216.34";
        let cleaned = prepend_public_ip_strip_private(&public, raw);
        assert_eq!(cleaned, "203.0.113.7\n82.1.2.3\n93.184.216.34");
    }

    #[test]
    fn drops_hop_lines_left_empty() {
        let public = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));
        let raw = "192.168.1.1|172.16.0.1\n93.184.216.34";
        let cleaned = prepend_public_ip_strip_private(&public, raw);
        assert_eq!(cleaned, "203.0.113.7\n93.184.216.34");
    }

    #[test]
    fn strips_private_v6_hops() {
        let public: IpAddr = "2001:db8::7".parse().unwrap();
        let raw = "fe80::1|2001:db8::2\nfd00::1\n2001:db8::9";
        let cleaned = prepend_public_ip_strip_private(&public, raw);
        assert_eq!(cleaned, "2001:db8::7\n2001:db8::2\n2001:db8::9");
    }

    #[test]
    fn keeps_unparseable_elements() {
        let public = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));
        let raw = "*\n93.184.216.34";
        let cleaned = prepend_public_ip_strip_private(&public, raw);
        assert_eq!(cleaned, "203.0.113.7\n*\n93.184.216.34");
    }
}
