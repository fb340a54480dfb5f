//! Traceroute via the system tool.
//!
//! Raw ICMP needs privileges this process usually does not have, so hop
//! measurement shells out to the platform's traceroute and reduces its
//! output to the hop-record format the scheduler expects.

use std::net::IpAddr;

use anyhow::bail;
use async_trait::async_trait;
use hunter::Tracer;
use tokio::process::Command;

pub struct SystemTracer {
    pub max_hops: u32,
    pub samples_per_hop: u32,
}

#[async_trait]
impl Tracer for SystemTracer {
    async fn traceroute(&self, ip: IpAddr) -> anyhow::Result<String> {
        let mut cmd = Command::new("traceroute");
        if ip.is_ipv6() {
            cmd.arg("-6");
        }
        cmd.arg("-n")
            .arg("-q")
            .arg(self.samples_per_hop.to_string())
            .arg("-m")
            .arg(self.max_hops.to_string())
            .arg(ip.to_string());
        let output = cmd.output().await?;
        if !output.status.success() {
            bail!("traceroute exited with {}", output.status);
        }
        Ok(parse_hops(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Reduce traceroute output to one record per hop: the distinct IPs seen
/// for that TTL, '|'-joined. The banner line contributes no parseable
/// addresses and drops out on its own.
fn parse_hops(raw: &str) -> String {
    let mut hops = Vec::new();
    for line in raw.lines() {
        let mut ips: Vec<String> = Vec::new();
        for token in line.split_whitespace() {
            if let Ok(ip) = token.parse::<IpAddr>() {
                let s = ip.to_string();
                if !ips.contains(&s) {
                    ips.push(s);
                }
            }
        }
        if !ips.is_empty() {
            hops.push(ips.join("|"));
        }
    }
    hops.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_typical_output() {
        let raw = "traceroute to example.com (93.184.216.34), 20 hops max, 60 byte packets\n \
                   1  192.168.1.1  0.5 ms  0.4 ms  0.4 ms\n \
                   2  * * *\n \
                   3  82.4.5.6  10.1 ms 82.4.5.7  10.3 ms  10.2 ms\n \
                   4  93.184.216.34  20.0 ms  20.1 ms  20.0 ms";
        let hops = parse_hops(raw);
        assert_eq!(hops, "192.168.1.1\n82.4.5.6|82.4.5.7\n93.184.216.34");
    }

    #[test]
    fn dedups_repeated_answers_within_a_hop() {
        let hops = parse_hops(" 1  10.0.0.1  1 ms 10.0.0.1  1 ms 10.0.0.1  1 ms");
        assert_eq!(hops, "10.0.0.1");
    }
}
