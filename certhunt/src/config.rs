use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Deserialize, Clone)]
pub struct ServerSection {
    pub host: Option<String>,
    /// Hex SHA-256 of the one certificate accepted for the server itself.
    pub pinned_cert_hash: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct HunterSection {
    pub public_ip_cache_validity: Option<i64>,
    pub server_ip_cache_validity: Option<i64>,
    pub task_reexecution_interval: Option<i64>,
    pub traceroute_max_hops: Option<u32>,
    pub traceroute_samples_per_hop: Option<u32>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct GuardSection {
    pub trust_automatically: Option<bool>,
    pub rating_to_trust_automatically: Option<u8>,
    pub cache_validity: Option<i64>,
    pub behind_ssl_proxy: Option<bool>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct NetSection {
    pub request_timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub handshake_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct Config {
    pub server: Option<ServerSection>,
    pub hunter: Option<HunterSection>,
    pub guard: Option<GuardSection>,
    pub net: Option<NetSection>,
    pub store_path: Option<PathBuf>,
}

pub fn load_config(path: Option<&Path>) -> Option<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new("certhunt.yaml");
            if p.exists() { p.to_path_buf() } else { return None; }
        }
    };
    let s = fs::read_to_string(path).ok()?;
    serde_yaml::from_str(&s).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_parses() {
        let cfg: Config = serde_yaml::from_str(
            "server:\n  host: hunt.example.org\nhunter:\n  task_reexecution_interval: 3600\n",
        )
        .unwrap();
        assert_eq!(cfg.server.unwrap().host.as_deref(), Some("hunt.example.org"));
        let h = cfg.hunter.unwrap();
        assert_eq!(h.task_reexecution_interval, Some(3600));
        assert_eq!(h.traceroute_max_hops, None);
        assert!(cfg.guard.is_none());
    }

    #[test]
    fn missing_file_is_none() {
        assert!(load_config(Some(Path::new("/nonexistent/certhunt.yaml"))).is_none());
    }
}
