//! Binary HTTP transport to the verification server, plus DNS resolution.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use thiserror::Error;

/// Transport failures split the way the rest of the engine cares about
/// them: timeouts are recoverable per local policy, everything else is not.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("request timed out")]
    Timeout,
    #[error("http failure: {0}")]
    Http(String),
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn post_binary(
        &self,
        url: &str,
        host_header: &str,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, NetError>;

    async fn get_binary(&self, url: &str, host_header: &str) -> Result<Vec<u8>, NetError>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("certhunt/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(ReqwestTransport { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn post_binary(
        &self,
        url: &str,
        host_header: &str,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, NetError> {
        debug!("POST {url} ({} bytes)", body.len());
        let resp = self
            .client
            .post(url)
            .header(reqwest::header::HOST, host_header)
            .body(body)
            .send()
            .await
            .map_err(to_net_error)?;
        read_body(resp).await
    }

    async fn get_binary(&self, url: &str, host_header: &str) -> Result<Vec<u8>, NetError> {
        debug!("GET {url}");
        let resp = self
            .client
            .get(url)
            .header(reqwest::header::HOST, host_header)
            .send()
            .await
            .map_err(to_net_error)?;
        read_body(resp).await
    }
}

async fn read_body(resp: reqwest::Response) -> Result<Vec<u8>, NetError> {
    let status = resp.status();
    if !status.is_success() {
        return Err(NetError::Http(format!("status {status}")));
    }
    let bytes = resp.bytes().await.map_err(to_net_error)?;
    Ok(bytes.to_vec())
}

fn to_net_error(e: reqwest::Error) -> NetError {
    if e.is_timeout() {
        NetError::Timeout
    } else {
        NetError::Http(e.to_string())
    }
}

/// At most one address per family, first answer wins. An absent family
/// means the system (or its resolver) has no connectivity for it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolvedIps {
    pub v4: Option<Ipv4Addr>,
    pub v6: Option<Ipv6Addr>,
}

/// Resolve a hostname to its IPv4 and IPv6 addresses (best-effort).
pub async fn resolve(host: &str) -> ResolvedIps {
    let mut out = ResolvedIps::default();
    match tokio::net::lookup_host((host, 0u16)).await {
        Ok(addrs) => {
            for sa in addrs {
                match sa.ip() {
                    IpAddr::V4(v4) if out.v4.is_none() => out.v4 = Some(v4),
                    IpAddr::V6(v6) if out.v6.is_none() => out.v6 = Some(v6),
                    _ => {}
                }
            }
        }
        Err(e) => debug!("resolving {host} failed: {e}"),
    }
    out
}
