use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use certhunt_core::clock::ServerClock;
use certhunt_core::report::{LogReporter, Reporter};
use certhunt_core::{now_unix, sha256, CertHash};
use chain_fetch::RustlsChainFetcher;
use collector::ProbeCollector;
use guard::{GuardConfig, VerificationGuard};
use hunter::{ChainFetcher, FetchOutcome, HunterConfig, HunterWorker, WorkerEvent};
use log::{info, warn};
use net::{HttpTransport, ReqwestTransport};
use store_sqlite::{lock_db, Db, SharedDb};
use task_list::TaskListProcessor;
use tokio::sync::mpsc;
use trust_cache::{CacheVerdict, TrustDecisionCache};

mod config;
mod pump;
mod tracer;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "certhunt", version, about = "Crowd-sourced detection of TLS man-in-the-middle attacks")]
struct Cli {
    /// Optional config file (YAML). If omitted, loads ./certhunt.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// Pull the hunting-task list and run one hunting round
    Hunt {
        /// Verification server host name
        #[arg(long)]
        server: Option<String>,
        /// Path of the local SQLite store
        #[arg(long, value_name = "FILE")]
        store: Option<PathBuf>,
    },
    /// Fetch a host's certificate and verify it against cache and server
    Verify {
        /// Target host name
        host: String,
        /// Target port
        #[arg(long, default_value_t = 443)]
        port: u16,
        /// Verification server host name
        #[arg(long)]
        server: Option<String>,
        /// Path of the local SQLite store
        #[arg(long, value_name = "FILE")]
        store: Option<PathBuf>,
        /// Output format: text or json
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Inspect or edit the local trust cache
    Cache {
        #[command(subcommand)]
        cmd: CacheCmd,
    },
}

#[derive(Debug, Subcommand)]
enum CacheCmd {
    /// List cached trust decisions (JSON lines)
    List {
        #[arg(long, value_name = "FILE")]
        store: Option<PathBuf>,
    },
    /// Remove a cached trust decision
    Remove {
        /// Hex SHA-256 of the certificate
        #[arg(long)]
        hash: String,
        /// Host the decision was made for
        #[arg(long)]
        host: String,
        #[arg(long, value_name = "FILE")]
        store: Option<PathBuf>,
    },
}

struct Settings {
    server_host: String,
    pinned_hash: CertHash,
    store_path: PathBuf,
    public_ip_cache_validity: i64,
    server_ip_cache_validity: i64,
    task_reexecution_interval: i64,
    traceroute_max_hops: u32,
    traceroute_samples_per_hop: u32,
    trust_automatically: bool,
    rating_to_trust_automatically: u8,
    guard_cache_validity: i64,
    behind_ssl_proxy: bool,
    request_timeout: Duration,
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

impl Settings {
    fn resolve(
        cfg: &Option<config::Config>,
        server: Option<String>,
        store: Option<PathBuf>,
    ) -> Settings {
        let c = cfg.clone().unwrap_or_default();
        let srv = c.server.unwrap_or_default();
        let h = c.hunter.unwrap_or_default();
        let g = c.guard.unwrap_or_default();
        let n = c.net.unwrap_or_default();
        let pinned_hash = match srv.pinned_cert_hash.as_deref().map(str::parse::<CertHash>) {
            Some(Ok(hash)) => hash,
            Some(Err(e)) => {
                warn!("ignoring unusable pinned certificate hash: {e}");
                CertHash([0u8; 32])
            }
            None => {
                warn!("no pinned certificate hash configured; no certificate will be accepted for the server itself");
                CertHash([0u8; 32])
            }
        };
        Settings {
            server_host: server
                .or(srv.host)
                .unwrap_or_else(|| "verify.certhunt.net".into()),
            pinned_hash,
            store_path: store
                .or(c.store_path)
                .unwrap_or_else(|| PathBuf::from("certhunt.db")),
            public_ip_cache_validity: h.public_ip_cache_validity.unwrap_or(60),
            server_ip_cache_validity: h.server_ip_cache_validity.unwrap_or(3600),
            task_reexecution_interval: h.task_reexecution_interval.unwrap_or(21_600),
            traceroute_max_hops: h.traceroute_max_hops.unwrap_or(20),
            traceroute_samples_per_hop: h.traceroute_samples_per_hop.unwrap_or(5),
            trust_automatically: g.trust_automatically.unwrap_or(true),
            rating_to_trust_automatically: g.rating_to_trust_automatically.unwrap_or(100),
            guard_cache_validity: g.cache_validity.unwrap_or(604_800),
            behind_ssl_proxy: g.behind_ssl_proxy.unwrap_or(false),
            request_timeout: Duration::from_millis(n.request_timeout_ms.unwrap_or(30_000)),
            connect_timeout: Duration::from_millis(n.connect_timeout_ms.unwrap_or(20_000)),
            handshake_timeout: Duration::from_millis(n.handshake_timeout_ms.unwrap_or(10_000)),
        }
    }

    fn guard_config(&self) -> GuardConfig {
        GuardConfig {
            server_host: self.server_host.clone(),
            trust_automatically: self.trust_automatically,
            rating_to_trust_automatically: self.rating_to_trust_automatically,
            cache_validity: self.guard_cache_validity,
            behind_ssl_proxy: self.behind_ssl_proxy,
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let loaded = config::load_config(cli.config.as_deref());
    match cli.command {
        Commands::Version => {
            println!(
                "certhunt {} (core {})",
                env!("CARGO_PKG_VERSION"),
                certhunt_core::version()
            );
        }
        Commands::Hunt { server, store } => {
            let settings = Settings::resolve(&loaded, server, store);
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_hunt(settings))?;
        }
        Commands::Verify {
            host,
            port,
            server,
            store,
            format,
        } => {
            let settings = Settings::resolve(&loaded, server, store);
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_verify(settings, host, port, format))?;
        }
        Commands::Cache { cmd } => run_cache(cmd, &loaded)?,
    }
    Ok(())
}

fn open_store(settings: &Settings) -> Result<SharedDb> {
    let db = Db::open_or_create(&settings.store_path)?;
    match db.sweep_expired_trust(now_unix()) {
        Ok(n) if n > 0 => info!("swept {n} expired trust entries"),
        Ok(_) => {}
        Err(e) => warn!("sweeping expired trust entries failed: {e}"),
    }
    Ok(db.into_shared())
}

struct Engine {
    events: mpsc::Sender<WorkerEvent>,
    worker: tokio::task::JoinHandle<()>,
    pump: tokio::task::JoinHandle<Result<()>>,
}

impl Engine {
    /// Wait for the pump (and with it the worker) to wind down.
    async fn finish(self) -> Result<()> {
        let result = self
            .pump
            .await
            .map_err(|e| anyhow!("request pump failed: {e}"))?;
        let _ = self.worker.await;
        result
    }
}

fn spawn_engine(
    settings: &Settings,
    transport: Arc<dyn HttpTransport>,
    db: SharedDb,
    clock: Arc<ServerClock>,
    reporter: Arc<dyn Reporter>,
) -> Result<Engine> {
    let fetcher = Arc::new(RustlsChainFetcher::new(
        settings.connect_timeout,
        settings.handshake_timeout,
    )?);
    let sys_tracer = Arc::new(tracer::SystemTracer {
        max_hops: settings.traceroute_max_hops,
        samples_per_hop: settings.traceroute_samples_per_hop,
    });
    let (ev_tx, ev_rx) = mpsc::channel(256);
    let (req_tx, req_rx) = mpsc::channel(256);
    let worker = HunterWorker::new(
        HunterConfig {
            public_ip_cache_validity: settings.public_ip_cache_validity,
            server_ip_cache_validity: settings.server_ip_cache_validity,
            batch_size: 5,
        },
        fetcher,
        sys_tracer,
        ev_rx,
        req_tx,
    );
    let worker = tokio::spawn(worker.run());
    let probe_collector = ProbeCollector::new(
        transport,
        settings.server_host.clone(),
        reporter.clone(),
    );
    // Public IPs normally arrive piggybacked on server replies; the sealed
    // public-ip exchange needs a platform-provided cipher and is absent in
    // the plain CLI, so unsatisfied requests degrade to a family skip.
    let p = pump::Pump {
        events: ev_tx.clone(),
        requests: req_rx,
        server_host: settings.server_host.clone(),
        clock,
        db,
        collector: probe_collector,
        pip: None,
        reporter,
    };
    let pump = tokio::spawn(p.run());
    Ok(Engine {
        events: ev_tx,
        worker,
        pump,
    })
}

async fn run_hunt(settings: Settings) -> Result<()> {
    let reporter: Arc<dyn Reporter> = Arc::new(LogReporter);
    let db = open_store(&settings)?;
    let transport: Arc<dyn HttpTransport> =
        Arc::new(ReqwestTransport::new(settings.request_timeout)?);
    let clock = Arc::new(ServerClock::new());
    let engine = spawn_engine(&settings, transport.clone(), db.clone(), clock.clone(), reporter.clone())?;

    let mut processor = TaskListProcessor::new(
        transport,
        settings.server_host.clone(),
        engine.events.clone(),
        clock,
        db,
        None,
        reporter,
        settings.task_reexecution_interval,
    );
    let summary = processor.pull_and_process().await?;
    if summary.accepted == 0 {
        let _ = engine.events.send(WorkerEvent::Shutdown).await;
    }
    engine.finish().await
}

async fn run_verify(
    settings: Settings,
    host: String,
    port: u16,
    format: OutputFormat,
) -> Result<()> {
    let reporter: Arc<dyn Reporter> = Arc::new(LogReporter);
    let db = open_store(&settings)?;
    let transport: Arc<dyn HttpTransport> =
        Arc::new(ReqwestTransport::new(settings.request_timeout)?);
    let clock = Arc::new(ServerClock::new());

    let resolved = net::resolve(&host).await;
    let ip = resolved
        .v4
        .map(IpAddr::V4)
        .or_else(|| resolved.v6.map(IpAddr::V6))
        .ok_or_else(|| anyhow!("could not resolve {host}"))?;

    let fetcher = RustlsChainFetcher::new(settings.connect_timeout, settings.handshake_timeout)?;
    let mut outcome = fetcher.fetch_chain(ip, port, &host, false).await;
    if matches!(outcome, FetchOutcome::HandshakeMismatch) {
        outcome = fetcher.fetch_chain(ip, port, &host, true).await;
    }
    let chain = match outcome {
        FetchOutcome::Chain(chain) if !chain.is_empty() => chain,
        FetchOutcome::Chain(_) => bail!("{host}:{port} sent no certificate"),
        FetchOutcome::HandshakeMismatch | FetchOutcome::Failed(_) => {
            bail!("could not obtain a certificate from {host}:{port}")
        }
    };
    let hash = sha256(&chain[0]);
    let host_key = format!("{host}|{ip}|{port}");

    let engine = spawn_engine(&settings, transport.clone(), db.clone(), clock.clone(), reporter.clone())?;
    let cache = TrustDecisionCache::new(db, settings.server_host.clone(), settings.pinned_hash);
    let mut cert_guard = VerificationGuard::new(
        settings.guard_config(),
        transport,
        cache,
        clock,
        reporter,
        engine.events.clone(),
    );

    let mut verdict = cert_guard.cache_mut().check_validity(hash, &host, false);
    let mut rating = None;
    let mut report = None;
    if verdict == CacheVerdict::NotInCache {
        cert_guard.enqueue(chain, hash, &host_key);
        cert_guard.drive().await?;
        if let Some((r, rep)) = cert_guard.take_last_result() {
            rating = Some(r);
            report = Some(rep);
        }
        verdict = cert_guard.cache_mut().check_validity(hash, &host, false);
    }

    if cert_guard.forwarded_tasks() == 0 {
        let _ = engine.events.send(WorkerEvent::Shutdown).await;
    }
    if let Err(e) = engine.finish().await {
        warn!("hunting alongside verification failed: {e}");
    }

    match format {
        OutputFormat::Text => {
            println!("{host}:{port} ({ip})");
            println!("  certificate: {hash}");
            println!("  verdict: {}", verdict_label(verdict));
            if let Some(r) = rating {
                println!("  server rating: {r}");
            }
            if let Some(rep) = report {
                for line in rep.lines() {
                    println!("  | {line}");
                }
            }
        }
        OutputFormat::Json => {
            let obj = serde_json::json!({
                "host": host,
                "ip": ip.to_string(),
                "port": port,
                "cert_hash": hash.to_string(),
                "verdict": verdict_label(verdict),
                "rating": rating,
                "report": report,
            });
            println!("{}", serde_json::to_string(&obj)?);
        }
    }
    Ok(())
}

fn verdict_label(verdict: CacheVerdict) -> &'static str {
    match verdict {
        CacheVerdict::Ok => "trusted",
        CacheVerdict::NotValid => "not trusted",
        CacheVerdict::ServerOk => "verification server (pinned certificate)",
        CacheVerdict::ServerNotValid => "REJECTED: not the pinned verification-server certificate",
        CacheVerdict::NotInCache => "undecided",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_fall_back_to_defaults() {
        let s = Settings::resolve(&None, None, None);
        assert_eq!(s.server_host, "verify.certhunt.net");
        assert_eq!(s.task_reexecution_interval, 21_600);
        assert_eq!(s.public_ip_cache_validity, 60);
        assert_eq!(s.rating_to_trust_automatically, 100);
        assert_eq!(s.pinned_hash, CertHash([0u8; 32]));
    }

    #[test]
    fn settings_merge_field_by_field() {
        let pinned = sha256(b"server-cert");
        let cfg: config::Config = serde_yaml::from_str(&format!(
            "server:\n  host: hunt.example.org\n  pinned_cert_hash: \"{pinned}\"\nhunter:\n  task_reexecution_interval: 3600\n",
        ))
        .unwrap();
        let s = Settings::resolve(&Some(cfg), None, None);
        assert_eq!(s.server_host, "hunt.example.org");
        assert_eq!(s.pinned_hash, pinned);
        assert_eq!(s.task_reexecution_interval, 3600);
        // untouched fields keep their defaults
        assert_eq!(s.server_ip_cache_validity, 3600);
        assert!(s.trust_automatically);
    }

    #[test]
    fn cli_flag_wins_over_config() {
        let cfg: config::Config =
            serde_yaml::from_str("server:\n  host: hunt.example.org\n").unwrap();
        let s = Settings::resolve(&Some(cfg), Some("other.example.net".into()), None);
        assert_eq!(s.server_host, "other.example.net");
    }
}

fn run_cache(cmd: CacheCmd, cfg: &Option<config::Config>) -> Result<()> {
    match cmd {
        CacheCmd::List { store } => {
            let settings = Settings::resolve(cfg, None, store);
            let db = open_store(&settings)?;
            for row in lock_db(&db).list_trust()? {
                println!("{}", serde_json::to_string(&row)?);
            }
        }
        CacheCmd::Remove { hash, host, store } => {
            let settings = Settings::resolve(cfg, None, store);
            let db = open_store(&settings)?;
            let hash: CertHash = hash.parse()?;
            let mut cache =
                TrustDecisionCache::new(db, settings.server_host.clone(), settings.pinned_hash);
            cache.remove(hash, &host);
            println!("removed {hash} for {host}");
        }
    }
    Ok(())
}
