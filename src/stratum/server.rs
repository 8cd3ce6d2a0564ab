//! Stratum TCP/TLS listeners and shared server state
//!
//! One accept loop per configured port, each connection handed to a
//! [`Session`](crate::stratum::client::Session) task. Shared state carries
//! the ban table, the session registry and the authorization callback.

use crate::config::{BanningConfig, PoolConfig, PortConfig, TlsConfig};
use crate::error::{Error, Result};
use crate::job_manager::{JobEvent, JobManager};
use crate::stratum::client::Session;
use crate::template::BlockTemplate;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use std::fs::File;
use std::io::BufReader;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;

/// Result of an authorization callback
#[derive(Debug, Clone, Default)]
pub struct AuthorizeOutcome {
    /// Whether the worker may submit shares
    pub authorized: bool,
    /// Error value forwarded verbatim to the miner, if any
    pub error: Option<Value>,
    /// Close the connection after replying
    pub disconnect: bool,
}

impl AuthorizeOutcome {
    /// Accept the worker
    pub fn accept() -> Self {
        Self {
            authorized: true,
            ..Self::default()
        }
    }
}

/// Pool-supplied worker authorization hook
pub type AuthorizeFn = Arc<
    dyn Fn(IpAddr, u16, String, String) -> BoxFuture<'static, AuthorizeOutcome> + Send + Sync,
>;

/// State shared by every session and the accept loops
pub struct ServerState {
    config: Arc<PoolConfig>,
    job_manager: Arc<JobManager>,
    authorize_fn: AuthorizeFn,
    banned: DashMap<IpAddr, Instant>,
    sessions: DashMap<String, ()>,
    subscription_counter: AtomicU64,
}

impl ServerState {
    /// Build shared state for one pool instance
    pub fn new(
        config: Arc<PoolConfig>,
        job_manager: Arc<JobManager>,
        authorize_fn: AuthorizeFn,
    ) -> Self {
        Self {
            config,
            job_manager,
            authorize_fn,
            banned: DashMap::new(),
            sessions: DashMap::new(),
            subscription_counter: AtomicU64::new(0),
        }
    }

    /// Monotonic subscription ids with a fixed recognizable prefix
    pub fn next_subscription_id(&self) -> String {
        let count = self.subscription_counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("deadbeefcafebabe{}", hex::encode(count.to_le_bytes()))
    }

    /// The job manager
    pub fn job_manager(&self) -> &JobManager {
        &self.job_manager
    }

    /// The worker authorization hook
    pub fn authorize_fn(&self) -> &AuthorizeFn {
        &self.authorize_fn
    }

    /// Subscribe to job broadcasts
    pub fn subscribe_jobs(&self) -> broadcast::Receiver<JobEvent> {
        self.job_manager.subscribe_jobs()
    }

    /// The job currently being worked on
    pub fn current_job(&self) -> Option<Arc<BlockTemplate>> {
        self.job_manager.current_job()
    }

    /// Configuration of one listening port
    pub fn port_config(&self, port: u16) -> Option<&PortConfig> {
        self.config.ports.get(&port)
    }

    /// Banning policy, if configured
    pub fn banning(&self) -> Option<&BanningConfig> {
        self.config.banning.as_ref()
    }

    /// Seconds of silence before a connection is dropped
    pub fn connection_timeout(&self) -> u64 {
        self.config.connection_timeout
    }

    /// Whether connections lead with a PROXY protocol line
    pub fn tcp_proxy_protocol(&self) -> bool {
        self.config.tcp_proxy_protocol
    }

    /// Record a ban for an address
    pub fn add_ban(&self, ip: IpAddr) {
        self.banned.insert(ip, Instant::now());
    }

    /// True when the address is still banned. Expired bans are forgiven on
    /// the next connection attempt.
    pub fn check_ban(&self, ip: IpAddr) -> bool {
        let banning = match self.banning() {
            Some(banning) if banning.enabled => banning,
            _ => return false,
        };
        if let Some(entry) = self.banned.get(&ip) {
            if entry.elapsed() < Duration::from_secs(banning.time) {
                return true;
            }
        }
        if self.banned.remove(&ip).is_some() {
            tracing::info!("forgave banned ip {}", ip);
        }
        false
    }

    /// Drop ban entries older than the ban duration
    pub fn purge_bans(&self) {
        let banning = match self.banning() {
            Some(banning) if banning.enabled => banning,
            _ => return,
        };
        let ban_duration = Duration::from_secs(banning.time);
        self.banned.retain(|_, banned_at| banned_at.elapsed() < ban_duration);
    }

    /// Track a live session
    pub fn register_session(&self, subscription_id: &str) {
        self.sessions.insert(subscription_id.to_string(), ());
    }

    /// Drop a session from the registry
    pub fn unregister_session(&self, subscription_id: &str) {
        self.sessions.remove(subscription_id);
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

/// The stratum server: binds every configured port and spawns accept loops
pub struct StratumServer {
    state: Arc<ServerState>,
}

impl StratumServer {
    /// Wrap shared state into a server
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    /// The shared state
    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    fn load_tls_acceptor(tls: &TlsConfig) -> Result<TlsAcceptor> {
        let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(&tls.cert)?))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(&tls.key)?))?
            .ok_or_else(|| Error::config("no private key found in tls key file"))?;
        let config = tokio_rustls::rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::config(format!("invalid tls key material: {}", e)))?;
        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    /// Bind all configured ports and start accepting. Returns once every
    /// listener is bound; accept loops keep running in spawned tasks.
    pub async fn start(&self) -> Result<()> {
        let ports: Vec<(u16, bool)> = self
            .state
            .config
            .ports
            .iter()
            .map(|(port, cfg)| (*port, cfg.tls))
            .collect();

        let needs_tls = ports.iter().any(|(_, tls)| *tls);
        let acceptor = if needs_tls {
            let tls = self
                .state
                .config
                .tls
                .as_ref()
                .ok_or_else(|| Error::config("tls ports configured without key material"))?;
            Some(Self::load_tls_acceptor(tls)?)
        } else {
            None
        };

        for (port, tls) in ports {
            let listener = TcpListener::bind(("0.0.0.0", port)).await?;
            let state = self.state.clone();
            let acceptor = if tls { acceptor.clone() } else { None };
            tracing::info!(port, tls, "stratum listener started");
            tokio::spawn(async move {
                loop {
                    let (socket, peer) = match listener.accept().await {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::error!(port, "accept failed: {}", e);
                            continue;
                        }
                    };
                    let _ = socket.set_nodelay(true);
                    let session = Session::new(state.clone(), port, peer.ip());
                    match acceptor.clone() {
                        Some(acceptor) => {
                            tokio::spawn(async move {
                                match acceptor.accept(socket).await {
                                    Ok(stream) => session.run(stream).await,
                                    Err(e) => {
                                        tracing::debug!(port, "tls handshake failed: {}", e)
                                    }
                                }
                            });
                        }
                        None => {
                            tokio::spawn(session.run(socket));
                        }
                    }
                }
            });
        }

        // sweep expired bans so the table cannot grow without bound
        if let Some(banning) = self.state.banning().filter(|b| b.enabled).cloned() {
            let state = self.state.clone();
            tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(Duration::from_secs(banning.purge_interval));
                loop {
                    interval.tick().await;
                    state.purge_bans();
                }
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RewardKind;
    use crate::job_manager::JobManagerOptions;
    use tokio::sync::mpsc;

    fn test_state(banning: Option<BanningConfig>) -> ServerState {
        let config: PoolConfig = toml::from_str(
            r#"
            address = "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa"
            [coin]
            name = "Testcoin"
            symbol = "TST"
            reward = "POW"
            [ports.3333]
            diff = 8.0
            [[daemons]]
            port = 19332
            user = "u"
            password = "p"
            "#,
        )
        .unwrap();
        let mut config = config;
        config.banning = banning;

        let (share_tx, _share_rx) = mpsc::unbounded_channel();
        let job_manager = Arc::new(JobManager::new(
            JobManagerOptions {
                pool_script: crate::util::address_to_script(&config.address).unwrap(),
                reward: RewardKind::Pow,
                tx_messages: false,
                recipients: Vec::new(),
                hasher: crate::algo::from_name("sha256d").unwrap(),
            },
            share_tx,
        ));
        let authorize_fn: AuthorizeFn =
            Arc::new(|_, _, _, _| Box::pin(async { AuthorizeOutcome::accept() }));
        ServerState::new(Arc::new(config), job_manager, authorize_fn)
    }

    #[test]
    fn test_subscription_ids_are_unique_and_prefixed() {
        let state = test_state(None);
        let a = state.next_subscription_id();
        let b = state.next_subscription_id();
        assert_ne!(a, b);
        assert!(a.starts_with("deadbeefcafebabe"));
        assert_eq!(a.len(), 16 + 16);
    }

    #[test]
    fn test_ban_lifecycle() {
        let banning = BanningConfig {
            enabled: true,
            time: 600,
            invalid_percent: 50.0,
            check_threshold: 500,
            purge_interval: 300,
        };
        let state = test_state(Some(banning));
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        assert!(!state.check_ban(ip));
        state.add_ban(ip);
        assert!(state.check_ban(ip));

        state.purge_bans();
        assert!(state.check_ban(ip)); // not yet expired
    }

    #[test]
    fn test_bans_ignored_when_disabled() {
        let state = test_state(None);
        let ip: IpAddr = "10.0.0.2".parse().unwrap();
        state.add_ban(ip);
        assert!(!state.check_ban(ip));
    }

    #[test]
    fn test_session_registry() {
        let state = test_state(None);
        state.register_session("sub1");
        state.register_session("sub2");
        assert_eq!(state.session_count(), 2);
        state.unregister_session("sub1");
        assert_eq!(state.session_count(), 1);
    }
}
