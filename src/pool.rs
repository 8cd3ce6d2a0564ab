//! Pool orchestration
//!
//! Wires the daemon manager, job manager and stratum server together:
//! startup detection against the daemon, template polling, block submission
//! for solving shares and the rebroadcast watchdog that keeps miners fed
//! when no new block arrives.

use crate::algo::MULTIPLIER;
use crate::config::{PoolConfig, RewardKind};
use crate::daemon::DaemonManager;
use crate::error::{Error, Result};
use crate::job_manager::{JobManager, JobManagerOptions, ShareEvent};
use crate::stratum::server::{AuthorizeFn, ServerState, StratumServer};
use crate::template::RpcBlockTemplate;
use crate::util;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// getblocktemplate parameters the pool always requests
fn template_params() -> Value {
    json!([{
        "capabilities": ["coinbasetxn", "workid", "coinbase/append"],
        "rules": ["segwit"],
    }])
}

/// One running pool: daemon client, job manager and stratum server
pub struct Pool {
    config: Arc<PoolConfig>,
    daemon: Arc<DaemonManager>,
    authorize_fn: AuthorizeFn,
    job_manager: OnceCell<Arc<JobManager>>,
    has_submit_method: AtomicBool,
    share_rx: Mutex<Option<mpsc::UnboundedReceiver<ShareEvent>>>,
}

impl Pool {
    /// Build a pool from validated configuration and an authorization hook
    pub fn new(config: PoolConfig, authorize_fn: AuthorizeFn) -> Result<Self> {
        let daemon = Arc::new(DaemonManager::new(&config.daemons)?);
        Ok(Self {
            config: Arc::new(config),
            daemon,
            authorize_fn,
            job_manager: OnceCell::new(),
            has_submit_method: AtomicBool::new(false),
            share_rx: Mutex::new(None),
        })
    }

    fn job_manager(&self) -> Result<&Arc<JobManager>> {
        self.job_manager
            .get()
            .ok_or_else(|| Error::other("pool not started"))
    }

    /// Full startup sequence followed by the event loop. Runs until the
    /// task is cancelled.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.daemon.is_online().await?;

        let pool_script = self.detect_coin_data().await?;
        let recipients = self.config.resolve_recipients();

        let hasher = crate::algo::from_name(&self.config.coin.algorithm)
            .ok_or_else(|| Error::startup("unknown hash algorithm"))?;
        let (share_tx, share_rx) = mpsc::unbounded_channel();
        *self.share_rx.lock() = Some(share_rx);
        let job_manager = Arc::new(JobManager::new(
            JobManagerOptions {
                pool_script,
                reward: self.config.coin.reward,
                tx_messages: self.config.coin.tx_messages,
                recipients,
                hasher,
            },
            share_tx,
        ));
        let _ = self.job_manager.set(job_manager.clone());

        self.ensure_blockchain_synced().await;
        self.get_first_job().await?;

        let state = Arc::new(ServerState::new(
            self.config.clone(),
            job_manager.clone(),
            self.authorize_fn.clone(),
        ));
        StratumServer::new(state.clone()).start().await?;

        self.log_pool_info(&job_manager);
        self.spawn_block_polling();

        self.run_event_loop(job_manager).await
    }

    /// Initial batch RPC: validate the pool address, detect the submission
    /// method, and pull network stats for the startup banner. Returns the
    /// coinbase output script.
    async fn detect_coin_data(&self) -> Result<Vec<u8>> {
        let batch = [
            ("validateaddress", json!([self.config.address])),
            ("getmininginfo", json!([])),
            ("submitblock", json!([])),
            ("getblockchaininfo", json!([])),
            ("getnetworkinfo", json!([])),
        ];
        let outcome = self.daemon.batch_cmd(&batch).await;
        if let Some(error) = &outcome.error {
            return Err(Error::startup(format!(
                "init batch rpc call failed: {}",
                error
            )));
        }
        let responses = outcome
            .response
            .as_ref()
            .and_then(Value::as_array)
            .ok_or_else(|| Error::startup("init batch rpc call returned no responses"))?;
        if responses.len() != batch.len() {
            return Err(Error::startup("init batch rpc response count mismatch"));
        }

        let result_of = |i: usize| -> &Value { &responses[i]["result"] };
        for (i, (method, _)) in batch.iter().enumerate() {
            // submitblock is probed with bad params on purpose
            if *method != "submitblock" && result_of(i).is_null() {
                return Err(Error::startup(format!(
                    "init rpc {} failed: {}",
                    method, responses[i]["error"]
                )));
            }
        }

        let validate = result_of(0);
        if validate["isvalid"] != json!(true) {
            return Err(Error::startup("daemon reports pool address is not valid"));
        }

        // POS coinbases pay to the raw pubkey, which the daemon only reveals
        // for wallet-owned addresses
        let pool_script = match self.config.coin.reward {
            RewardKind::Pos => {
                let pubkey = validate["pubkey"].as_str().ok_or_else(|| {
                    Error::startup(
                        "the pool address is not from the daemon wallet, required for POS coins",
                    )
                })?;
                util::pubkey_to_script(pubkey)?
            }
            RewardKind::Pow => {
                let address = validate["address"].as_str().unwrap_or(&self.config.address);
                util::address_to_script(address)?
            }
        };

        let submit_error = &responses[2]["error"];
        if submit_error["message"] == json!("Method not found") {
            self.has_submit_method.store(false, Ordering::Relaxed);
        } else if submit_error["code"] == json!(-1) {
            self.has_submit_method.store(true, Ordering::Relaxed);
        } else {
            return Err(Error::startup(format!(
                "could not detect block submission rpc method: {}",
                submit_error
            )));
        }

        let chain = result_of(3)["chain"].as_str().unwrap_or("main");
        let connections = result_of(4)["connections"].as_u64().unwrap_or(0);
        let hashrate = result_of(1)["networkhashps"].as_f64().unwrap_or(0.0);
        tracing::info!(
            "connected to {} ({} peers), network hash rate {}",
            chain,
            connections,
            util::hash_rate_string(hashrate)
        );

        Ok(pool_script)
    }

    /// A daemon still downloading the chain answers getblocktemplate with
    /// code -10; wait it out before serving work.
    async fn ensure_blockchain_synced(&self) {
        loop {
            let outcomes = self.daemon.cmd("getblocktemplate", template_params()).await;
            let synced = outcomes.iter().all(|o| {
                o.rpc_error
                    .as_ref()
                    .map_or(true, |e| e["code"] != json!(-10))
            });
            if synced {
                return;
            }
            tracing::warn!("daemon is still syncing with the network, waiting");
            self.log_sync_progress().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }

    async fn log_sync_progress(&self) {
        let chain_info = self.daemon.cmd("getblockchaininfo", json!([])).await;
        let blocks = chain_info
            .iter()
            .filter_map(|o| o.response.as_ref())
            .filter_map(|r| r["blocks"].as_u64())
            .max()
            .unwrap_or(0);

        let peer_info = self.daemon.cmd("getpeerinfo", json!([])).await;
        let peers = peer_info
            .first()
            .and_then(|o| o.response.as_ref())
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let total = peers
            .iter()
            .filter_map(|p| p["startingheight"].as_u64())
            .max()
            .unwrap_or(0);
        if total > 0 {
            tracing::warn!(
                "downloaded {:.2}% of blockchain from {} peers",
                blocks as f64 / total as f64 * 100.0,
                peers.len()
            );
        }
    }

    async fn get_first_job(&self) -> Result<()> {
        self.fetch_block_template().await.map_err(|e| {
            Error::startup(format!(
                "getblocktemplate failed creating the first job, server cannot start: {}",
                e
            ))
        })?;

        let job = self
            .job_manager()?
            .current_job()
            .ok_or_else(|| Error::startup("no job after first template"))?;
        let network_diff = job.difficulty * MULTIPLIER;
        for (port, cfg) in &self.config.ports {
            if network_diff < cfg.diff {
                tracing::warn!(
                    "network diff {} is lower than port {} w/ diff {}",
                    network_diff,
                    port,
                    cfg.diff
                );
            }
        }
        Ok(())
    }

    fn log_pool_info(&self, job_manager: &JobManager) {
        let height = job_manager
            .current_job()
            .map(|job| job.rpc_data.height)
            .unwrap_or(0);
        let ports: Vec<String> = self.config.ports.keys().map(u16::to_string).collect();
        tracing::info!(
            "stratum pool server started for {} [{}] at height {}, ports {}, fee {}%",
            self.config.coin.name,
            self.config.coin.symbol.to_uppercase(),
            height,
            ports.join(", "),
            self.config.fee_percent()
        );
        if self.config.block_refresh_interval > 0 {
            tracing::info!(
                "block polling every {} ms",
                self.config.block_refresh_interval
            );
        } else {
            tracing::info!("block template polling has been disabled");
        }
    }

    fn spawn_block_polling(self: &Arc<Self>) {
        if self.config.block_refresh_interval == 0 {
            return;
        }
        let pool = self.clone();
        let interval = Duration::from_millis(pool.config.block_refresh_interval);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match pool.fetch_block_template().await {
                    Ok(true) => tracing::info!("block notification via rpc polling"),
                    Ok(false) => {}
                    Err(e) => tracing::error!("template poll failed: {}", e),
                }
            }
        });
    }

    /// Fetch a template from the first healthy daemon and feed it to the
    /// job manager. Returns true when it rolled jobs over to a new block.
    async fn fetch_block_template(&self) -> Result<bool> {
        let outcomes = self.daemon.cmd("getblocktemplate", template_params()).await;
        let outcome = outcomes
            .into_iter()
            .next()
            .ok_or_else(|| Error::daemon("no daemon instances"))?;
        if !outcome.is_ok() {
            return Err(Error::daemon(format!(
                "getblocktemplate failed for daemon instance {}: {:?} {:?}",
                outcome.instance, outcome.error, outcome.rpc_error
            )));
        }
        let rpc_data: RpcBlockTemplate = serde_json::from_value(
            outcome
                .response
                .ok_or_else(|| Error::daemon("empty getblocktemplate response"))?,
        )?;
        self.job_manager()?.process_template(rpc_data)
    }

    /// Refresh the transaction set without declaring a new block, for the
    /// rebroadcast watchdog
    async fn refresh_current_job(&self) -> Result<()> {
        let outcomes = self.daemon.cmd("getblocktemplate", template_params()).await;
        let outcome = outcomes
            .into_iter()
            .next()
            .ok_or_else(|| Error::daemon("no daemon instances"))?;
        if !outcome.is_ok() {
            return Err(Error::daemon("getblocktemplate failed on rebroadcast"));
        }
        let rpc_data: RpcBlockTemplate = serde_json::from_value(
            outcome
                .response
                .ok_or_else(|| Error::daemon("empty getblocktemplate response"))?,
        )?;

        // a template for a different previous hash is a new block, let the
        // normal path broadcast it with clean_jobs instead
        let job_manager = self.job_manager()?;
        if job_manager.process_template(rpc_data.clone())? {
            return Ok(());
        }
        job_manager.update_current_job(rpc_data)
    }

    async fn run_event_loop(self: &Arc<Self>, job_manager: Arc<JobManager>) -> Result<()> {
        let mut share_rx = self
            .share_rx
            .lock()
            .take()
            .ok_or_else(|| Error::other("share channel already taken"))?;
        let mut job_rx = job_manager.subscribe_jobs();
        let rebroadcast = Duration::from_secs(self.config.job_rebroadcast_timeout);
        let mut deadline = tokio::time::Instant::now() + rebroadcast;

        loop {
            tokio::select! {
                event = share_rx.recv() => {
                    match event {
                        Some(event) => self.handle_share_event(event).await,
                        None => return Err(Error::other("share channel closed")),
                    }
                }
                event = job_rx.recv() => {
                    // any broadcast resets the watchdog
                    if event.is_ok() {
                        deadline = tokio::time::Instant::now() + rebroadcast;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::info!(
                        "no new blocks for {} seconds, updating transactions and rebroadcasting work",
                        self.config.job_rebroadcast_timeout
                    );
                    if let Err(e) = self.refresh_current_job().await {
                        tracing::error!("job rebroadcast failed: {}", e);
                    }
                    deadline = tokio::time::Instant::now() + rebroadcast;
                }
            }
        }
    }

    async fn handle_share_event(self: &Arc<Self>, event: ShareEvent) {
        let data = &event.data;
        match &data.error {
            Some(error) => {
                tracing::debug!(
                    "rejected share from {} [{}] on job {}: {}",
                    data.worker, data.ip, data.job_id, error
                );
            }
            None => {
                tracing::debug!(
                    "accepted share from {} [{}] diff {}/{:?}",
                    data.worker, data.ip, data.difficulty, data.share_diff
                );
            }
        }

        let (block_hex, block_hash) = match (&event.block_hex, &data.block_hash) {
            (Some(block_hex), Some(block_hash)) => (block_hex.clone(), block_hash.clone()),
            _ => return,
        };

        tracing::info!(
            "block candidate {} found by {} at height {:?}",
            block_hash, data.worker, data.height
        );
        if let Err(e) = self.submit_block(&block_hex).await {
            tracing::error!("block submission failed: {}", e);
        }
        match self.check_block_accepted(&block_hash).await {
            Some(tx_hash) => {
                tracing::info!("block {} accepted, generation tx {}", block_hash, tx_hash)
            }
            None => tracing::error!("block {} was not accepted by any daemon", block_hash),
        }
        match self.fetch_block_template().await {
            Ok(true) => tracing::info!("jobs rolled over to the next block"),
            Ok(false) => {}
            Err(e) => tracing::error!("template refresh after block failed: {}", e),
        }
    }

    /// Submit a serialized block to every daemon, with submitblock or the
    /// getblocktemplate submit mode depending on what the daemon supports
    async fn submit_block(&self, block_hex: &str) -> Result<()> {
        let (method, params) = if self.has_submit_method.load(Ordering::Relaxed) {
            ("submitblock", json!([block_hex]))
        } else {
            ("getblocktemplate", json!([{"mode": "submit", "data": block_hex}]))
        };

        let outcomes = self.daemon.cmd(method, params).await;
        for outcome in &outcomes {
            if !outcome.is_ok() {
                return Err(Error::daemon(format!(
                    "rpc error with daemon instance {} when submitting block with {}: {:?} {:?}",
                    outcome.instance, method, outcome.error, outcome.rpc_error
                )));
            }
            if outcome.response == Some(json!("rejected")) {
                return Err(Error::daemon(format!(
                    "daemon instance {} rejected a supposedly valid block",
                    outcome.instance
                )));
            }
        }
        tracing::info!("submitted block using {} to all daemon instances", method);
        Ok(())
    }

    /// Verify via getblock that a submitted block made it into the chain.
    /// Returns the generation transaction hash when accepted.
    async fn check_block_accepted(&self, block_hash: &str) -> Option<String> {
        let outcomes = self.daemon.cmd("getblock", json!([block_hash])).await;
        outcomes
            .iter()
            .filter_map(|o| o.response.as_ref())
            .find(|r| r["hash"] == json!(block_hash))
            .and_then(|r| r["tx"][0].as_str())
            .map(str::to_string)
    }

    /// Entry point for external block notifications (blocknotify scripts).
    /// Fetches fresh work when the notified hash is not what we mine on.
    pub async fn process_block_notify(&self, block_hash: &str, source: &str) {
        tracing::info!("block notification via {}", source);
        let current = match self.job_manager().ok().and_then(|jm| jm.current_job()) {
            Some(job) => job,
            None => return,
        };
        if current.rpc_data.previousblockhash != block_hash {
            if let Err(e) = self.fetch_block_template().await {
                tracing::error!(
                    "block notify error getting block template for {}: {}",
                    self.config.coin.name, e
                );
            }
        }
    }
}
