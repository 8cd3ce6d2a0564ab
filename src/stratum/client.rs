//! Per-connection stratum session
//!
//! Each accepted socket gets one task running [`Session::run`]. The task
//! owns the framed line stream and multiplexes miner requests against job
//! broadcasts with `select!`. Unparseable lines and flooding tear the
//! connection down; share quality is tracked for banning.

use crate::job_manager::{JobManager, ShareSubmission};
use crate::stratum::protocol::{RpcNotification, RpcRequest, RpcResponse, StratumError};
use crate::stratum::server::ServerState;
use crate::vardiff::{VarDiff, VarDiffState};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::net::IpAddr;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

/// Unterminated-line cap; anything longer is treated as flooding
const MAX_LINE_LENGTH: usize = 10240;

/// Default starting difficulty when a port does not configure one
pub const DEFAULT_DIFFICULTY: f64 = 8.0;

async fn send_json<S, T>(framed: &mut Framed<S, LinesCodec>, value: &T) -> Result<(), LinesCodecError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    // protocol messages are always serializable
    let line = serde_json::to_string(value).unwrap_or_default();
    framed.send(line).await
}

/// Mutable per-connection state
pub struct Session {
    state: std::sync::Arc<ServerState>,
    subscription_id: String,
    port: u16,
    remote: IpAddr,
    extranonce1: Option<String>,
    authorized: bool,
    worker_name: Option<String>,
    difficulty: Option<f64>,
    previous_difficulty: Option<f64>,
    pending_difficulty: Option<f64>,
    last_activity: Instant,
    shares_valid: u64,
    shares_invalid: u64,
    vardiff: Option<VarDiff>,
    vardiff_state: VarDiffState,
}

/// Why the session ended, for the disconnect log line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    Closed,
    Banned,
    Kicked,
    Flooded,
    Malformed,
    Idle,
    Error,
}

impl Session {
    /// Fresh session state for one accepted connection
    pub fn new(state: std::sync::Arc<ServerState>, port: u16, remote: IpAddr) -> Self {
        let vardiff = state
            .port_config(port)
            .and_then(|p| p.var_diff.as_ref().map(VarDiff::new));
        Self {
            subscription_id: state.next_subscription_id(),
            state,
            port,
            remote,
            extranonce1: None,
            authorized: false,
            worker_name: None,
            difficulty: None,
            previous_difficulty: None,
            pending_difficulty: None,
            last_activity: Instant::now(),
            shares_valid: 0,
            shares_invalid: 0,
            vardiff,
            vardiff_state: VarDiffState::default(),
        }
    }

    fn label(&self) -> String {
        format!(
            "{} [{}]",
            self.worker_name.as_deref().unwrap_or("(unauthorized)"),
            self.remote
        )
    }

    /// Starting difficulty for this session's port
    fn port_difficulty(&self) -> f64 {
        self.state
            .port_config(self.port)
            .map(|p| p.diff)
            .unwrap_or(DEFAULT_DIFFICULTY)
    }

    /// Drive the session until the miner disconnects or is torn down
    pub async fn run<S>(mut self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

        // the PROXY protocol line, when enabled, arrives before anything
        // else; a first line without the header is an ordinary message from
        // a directly connected miner and must not be dropped
        let mut pending_line = None;
        if self.state.tcp_proxy_protocol() {
            match framed.next().await {
                Some(Ok(line)) if line.starts_with("PROXY") => {
                    if let Some(source) = line.split(' ').nth(2) {
                        match source.parse() {
                            Ok(ip) => self.remote = ip,
                            Err(_) => tracing::warn!(
                                "unparseable source address in proxy line: {}",
                                source
                            ),
                        }
                    }
                }
                Some(Ok(line)) => {
                    tracing::warn!("expected proxy protocol line from {}", self.remote);
                    pending_line = Some(line);
                }
                _ => return,
            }
        }

        if self.state.check_ban(self.remote) {
            tracing::info!("kicked banned ip {}", self.remote);
            return;
        }

        let mut job_rx = self.state.subscribe_jobs();
        self.state.register_session(&self.subscription_id);
        let reason = self.drive(&mut framed, &mut job_rx, pending_line).await;
        self.state.unregister_session(&self.subscription_id);
        tracing::debug!("session {} ended: {:?}", self.label(), reason);
    }

    /// Parse one received line and dispatch it. `Ok(Some(_))` tears the
    /// session down.
    async fn handle_line<S>(
        &mut self,
        framed: &mut Framed<S, LinesCodec>,
        line: &str,
    ) -> Result<Option<Teardown>, LinesCodecError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if line.trim().is_empty() {
            return Ok(None);
        }
        let request: RpcRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(_) => {
                tracing::warn!("malformed message from {}: {}", self.label(), line);
                return Ok(Some(Teardown::Malformed));
            }
        };
        self.handle_request(framed, request).await
    }

    async fn drive<S>(
        &mut self,
        framed: &mut Framed<S, LinesCodec>,
        job_rx: &mut broadcast::Receiver<crate::job_manager::JobEvent>,
        pending_line: Option<String>,
    ) -> Teardown
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if let Some(line) = pending_line {
            match self.handle_line(framed, &line).await {
                Ok(None) => {}
                Ok(Some(reason)) => return reason,
                Err(_) => return Teardown::Error,
            }
        }

        loop {
            tokio::select! {
                line = framed.next() => {
                    match line {
                        Some(Ok(line)) => {
                            match self.handle_line(framed, &line).await {
                                Ok(None) => {}
                                Ok(Some(reason)) => return reason,
                                Err(_) => return Teardown::Error,
                            }
                        }
                        Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                            tracing::warn!("flooded socket from {}", self.remote);
                            return Teardown::Flooded;
                        }
                        Some(Err(_)) | None => return Teardown::Closed,
                    }
                }
                event = job_rx.recv() => {
                    match event {
                        Ok(event) => {
                            let params = event.job().job_params(event.clean_jobs());
                            match self.send_mining_job(framed, params).await {
                                Ok(true) => {}
                                Ok(false) => return Teardown::Idle,
                                Err(_) => return Teardown::Error,
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return Teardown::Closed,
                    }
                }
            }
        }
    }

    async fn handle_request<S>(
        &mut self,
        framed: &mut Framed<S, LinesCodec>,
        request: RpcRequest,
    ) -> Result<Option<Teardown>, LinesCodecError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match request.method.as_str() {
            "mining.subscribe" => self.handle_subscribe(framed, request).await,
            "mining.authorize" => self.handle_authorize(framed, request).await,
            "mining.submit" => {
                self.last_activity = Instant::now();
                self.handle_submit(framed, request).await
            }
            "mining.get_transactions" => {
                send_json(
                    framed,
                    &json!({"id": Value::Null, "result": [], "error": true}),
                )
                .await?;
                Ok(None)
            }
            other => {
                tracing::debug!("unknown stratum method from {}: {}", self.label(), other);
                Ok(None)
            }
        }
    }

    async fn handle_subscribe<S>(
        &mut self,
        framed: &mut Framed<S, LinesCodec>,
        request: RpcRequest,
    ) -> Result<Option<Teardown>, LinesCodecError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let extranonce1 = JobManager::next_extranonce1();
        self.extranonce1 = Some(extranonce1.clone());

        let result = json!([
            [
                ["mining.set_difficulty", self.subscription_id],
                ["mining.notify", self.subscription_id]
            ],
            extranonce1,
            JobManager::extranonce2_size()
        ]);
        send_json(framed, &RpcResponse::ok(request.id, result)).await?;

        // fresh subscribers get the port difficulty and the current job
        // immediately rather than waiting for the next broadcast
        self.send_difficulty(framed, self.port_difficulty()).await?;
        if let Some(job) = self.state.current_job() {
            let params = job.job_params(true);
            if !self.send_mining_job(framed, params).await? {
                return Ok(Some(Teardown::Idle));
            }
        }
        Ok(None)
    }

    async fn handle_authorize<S>(
        &mut self,
        framed: &mut Framed<S, LinesCodec>,
        request: RpcRequest,
    ) -> Result<Option<Teardown>, LinesCodecError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let worker = request
            .params
            .first()
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let password = request
            .params
            .get(1)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let outcome =
            (self.state.authorize_fn())(self.remote, self.port, worker.clone(), password).await;
        self.authorized = outcome.error.is_none() && outcome.authorized;
        if self.authorized {
            self.worker_name = Some(worker);
        }

        send_json(
            framed,
            &RpcResponse {
                id: request.id,
                result: json!(self.authorized),
                error: outcome.error.unwrap_or(Value::Null),
            },
        )
        .await?;

        if outcome.disconnect {
            return Ok(Some(Teardown::Kicked));
        }
        Ok(None)
    }

    async fn handle_submit<S>(
        &mut self,
        framed: &mut Framed<S, LinesCodec>,
        request: RpcRequest,
    ) -> Result<Option<Teardown>, LinesCodecError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if !self.authorized {
            send_json(
                framed,
                &RpcResponse::err(request.id, StratumError::UnauthorizedWorker),
            )
            .await?;
            if self.consider_ban(false) {
                return Ok(Some(Teardown::Banned));
            }
            return Ok(None);
        }
        let extranonce1 = match &self.extranonce1 {
            Some(extranonce1) => extranonce1.clone(),
            None => {
                send_json(
                    framed,
                    &RpcResponse::err(request.id, StratumError::NotSubscribed),
                )
                .await?;
                if self.consider_ban(false) {
                    return Ok(Some(Teardown::Banned));
                }
                return Ok(None);
            }
        };

        let param = |i: usize| -> String {
            request
                .params
                .get(i)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        let difficulty = self.difficulty.unwrap_or_else(|| self.port_difficulty());

        // feed the controller before validating so rejected shares still
        // count toward the submission rate
        if let Some(vardiff) = &self.vardiff {
            if let Some(new_diff) =
                vardiff.on_submit(&mut self.vardiff_state, difficulty, crate::util::unix_time())
            {
                self.pending_difficulty = Some(new_diff);
                tracing::debug!(
                    "vardiff retarget for {}: {} -> {}", self.label(), difficulty, new_diff
                );
            }
        }

        let submission = ShareSubmission {
            worker: param(0),
            job_id: param(1),
            extranonce2: param(2),
            ntime: param(3),
            nonce: param(4),
            extranonce1,
            difficulty,
            previous_difficulty: self.previous_difficulty,
            ip: self.remote,
            port: self.port,
        };
        let outcome = self.state.job_manager().process_share(&submission);

        let banned = self.consider_ban(outcome.valid);
        if !banned {
            let response = match outcome.error {
                Some(error) => RpcResponse::err(request.id, error),
                None => RpcResponse::ok(request.id, json!(true)),
            };
            send_json(framed, &response).await?;
        }
        if banned {
            return Ok(Some(Teardown::Banned));
        }
        Ok(None)
    }

    /// Track share quality and ban the IP when too large a fraction of a
    /// check window is invalid. Returns true when this share triggered a ban.
    fn consider_ban(&mut self, valid: bool) -> bool {
        let banning = match self.state.banning() {
            Some(banning) if banning.enabled => banning.clone(),
            _ => return false,
        };
        if valid {
            self.shares_valid += 1;
        } else {
            self.shares_invalid += 1;
        }
        let total = self.shares_valid + self.shares_invalid;
        if total >= banning.check_threshold {
            let percent_bad = self.shares_invalid as f64 / total as f64 * 100.0;
            if percent_bad < banning.invalid_percent {
                self.shares_valid = 0;
                self.shares_invalid = 0;
            } else {
                tracing::info!(
                    "banning {}: {} of the last {} shares were invalid",
                    self.label(),
                    self.shares_invalid,
                    total
                );
                self.state.add_ban(self.remote);
                return true;
            }
        }
        false
    }

    async fn send_difficulty<S>(
        &mut self,
        framed: &mut Framed<S, LinesCodec>,
        difficulty: f64,
    ) -> Result<bool, LinesCodecError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.difficulty == Some(difficulty) {
            return Ok(false);
        }
        self.previous_difficulty = self.difficulty;
        self.difficulty = Some(difficulty);
        send_json(
            framed,
            &RpcNotification::new("mining.set_difficulty", vec![json!(difficulty)]),
        )
        .await?;
        Ok(true)
    }

    /// Send a job, applying any queued difficulty change first. Returns
    /// false when the connection has idled past the timeout and must drop.
    async fn send_mining_job<S>(
        &mut self,
        framed: &mut Framed<S, LinesCodec>,
        job_params: Vec<Value>,
    ) -> Result<bool, LinesCodecError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.last_activity.elapsed().as_secs() > self.state.connection_timeout() {
            tracing::debug!("dropping idle connection {}", self.label());
            return Ok(false);
        }

        if let Some(pending) = self.pending_difficulty.take() {
            self.send_difficulty(framed, pending).await?;
        }

        send_json(framed, &RpcNotification::new("mining.notify", job_params)).await?;
        Ok(true)
    }
}
