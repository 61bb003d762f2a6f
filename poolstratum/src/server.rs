//! Stratum TCP server: accept loop, per-session framed I/O, dispatch,
//! notify broadcast, and the difficulty-adjust task.
//!
//! Grounded on the teacher's `StratumServer`/`StratumSession` skeleton
//! (`mining/src/stratum.rs`: `Framed`/`LinesCodec`, `mpsc` write channel,
//! `RwLock<HashMap<..>>` session registry) generalized to Bitcoin Stratum
//! semantics from `original_source/proxy/stratum.go` and
//! `proxy/handlers.go`.

use crate::policy::PolicyOracle;
use crate::protocol::{
    StratumPush, StratumRequest, StratumResponse, ERR_DUPLICATE_SHARE, ERR_INVALID_PARAMS,
    ERR_INVALID_SHARE, ERR_METHOD_NOT_FOUND, MAX_FRAME_BYTES,
};
use crate::session::Session;
use crate::share::{process_share, ShareOutcome, ShareSubmission};
use futures::StreamExt;
use log::{debug, error, info, warn};
use poolbackend::{Backend, SubmissionTriple};
use poolcore::target::{diff_to_target, target_to_diff};
use poolcore::uint256::stratum_byte_order;
use pooltemplate::{BlockTemplate, TemplateEngine};
use poolupstream::UpstreamPool;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock, Semaphore};
use tokio_util::codec::{FramedRead, LinesCodec};

#[derive(Debug, Error)]
pub enum StratumServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct DiffAdjustConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub expect_share_count: i64,
}

pub struct StratumServerConfig {
    pub bind_addr: std::net::SocketAddr,
    pub max_connections: usize,
    pub node_id: u16,
    pub initial_diff: u64,
    pub hashrate_expiration_secs: u64,
    pub diff_adjust: DiffAdjustConfig,
}

/// Caps concurrent in-flight `mining.notify` fan-out writes at 1024, per
/// spec §5's bounded-broadcast-channel requirement.
const BROADCAST_CONCURRENCY: usize = 1024;

pub struct StratumServer {
    config: StratumServerConfig,
    sessions: RwLock<HashMap<u16, Arc<Session>>>,
    free_tags: AsyncMutex<VecDeque<u16>>,
    broadcast_permits: Semaphore,
    template_engine: Arc<TemplateEngine>,
    upstream: Arc<UpstreamPool>,
    backend: Arc<dyn Backend>,
    policy: Arc<dyn PolicyOracle>,
}

impl StratumServer {
    pub fn new(
        config: StratumServerConfig,
        template_engine: Arc<TemplateEngine>,
        upstream: Arc<UpstreamPool>,
        backend: Arc<dyn Backend>,
        policy: Arc<dyn PolicyOracle>,
    ) -> Arc<Self> {
        let free_tags = (0..config.max_connections as u16).collect();
        Arc::new(StratumServer {
            config,
            sessions: RwLock::new(HashMap::new()),
            free_tags: AsyncMutex::new(free_tags),
            broadcast_permits: Semaphore::new(BROADCAST_CONCURRENCY),
            template_engine,
            upstream,
            backend,
            policy,
        })
    }

    pub async fn run(self: Arc<Self>) -> Result<(), StratumServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("Stratum server listening on {}", self.config.bind_addr);

        if self.config.diff_adjust.enabled {
            let server = self.clone();
            tokio::spawn(async move { server.diff_adjust_loop().await });
        }

        loop {
            match listener.accept().await {
                Ok((socket, addr)) => {
                    let ip = addr.ip().to_string();
                    if self.policy.is_banned(&ip).await {
                        debug!("rejecting banned ip {ip}");
                        continue;
                    }
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_connection(socket, ip).await;
                    });
                }
                Err(e) => error!("error accepting connection: {e}"),
            }
        }
    }

    async fn acquire_tag(&self) -> Option<u16> {
        self.free_tags.lock().await.pop_front()
    }

    async fn release_tag(&self, tag: u16) {
        self.free_tags.lock().await.push_back(tag);
    }

    async fn handle_connection(self: Arc<Self>, socket: tokio::net::TcpStream, ip: String) {
        let Some(tag) = self.acquire_tag().await else {
            warn!("connection from {ip} rejected: max_connections reached");
            return;
        };

        let (tx, mut rx) = mpsc::channel::<String>(1024);
        let initial_target = diff_to_target(&num_bigint::BigUint::from(self.config.initial_diff));
        let session = Arc::new(Session::new(
            ip.clone(),
            self.config.node_id,
            tag,
            initial_target,
            tx,
        ));

        self.sessions.write().await.insert(tag, session.clone());

        let (reader, mut writer) = socket.into_split();
        let mut framed = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));

        let writer_task = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if writer.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if writer.write_all(b"\n").await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
        });

        loop {
            match framed.next().await {
                Some(Ok(line)) => {
                    if self.dispatch(&session, &line).await {
                        break;
                    }
                }
                Some(Err(_)) => {
                    self.policy.apply_limit_policy(&ip).await;
                    break;
                }
                None => break,
            }
        }

        writer_task.abort();
        self.sessions.write().await.remove(&tag);
        self.release_tag(tag).await;
        debug!("session {} closed", session.sid);
    }

    /// Returns `true` if the connection should be closed.
    async fn dispatch(self: &Arc<Self>, session: &Arc<Session>, line: &str) -> bool {
        let request: StratumRequest = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(_) => {
                let resp = StratumResponse::err(Value::Null, ERR_INVALID_PARAMS, "parse error");
                self.reply(session, &resp).await;
                return self.policy.apply_malformed_policy(&session.ip).await;
            }
        };

        match request.method.as_str() {
            "mining.subscribe" => {
                self.handle_subscribe(session, request).await;
                false
            }
            "mining.authorize" => {
                self.handle_authorize(session, request).await;
                false
            }
            "mining.submit" => self.handle_submit(session, request).await,
            "mining.extranonce.subscribe" => {
                let resp = StratumResponse::ok(request.id, Value::Bool(true));
                self.reply(session, &resp).await;
                false
            }
            _ => {
                let resp =
                    StratumResponse::err(request.id, ERR_METHOD_NOT_FOUND, "Method not found");
                self.reply(session, &resp).await;
                self.policy.apply_malformed_policy(&session.ip).await
            }
        }
    }

    async fn handle_subscribe(&self, session: &Arc<Session>, request: StratumRequest) {
        let result = json!([
            [
                ["mining.set_difficulty", session.sid],
                ["mining.notify", session.sid],
            ],
            session.extranonce1_hex(),
            poolcoinbase::EXTRANONCE2_SIZE,
        ]);
        let resp = StratumResponse::ok(request.id, result);
        self.reply(session, &resp).await;
    }

    async fn handle_authorize(&self, session: &Arc<Session>, request: StratumRequest) {
        let params = request.params.as_array().cloned().unwrap_or_default();
        let login_worker = params
            .first()
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let (login, worker_id) = split_login_worker(&login_worker);

        if !poolcore::is_valid_address(&login)
            || !self.policy.apply_login_policy(&session.ip, &login).await
        {
            let resp = StratumResponse::err(request.id, ERR_INVALID_PARAMS, "invalid login");
            self.reply(session, &resp).await;
            return;
        }

        {
            let mut state = session.state.lock().unwrap();
            state.login = login;
            state.worker_id = worker_id;
            state.is_authorized = true;
        }

        let resp = StratumResponse::ok(request.id, Value::Bool(true));
        self.reply(session, &resp).await;
        self.push_set_difficulty(session).await;

        if let Some(tpl) = self.template_engine.snapshot() {
            self.push_notify(session, &tpl, true).await;
        }
    }

    /// Returns `true` if the connection should be closed (the policy oracle
    /// judged this invalid share fatal, per `handlers.go: handleSubmitRPC`).
    async fn handle_submit(self: &Arc<Self>, session: &Arc<Session>, request: StratumRequest) -> bool {
        let params = request.params.as_array().cloned().unwrap_or_default();
        if params.len() != 5 {
            let resp = StratumResponse::err(request.id, ERR_INVALID_PARAMS, "invalid params");
            self.reply(session, &resp).await;
            return false;
        }

        let job_id = params[1].as_str().unwrap_or_default().to_string();
        let extranonce2 = params[2].as_str().unwrap_or_default().to_string();
        let ntime = params[3].as_str().unwrap_or_default().to_string();
        let nonce = params[4].as_str().unwrap_or_default().to_string();

        let valid_hex8 = |s: &str| s.len() == 8 && s.chars().all(|c| c.is_ascii_hexdigit());
        if !valid_hex8(&extranonce2) || !valid_hex8(&ntime) || !valid_hex8(&nonce) {
            let resp = StratumResponse::err(request.id, ERR_INVALID_PARAMS, "invalid params");
            self.reply(session, &resp).await;
            return false;
        }

        let Some(template) = self.template_engine.snapshot() else {
            let resp = StratumResponse::err(request.id, ERR_INVALID_PARAMS, "no template");
            self.reply(session, &resp).await;
            return false;
        };

        let (login, worker_id, share_target) = {
            let state = session.state.lock().unwrap();
            (state.login.clone(), state.worker_id.clone(), state.target)
        };

        let submission = ShareSubmission {
            job_id: &job_id,
            extranonce2_hex: &extranonce2,
            ntime_hex: &ntime,
            nonce_hex: &nonce,
        };

        let outcome =
            match process_share(&template, &share_target, &submission, &session.extranonce1) {
                Ok(o) => o,
                Err(e) => {
                    warn!("share verification error for {login}.{worker_id}: {e}");
                    let resp = StratumResponse::err(request.id, ERR_INVALID_PARAMS, "invalid share");
                    self.reply(session, &resp).await;
                    return false;
                }
            };

        session
            .shares_since_connect
            .fetch_add(1, Ordering::Relaxed);
        session.state.lock().unwrap().share_count_in_interval += 1;

        let (ms, secs) = now_ms_and_secs();
        let triple = SubmissionTriple {
            nonce: nonce.clone(),
            extranonce1: hex::encode(session.extranonce1),
            extranonce2: extranonce2.clone(),
        };
        let share_diff_units = diff_as_u64(&target_to_diff(&share_target));

        match outcome {
            ShareOutcome::Stale => {
                let _ = self
                    .backend
                    .write_invalid_share(ms, secs, &login, &worker_id, share_diff_units)
                    .await;
                let resp = StratumResponse::err(request.id, ERR_INVALID_PARAMS, "stale share");
                self.reply(session, &resp).await;
                false
            }
            ShareOutcome::Reject => {
                let _ = self
                    .backend
                    .write_reject_share(ms, secs, &login, &worker_id, share_diff_units)
                    .await;
                let resp =
                    StratumResponse::err(request.id, ERR_INVALID_SHARE, "low difficulty share");
                self.reply(session, &resp).await;
                self.policy.apply_share_policy(&session.ip, &login).await
            }
            ShareOutcome::Valid => {
                let duplicate = self
                    .backend
                    .write_share(
                        &login,
                        &worker_id,
                        &triple,
                        share_diff_units,
                        template.height,
                        self.config.hashrate_expiration_secs,
                    )
                    .await
                    .unwrap_or(false);
                if duplicate {
                    let _ = self
                        .backend
                        .write_invalid_share(ms, secs, &login, &worker_id, share_diff_units)
                        .await;
                    let resp =
                        StratumResponse::err(request.id, ERR_DUPLICATE_SHARE, "duplicate share");
                    self.reply(session, &resp).await;
                } else {
                    let resp = StratumResponse::ok(request.id, Value::Bool(true));
                    self.reply(session, &resp).await;
                }
                false
            }
            ShareOutcome::Block { raw_block_hex } => {
                self.submit_found_block(
                    &template, &job_id, &login, &worker_id, &triple, share_diff_units,
                    raw_block_hex,
                )
                .await;
                let resp = StratumResponse::ok(request.id, Value::Bool(true));
                self.reply(session, &resp).await;
                false
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn submit_found_block(
        self: &Arc<Self>,
        template: &BlockTemplate,
        job_id: &str,
        login: &str,
        worker_id: &str,
        triple: &SubmissionTriple,
        share_diff_units: u64,
        raw_block_hex: String,
    ) {
        match self.upstream.active().submit_block(&raw_block_hex).await {
            Ok(()) => {
                let job = template.jobs.get(job_id);
                let block_diff_units = diff_as_u64(&template.difficulty);
                let duplicate = self
                    .backend
                    .write_block(
                        login,
                        worker_id,
                        triple,
                        share_diff_units,
                        block_diff_units,
                        template.height,
                        job.map(|j| j.coinbase_value).unwrap_or(0),
                        job.map(|j| j.tx_fee_total).unwrap_or(0),
                        self.config.hashrate_expiration_secs,
                    )
                    .await
                    .unwrap_or(false);
                if duplicate {
                    let (ms, secs) = now_ms_and_secs();
                    let _ = self
                        .backend
                        .write_invalid_share(ms, secs, login, worker_id, share_diff_units)
                        .await;
                }
                info!("block found by {login} at height {}", template.height);

                match self.template_engine.poll().await {
                    Ok(Some(fresh)) => self.broadcast(fresh).await,
                    Ok(None) => {}
                    Err(e) => warn!("template refetch after block submission failed: {e}"),
                }
            }
            Err(e) => {
                warn!(
                    "block submission failed at height {}: {e}",
                    template.height
                );
            }
        }
    }

    async fn reply(&self, session: &Arc<Session>, resp: &StratumResponse) {
        if let Ok(line) = serde_json::to_string(resp) {
            if !session.send_line(line).await {
                self.sessions.write().await.remove(&session.tag);
            }
        }
    }

    async fn push_set_difficulty(&self, session: &Arc<Session>) {
        let push = StratumPush {
            id: None,
            method: "mining.set_difficulty",
            params: json!([session.share_difficulty()]),
        };
        if let Ok(line) = serde_json::to_string(&push) {
            session.send_line(line).await;
        }
    }

    async fn push_notify(&self, session: &Arc<Session>, template: &BlockTemplate, clean_jobs: bool) {
        let Some(job) = template.jobs.get(&template.last_job_id) else {
            return;
        };
        let prev_hash_stratum = hex::encode(stratum_byte_order(template.prev_hash.internal_bytes()));
        let merkle_branch_stratum: Vec<String> = job
            .merkle_branch
            .iter()
            .map(|h| hex::encode(h.internal_bytes()))
            .collect();

        let push = StratumPush {
            id: None,
            method: "mining.notify",
            params: json!([
                job.job_id,
                prev_hash_stratum,
                job.coinbase1_hex(),
                job.coinbase2_hex(),
                merkle_branch_stratum,
                format!("{:08x}", template.version),
                format!("{:08x}", template.n_bits),
                format!("{:08x}", job.job_time),
                clean_jobs,
            ]),
        };
        if let Ok(line) = serde_json::to_string(&push) {
            session.send_line(line).await;
        }
    }

    /// Broadcasts the current template to every authorized session, capping
    /// concurrent in-flight writes at [`BROADCAST_CONCURRENCY`] so a burst of
    /// sessions cannot starve the runtime, per spec §5.
    pub async fn broadcast(self: &Arc<Self>, template: Arc<BlockTemplate>) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.is_authorized())
            .cloned()
            .collect();

        let clean_jobs = template.new_template;
        let mut handles = Vec::with_capacity(sessions.len());
        for session in sessions {
            let template = template.clone();
            let server = self.clone();
            handles.push(tokio::spawn(async move {
                let Ok(_permit) = server.broadcast_permits.acquire().await else {
                    return;
                };
                server.push_notify(&session, &template, clean_jobs).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn diff_adjust_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.diff_adjust.interval);
        loop {
            ticker.tick().await;
            let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
            for session in sessions {
                let mut state = session.state.lock().unwrap();
                let expect = self.config.diff_adjust.expect_share_count;
                if state.share_count_in_interval > expect * 2 {
                    let diff = target_to_diff(&state.target);
                    state.target_next = diff_to_target(&scale_diff(&diff, 1.2));
                } else if state.share_count_in_interval < expect / 2 {
                    let diff = target_to_diff(&state.target);
                    state.target = diff_to_target(&scale_diff(&diff, 0.8));
                    state.target_next = state.target;
                }
                state.share_count_in_interval = 0;
            }
        }
    }
}

fn diff_as_u64(diff: &num_bigint::BigUint) -> u64 {
    use num_traits::ToPrimitive;
    diff.to_u64().unwrap_or(u64::MAX)
}

fn scale_diff(diff: &num_bigint::BigUint, factor: f64) -> num_bigint::BigUint {
    use num_traits::ToPrimitive;
    let scaled = diff.to_f64().unwrap_or(1.0) * factor;
    num_bigint::BigUint::from(scaled.max(1.0) as u64)
}

fn split_login_worker(login_worker: &str) -> (String, String) {
    match login_worker.split_once('.') {
        Some((login, worker)) => {
            let worker_valid = !worker.is_empty()
                && worker.len() <= 64
                && worker
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
            if worker_valid {
                (login.to_string(), worker.to_string())
            } else {
                (login.to_string(), "default".to_string())
            }
        }
        None => (login_worker.to_string(), "default".to_string()),
    }
}

fn now_ms_and_secs() -> (i64, i64) {
    let dur = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let ms = dur.as_millis() as i64;
    (ms, ms / 1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_login_worker_defaults_when_absent() {
        let (login, worker) = split_login_worker("1abc");
        assert_eq!(login, "1abc");
        assert_eq!(worker, "default");
    }

    #[test]
    fn split_login_worker_rejects_bad_worker_id() {
        let (login, worker) = split_login_worker("1abc.bad worker!");
        assert_eq!(login, "1abc");
        assert_eq!(worker, "default");
    }

    #[test]
    fn split_login_worker_keeps_valid_worker_id() {
        let (login, worker) = split_login_worker("1abc.rig-01");
        assert_eq!(login, "1abc");
        assert_eq!(worker, "rig-01");
    }

    #[test]
    fn scale_diff_up_and_down() {
        let base = num_bigint::BigUint::from(1000u32);
        assert_eq!(scale_diff(&base, 1.2), num_bigint::BigUint::from(1200u32));
        assert_eq!(scale_diff(&base, 0.8), num_bigint::BigUint::from(800u32));
    }
}
