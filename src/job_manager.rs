//! Job lifecycle and share validation
//!
//! The job manager owns the current job and the window of still-valid jobs,
//! decides when a polled template constitutes a new block, and runs the full
//! share validation pipeline for every mining.submit. Job changes go out on
//! a broadcast channel; validated shares (and found blocks) go to the pool
//! on an mpsc channel.

use crate::algo::{HashFunction, DIFF1, MULTIPLIER};
use crate::config::{Recipient, RewardKind};
use crate::error::Result;
use crate::stratum::protocol::StratumError;
use crate::template::{BlockTemplate, RpcBlockTemplate};
use crate::util;
use num_bigint::BigUint;
use num_traits::ToPrimitive;
use parking_lot::RwLock;
use rand::RngCore;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Placeholder spliced into the coinbase where extranonce1 ‖ extranonce2 goes
pub const EXTRANONCE_PLACEHOLDER: [u8; 8] = [0xf0, 0x00, 0x00, 0x0f, 0xf1, 0x11, 0x11, 0x1f];

/// Bytes of extranonce1 assigned per subscription
pub const EXTRANONCE1_SIZE: usize = 2;

/// A job change to broadcast to connected miners
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// A previously unknown block, broadcast with clean_jobs set
    NewBlock(Arc<BlockTemplate>),
    /// Same block, refreshed transaction set
    Updated(Arc<BlockTemplate>),
}

impl JobEvent {
    /// The job carried by the event
    pub fn job(&self) -> &Arc<BlockTemplate> {
        match self {
            Self::NewBlock(job) | Self::Updated(job) => job,
        }
    }

    /// Whether miners should abandon work on older jobs
    pub fn clean_jobs(&self) -> bool {
        matches!(self, Self::NewBlock(_))
    }
}

/// Everything the pool wants to know about one processed share
#[derive(Debug, Clone)]
pub struct ShareData {
    /// Job the share was submitted against
    pub job_id: String,
    /// Submitting connection address
    pub ip: IpAddr,
    /// Port the connection came in on
    pub port: u16,
    /// Worker name from mining.authorize
    pub worker: String,
    /// Difficulty the share was credited at
    pub difficulty: f64,
    /// Actual difficulty of the submitted hash
    pub share_diff: Option<f64>,
    /// Height of the block being worked on
    pub height: Option<u64>,
    /// Coinbase value of the block being worked on
    pub block_reward: Option<u64>,
    /// Network difficulty in displayed units
    pub block_diff: Option<f64>,
    /// Hash of the solved block, candidates only
    pub block_hash: Option<String>,
    /// Rejection message, rejected shares only
    pub error: Option<String>,
}

/// A processed share, with the serialized block when one was found
#[derive(Debug, Clone)]
pub struct ShareEvent {
    /// Accounting fields of the share
    pub data: ShareData,
    /// Serialized block hex when the share solved the block
    pub block_hex: Option<String>,
}

/// One mining.submit, already split into fields by the session
#[derive(Debug, Clone)]
pub struct ShareSubmission {
    /// Job id named by the miner
    pub job_id: String,
    /// Extranonce1 assigned at subscription, hex
    pub extranonce1: String,
    /// Miner-chosen extranonce2, hex
    pub extranonce2: String,
    /// Header timestamp, 8 hex chars
    pub ntime: String,
    /// Header nonce, 8 hex chars
    pub nonce: String,
    /// Difficulty currently assigned to the connection
    pub difficulty: f64,
    /// Difficulty before the last retarget, if any
    pub previous_difficulty: Option<f64>,
    /// Submitting connection address
    pub ip: IpAddr,
    /// Port the connection came in on
    pub port: u16,
    /// Worker name from mining.authorize
    pub worker: String,
}

/// Outcome handed back to the session for the wire reply
#[derive(Debug, Clone)]
pub struct ShareOutcome {
    /// Accepted or not; banning counts against this
    pub valid: bool,
    /// Wire error for rejected shares
    pub error: Option<StratumError>,
    /// Hex hash when the share solved the block
    pub block_hash: Option<String>,
}

/// Fixed coin parameters the job manager needs for template construction
pub struct JobManagerOptions {
    /// Output script receiving the pool's cut of the reward
    pub pool_script: Vec<u8>,
    /// POW or POS generation transaction layout
    pub reward: RewardKind,
    /// Whether generation transactions carry a comment string
    pub tx_messages: bool,
    /// Fee recipients taken out of the reward
    pub recipients: Vec<Recipient>,
    /// Header hash algorithm
    pub hasher: &'static dyn HashFunction,
}

/// Owner of the job window and the share validation pipeline
pub struct JobManager {
    options: JobManagerOptions,
    current_job: RwLock<Option<Arc<BlockTemplate>>>,
    valid_jobs: RwLock<HashMap<String, Arc<BlockTemplate>>>,
    job_events: broadcast::Sender<JobEvent>,
    share_events: mpsc::UnboundedSender<ShareEvent>,
}

impl JobManager {
    /// Build a manager; share events drain into the given channel
    pub fn new(
        options: JobManagerOptions,
        share_events: mpsc::UnboundedSender<ShareEvent>,
    ) -> Self {
        let (job_events, _) = broadcast::channel(16);
        Self {
            options,
            current_job: RwLock::new(None),
            valid_jobs: RwLock::new(HashMap::new()),
            job_events,
            share_events,
        }
    }

    /// Subscribe to job broadcasts
    pub fn subscribe_jobs(&self) -> broadcast::Receiver<JobEvent> {
        self.job_events.subscribe()
    }

    /// A fresh random extranonce1 for one subscription
    pub fn next_extranonce1() -> String {
        let mut bytes = [0u8; EXTRANONCE1_SIZE];
        rand::rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Bytes of extranonce2 each miner must send
    pub fn extranonce2_size() -> usize {
        EXTRANONCE_PLACEHOLDER.len() - EXTRANONCE1_SIZE
    }

    fn next_job_id() -> String {
        let mut bytes = [0u8; 8];
        rand::rng().fill_bytes(&mut bytes);
        format!("{:x}", u64::from_be_bytes(bytes))
    }

    /// The job currently being worked on
    pub fn current_job(&self) -> Option<Arc<BlockTemplate>> {
        self.current_job.read().clone()
    }

    fn build_job(&self, rpc_data: RpcBlockTemplate) -> Result<Arc<BlockTemplate>> {
        Ok(Arc::new(BlockTemplate::new(
            Self::next_job_id(),
            rpc_data,
            &self.options.pool_script,
            &EXTRANONCE_PLACEHOLDER,
            self.options.reward,
            self.options.tx_messages,
            &self.options.recipients,
        )?))
    }

    /// Replace the current job with a refreshed template for the same block.
    /// Older jobs stay valid so in-flight shares still count.
    pub fn update_current_job(&self, rpc_data: RpcBlockTemplate) -> Result<()> {
        let job = self.build_job(rpc_data)?;
        *self.current_job.write() = Some(job.clone());
        self.valid_jobs.write().insert(job.job_id.clone(), job.clone());
        let _ = self.job_events.send(JobEvent::Updated(job));
        Ok(())
    }

    /// Decide whether a polled template is a new block and if so roll all
    /// jobs over to it. Returns true when a new block was adopted.
    pub fn process_template(&self, rpc_data: RpcBlockTemplate) -> Result<bool> {
        {
            let current = self.current_job.read();
            match current.as_ref() {
                None => {}
                Some(job) => {
                    if job.rpc_data.previousblockhash == rpc_data.previousblockhash {
                        return Ok(false);
                    }
                    // a lagging daemon may hand us work for an older height
                    if rpc_data.height < job.rpc_data.height {
                        return Ok(false);
                    }
                }
            }
        }

        let job = self.build_job(rpc_data)?;
        *self.current_job.write() = Some(job.clone());
        {
            let mut valid_jobs = self.valid_jobs.write();
            valid_jobs.clear();
            valid_jobs.insert(job.job_id.clone(), job.clone());
        }
        let _ = self.job_events.send(JobEvent::NewBlock(job));
        Ok(true)
    }

    fn emit_invalid(&self, submission: &ShareSubmission, error: &StratumError) {
        let _ = self.share_events.send(ShareEvent {
            data: ShareData {
                job_id: submission.job_id.clone(),
                ip: submission.ip,
                port: submission.port,
                worker: submission.worker.clone(),
                difficulty: submission.difficulty,
                share_diff: None,
                height: None,
                block_reward: None,
                block_diff: None,
                block_hash: None,
                error: Some(error.message()),
            },
            block_hex: None,
        });
    }

    fn reject(&self, submission: &ShareSubmission, error: StratumError) -> ShareOutcome {
        self.emit_invalid(submission, &error);
        ShareOutcome {
            valid: false,
            error: Some(error),
            block_hash: None,
        }
    }

    /// Run the full validation pipeline over one submission
    pub fn process_share(&self, submission: &ShareSubmission) -> ShareOutcome {
        let submit_time = util::unix_time();

        // exact hex length; odd-length strings must not reach the replay set
        if submission.extranonce2.len() != Self::extranonce2_size() * 2 {
            return self.reject(
                submission,
                StratumError::Other("incorrect size of extranonce2".into()),
            );
        }

        let job = match self.valid_jobs.read().get(&submission.job_id).cloned() {
            Some(job) => job,
            None => return self.reject(submission, StratumError::JobNotFound),
        };

        if submission.ntime.len() != 8 {
            return self.reject(
                submission,
                StratumError::Other("incorrect size of ntime".into()),
            );
        }

        let ntime = match u32::from_str_radix(&submission.ntime, 16) {
            Ok(ntime) => ntime,
            Err(_) => {
                return self.reject(
                    submission,
                    StratumError::Other("incorrect size of ntime".into()),
                )
            }
        };
        if (ntime as u64) < job.rpc_data.curtime as u64 || ntime as u64 > submit_time + 7200 {
            return self.reject(submission, StratumError::Other("ntime out of range".into()));
        }

        if submission.nonce.len() != 8 {
            return self.reject(
                submission,
                StratumError::Other("incorrect size of nonce".into()),
            );
        }

        if !job.register_submit(
            &submission.extranonce1,
            &submission.extranonce2,
            &submission.ntime,
            &submission.nonce,
        ) {
            return self.reject(submission, StratumError::DuplicateShare);
        }

        let extranonce1 = match hex::decode(&submission.extranonce1) {
            Ok(bytes) => bytes,
            Err(_) => {
                return self.reject(
                    submission,
                    StratumError::Other("malformed extranonce1".into()),
                )
            }
        };
        let extranonce2 = match hex::decode(&submission.extranonce2) {
            Ok(bytes) => bytes,
            Err(_) => {
                return self.reject(
                    submission,
                    StratumError::Other("malformed extranonce2".into()),
                )
            }
        };

        let coinbase = job.serialize_coinbase(&extranonce1, &extranonce2);
        let coinbase_hash = util::sha256d(&coinbase);
        let merkle_root_reversed = util::reverse_buffer(&job.merkle_tree.with_first(coinbase_hash));
        let merkle_root: [u8; 32] = match merkle_root_reversed.try_into() {
            Ok(root) => root,
            Err(_) => {
                return self.reject(submission, StratumError::Other("merkle root error".into()))
            }
        };

        let header = match job.serialize_header(&merkle_root, &submission.ntime, &submission.nonce)
        {
            Ok(header) => header,
            Err(_) => {
                return self.reject(submission, StratumError::Other("malformed header".into()))
            }
        };
        let header_hash = self.options.hasher.hash(&header, ntime);
        let header_value = BigUint::from_bytes_le(&header_hash);

        let share_diff = DIFF1.to_f64().unwrap_or(f64::MAX)
            / header_value.to_f64().unwrap_or(f64::MAX).max(1.0)
            * MULTIPLIER;
        let block_diff_adjusted = job.difficulty * MULTIPLIER;

        // block candidate when the header beats the network target
        if job.target >= header_value {
            let block_hex = hex::encode(job.serialize_block(&header, &coinbase));
            let block_hash = hex::encode(util::reverse_buffer(&header_hash));

            let _ = self.share_events.send(ShareEvent {
                data: ShareData {
                    job_id: submission.job_id.clone(),
                    ip: submission.ip,
                    port: submission.port,
                    worker: submission.worker.clone(),
                    difficulty: submission.difficulty,
                    share_diff: Some(share_diff),
                    height: Some(job.rpc_data.height),
                    block_reward: Some(job.rpc_data.coinbasevalue),
                    block_diff: Some(block_diff_adjusted),
                    block_hash: Some(block_hash.clone()),
                    error: None,
                },
                block_hex: Some(block_hex),
            });

            return ShareOutcome {
                valid: true,
                error: None,
                block_hash: Some(block_hash),
            };
        }

        let mut difficulty = submission.difficulty;
        if share_diff / difficulty < 0.99 {
            // a share aimed at the pre-retarget difficulty still counts
            match submission.previous_difficulty {
                Some(previous) if share_diff >= previous => difficulty = previous,
                _ => {
                    return self.reject(submission, StratumError::LowDifficultyShare(share_diff))
                }
            }
        }

        let _ = self.share_events.send(ShareEvent {
            data: ShareData {
                job_id: submission.job_id.clone(),
                ip: submission.ip,
                port: submission.port,
                worker: submission.worker.clone(),
                difficulty,
                share_diff: Some(share_diff),
                height: Some(job.rpc_data.height),
                block_reward: Some(job.rpc_data.coinbasevalue),
                block_diff: Some(block_diff_adjusted),
                block_hash: None,
                error: None,
            },
            block_hex: None,
        });

        ShareOutcome {
            valid: true,
            error: None,
            block_hash: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::test_support::sample_rpc_template;
    use assert_matches::assert_matches;

    fn manager() -> (JobManager, mpsc::UnboundedReceiver<ShareEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let options = JobManagerOptions {
            pool_script: util::address_to_script("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa").unwrap(),
            reward: RewardKind::Pow,
            tx_messages: false,
            recipients: Vec::new(),
            hasher: crate::algo::from_name("sha256d").unwrap(),
        };
        (JobManager::new(options, tx), rx)
    }

    fn submission(job_id: &str) -> ShareSubmission {
        ShareSubmission {
            job_id: job_id.to_string(),
            extranonce1: "0800".to_string(),
            extranonce2: "000000000001".to_string(),
            ntime: format!("{:08x}", 1700000000u32),
            nonce: "deadbeef".to_string(),
            difficulty: 8.0,
            previous_difficulty: None,
            ip: "127.0.0.1".parse().unwrap(),
            port: 3333,
            worker: "miner1.rig".to_string(),
        }
    }

    #[test]
    fn test_extranonce_sizing() {
        assert_eq!(JobManager::extranonce2_size(), 6);
        let extranonce1 = JobManager::next_extranonce1();
        assert_eq!(extranonce1.len(), EXTRANONCE1_SIZE * 2);
        assert!(hex::decode(&extranonce1).is_ok());
    }

    #[test]
    fn test_job_events_format_for_logging() {
        let (manager, _rx) = manager();
        let mut events = manager.subscribe_jobs();
        manager.process_template(sample_rpc_template()).unwrap();

        let event = events.try_recv().unwrap();
        let formatted = format!("{:?}", event);
        assert!(formatted.starts_with("NewBlock"));
        assert!(formatted.contains("job_id"));
    }

    #[test]
    fn test_process_template_new_block_decision() {
        let (manager, _rx) = manager();
        let mut events = manager.subscribe_jobs();

        // first template is always a new block
        assert!(manager.process_template(sample_rpc_template()).unwrap());
        assert_matches!(events.try_recv(), Ok(JobEvent::NewBlock(_)));

        // same previous hash is not
        assert!(!manager.process_template(sample_rpc_template()).unwrap());

        // different previous hash at lower height is stale daemon work
        let mut stale = sample_rpc_template();
        stale.previousblockhash = "11".repeat(32);
        stale.height = 0;
        assert!(!manager.process_template(stale).unwrap());

        // different previous hash at the same or higher height rolls over
        let mut next = sample_rpc_template();
        next.previousblockhash = "22".repeat(32);
        next.height = 2;
        assert!(manager.process_template(next).unwrap());
        assert_matches!(events.try_recv(), Ok(JobEvent::NewBlock(_)));
    }

    #[test]
    fn test_update_keeps_old_jobs_valid() {
        let (manager, mut rx) = manager();
        manager.process_template(sample_rpc_template()).unwrap();
        let first_job = manager.current_job().unwrap();

        manager.update_current_job(sample_rpc_template()).unwrap();
        let second_job = manager.current_job().unwrap();
        assert_ne!(first_job.job_id, second_job.job_id);

        // a submission against the first job id is not "job not found"
        let outcome = manager.process_share(&submission(&first_job.job_id));
        assert_matches!(outcome.error, Some(StratumError::LowDifficultyShare(_)) | None);
        let event = rx.try_recv().unwrap();
        assert_ne!(event.data.error.as_deref(), Some("job not found"));
    }

    #[test]
    fn test_pipeline_rejections_in_order() {
        let (manager, mut rx) = manager();
        manager.process_template(sample_rpc_template()).unwrap();
        let job_id = manager.current_job().unwrap().job_id.clone();

        // wrong extranonce2 width fails before the job lookup
        let mut s = submission("no-such-job");
        s.extranonce2 = "0000".to_string();
        let outcome = manager.process_share(&s);
        assert_matches!(outcome.error, Some(StratumError::Other(ref msg))
            if msg == "incorrect size of extranonce2");

        // unknown job
        let outcome = manager.process_share(&submission("no-such-job"));
        assert_matches!(outcome.error, Some(StratumError::JobNotFound));

        // short ntime
        let mut s = submission(&job_id);
        s.ntime = "6540".to_string();
        let outcome = manager.process_share(&s);
        assert_matches!(outcome.error, Some(StratumError::Other(ref msg))
            if msg == "incorrect size of ntime");

        // ntime before the template time
        let mut s = submission(&job_id);
        s.ntime = format!("{:08x}", 1600000000u32);
        let outcome = manager.process_share(&s);
        assert_matches!(outcome.error, Some(StratumError::Other(ref msg))
            if msg == "ntime out of range");

        // short nonce
        let mut s = submission(&job_id);
        s.nonce = "dead".to_string();
        let outcome = manager.process_share(&s);
        assert_matches!(outcome.error, Some(StratumError::Other(ref msg))
            if msg == "incorrect size of nonce");

        // every rejection emitted a share event with its message
        for expected in [
            "incorrect size of extranonce2",
            "job not found",
            "incorrect size of ntime",
            "ntime out of range",
            "incorrect size of nonce",
        ] {
            assert_eq!(rx.try_recv().unwrap().data.error.as_deref(), Some(expected));
        }
    }

    #[test]
    fn test_odd_length_extranonce2_rejected_as_sized() {
        let (manager, _rx) = manager();
        manager.process_template(sample_rpc_template()).unwrap();
        let job_id = manager.current_job().unwrap().job_id.clone();

        // 13 hex chars round down to 6 bytes; the size check must still
        // reject it, and a resubmit must not be treated as a duplicate
        let mut s = submission(&job_id);
        s.extranonce2 = "000000000001f".to_string();
        for _ in 0..2 {
            let outcome = manager.process_share(&s);
            assert_matches!(outcome.error, Some(StratumError::Other(ref msg))
                if msg == "incorrect size of extranonce2");
        }
    }

    #[test]
    fn test_duplicate_share_detection() {
        let (manager, _rx) = manager();
        manager.process_template(sample_rpc_template()).unwrap();
        let job_id = manager.current_job().unwrap().job_id.clone();

        let s = submission(&job_id);
        let first = manager.process_share(&s);
        // whatever the hash verdict, the duplicate must hit code 22
        assert_matches!(first.error, None | Some(StratumError::LowDifficultyShare(_)));
        let second = manager.process_share(&s);
        assert_matches!(second.error, Some(StratumError::DuplicateShare));
    }

    #[test]
    fn test_previous_difficulty_grace() {
        let (manager, _rx) = manager();
        manager.process_template(sample_rpc_template()).unwrap();
        let job_id = manager.current_job().unwrap().job_id.clone();

        // an sha256d share at difficulty 1e9 will essentially never meet
        // 0.99 of target, so the grace path decides the outcome
        let mut s = submission(&job_id);
        s.difficulty = 1e9;
        s.previous_difficulty = Some(1e-24);
        let outcome = manager.process_share(&s);
        assert!(outcome.valid);
        assert_eq!(outcome.block_hash, None);

        let mut s = submission(&job_id);
        s.extranonce2 = "000000000002".to_string();
        s.difficulty = 1e9;
        s.previous_difficulty = Some(1e9);
        let outcome = manager.process_share(&s);
        assert!(!outcome.valid);
        assert_matches!(outcome.error, Some(StratumError::LowDifficultyShare(_)));
    }
}
