//! Block templates and job state
//!
//! [`RpcBlockTemplate`] mirrors the daemon's `getblocktemplate` response.
//! [`BlockTemplate`] wraps one template as a mining job: it precomputes the
//! target, share difficulty, merkle steps and the split generation
//! transaction, and serializes coinbases, headers and full blocks for
//! submitted shares.

use crate::config::{Recipient, RewardKind};
use crate::error::{Error, Result};
use crate::merkle::MerkleTree;
use crate::transactions;
use crate::util;
use num_bigint::BigUint;
use num_traits::ToPrimitive;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;

/// `coinbaseaux` object of a template
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CoinbaseAux {
    /// Hex flags spliced into the coinbase scriptSig
    #[serde(default)]
    pub flags: String,
}

/// One non-coinbase transaction of a template
#[derive(Debug, Clone, Deserialize)]
pub struct RpcTransaction {
    /// Raw transaction hex
    pub data: String,
    /// Segwit-era transaction id, preferred for merkle leaves
    #[serde(default)]
    pub txid: Option<String>,
    /// Legacy transaction hash
    #[serde(default)]
    pub hash: Option<String>,
}

impl RpcTransaction {
    /// Hash to use as the merkle leaf
    pub fn leaf_hash(&self) -> &str {
        self.txid.as_deref().or(self.hash.as_deref()).unwrap_or("")
    }
}

/// Masternode payment info on Dash-style templates
#[derive(Debug, Clone, Deserialize)]
pub struct MasternodeInfo {
    /// Payee address
    #[serde(default)]
    pub payee: Option<String>,
    /// Payment amount in base units
    #[serde(default)]
    pub amount: Option<u64>,
}

/// One superblock payee on Dash-style templates
#[derive(Debug, Clone, Deserialize)]
pub struct SuperblockPayee {
    /// Payee address
    pub payee: String,
    /// Payment amount in base units
    pub amount: u64,
}

/// Daemon `getblocktemplate` response, tolerant of the fields coins add
#[derive(Debug, Clone, Deserialize)]
pub struct RpcBlockTemplate {
    /// Block version
    pub version: i32,
    /// Previous block hash, big-endian hex
    pub previousblockhash: String,
    /// Compact difficulty bits, 8 hex chars
    pub bits: String,
    /// Current network time
    pub curtime: u32,
    /// Block height being worked on
    pub height: u64,
    /// Coinbase reward in base units
    pub coinbasevalue: u64,
    /// Explicit 256-bit target, overrides `bits` when present
    #[serde(default)]
    pub target: Option<String>,
    /// Coinbase auxiliary data
    #[serde(default)]
    pub coinbaseaux: CoinbaseAux,
    /// Transactions to include after the coinbase
    #[serde(default)]
    pub transactions: Vec<RpcTransaction>,
    /// Segwit witness commitment script hex
    #[serde(default)]
    pub default_witness_commitment: Option<String>,
    /// Masternode payment info
    #[serde(default)]
    pub masternode: Option<MasternodeInfo>,
    /// Superblock payees
    #[serde(default)]
    pub superblock: Option<Vec<SuperblockPayee>>,
    /// Generic single payee address
    #[serde(default)]
    pub payee: Option<String>,
    /// Amount for the generic payee, defaults to a fifth of the reward
    #[serde(default)]
    pub payee_amount: Option<u64>,
    /// Whether vote data trails the transaction list in serialized blocks
    #[serde(default)]
    pub masternode_payments: bool,
    /// Raw vote hex blobs appended when `masternode_payments` is set
    #[serde(default)]
    pub votes: Vec<String>,
}

/// A single mining job derived from one block template
#[derive(Debug)]
pub struct BlockTemplate {
    /// Job identifier sent to miners
    pub job_id: String,
    /// The template this job was built from
    pub rpc_data: RpcBlockTemplate,
    /// 256-bit share target of the block
    pub target: BigUint,
    /// Network difficulty of the block, diff1 / target
    pub difficulty: f64,
    /// Previous block hash in the 4-byte-swapped order stratum expects
    pub prev_hash_reversed: String,
    /// Concatenated raw transaction data
    pub transaction_data: Vec<u8>,
    /// Merkle steps over the transaction leaves
    pub merkle_tree: MerkleTree,
    /// Merkle steps as hex, as broadcast in mining.notify
    pub merkle_branch: Vec<String>,
    /// Generation transaction halves around the extranonce
    pub generation_transaction: (Vec<u8>, Vec<u8>),
    /// Coin reward scheme
    pub reward: RewardKind,
    submits: Mutex<HashSet<String>>,
    job_params: OnceCell<Vec<Value>>,
}

impl BlockTemplate {
    /// Build a job from a template
    pub fn new(
        job_id: String,
        rpc_data: RpcBlockTemplate,
        pool_script: &[u8],
        extranonce_placeholder: &[u8],
        reward: RewardKind,
        tx_messages: bool,
        recipients: &[Recipient],
    ) -> Result<Self> {
        let target = match &rpc_data.target {
            Some(hex) => BigUint::parse_bytes(hex.as_bytes(), 16)
                .ok_or_else(|| Error::invalid_template("malformed target hex"))?,
            None => util::target_from_bits_hex(&rpc_data.bits)?,
        };
        if target == BigUint::default() {
            return Err(Error::invalid_template("zero target"));
        }

        let ratio = crate::algo::DIFF1.to_f64().unwrap_or(f64::MAX)
            / target.to_f64().unwrap_or(f64::MAX);
        let difficulty = (ratio * 1e9).round() / 1e9;

        let prev_hash = hex::decode(&rpc_data.previousblockhash)?;
        let prev_hash: [u8; 32] = prev_hash
            .try_into()
            .map_err(|_| Error::invalid_template("previousblockhash is not 32 bytes"))?;
        let prev_hash_reversed = hex::encode(util::reverse_byte_order(&prev_hash));

        let mut transaction_data = Vec::new();
        let mut tx_hashes = Vec::with_capacity(rpc_data.transactions.len());
        for tx in &rpc_data.transactions {
            transaction_data.extend_from_slice(&hex::decode(&tx.data)?);
            tx_hashes.push(util::uint256_buffer_from_hash(tx.leaf_hash())?);
        }
        let merkle_tree = MerkleTree::new(tx_hashes);
        let merkle_branch = merkle_tree.branch_hex();

        let generation_transaction = transactions::create_generation(
            &rpc_data,
            pool_script,
            extranonce_placeholder,
            reward,
            tx_messages,
            recipients,
        )?;

        Ok(Self {
            job_id,
            rpc_data,
            target,
            difficulty,
            prev_hash_reversed,
            transaction_data,
            merkle_tree,
            merkle_branch,
            generation_transaction,
            reward,
            submits: Mutex::new(HashSet::new()),
            job_params: OnceCell::new(),
        })
    }

    /// Join the generation transaction halves with a miner's extranonce
    pub fn serialize_coinbase(&self, extranonce1: &[u8], extranonce2: &[u8]) -> Vec<u8> {
        let (p1, p2) = &self.generation_transaction;
        let mut coinbase = Vec::with_capacity(
            p1.len() + extranonce1.len() + extranonce2.len() + p2.len(),
        );
        coinbase.extend_from_slice(p1);
        coinbase.extend_from_slice(extranonce1);
        coinbase.extend_from_slice(extranonce2);
        coinbase.extend_from_slice(p2);
        coinbase
    }

    /// Serialize the 80-byte block header. Fields are laid down in reverse
    /// order and the whole buffer flipped, matching the stratum submit
    /// byte conventions.
    pub fn serialize_header(
        &self,
        merkle_root_reversed: &[u8; 32],
        ntime_hex: &str,
        nonce_hex: &str,
    ) -> Result<Vec<u8>> {
        let mut header = Vec::with_capacity(80);
        header.extend_from_slice(&hex::decode(nonce_hex)?);
        header.extend_from_slice(&hex::decode(&self.rpc_data.bits)?);
        header.extend_from_slice(&hex::decode(ntime_hex)?);
        header.extend_from_slice(merkle_root_reversed);
        header.extend_from_slice(&hex::decode(&self.rpc_data.previousblockhash)?);
        header.extend_from_slice(&self.rpc_data.version.to_be_bytes());
        if header.len() != 80 {
            return Err(Error::invalid_template("header is not 80 bytes"));
        }
        header.reverse();
        Ok(header)
    }

    /// Serialize a full block: header, transaction count, coinbase, the
    /// template transactions and trailing vote data
    pub fn serialize_block(&self, header: &[u8], coinbase: &[u8]) -> Vec<u8> {
        let mut block = Vec::new();
        block.extend_from_slice(header);
        block.extend_from_slice(&util::var_int_buffer(
            self.rpc_data.transactions.len() as u64 + 1,
        ));
        block.extend_from_slice(coinbase);
        block.extend_from_slice(&self.transaction_data);
        if self.rpc_data.masternode_payments {
            block.extend_from_slice(&util::var_int_buffer(self.rpc_data.votes.len() as u64));
            for vote in &self.rpc_data.votes {
                if let Ok(bytes) = hex::decode(vote) {
                    block.extend_from_slice(&bytes);
                }
            }
        }
        // POS daemons replace this placeholder byte with the block signature
        if self.reward == RewardKind::Pos {
            block.push(0);
        }
        block
    }

    /// Record a submission, returning false if it was already seen
    pub fn register_submit(
        &self,
        extranonce1: &str,
        extranonce2: &str,
        ntime: &str,
        nonce: &str,
    ) -> bool {
        let submission = format!("{}{}{}{}", extranonce1, extranonce2, ntime, nonce);
        self.submits.lock().insert(submission)
    }

    /// The mining.notify parameter tuple for this job, built once
    pub fn job_params(&self, clean_jobs: bool) -> Vec<Value> {
        let mut params = self
            .job_params
            .get_or_init(|| {
                vec![
                    json!(self.job_id),
                    json!(self.prev_hash_reversed),
                    json!(hex::encode(&self.generation_transaction.0)),
                    json!(hex::encode(&self.generation_transaction.1)),
                    json!(self.merkle_branch),
                    json!(hex::encode(self.rpc_data.version.to_be_bytes())),
                    json!(self.rpc_data.bits),
                    json!(hex::encode(self.rpc_data.curtime.to_be_bytes())),
                    json!(true),
                ]
            })
            .clone();
        params[8] = json!(clean_jobs);
        params
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::sample_rpc_template;
    use super::*;
    use crate::util::sha256d;

    const PLACEHOLDER: [u8; 8] = [0xf0, 0x00, 0x00, 0x0f, 0xf1, 0x11, 0x11, 0x1f];

    fn sample_template() -> BlockTemplate {
        let pool_script = util::address_to_script("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa").unwrap();
        BlockTemplate::new(
            "1".to_string(),
            sample_rpc_template(),
            &pool_script,
            &PLACEHOLDER,
            RewardKind::Pow,
            false,
            &[],
        )
        .unwrap()
    }

    #[test]
    fn test_difficulty_from_bits() {
        let job = sample_template();
        // genesis bits decode to exactly difficulty 1
        assert_eq!(job.difficulty, 1.0);
        assert_eq!(job.target, *crate::algo::DIFF1);
    }

    #[test]
    fn test_explicit_target_overrides_bits() {
        let mut rpc_data = sample_rpc_template();
        rpc_data.target = Some(
            "00000000000000000000000000000000000000000000000000000000000000ff".to_string(),
        );
        let pool_script = util::address_to_script("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa").unwrap();
        let job = BlockTemplate::new(
            "2".to_string(),
            rpc_data,
            &pool_script,
            &PLACEHOLDER,
            RewardKind::Pow,
            false,
            &[],
        )
        .unwrap();
        assert_eq!(job.target, BigUint::from(0xffu32));
    }

    #[test]
    fn test_header_round_trip() {
        let job = sample_template();
        let coinbase = job.serialize_coinbase(&[0u8; 2], &[0u8; 6]);
        let root = util::reverse_buffer(&job.merkle_tree.with_first(sha256d(&coinbase)));
        let root: [u8; 32] = root.try_into().unwrap();
        let header = job.serialize_header(&root, "65400000", "deadbeef").unwrap();
        assert_eq!(header.len(), 80);

        // after the final reversal the version leads in little-endian
        assert_eq!(&header[0..4], &job.rpc_data.version.to_le_bytes());
        // and the nonce bytes land reversed at the tail
        assert_eq!(&header[76..80], &[0xef, 0xbe, 0xad, 0xde]);
    }

    #[test]
    fn test_serialize_block_shapes() {
        let job = sample_template();
        let coinbase = job.serialize_coinbase(&[0u8; 2], &[0u8; 6]);
        let header = vec![0u8; 80];
        let block = job.serialize_block(&header, &coinbase);
        assert_eq!(block.len(), 80 + 1 + coinbase.len());
        assert_eq!(block[80], 1); // tx count

        let pool_script = util::address_to_script("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa").unwrap();
        let pos_job = BlockTemplate::new(
            "3".to_string(),
            sample_rpc_template(),
            &pool_script,
            &PLACEHOLDER,
            RewardKind::Pos,
            false,
            &[],
        )
        .unwrap();
        let pos_coinbase = pos_job.serialize_coinbase(&[0u8; 2], &[0u8; 6]);
        let pos_block = pos_job.serialize_block(&header, &pos_coinbase);
        assert_eq!(*pos_block.last().unwrap(), 0);
        assert_eq!(pos_block.len(), 80 + 1 + pos_coinbase.len() + 1);
    }

    #[test]
    fn test_register_submit_dedup() {
        let job = sample_template();
        assert!(job.register_submit("08000002", "00000001", "65400000", "deadbeef"));
        assert!(!job.register_submit("08000002", "00000001", "65400000", "deadbeef"));
        assert!(job.register_submit("08000002", "00000002", "65400000", "deadbeef"));
    }

    #[test]
    fn test_job_params_clean_flag() {
        let job = sample_template();
        let params = job.job_params(true);
        assert_eq!(params.len(), 9);
        assert_eq!(params[0], json!("1"));
        assert_eq!(params[1], json!(job.prev_hash_reversed));
        assert_eq!(params[5], json!("20000000"));
        assert_eq!(params[6], json!("1d00ffff"));
        assert_eq!(params[8], json!(true));

        let params = job.job_params(false);
        assert_eq!(params[8], json!(false));
    }
}
