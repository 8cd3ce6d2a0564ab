//! Generation (coinbase) transaction construction
//!
//! The generation transaction claims the block reward. It is built in two
//! halves split around the extranonce placeholder inside the input scriptSig;
//! each miner's extranonce1 + extranonce2 joins the halves into a unique
//! coinbase, which is what makes every submitted share distinct.

use crate::config::{Recipient, RewardKind};
use crate::error::Result;
use crate::template::RpcBlockTemplate;
use crate::util;

/// Signature marker embedded after the extranonce in the coinbase scriptSig
const COINBASE_SIGNATURE: &str = "/stratum-pool/";

/// Comment appended to tx-message coins (transaction version 2)
const TX_COMMENT: &str = "https://github.com/stratum-pool/stratum-pool";

/// Serialize the transaction output section: output count followed by each
/// `value(u64 LE) ‖ varint(script len) ‖ script`.
fn generate_output_transactions(
    pool_script: &[u8],
    recipients: &[Recipient],
    rpc_data: &RpcBlockTemplate,
) -> Result<Vec<u8>> {
    let mut reward = rpc_data.coinbasevalue;
    let mut reward_to_pool = reward;
    let mut outputs: Vec<Vec<u8>> = Vec::new();

    let push_output = |outputs: &mut Vec<Vec<u8>>, value: u64, script: &[u8]| {
        let mut out = Vec::with_capacity(8 + 9 + script.len());
        out.extend_from_slice(&value.to_le_bytes());
        out.extend_from_slice(&util::var_int_buffer(script.len() as u64));
        out.extend_from_slice(script);
        outputs.push(out);
    };

    // Masternode / superblock payees (Dash-style templates carry both keys)
    if rpc_data.masternode.is_some() && rpc_data.superblock.is_some() {
        let masternode = rpc_data.masternode.as_ref().and_then(|m| m.payee.as_ref());
        if let Some(payee) = masternode {
            let amount = rpc_data
                .masternode
                .as_ref()
                .and_then(|m| m.amount)
                .unwrap_or(0);
            reward -= amount;
            reward_to_pool -= amount;
            let script = util::address_to_script(payee)?;
            push_output(&mut outputs, amount, &script);
        } else if let Some(superblock) = rpc_data.superblock.as_ref().filter(|s| !s.is_empty()) {
            for entry in superblock {
                reward -= entry.amount;
                reward_to_pool -= entry.amount;
                let script = util::address_to_script(&entry.payee)?;
                push_output(&mut outputs, entry.amount, &script);
            }
        }
    }

    // Generic single payee, amount defaults to a fifth of the reward
    if let Some(payee) = &rpc_data.payee {
        let amount = match rpc_data.payee_amount {
            Some(amount) => amount,
            None => (reward as f64 / 5.0).ceil() as u64,
        };
        reward -= amount;
        reward_to_pool -= amount;
        let script = util::address_to_script(payee)?;
        push_output(&mut outputs, amount, &script);
    }

    for recipient in recipients {
        let recipient_reward = (recipient.percent * reward as f64).floor() as u64;
        reward_to_pool -= recipient_reward;
        push_output(&mut outputs, recipient_reward, &recipient.script);
    }

    // Pool output goes first among the value outputs
    let mut out = Vec::with_capacity(8 + 9 + pool_script.len());
    out.extend_from_slice(&reward_to_pool.to_le_bytes());
    out.extend_from_slice(&util::var_int_buffer(pool_script.len() as u64));
    out.extend_from_slice(pool_script);
    outputs.insert(0, out);

    // Segwit templates require the witness commitment ahead of everything
    if let Some(commitment_hex) = &rpc_data.default_witness_commitment {
        let commitment = hex::decode(commitment_hex)?;
        let mut out = Vec::with_capacity(8 + 9 + commitment.len());
        out.extend_from_slice(&0u64.to_le_bytes());
        out.extend_from_slice(&util::var_int_buffer(commitment.len() as u64));
        out.extend_from_slice(&commitment);
        outputs.insert(0, out);
    }

    let mut serialized = util::var_int_buffer(outputs.len() as u64);
    for output in outputs {
        serialized.extend_from_slice(&output);
    }
    Ok(serialized)
}

/// Build the generation transaction split around the extranonce placeholder.
/// Returns `(p1, p2)` where the full coinbase is
/// `p1 ‖ extranonce1 ‖ extranonce2 ‖ p2`.
pub fn create_generation(
    rpc_data: &RpcBlockTemplate,
    pool_script: &[u8],
    extranonce_placeholder: &[u8],
    reward: RewardKind,
    tx_messages: bool,
    recipients: &[Recipient],
) -> Result<(Vec<u8>, Vec<u8>)> {
    let tx_version: u32 = if tx_messages { 2 } else { 1 };
    let tx_lock_time: u32 = 0;
    let tx_in_prev_out_index: u32 = u32::MAX;
    let tx_in_sequence: u32 = 0;

    let flags = hex::decode(&rpc_data.coinbaseaux.flags)?;

    let mut script_sig_1 = Vec::new();
    script_sig_1.extend_from_slice(&util::serialize_number(rpc_data.height));
    script_sig_1.extend_from_slice(&flags);
    script_sig_1.extend_from_slice(&util::serialize_number(util::unix_time()));
    script_sig_1.push(extranonce_placeholder.len() as u8);

    let script_sig_2 = util::serialize_string(COINBASE_SIGNATURE);

    let mut p1 = Vec::new();
    p1.extend_from_slice(&tx_version.to_le_bytes());
    // POS coins timestamp the transaction itself
    if reward == RewardKind::Pos {
        p1.extend_from_slice(&rpc_data.curtime.to_le_bytes());
    }
    p1.extend_from_slice(&util::var_int_buffer(1)); // input count
    p1.extend_from_slice(&util::uint256_buffer_from_hash("")?);
    p1.extend_from_slice(&tx_in_prev_out_index.to_le_bytes());
    p1.extend_from_slice(&util::var_int_buffer(
        (script_sig_1.len() + extranonce_placeholder.len() + script_sig_2.len()) as u64,
    ));
    p1.extend_from_slice(&script_sig_1);

    let outputs = generate_output_transactions(pool_script, recipients, rpc_data)?;

    let mut p2 = Vec::new();
    p2.extend_from_slice(&script_sig_2);
    p2.extend_from_slice(&tx_in_sequence.to_le_bytes());
    p2.extend_from_slice(&outputs);
    p2.extend_from_slice(&tx_lock_time.to_le_bytes());
    if tx_messages {
        p2.extend_from_slice(&util::serialize_string(TX_COMMENT));
    }

    Ok((p1, p2))
}
