//! Merkle branch computation
//!
//! The tree is built once per job over the template's transaction hashes,
//! with leaf 0 reserved for the not-yet-known coinbase hash. Only the
//! `steps` needed to fold a coinbase hash up to the root are kept, so each
//! submitted share recomputes just the root instead of the whole tree.

use crate::util;

/// Merkle tree reduced to the branch steps for the first leaf
#[derive(Debug, Clone)]
pub struct MerkleTree {
    steps: Vec<[u8; 32]>,
}

impl MerkleTree {
    /// Build the steps from the transaction hashes. The coinbase occupies
    /// an implicit first leaf that is only known at share time.
    pub fn new(tx_hashes: Vec<[u8; 32]>) -> Self {
        Self {
            steps: Self::calculate_steps(tx_hashes),
        }
    }

    fn merkle_join(h1: &[u8], h2: &[u8]) -> [u8; 32] {
        let mut joined = Vec::with_capacity(h1.len() + h2.len());
        joined.extend_from_slice(h1);
        joined.extend_from_slice(h2);
        util::sha256d(&joined)
    }

    // `level` holds every leaf except the implicit coinbase slot. At each
    // height the first element is the sibling the coinbase fold needs; the
    // rest pair up, duplicating the tail when the full row is odd.
    fn calculate_steps(mut level: Vec<[u8; 32]>) -> Vec<[u8; 32]> {
        let mut steps = Vec::new();

        while !level.is_empty() {
            steps.push(level[0]);

            // odd full-row count, counting the coinbase slot
            if level.len() % 2 == 0 {
                if let Some(last) = level.last().copied() {
                    level.push(last);
                }
            }

            level = level[1..]
                .chunks_exact(2)
                .map(|pair| Self::merkle_join(&pair[0], &pair[1]))
                .collect();
        }
        steps
    }

    /// The branch steps, in fold order
    pub fn steps(&self) -> &[[u8; 32]] {
        &self.steps
    }

    /// Fold a first-leaf value (the coinbase hash) through the steps to
    /// produce the merkle root
    pub fn with_first(&self, first: [u8; 32]) -> [u8; 32] {
        self.steps
            .iter()
            .fold(first, |acc, step| Self::merkle_join(&acc, step))
    }

    /// Branch steps hex-encoded for `mining.notify`
    pub fn branch_hex(&self) -> Vec<String> {
        self.steps.iter().map(hex::encode).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_leaf_is_identity() {
        let tree = MerkleTree::new(Vec::new());
        assert!(tree.steps().is_empty());

        let first = util::sha256d(b"coinbase");
        assert_eq!(tree.with_first(first), first);
    }

    #[test]
    fn test_two_leaves_single_step() {
        let tx = util::sha256d(b"tx-b");
        let tree = MerkleTree::new(vec![tx]);

        assert_eq!(tree.steps(), &[tx]);

        let coinbase = util::sha256d(b"coinbase");
        let mut joined = Vec::new();
        joined.extend_from_slice(&coinbase);
        joined.extend_from_slice(&tx);
        assert_eq!(tree.with_first(coinbase), util::sha256d(&joined));
    }

    #[test]
    fn test_three_leaves_duplicates_odd_tail() {
        let a = util::sha256d(b"tx-a");
        let b = util::sha256d(b"tx-b");
        let tree = MerkleTree::new(vec![a, b]);

        // Two levels: step a at the bottom, then the hash of (b, b).
        assert_eq!(tree.steps().len(), 2);
        assert_eq!(tree.steps()[0], a);

        let mut bb = Vec::new();
        bb.extend_from_slice(&b);
        bb.extend_from_slice(&b);
        assert_eq!(tree.steps()[1], util::sha256d(&bb));
    }

    #[test]
    fn test_branch_hex_matches_steps() {
        let a = util::sha256d(b"tx-a");
        let tree = MerkleTree::new(vec![a]);
        assert_eq!(tree.branch_hex(), vec![hex::encode(a)]);
    }
}
