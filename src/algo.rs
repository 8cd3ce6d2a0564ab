//! Pluggable proof-of-work hash abstraction
//!
//! Each deployed coin picks one header hash function at startup from a
//! static registry; nothing else in the pipeline assumes a specific
//! algorithm. `diff1` is the canonical maximum 256-bit target and
//! `multiplier` scales raw difficulty ratios into displayed units.

use crate::util;
use num_bigint::BigUint;
use once_cell::sync::Lazy;

/// The maximum target, against which difficulty 1 is defined
pub static DIFF1: Lazy<BigUint> = Lazy::new(|| {
    BigUint::parse_bytes(
        b"00000000ffff0000000000000000000000000000000000000000000000000000",
        16,
    )
    .expect("diff1 constant")
});

/// Fixed scale factor between internal difficulty units and displayed units
pub const MULTIPLIER: f64 = 65536.0;

/// Header hash capability, selected once at startup
pub trait HashFunction: Send + Sync {
    /// Registry name of this algorithm
    fn name(&self) -> &'static str;

    /// Hash an 80-byte serialized header. `ntime` is passed for algorithms
    /// that mix the timestamp into the digest; sha256d ignores it.
    fn hash(&self, header: &[u8], ntime: u32) -> [u8; 32];
}

/// Double-SHA256, the default bitcoin-style header hash
pub struct Sha256d;

impl HashFunction for Sha256d {
    fn name(&self) -> &'static str {
        "sha256d"
    }

    fn hash(&self, header: &[u8], _ntime: u32) -> [u8; 32] {
        util::sha256d(header)
    }
}

static SHA256D: Sha256d = Sha256d;

/// Look up a hash algorithm by registry name
pub fn from_name(name: &str) -> Option<&'static dyn HashFunction> {
    match name {
        "sha256d" | "sha256" => Some(&SHA256D),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::ToPrimitive;

    #[test]
    fn test_diff1_magnitude() {
        // diff1 = 0xffff * 2^208
        let expect = BigUint::from(0xffffu32) << 208;
        assert_eq!(*DIFF1, expect);
        assert!(DIFF1.to_f64().is_some());
    }

    #[test]
    fn test_registry() {
        let algo = from_name("sha256d").unwrap();
        assert_eq!(algo.name(), "sha256d");
        assert!(from_name("scrypt-jane").is_none());
    }

    #[test]
    fn test_sha256d_header_hash() {
        let header = [0u8; 80];
        let digest = Sha256d.hash(&header, 0);
        assert_eq!(digest, util::sha256d(&header));
    }
}
