//! Binary codec utilities
//!
//! Bitcoin-style primitives shared by the template, merkle and stratum
//! layers: double-SHA256, buffer reversal, variable-length integers,
//! CScript number/string serialization, address-to-script conversion and
//! compact-bits target decoding.

use crate::error::{Error, Result};
use num_bigint::BigUint;
use sha2::{Digest, Sha256};

/// Single SHA256
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Double SHA256, the hash used everywhere in bitcoin-style block structures
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

/// Reverse a byte buffer
pub fn reverse_buffer(data: &[u8]) -> Vec<u8> {
    data.iter().rev().copied().collect()
}

/// Reverse the bytes of a hex string
pub fn reverse_hex(hex: &str) -> Result<String> {
    let bytes = hex::decode(hex).map_err(|e| Error::other(format!("invalid hex: {}", e)))?;
    Ok(hex::encode(reverse_buffer(&bytes)))
}

/// Swap each 32-bit word to little-endian, then reverse the whole buffer.
///
/// This is the transformation applied to the previous-block hash before it
/// is handed to miners in `mining.notify`.
pub fn reverse_byte_order(data: &[u8; 32]) -> [u8; 32] {
    let mut swapped = [0u8; 32];
    for (i, word) in data.chunks_exact(4).enumerate() {
        swapped[i * 4..i * 4 + 4]
            .copy_from_slice(&[word[3], word[2], word[1], word[0]]);
    }
    swapped.reverse();
    swapped
}

/// Decode a hash hex string into a reversed 32-byte buffer, zero-padding
/// short inputs (the null prevout hash of a coinbase input is empty).
pub fn uint256_buffer_from_hash(hex: &str) -> Result<[u8; 32]> {
    let decoded = hex::decode(hex).map_err(|e| Error::other(format!("invalid hash hex: {}", e)))?;
    let mut padded = [0u8; 32];
    let n = decoded.len().min(32);
    padded[..n].copy_from_slice(&decoded[..n]);
    padded.reverse();
    Ok(padded)
}

/// Bitcoin variable-length integer.
///
/// `< 0xfd` one byte; `<= 0xffff` 0xfd + u16 LE; `<= 0xffffffff`
/// 0xfe + u32 LE; otherwise 0xff + u64 LE.
pub fn var_int_buffer(n: u64) -> Vec<u8> {
    if n < 0xfd {
        vec![n as u8]
    } else if n <= 0xffff {
        let mut buf = vec![0xfd];
        buf.extend_from_slice(&(n as u16).to_le_bytes());
        buf
    } else if n <= 0xffff_ffff {
        let mut buf = vec![0xfe];
        buf.extend_from_slice(&(n as u32).to_le_bytes());
        buf
    } else {
        let mut buf = vec![0xff];
        buf.extend_from_slice(&n.to_le_bytes());
        buf
    }
}

/// Length-prefixed byte string (varint length followed by the bytes)
pub fn var_string_buffer(s: &[u8]) -> Vec<u8> {
    let mut buf = var_int_buffer(s.len() as u64);
    buf.extend_from_slice(s);
    buf
}

/// Serialized CScript number, used for the height and timestamp pushed
/// into the coinbase scriptSig (BIP 34 format).
pub fn serialize_number(n: u64) -> Vec<u8> {
    if (1..=16).contains(&n) {
        return vec![0x50 + n as u8];
    }
    let mut n = n;
    let mut buf = vec![0u8];
    while n > 0x7f {
        buf.push((n & 0xff) as u8);
        n >>= 8;
    }
    buf.push(n as u8);
    buf[0] = (buf.len() - 1) as u8;
    buf
}

/// Length-prefixed script string (single-byte length below 253, then the
/// 0xfd/0xfe/0xff classes), used for scriptSig tag strings and tx comments.
pub fn serialize_string(s: &str) -> Vec<u8> {
    let bytes = s.as_bytes();
    let mut buf = match bytes.len() {
        n if n < 253 => vec![n as u8],
        n if n < 0x10000 => {
            let mut b = vec![253];
            b.extend_from_slice(&(n as u16).to_le_bytes());
            b
        }
        n => {
            let mut b = vec![254];
            b.extend_from_slice(&(n as u32).to_le_bytes());
            b
        }
    };
    buf.extend_from_slice(bytes);
    buf
}

/// P2PKH output script from a base58check address (POW payouts)
pub fn address_to_script(addr: &str) -> Result<Vec<u8>> {
    let decoded = bs58::decode(addr)
        .into_vec()
        .map_err(|e| Error::invalid_address(format!("base58 decode failed for {}: {}", addr, e)))?;

    if decoded.len() < 25 {
        return Err(Error::invalid_address(format!(
            "invalid address length for {}",
            addr
        )));
    }

    let pubkey_hash = &decoded[1..decoded.len() - 4];
    let mut script = vec![0x76, 0xa9, 0x14];
    script.extend_from_slice(pubkey_hash);
    script.extend_from_slice(&[0x88, 0xac]);
    Ok(script)
}

/// P2PKH output script from a raw 20-byte pubkey hash (40 hex chars)
pub fn mining_key_to_script(key: &str) -> Result<Vec<u8>> {
    let hash = hex::decode(key)
        .map_err(|e| Error::invalid_address(format!("invalid mining key {}: {}", key, e)))?;
    let mut script = vec![0x76, 0xa9, 0x14];
    script.extend_from_slice(&hash);
    script.extend_from_slice(&[0x88, 0xac]);
    Ok(script)
}

/// P2PK output script from a 33-byte compressed pubkey, required for the
/// generation transaction of POS coins
pub fn pubkey_to_script(key: &str) -> Result<Vec<u8>> {
    if key.len() != 66 {
        return Err(Error::invalid_address(format!("invalid pubkey: {}", key)));
    }
    let mut script = vec![0u8; 35];
    script[0] = 0x21;
    script[34] = 0xac;
    let decoded =
        hex::decode(key).map_err(|e| Error::invalid_address(format!("invalid pubkey hex: {}", e)))?;
    script[1..34].copy_from_slice(&decoded);
    Ok(script)
}

/// Decode a compact-bits buffer (exponent byte + 3-byte mantissa) into a
/// 256-bit target
pub fn target_from_bits(bits: &[u8]) -> Result<BigUint> {
    if bits.len() != 4 {
        return Err(Error::invalid_template(format!(
            "bits must be 4 bytes, got {}",
            bits.len()
        )));
    }
    let exponent = bits[0] as u32;
    let mantissa = BigUint::from_bytes_be(&bits[1..]);
    if exponent >= 3 {
        Ok(mantissa << (8 * (exponent - 3)))
    } else {
        Ok(mantissa >> (8 * (3 - exponent)))
    }
}

/// Decode a compact-bits hex string into a 256-bit target
pub fn target_from_bits_hex(bits: &str) -> Result<BigUint> {
    let buf = hex::decode(bits)
        .map_err(|e| Error::invalid_template(format!("invalid bits hex {}: {}", bits, e)))?;
    target_from_bits(&buf)
}

/// Human-readable hash rate
pub fn hash_rate_string(hashrate: f64) -> String {
    let units = [" KH", " MH", " GH", " TH", " PH"];
    let mut rate = hashrate;
    let mut i = 0;
    loop {
        rate /= 1024.0;
        if rate <= 1024.0 || i == units.len() - 1 {
            break;
        }
        i += 1;
    }
    format!("{:.2}{}", rate, units[i])
}

/// Current unix time in seconds
pub fn unix_time() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reverse_buffer_involution() {
        let buf = vec![0x00, 0x01, 0x02];
        assert_eq!(reverse_buffer(&buf), vec![0x02, 0x01, 0x00]);
        assert_eq!(reverse_buffer(&reverse_buffer(&buf)), buf);
    }

    #[test]
    fn test_var_int_size_classes() {
        assert_eq!(var_int_buffer(0xfc), vec![0xfc]);
        assert_eq!(var_int_buffer(0xfd), vec![0xfd, 0xfd, 0x00]);
        assert_eq!(var_int_buffer(0xffff), vec![0xfd, 0xff, 0xff]);
        assert_eq!(var_int_buffer(0x10000), vec![0xfe, 0x00, 0x00, 0x01, 0x00]);
        assert_eq!(
            var_int_buffer(0xffff_ffff),
            vec![0xfe, 0xff, 0xff, 0xff, 0xff]
        );
        assert_eq!(
            var_int_buffer(0x1_0000_0000),
            vec![0xff, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_serialize_number() {
        // Small numbers are OP_1..OP_16
        assert_eq!(serialize_number(1), vec![0x51]);
        assert_eq!(serialize_number(16), vec![0x60]);
        // Larger values get a length prefix and little-endian payload
        assert_eq!(serialize_number(0x80), vec![2, 0x80, 0x00]);
        assert_eq!(serialize_number(500_000), vec![3, 0x20, 0xa1, 0x07]);
    }

    #[test]
    fn test_serialize_string_short() {
        let out = serialize_string("/stratum-pool/");
        assert_eq!(out[0] as usize, "/stratum-pool/".len());
        assert_eq!(&out[1..], "/stratum-pool/".as_bytes());
    }

    #[test]
    fn test_uint256_from_hash_pads_and_reverses() {
        let out = uint256_buffer_from_hash("").unwrap();
        assert_eq!(out, [0u8; 32]);

        let mut hex = String::from("01");
        hex.push_str(&"00".repeat(31));
        let out = uint256_buffer_from_hash(&hex).unwrap();
        assert_eq!(out[31], 0x01);
        assert_eq!(out[0], 0x00);
    }

    #[test]
    fn test_target_from_bits() {
        // 0x1d00ffff is the bitcoin genesis difficulty
        let target = target_from_bits_hex("1d00ffff").unwrap();
        let expect = BigUint::parse_bytes(
            b"00000000ffff0000000000000000000000000000000000000000000000000000",
            16,
        )
        .unwrap();
        assert_eq!(target, expect);
    }

    #[test]
    fn test_reverse_byte_order() {
        let mut buf = [0u8; 32];
        buf[0] = 0xaa;
        buf[3] = 0xbb;
        let out = reverse_byte_order(&buf);
        // Word 0 [aa 00 00 bb] becomes LE [bb 00 00 aa], then the whole
        // buffer is reversed, putting it at the tail in original order.
        assert_eq!(out[28..32], [0xaa, 0x00, 0x00, 0xbb]);
    }

    #[test]
    fn test_address_to_script() {
        // Genesis block payout address
        let script = address_to_script("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa").unwrap();
        assert_eq!(script.len(), 25);
        assert_eq!(script[0], 0x76);
        assert_eq!(script[1], 0xa9);
        assert_eq!(script[23], 0x88);
        assert_eq!(script[24], 0xac);

        assert!(address_to_script("notbase58!!").is_err());
    }

    #[test]
    fn test_pubkey_to_script() {
        let key = "02".to_string() + &"11".repeat(32);
        let script = pubkey_to_script(&key).unwrap();
        assert_eq!(script.len(), 35);
        assert_eq!(script[0], 0x21);
        assert_eq!(script[34], 0xac);

        assert!(pubkey_to_script("0211").is_err());
    }

    #[test]
    fn test_sha256d() {
        // sha256d of empty input
        let digest = sha256d(b"");
        assert_eq!(
            hex::encode(digest),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
    }

    mod properties {
        use super::super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_var_int_width_matches_class(n in any::<u64>()) {
                let buf = var_int_buffer(n);
                let expected = match n {
                    0..=0xfc => 1,
                    0xfd..=0xffff => 3,
                    0x1_0000..=0xffff_ffff => 5,
                    _ => 9,
                };
                prop_assert_eq!(buf.len(), expected);
            }

            #[test]
            fn prop_reverse_buffer_involution(data in proptest::collection::vec(any::<u8>(), 0..128)) {
                prop_assert_eq!(reverse_buffer(&reverse_buffer(&data)), data);
            }

            #[test]
            fn prop_reverse_byte_order_involution(data in any::<[u8; 32]>()) {
                prop_assert_eq!(reverse_byte_order(&reverse_byte_order(&data)), data);
            }

            #[test]
            fn prop_var_string_round_trips_length(data in proptest::collection::vec(any::<u8>(), 0..300)) {
                let buf = var_string_buffer(&data);
                let prefix = var_int_buffer(data.len() as u64);
                prop_assert_eq!(&buf[..prefix.len()], &prefix[..]);
                prop_assert_eq!(&buf[prefix.len()..], &data[..]);
            }
        }
    }
}
