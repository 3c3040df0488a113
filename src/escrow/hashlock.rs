//! Hashlock primitives

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use sha3::Keccak256;
use std::fmt;
use std::str::FromStr;

/// Error returned when a 32-byte hex value cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("expected 32 bytes of hex, got {0}")]
pub struct HexParseError(String);

fn parse_hex32(input: &str) -> Result<[u8; 32], HexParseError> {
    let trimmed = input.strip_prefix("0x").unwrap_or(input);
    let bytes = hex::decode(trimmed).map_err(|e| HexParseError(e.to_string()))?;
    if bytes.len() != 32 {
        return Err(HexParseError(format!("{} bytes", bytes.len())));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

macro_rules! hex32_newtype {
    ($name:ident) => {
        impl $name {
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl FromStr for $name {
            type Err = HexParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_hex32(s).map($name)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

/// SHA-256 digest locking an escrow
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SecretHash(pub [u8; 32]);

/// 32-byte preimage of a [`SecretHash`]
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(pub [u8; 32]);

/// Deterministic escrow identifier, reproducible off-chain
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EscrowId(pub [u8; 32]);

hex32_newtype!(SecretHash);
hex32_newtype!(Secret);
hex32_newtype!(EscrowId);

impl fmt::Debug for SecretHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretHash({})", self.to_hex())
    }
}

impl fmt::Display for SecretHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// Never print the preimage.
impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

impl fmt::Debug for EscrowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EscrowId({})", self.to_hex())
    }
}

impl fmt::Display for EscrowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Hash a secret into the digest stored in the escrow
pub fn hash_secret(secret: &Secret) -> SecretHash {
    let digest = Sha256::digest(secret.0);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    SecretHash(out)
}

/// The single place where a preimage is checked against a hashlock
pub fn verify_secret(secret: &Secret, secret_hash: &SecretHash) -> bool {
    hash_secret(secret) == *secret_hash
}

/// Derive the escrow id from its immutable parameters.
///
/// `keccak256(maker ‖ 0x00 ‖ taker ‖ 0x00 ‖ secret_hash ‖ timelock_be ‖ salt)`.
/// An unknown taker hashes as the empty string.
pub fn compute_escrow_id(
    maker: &str,
    taker: Option<&str>,
    secret_hash: &SecretHash,
    timelock: u64,
    salt: &[u8],
) -> EscrowId {
    let mut hasher = Keccak256::new();
    hasher.update(maker.as_bytes());
    hasher.update([0u8]);
    hasher.update(taker.unwrap_or_default().as_bytes());
    hasher.update([0u8]);
    hasher.update(secret_hash.0);
    hasher.update(timelock.to_be_bytes());
    hasher.update(salt);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    EscrowId(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_secret() {
        let secret = Secret([7u8; 32]);
        let hash = hash_secret(&secret);
        assert!(verify_secret(&secret, &hash));
        assert!(!verify_secret(&Secret([8u8; 32]), &hash));
    }

    #[test]
    fn test_known_sha256_vector() {
        // sha256 of 32 zero bytes
        let hash = hash_secret(&Secret([0u8; 32]));
        assert_eq!(
            hash.to_hex(),
            "66687aadf862bd776c8fc18b8e9f8e20089714856ee233b3902a591d0d5f2925"
        );
    }

    #[test]
    fn test_escrow_id_is_deterministic_and_salted() {
        let hash = hash_secret(&Secret([1u8; 32]));
        let a = compute_escrow_id("maker", Some("taker"), &hash, 1_000, b"order-1");
        let b = compute_escrow_id("maker", Some("taker"), &hash, 1_000, b"order-1");
        let c = compute_escrow_id("maker", Some("taker"), &hash, 1_000, b"order-2");
        let d = compute_escrow_id("maker", None, &hash, 1_000, b"order-1");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_hex_parsing() {
        let secret = Secret([0xab; 32]);
        let parsed: Secret = format!("0x{}", secret.to_hex()).parse().unwrap();
        assert_eq!(parsed, secret);
        assert!("abcd".parse::<Secret>().is_err());
        assert!("zz".parse::<SecretHash>().is_err());
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = Secret([0xab; 32]);
        assert!(!format!("{:?}", secret).contains("abab"));
    }

    #[test]
    fn test_serde_as_hex_string() {
        let id = EscrowId([3u8; 32]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_hex()));
        let back: EscrowId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
