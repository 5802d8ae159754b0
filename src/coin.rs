//! Supported coin families and their signing rules

use crate::crypto::{ed25519, secp256k1};
use crate::errors::{CustodyError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Signature scheme behind a coin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Curve {
    Secp256k1,
    Ed25519,
}

/// Coin type for a signing request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoinType {
    Bitcoin,
    Ethereum,
    Solana,
}

impl CoinType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoinType::Bitcoin => "bitcoin",
            CoinType::Ethereum => "ethereum",
            CoinType::Solana => "solana",
        }
    }

    pub fn curve(&self) -> Curve {
        match self {
            CoinType::Bitcoin | CoinType::Ethereum => Curve::Secp256k1,
            CoinType::Solana => Curve::Ed25519,
        }
    }

    /// Length of a genuine signature for this coin.
    ///
    /// The degraded signing path returns exactly this many bytes so the
    /// result cannot be told apart by shape.
    pub fn signature_len(&self) -> usize {
        match self.curve() {
            Curve::Secp256k1 => secp256k1::RECOVERABLE_SIGNATURE_LEN,
            Curve::Ed25519 => ed25519::SIGNATURE_LEN,
        }
    }

    /// The bytes that are actually signed for `unsigned_tx`.
    pub fn signing_payload(&self, unsigned_tx: &[u8]) -> Vec<u8> {
        match self {
            CoinType::Bitcoin => secp256k1::double_sha256(unsigned_tx).to_vec(),
            CoinType::Ethereum => secp256k1::keccak256(unsigned_tx).to_vec(),
            CoinType::Solana => unsigned_tx.to_vec(),
        }
    }

    /// Sign `unsigned_tx` with the raw private key `key`.
    ///
    /// secp256k1 coins produce `r || s || v` over the digest; Solana
    /// produces an ed25519 signature over the message itself.
    pub fn sign_with_key(&self, key: &[u8], unsigned_tx: &[u8]) -> Result<Vec<u8>> {
        let payload = self.signing_payload(unsigned_tx);
        match self.curve() {
            Curve::Secp256k1 => {
                let digest: [u8; 32] = payload
                    .as_slice()
                    .try_into()
                    .map_err(|_| CustodyError::Internal("digest is not 32 bytes".into()))?;
                let keypair = secp256k1::Secp256k1KeyPair::from_bytes(key)?;
                Ok(keypair.sign_digest(&digest)?.to_vec())
            }
            Curve::Ed25519 => {
                let keypair = ed25519::Ed25519KeyPair::from_seed(key)?;
                Ok(keypair.sign(&payload).to_vec())
            }
        }
    }

    /// Public key for `key`: SEC1 compressed for secp256k1, raw 32 bytes
    /// for ed25519.
    pub fn public_key(&self, key: &[u8]) -> Result<Vec<u8>> {
        match self.curve() {
            Curve::Secp256k1 => {
                Ok(secp256k1::Secp256k1KeyPair::from_bytes(key)?.public_key_compressed())
            }
            Curve::Ed25519 => Ok(ed25519::Ed25519KeyPair::from_seed(key)?.public_key().to_vec()),
        }
    }
}

impl FromStr for CoinType {
    type Err = CustodyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "bitcoin" | "btc" => Ok(CoinType::Bitcoin),
            "ethereum" | "eth" => Ok(CoinType::Ethereum),
            "solana" | "sol" => Ok(CoinType::Solana),
            other => Err(CustodyError::Validation(format!(
                "Unsupported coin type: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for CoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
