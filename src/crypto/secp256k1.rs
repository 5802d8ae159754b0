//! secp256k1 signing for Bitcoin- and Ethereum-style coins
//!
//! Provides:
//! - Key loading from raw 32-byte secrets
//! - Recoverable prehash signing (`r || s || v`, 65 bytes)
//! - Prehash verification against a SEC1 public key
//! - Address rendering (EIP-55 for Ethereum, compressed hex for Bitcoin)

use crate::errors::{CustodyError, Result};
use crate::security::SecureBuffer;
use k256::{
    ecdsa::{signature::hazmat::PrehashVerifier, Signature, SigningKey, VerifyingKey},
    elliptic_curve::sec1::ToEncodedPoint,
    SecretKey,
};
use sha2::Sha256;
use sha3::{Digest, Keccak256};

/// Length of a recoverable signature
pub const RECOVERABLE_SIGNATURE_LEN: usize = 65;

/// secp256k1 key pair
pub struct Secp256k1KeyPair {
    signing_key: SigningKey,
}

impl Secp256k1KeyPair {
    /// Create a new random key pair
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut rand::thread_rng()),
        }
    }

    /// Create from raw private key bytes (32 bytes)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 32 {
            return Err(CustodyError::Validation(format!(
                "Expected 32 byte secp256k1 key, got {}",
                bytes.len()
            )));
        }

        let secret_key = SecretKey::from_slice(bytes)
            .map_err(|_| CustodyError::validation("secp256k1 key out of range"))?;

        Ok(Self {
            signing_key: SigningKey::from(secret_key),
        })
    }

    /// Compressed SEC1 public key (33 bytes)
    pub fn public_key_compressed(&self) -> Vec<u8> {
        self.signing_key
            .verifying_key()
            .to_encoded_point(true)
            .as_bytes()
            .to_vec()
    }

    /// Uncompressed SEC1 public key (65 bytes, 0x04 prefix)
    pub fn public_key_uncompressed(&self) -> Vec<u8> {
        self.signing_key
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()
    }

    /// Ethereum address (last 20 bytes of keccak256 of the raw point)
    pub fn eth_address(&self) -> [u8; 20] {
        let pubkey = self.public_key_uncompressed();
        let hash = Keccak256::digest(&pubkey[1..]);
        let mut address = [0u8; 20];
        address.copy_from_slice(&hash[12..]);
        address
    }

    /// Sign a 32-byte digest, returning `r || s || v`
    pub fn sign_digest(&self, digest: &[u8; 32]) -> Result<[u8; RECOVERABLE_SIGNATURE_LEN]> {
        let (signature, recovery_id) = self
            .signing_key
            .sign_prehash_recoverable(digest)
            .map_err(|e| CustodyError::Internal(format!("secp256k1 signing failed: {}", e)))?;

        let mut out = [0u8; RECOVERABLE_SIGNATURE_LEN];
        out[..64].copy_from_slice(&signature.to_bytes());
        out[64] = recovery_id.to_byte();
        Ok(out)
    }

    /// Export the private key bytes
    pub fn private_key_bytes(&self) -> SecureBuffer {
        SecureBuffer::new(self.signing_key.to_bytes().to_vec())
    }
}

/// Verify `r || s [|| v]` over `digest` against a SEC1 public key.
///
/// Anything that does not parse as a signature verifies as `false`.
pub fn verify_digest(public_key: &[u8], digest: &[u8; 32], signature: &[u8]) -> bool {
    if signature.len() < 64 {
        return false;
    }
    let Ok(verifying_key) = VerifyingKey::from_sec1_bytes(public_key) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(&signature[..64]) else {
        return false;
    };
    verifying_key.verify_prehash(digest, &sig).is_ok()
}

/// Compute keccak256 hash
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// SHA-256 applied twice, as Bitcoin sighashes are
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    let first = <Sha256 as sha2::Digest>::digest(data);
    <Sha256 as sha2::Digest>::digest(first).into()
}

/// Convert an address to checksummed format (EIP-55)
pub fn checksum_address(address: &[u8; 20]) -> String {
    let addr_hex = hex::encode(address);
    let hash = hex::encode(Keccak256::digest(addr_hex.as_bytes()));

    let mut result = String::with_capacity(42);
    result.push_str("0x");

    for (c, h) in addr_hex.chars().zip(hash.chars()) {
        if c.is_ascii_alphabetic() && h >= '8' {
            result.push(c.to_ascii_uppercase());
        } else {
            result.push(c);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_checksum() {
        // Test vector from EIP-55
        let addr = hex::decode("5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed").unwrap();
        let mut address = [0u8; 20];
        address.copy_from_slice(&addr);

        assert_eq!(
            checksum_address(&address),
            "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed"
        );
    }

    #[test]
    fn test_sign_and_verify() {
        let keypair = Secp256k1KeyPair::generate();
        let digest = keccak256(b"unsigned tx");

        let sig = keypair.sign_digest(&digest).unwrap();
        assert_eq!(sig.len(), RECOVERABLE_SIGNATURE_LEN);
        assert!(sig[64] <= 3);

        assert!(verify_digest(&keypair.public_key_compressed(), &digest, &sig));
        assert!(!verify_digest(
            &keypair.public_key_compressed(),
            &keccak256(b"other tx"),
            &sig
        ));
    }

    #[test]
    fn test_random_bytes_do_not_verify() {
        let keypair = Secp256k1KeyPair::generate();
        let digest = double_sha256(b"tx");
        assert!(!verify_digest(&keypair.public_key_compressed(), &digest, &[0xAB; 65]));
        assert!(!verify_digest(&keypair.public_key_compressed(), &digest, &[0u8; 65]));
        assert!(!verify_digest(&keypair.public_key_compressed(), &digest, &[1u8; 10]));
    }

    #[test]
    fn test_from_bytes() {
        let private_key =
            hex::decode("0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef")
                .unwrap();

        let keypair = Secp256k1KeyPair::from_bytes(&private_key).unwrap();
        let addr = checksum_address(&keypair.eth_address());
        assert!(addr.starts_with("0x"));
        assert_eq!(addr.len(), 42);
        assert_eq!(keypair.private_key_bytes().expose(), private_key.as_slice());
    }

    #[test]
    fn test_rejects_bad_lengths_and_zero_key() {
        assert!(Secp256k1KeyPair::from_bytes(&[1u8; 31]).is_err());
        assert!(Secp256k1KeyPair::from_bytes(&[0u8; 32]).is_err());
    }

    #[test]
    fn test_double_sha256_vector() {
        // sha256d("") from the Bitcoin test suite
        assert_eq!(
            hex::encode(double_sha256(b"")),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
    }
}
