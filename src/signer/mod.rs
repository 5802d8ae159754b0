//! Caller-facing signing service
//!
//! Routes a request either to the software path (key from the ephemeral
//! cache, signed locally) or to the active hardware session. Internal
//! failures are obfuscated before they reach the caller.

use crate::coin::CoinType;
use crate::errors::{CustodyError, Result};
use crate::hardware::{GateDecision, HardwareWalletManager};
use crate::keystore::KeyCache;
use crate::security::obfuscate;
use secrecy::SecretString;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info};

/// Where the private key for a request lives
pub enum KeySource {
    /// Encrypted key from the wallet repository plus the password for it
    Software {
        encrypted_key: String,
        password: SecretString,
    },
    /// The connected hardware wallet
    Hardware { derivation_path: String },
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySource::Software { .. } => f.write_str("Software"),
            KeySource::Hardware { derivation_path } => f
                .debug_struct("Hardware")
                .field("derivation_path", derivation_path)
                .finish(),
        }
    }
}

#[derive(Debug)]
pub struct SigningRequest {
    pub wallet_id: String,
    pub coin: CoinType,
    pub unsigned_tx: Vec<u8>,
    pub source: KeySource,
}

/// Which path produced a signature. For audit logs, not for end users.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureOrigin {
    Software,
    Hardware,
    Degraded,
}

#[derive(Debug, Clone)]
pub struct SignatureOutcome {
    pub signature: Vec<u8>,
    pub origin: SignatureOrigin,
}

pub struct SecureTransactionSigner {
    cache: Arc<KeyCache>,
    hardware: Arc<HardwareWalletManager>,
}

impl SecureTransactionSigner {
    pub fn new(cache: Arc<KeyCache>, hardware: Arc<HardwareWalletManager>) -> Self {
        Self { cache, hardware }
    }

    /// Sign a transaction.
    ///
    /// Validation, authentication and device errors are returned as they
    /// are; anything else comes back as [`CustodyError::Obscured`].
    pub async fn sign(&self, request: SigningRequest) -> Result<SignatureOutcome> {
        let wallet_id = request.wallet_id.clone();
        let coin = request.coin;

        match self.sign_inner(request).await {
            Ok(outcome) => {
                info!(
                    wallet = %wallet_id,
                    coin = %coin,
                    origin = ?outcome.origin,
                    "Transaction signed"
                );
                Ok(outcome)
            }
            Err(e) if e.is_caller_safe() => Err(e),
            Err(e) => {
                error!(wallet = %wallet_id, "Signing failed internally: {}", e);
                Err(obfuscate(e))
            }
        }
    }

    async fn sign_inner(&self, request: SigningRequest) -> Result<SignatureOutcome> {
        if request.wallet_id.is_empty() {
            return Err(CustodyError::validation("wallet id must not be empty"));
        }
        if request.unsigned_tx.is_empty() {
            return Err(CustodyError::validation("transaction must not be empty"));
        }

        match &request.source {
            KeySource::Software {
                encrypted_key,
                password,
            } => {
                let key = self
                    .cache
                    .load(&request.wallet_id, encrypted_key, password)
                    .await?;
                // A stored key that fails to load as a signing key is an
                // internal fault, not an input error.
                let signature = request
                    .coin
                    .sign_with_key(key.expose(), &request.unsigned_tx)
                    .map_err(|e| CustodyError::Internal(format!("software signing: {}", e)))?;
                Ok(SignatureOutcome {
                    signature,
                    origin: SignatureOrigin::Software,
                })
            }
            KeySource::Hardware { derivation_path } => {
                let (signature, decision) = self
                    .hardware
                    .sign_gated(request.coin, derivation_path, &request.unsigned_tx)
                    .await?;
                let origin = match decision {
                    GateDecision::Proceed => SignatureOrigin::Hardware,
                    GateDecision::Degrade(_) => SignatureOrigin::Degraded,
                };
                Ok(SignatureOutcome { signature, origin })
            }
        }
    }
}
