//! End-to-end custody flows through the public API

use keyguard::config::HardwareConfig;
use keyguard::crypto::{secp256k1, KdfParams};
use keyguard::security::Detector;
use keyguard::{
    CoinType, CustodyError, EmulatorDriver, HardwareWalletManager, IntegrityVerifier, KeyCache,
    KeySource, LayeredCipher, PasswordHasher, RuntimeMonitor, SecureTransactionSigner,
    SessionScope, SignatureOrigin, SigningRequest, VendorType,
};
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use std::time::Duration;

const KEY_HEX: &str = "8da4ef21b864d2cc526dbdb2a120bd2874c36c9d0a1fb7f8c63d7f7a8b41de8f";
const ETH_PATH: &str = "m/44'/60'/0'/0/0";

struct Debugged;

impl Detector for Debugged {
    fn name(&self) -> &'static str {
        "debugger"
    }

    fn detect(&self) -> Option<String> {
        Some("tracer pid 1".to_string())
    }
}

fn password(s: &str) -> SecretString {
    SecretString::new(s.to_string())
}

fn cipher() -> Arc<LayeredCipher> {
    Arc::new(LayeredCipher::new(
        vec![0xA5; 32],
        KdfParams {
            layer_iterations: 16,
            password_iterations: 32,
        },
        "integration-host",
    ))
}

fn hardware(monitor: RuntimeMonitor, driver: Arc<EmulatorDriver>) -> Arc<HardwareWalletManager> {
    let config = HardwareConfig {
        jitter_min_ms: 1,
        jitter_max_ms: 3,
        ..HardwareConfig::default()
    };
    Arc::new(
        HardwareWalletManager::new(
            Arc::new(monitor),
            Arc::new(IntegrityVerifier::new(vec![])),
            &config,
        )
        .with_driver(driver),
    )
}

#[test]
fn test_protect_roundtrip_with_and_without_password() {
    let cipher = cipher();
    let data = b"seed words are not stored in plaintext";

    let with_pw = cipher.context(SessionScope::Stable("s1".into()), Some(password("hunter2")));
    let blob = cipher.protect(data, &with_pw).unwrap();
    assert_eq!(cipher.unprotect(&blob, &with_pw).unwrap().expose(), data);

    let wrong = cipher.context(SessionScope::Stable("s1".into()), Some(password("hunter3")));
    assert!(matches!(
        cipher.unprotect(&blob, &wrong),
        Err(CustodyError::Authentication)
    ));

    let no_pw = cipher.context(SessionScope::Stable("s1".into()), None);
    let blob = cipher.protect(data, &no_pw).unwrap();
    assert_eq!(cipher.unprotect(&blob, &no_pw).unwrap().expose(), data);
}

#[test]
fn test_password_hash_verification() {
    let hasher = PasswordHasher::new(64);
    let stored = hasher.hash_password(&password("correct horse")).unwrap();

    assert!(hasher.verify_password_hash(&password("correct horse"), &stored));
    assert!(!hasher.verify_password_hash(&password("wrong horse"), &stored));
    assert!(!hasher.verify_password_hash(&password("correct horse"), "garbage"));
}

#[test]
fn test_private_key_string_api() {
    let cipher = cipher();
    let encrypted = cipher.encrypt_private_key(KEY_HEX, &password("pw")).unwrap();
    assert_ne!(encrypted, KEY_HEX);
    assert_eq!(
        cipher
            .decrypt_private_key(&encrypted, &password("pw"))
            .unwrap()
            .expose_secret(),
        KEY_HEX
    );
}

#[tokio::test]
async fn test_software_signing_through_cache() {
    let cipher = cipher();
    let encrypted = cipher.encrypt_private_key(KEY_HEX, &password("pw")).unwrap();
    let cache = Arc::new(KeyCache::new(cipher, Duration::from_secs(300)));
    let driver = Arc::new(EmulatorDriver::new([4u8; 32]));
    let signer = SecureTransactionSigner::new(
        cache.clone(),
        hardware(RuntimeMonitor::new(vec![]), driver),
    );

    let outcome = signer
        .sign(SigningRequest {
            wallet_id: "hot-wallet".into(),
            coin: CoinType::Bitcoin,
            unsigned_tx: b"psbt bytes".to_vec(),
            source: KeySource::Software {
                encrypted_key: encrypted,
                password: password("pw"),
            },
        })
        .await
        .unwrap();

    assert_eq!(outcome.origin, SignatureOrigin::Software);
    let pk = CoinType::Bitcoin
        .public_key(&hex::decode(KEY_HEX).unwrap())
        .unwrap();
    assert!(secp256k1::verify_digest(
        &pk,
        &secp256k1::double_sha256(b"psbt bytes"),
        &outcome.signature
    ));

    assert!(cache.get("hot-wallet").await.is_some());
    assert!(cache.clear("hot-wallet").await);
}

#[tokio::test]
async fn test_hardware_flow_and_degraded_signature() {
    let driver = Arc::new(EmulatorDriver::with_vendor(VendorType::Ledger, [8u8; 32]));
    let path = ETH_PATH.parse().unwrap();
    let pk = driver.public_key(CoinType::Ethereum, &path).unwrap();
    let digest = secp256k1::keccak256(b"eip1559 payload");

    // Trusted environment: genuine signature
    let manager = hardware(RuntimeMonitor::new(vec![]), driver.clone());
    assert!(manager.detect_connected().await.contains(&VendorType::Ledger));
    assert!(manager.connect(VendorType::Ledger).await);
    let address = manager.get_address(CoinType::Ethereum, ETH_PATH).await.unwrap();
    assert!(address.starts_with("0x"));

    let genuine = manager
        .sign_transaction(CoinType::Ethereum, ETH_PATH, b"eip1559 payload")
        .await
        .unwrap();
    assert!(secp256k1::verify_digest(&pk, &digest, &genuine));
    manager.disconnect().await;

    // Flagged environment: same shape, does not verify
    let manager = hardware(RuntimeMonitor::new(vec![Box::new(Debugged)]), driver);
    assert!(manager.connect(VendorType::Ledger).await);
    let fake = manager
        .sign_transaction(CoinType::Ethereum, ETH_PATH, b"eip1559 payload")
        .await
        .unwrap();
    assert_eq!(fake.len(), genuine.len());
    assert!(!secp256k1::verify_digest(&pk, &digest, &fake));
}

#[tokio::test]
async fn test_signing_without_device_is_device_error() {
    let driver = Arc::new(EmulatorDriver::new([8u8; 32]));
    let manager = hardware(RuntimeMonitor::new(vec![]), driver);
    assert!(matches!(
        manager.sign_transaction(CoinType::Solana, "m/44'/501'/0'", b"m").await,
        Err(CustodyError::Device(_))
    ));
}
