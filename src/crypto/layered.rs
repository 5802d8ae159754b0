//! Three-layer AES-256-CBC protection of key material
//!
//! ```text
//! layer 1 (device)  : IV || AES-CBC(K_device,  data || tag)
//! layer 2 (session) : IV || AES-CBC(K_session, layer1)
//! layer 3 (password): IV || AES-CBC(K_password, layer2)
//! ```
//!
//! Each layer key is normalized to 32 bytes through PBKDF2 under the
//! application salt. `tag` is HMAC-SHA-256(K_device, data); it makes a
//! corrupted blob fail even when every layer's padding happens to be valid.
//! Unwrapping goes layer 3, 2, 1 and any failure is reported as
//! [`CustodyError::Authentication`] with no further detail.

use crate::crypto::kdf::{combine, derive_key, KdfParams, BLOCK_LEN, IV_LEN, KEY_LEN};
use crate::errors::{CustodyError, Result};
use crate::security::SecureBuffer;
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes256;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use std::fs;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::debug;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// HMAC tag appended to the innermost plaintext
const TAG_LEN: usize = 32;

/// Domain label for the third layer when no password is supplied
const NO_CREDENTIAL_LABEL: &[u8] = b"keyguard/layer3/no-credential";

/// Session label used for long-lived private key blobs
const PRIVATE_KEY_SESSION: &str = "private-key-v1";

/// One encryption layer: `IV(16) || ciphertext`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedBlob {
    pub iv: [u8; IV_LEN],
    pub ciphertext: Vec<u8>,
}

impl EncryptedBlob {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(IV_LEN + self.ciphertext.len());
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Parse `IV || ciphertext`. The ciphertext must be a non-empty whole
    /// number of AES blocks.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < IV_LEN + BLOCK_LEN || (bytes.len() - IV_LEN) % BLOCK_LEN != 0 {
            return Err(CustodyError::Authentication);
        }
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&bytes[..IV_LEN]);
        Ok(Self {
            iv,
            ciphertext: bytes[IV_LEN..].to_vec(),
        })
    }
}

/// Which session a blob is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionScope {
    /// Decryptable for as long as the label is the same
    Stable(String),
    /// Decryptable only within the same wall-clock bucket
    TimeBucketed { label: String, bucket: Duration },
}

impl SessionScope {
    fn material(&self) -> String {
        self.material_at(chrono::Utc::now().timestamp())
    }

    /// Key material for the bucket containing unix time `timestamp`.
    fn material_at(&self, timestamp: i64) -> String {
        match self {
            SessionScope::Stable(label) => format!("stable:{}", label),
            SessionScope::TimeBucketed { label, bucket } => {
                let width = bucket.as_secs().max(1) as i64;
                let index = timestamp.div_euclid(width);
                format!("bucket:{}:{}:{}", label, width, index)
            }
        }
    }
}

/// Inputs that select the three layer keys.
#[derive(Debug, Clone)]
pub struct ProtectionContext {
    pub device_fingerprint: String,
    pub session: SessionScope,
    pub password: Option<SecretString>,
}

impl ProtectionContext {
    pub fn new(device_fingerprint: impl Into<String>, session: SessionScope) -> Self {
        Self {
            device_fingerprint: device_fingerprint.into(),
            session,
            password: None,
        }
    }

    pub fn with_password(mut self, password: SecretString) -> Self {
        self.password = Some(password);
        self
    }
}

struct LayerKeys {
    device: SecureBuffer,
    session: SecureBuffer,
    credential: SecureBuffer,
}

/// The layered encryption core.
#[derive(Clone)]
pub struct LayeredCipher {
    app_salt: Vec<u8>,
    params: KdfParams,
    device_fingerprint: String,
}

impl LayeredCipher {
    pub fn new(app_salt: Vec<u8>, params: KdfParams, device_fingerprint: impl Into<String>) -> Self {
        Self {
            app_salt,
            params,
            device_fingerprint: device_fingerprint.into(),
        }
    }

    pub fn params(&self) -> KdfParams {
        self.params
    }

    pub fn device_fingerprint(&self) -> &str {
        &self.device_fingerprint
    }

    /// Context bound to this host's fingerprint.
    pub fn context(&self, session: SessionScope, password: Option<SecretString>) -> ProtectionContext {
        ProtectionContext {
            device_fingerprint: self.device_fingerprint.clone(),
            session,
            password,
        }
    }

    fn layer_keys(&self, ctx: &ProtectionContext) -> Result<LayerKeys> {
        let device_raw = combine(&self.app_salt, ctx.device_fingerprint.as_bytes())?;
        let device = derive_key(
            device_raw.expose(),
            &self.app_salt,
            self.params.layer_iterations,
            KEY_LEN,
        );

        let session_raw = combine(&self.app_salt, ctx.session.material().as_bytes())?;
        let session = derive_key(
            session_raw.expose(),
            &self.app_salt,
            self.params.layer_iterations,
            KEY_LEN,
        );

        let credential = match &ctx.password {
            Some(password) => derive_key(
                password.expose_secret().as_bytes(),
                &self.app_salt,
                self.params.password_iterations,
                KEY_LEN,
            ),
            None => {
                let raw = combine(device_raw.expose(), NO_CREDENTIAL_LABEL)?;
                derive_key(raw.expose(), &self.app_salt, self.params.layer_iterations, KEY_LEN)
            }
        };

        Ok(LayerKeys {
            device,
            session,
            credential,
        })
    }

    /// Wrap `data` in the three layers. Returns the outermost blob bytes.
    pub fn protect(&self, data: &[u8], ctx: &ProtectionContext) -> Result<Vec<u8>> {
        let keys = self.layer_keys(ctx)?;

        let tag = combine(keys.device.expose(), data)?;
        let mut inner = Vec::with_capacity(data.len() + TAG_LEN);
        inner.extend_from_slice(data);
        inner.extend_from_slice(tag.expose());
        let inner = SecureBuffer::new(inner);

        let layer1 = encrypt_layer(keys.device.expose(), inner.expose())?.to_bytes();
        let layer2 = encrypt_layer(keys.session.expose(), &layer1)?.to_bytes();
        let layer3 = encrypt_layer(keys.credential.expose(), &layer2)?;

        debug!("Protected {} bytes in 3 layers", data.len());
        Ok(layer3.to_bytes())
    }

    /// Unwrap the three layers in reverse order.
    pub fn unprotect(&self, blob: &[u8], ctx: &ProtectionContext) -> Result<SecureBuffer> {
        let keys = self.layer_keys(ctx)?;

        let layer2 = decrypt_layer(keys.credential.expose(), blob)?;
        let layer1 = decrypt_layer(keys.session.expose(), layer2.expose())?;
        let inner = decrypt_layer(keys.device.expose(), layer1.expose())?;

        if inner.len() < TAG_LEN {
            return Err(CustodyError::Authentication);
        }
        let (data, tag) = inner.expose().split_at(inner.len() - TAG_LEN);
        let expected = combine(keys.device.expose(), data)?;
        if !bool::from(expected.expose().ct_eq(tag)) {
            return Err(CustodyError::Authentication);
        }

        Ok(SecureBuffer::new(data.to_vec()))
    }

    /// Protect a hex-encoded private key under `password`; returns base64.
    pub fn encrypt_private_key(&self, private_key_hex: &str, password: &SecretString) -> Result<String> {
        if password.expose_secret().is_empty() {
            return Err(CustodyError::validation("password must not be empty"));
        }
        let trimmed = private_key_hex.trim();
        let trimmed = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        if trimmed.is_empty() {
            return Err(CustodyError::validation("private key must not be empty"));
        }

        let key = SecureBuffer::new(hex::decode(trimmed).map_err(|_| {
            CustodyError::validation("private key must be hex encoded")
        })?);
        let ctx = self.context(
            SessionScope::Stable(PRIVATE_KEY_SESSION.to_string()),
            Some(password.clone()),
        );
        let blob = self.protect(key.expose(), &ctx)?;
        Ok(STANDARD.encode(blob))
    }

    /// Inverse of [`encrypt_private_key`](Self::encrypt_private_key).
    ///
    /// Every failure, malformed input included, surfaces as
    /// [`CustodyError::Authentication`].
    pub fn decrypt_private_key(&self, encrypted: &str, password: &SecretString) -> Result<SecretString> {
        let key = self.open_private_key(encrypted, password)?;
        Ok(SecretString::new(hex::encode(key.expose())))
    }

    /// Like [`decrypt_private_key`](Self::decrypt_private_key) but returns
    /// the raw key bytes.
    pub fn open_private_key(&self, encrypted: &str, password: &SecretString) -> Result<SecureBuffer> {
        let blob = STANDARD
            .decode(encrypted.trim())
            .map_err(|_| CustodyError::Authentication)?;
        let ctx = self.context(
            SessionScope::Stable(PRIVATE_KEY_SESSION.to_string()),
            Some(password.clone()),
        );
        self.unprotect(&blob, &ctx)
            .map_err(|_| CustodyError::Authentication)
    }
}

impl std::fmt::Debug for LayeredCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayeredCipher")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

fn encrypt_layer(key: &[u8], plaintext: &[u8]) -> Result<EncryptedBlob> {
    let mut iv = [0u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let cipher = Aes256CbcEnc::new_from_slices(key, &iv)
        .map_err(|e| CustodyError::Internal(format!("cipher init: {}", e)))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    Ok(EncryptedBlob { iv, ciphertext })
}

fn decrypt_layer(key: &[u8], bytes: &[u8]) -> Result<SecureBuffer> {
    let blob = EncryptedBlob::from_bytes(bytes)?;
    let cipher = Aes256CbcDec::new_from_slices(key, &blob.iv)
        .map_err(|_| CustodyError::Authentication)?;
    let plaintext = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&blob.ciphertext)
        .map_err(|_| CustodyError::Authentication)?;
    Ok(SecureBuffer::new(plaintext))
}

/// Stable identifier for this host, used as the device layer input.
///
/// Reads the systemd/dbus machine id and falls back to the hostname.
pub fn host_fingerprint() -> String {
    for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
        if let Ok(id) = fs::read_to_string(path) {
            let id = id.trim();
            if !id.is_empty() {
                return id.to_string();
            }
        }
    }

    fs::read_to_string("/etc/hostname")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "unknown-host".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> LayeredCipher {
        LayeredCipher::new(
            vec![0x42; 32],
            KdfParams {
                layer_iterations: 8,
                password_iterations: 16,
            },
            "test-device",
        )
    }

    fn password(s: &str) -> SecretString {
        SecretString::new(s.to_string())
    }

    fn ctx(pw: &str) -> ProtectionContext {
        ProtectionContext::new("test-device", SessionScope::Stable("session-1".into()))
            .with_password(password(pw))
    }

    #[test]
    fn test_protect_unprotect_roundtrip() {
        let cipher = cipher();
        for data in [&b""[..], b"k", &[0xABu8; 32][..], &[7u8; 1000][..]] {
            let blob = cipher.protect(data, &ctx("pw")).unwrap();
            let plain = cipher.unprotect(&blob, &ctx("pw")).unwrap();
            assert_eq!(plain.expose(), data);
        }
    }

    #[test]
    fn test_blob_is_three_layers_deep() {
        let cipher = cipher();
        let data = [1u8; 32];
        let blob = cipher.protect(&data, &ctx("pw")).unwrap();

        // data+tag = 64 -> 80 padded -> +16 IV = 96 -> 112 padded -> +16 = 128
        // -> 144 padded -> +16 = 160
        assert_eq!(blob.len(), 160);
        assert_eq!((blob.len() - IV_LEN) % BLOCK_LEN, 0);
    }

    #[test]
    fn test_fresh_iv_per_call() {
        let cipher = cipher();
        let a = cipher.protect(b"same", &ctx("pw")).unwrap();
        let b = cipher.protect(b"same", &ctx("pw")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_password_is_authentication_error() {
        let cipher = cipher();
        let blob = cipher.protect(b"secret key", &ctx("right")).unwrap();
        let err = cipher.unprotect(&blob, &ctx("wrong")).unwrap_err();
        assert!(matches!(err, CustodyError::Authentication));
    }

    #[test]
    fn test_wrong_session_or_device_fails() {
        let cipher = cipher();
        let blob = cipher.protect(b"secret key", &ctx("pw")).unwrap();

        let other_session = ProtectionContext::new("test-device", SessionScope::Stable("session-2".into()))
            .with_password(password("pw"));
        assert!(matches!(
            cipher.unprotect(&blob, &other_session),
            Err(CustodyError::Authentication)
        ));

        let other_device = ProtectionContext::new("other-device", SessionScope::Stable("session-1".into()))
            .with_password(password("pw"));
        assert!(matches!(
            cipher.unprotect(&blob, &other_device),
            Err(CustodyError::Authentication)
        ));
    }

    #[test]
    fn test_flipped_iv_byte_is_rejected() {
        let cipher = cipher();
        let mut blob = cipher.protect(b"secret key", &ctx("pw")).unwrap();
        // CBC propagates an IV flip straight into the inner layers without
        // breaking padding; the tag catches it.
        blob[0] ^= 0x01;
        assert!(matches!(
            cipher.unprotect(&blob, &ctx("pw")),
            Err(CustodyError::Authentication)
        ));
    }

    #[test]
    fn test_truncated_blob_is_rejected() {
        let cipher = cipher();
        let blob = cipher.protect(b"secret key", &ctx("pw")).unwrap();
        for len in [0, 15, 16, 31, blob.len() - 1] {
            assert!(matches!(
                cipher.unprotect(&blob[..len], &ctx("pw")),
                Err(CustodyError::Authentication)
            ));
        }
    }

    #[test]
    fn test_no_password_still_three_layers() {
        let cipher = cipher();
        let ctx = ProtectionContext::new("test-device", SessionScope::Stable("s".into()));
        let blob = cipher.protect(b"data", &ctx).unwrap();
        assert_eq!(cipher.unprotect(&blob, &ctx).unwrap().expose(), b"data");

        // A blob made without a password cannot be opened with one
        assert!(cipher.unprotect(&blob, &ctx.clone().with_password(password("x"))).is_err());
    }

    #[test]
    fn test_time_bucketed_scope_roundtrip() {
        let cipher = cipher();
        let scope = SessionScope::TimeBucketed {
            label: "cache".into(),
            bucket: Duration::from_secs(3600),
        };
        let ctx = ProtectionContext::new("test-device", scope.clone());

        // retry if the wall clock crossed into the next bucket mid-test
        for _ in 0..3 {
            let before = scope.material();
            let blob = cipher.protect(b"ephemeral", &ctx).unwrap();
            let opened = cipher.unprotect(&blob, &ctx);
            if scope.material() == before {
                assert_eq!(opened.unwrap().expose(), b"ephemeral");
                return;
            }
        }
        panic!("bucket boundary crossed on every attempt");
    }

    #[test]
    fn test_time_bucket_material() {
        let scope = SessionScope::TimeBucketed {
            label: "cache".into(),
            bucket: Duration::from_secs(3600),
        };
        assert_eq!(scope.material_at(7200), scope.material_at(7200 + 3599));
        assert_ne!(scope.material_at(7200), scope.material_at(7200 + 3600));

        let stable = SessionScope::Stable("s".into());
        assert_eq!(stable.material_at(0), stable.material_at(1_000_000));
    }

    #[test]
    fn test_private_key_string_roundtrip() {
        let cipher = cipher();
        let key_hex = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

        let encrypted = cipher.encrypt_private_key(key_hex, &password("pw")).unwrap();
        let decrypted = cipher.decrypt_private_key(&encrypted, &password("pw")).unwrap();
        assert_eq!(decrypted.expose_secret(), key_hex);

        let prefixed = cipher
            .encrypt_private_key(&format!("0x{}", key_hex), &password("pw"))
            .unwrap();
        let decrypted = cipher.decrypt_private_key(&prefixed, &password("pw")).unwrap();
        assert_eq!(decrypted.expose_secret(), key_hex);
    }

    #[test]
    fn test_private_key_failures_are_opaque() {
        let cipher = cipher();
        let encrypted = cipher.encrypt_private_key("aa", &password("pw")).unwrap();

        assert!(matches!(
            cipher.decrypt_private_key(&encrypted, &password("nope")),
            Err(CustodyError::Authentication)
        ));
        assert!(matches!(
            cipher.decrypt_private_key("%%% not base64", &password("pw")),
            Err(CustodyError::Authentication)
        ));
    }

    #[test]
    fn test_private_key_input_validation() {
        let cipher = cipher();
        assert!(matches!(
            cipher.encrypt_private_key("", &password("pw")),
            Err(CustodyError::Validation(_))
        ));
        assert!(matches!(
            cipher.encrypt_private_key("zz", &password("pw")),
            Err(CustodyError::Validation(_))
        ));
        assert!(matches!(
            cipher.encrypt_private_key("aa", &password("")),
            Err(CustodyError::Validation(_))
        ));
    }

    #[test]
    fn test_host_fingerprint_is_not_empty() {
        assert!(!host_fingerprint().is_empty());
    }
}
