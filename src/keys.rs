//! Signing key generation and password-based unwrapping
//!
//! The cryptographic primitives (randomness, PBKDF2, AES-CBC key wrap,
//! ECDSA key generation) sit behind [`KeyCrypto`]. This module only
//! orchestrates them: it draws an iv and salt per key half, wraps each half
//! under its own password, and on the way back checks the requested usage
//! before handing the unwrap to the collaborator.
//!
//! Errors from the collaborator are returned exactly as produced.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use tracing::{debug, trace};
use zeroize::Zeroizing;

use crate::error::{EasySignError, ErrorCategory, ErrorKind, Result};
use crate::pem::{IV_LEN, KeySource, KeyType, SALT_LEN, WrappedKey};

/// Length of the AES-256 wrapping key derived from a password
pub const WRAPPING_KEY_LEN: usize = 32;

/// Symmetric key derived from a password; wiped on drop.
pub type WrappingKey = Zeroizing<[u8; WRAPPING_KEY_LEN]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyUsage {
    Sign,
    Verify,
}

impl KeyUsage {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyUsage::Sign => "sign",
            KeyUsage::Verify => "verify",
        }
    }

    /// The only key type this usage is valid for.
    pub fn key_type(self) -> KeyType {
        match self {
            KeyUsage::Sign => KeyType::Private,
            KeyUsage::Verify => KeyType::Public,
        }
    }
}

impl fmt::Display for KeyUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyUsage {
    type Err = EasySignError;

    fn from_str(usage: &str) -> Result<Self> {
        match usage {
            "sign" => Ok(KeyUsage::Sign),
            "verify" => Ok(KeyUsage::Verify),
            other => Err(EasySignError::with_kind(
                ErrorCategory::Internal,
                ErrorKind::InvalidUsage,
                format!(
                    "usage argument must be either 'sign' or 'verify', but got '{}'",
                    other
                ),
            )),
        }
    }
}

/// Raw key pair material as produced by the collaborator.
///
/// `public` is not secret; `private` is wiped on drop.
pub struct KeyPairMaterial {
    pub public: Vec<u8>,
    pub private: Zeroizing<Vec<u8>>,
}

/// The cryptographic primitives key management is built on.
#[async_trait]
pub trait KeyCrypto: Send + Sync {
    /// Opaque unwrapped key produced by [`KeyCrypto::unwrap_key`].
    type Handle: Send;

    /// Fill `buf` from a cryptographically secure source.
    fn fill_random(&self, buf: &mut [u8]) -> Result<()>;

    /// Derive a wrapping key from a password and salt.
    async fn derive_key(&self, password: &[u8], salt: &[u8; SALT_LEN]) -> Result<WrappingKey>;

    async fn generate_key_pair(&self) -> Result<KeyPairMaterial>;

    /// Encrypt key material under `wrapping_key`.
    async fn wrap_key(
        &self,
        material: &[u8],
        wrapping_key: &WrappingKey,
        iv: &[u8; IV_LEN],
    ) -> Result<Vec<u8>>;

    /// Decrypt wrapped key material and import it for `usage`.
    async fn unwrap_key(
        &self,
        wrapped: &[u8],
        unwrapping_key: &WrappingKey,
        iv: &[u8; IV_LEN],
        usage: KeyUsage,
    ) -> Result<Self::Handle>;
}

/// Receives raw key material during generation, for debugging only.
///
/// Nothing is recorded unless a sink is passed explicitly to
/// [`generate_signing_keys`].
pub trait DebugSink {
    fn record(&mut self, key_type: KeyType, material: &[u8]);
}

/// A freshly generated key pair, each half wrapped under its own password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningKeyPair {
    pub public: WrappedKey,
    pub private: WrappedKey,
}

struct WrapParams {
    iv: [u8; IV_LEN],
    salt: [u8; SALT_LEN],
}

impl WrapParams {
    fn draw<C: KeyCrypto>(crypto: &C) -> Result<Self> {
        let mut iv = [0u8; IV_LEN];
        crypto.fill_random(&mut iv)?;
        let mut salt = [0u8; SALT_LEN];
        crypto.fill_random(&mut salt)?;
        Ok(Self { iv, salt })
    }
}

/// Generate an ECDSA signing key pair and wrap both halves.
///
/// The private half is wrapped under `private_password`, the public half
/// under `public_password`, each with its own random iv and salt.
pub async fn generate_signing_keys<C: KeyCrypto>(
    crypto: &C,
    private_password: &[u8],
    public_password: &[u8],
    debug_sink: Option<&mut (dyn DebugSink + Send)>,
) -> Result<SigningKeyPair> {
    let private_params = WrapParams::draw(crypto)?;
    let public_params = WrapParams::draw(crypto)?;

    let material = crypto.generate_key_pair().await?;
    if let Some(sink) = debug_sink {
        sink.record(KeyType::Public, &material.public);
        sink.record(KeyType::Private, &material.private);
    }

    let public = wrap_half(
        crypto,
        KeyType::Public,
        &material.public,
        public_password,
        &public_params,
    )
    .await?;
    let private = wrap_half(
        crypto,
        KeyType::Private,
        &material.private,
        private_password,
        &private_params,
    )
    .await?;

    debug!("generated signing key pair");
    Ok(SigningKeyPair { public, private })
}

async fn wrap_half<C: KeyCrypto>(
    crypto: &C,
    key_type: KeyType,
    material: &[u8],
    password: &[u8],
    params: &WrapParams,
) -> Result<WrappedKey> {
    let wrapping_key = crypto.derive_key(password, &params.salt).await?;
    let wrapped = crypto.wrap_key(material, &wrapping_key, &params.iv).await?;
    trace!(%key_type, wrapped_len = wrapped.len(), "wrapped key");
    Ok(WrappedKey::new(
        Some(key_type),
        &params.iv,
        &params.salt,
        &wrapped,
    ))
}

/// First stage of unwrapping: a key and usage that passed validation,
/// waiting for a password.
#[derive(Debug, Clone)]
pub struct UnwrapRequest {
    key: WrappedKey,
    usage: KeyUsage,
}

impl UnwrapRequest {
    /// Pair a key with a usage, rejecting combinations that contradict the
    /// key's type. Keys of unknown type accept either usage.
    pub fn new(key: WrappedKey, usage: KeyUsage) -> Result<Self> {
        if let Some(key_type) = key.key_type {
            if key_type != usage.key_type() {
                return Err(EasySignError::with_kind(
                    ErrorCategory::User,
                    ErrorKind::InvalidUsage,
                    format!(
                        "usage '{}' requires a {} key, but got a {} key",
                        usage,
                        usage.key_type(),
                        key_type
                    ),
                ));
            }
        }
        Ok(Self { key, usage })
    }

    pub fn key(&self) -> &WrappedKey {
        &self.key
    }

    pub fn usage(&self) -> KeyUsage {
        self.usage
    }

    /// Derive the unwrapping key from `password` and unwrap.
    pub async fn unwrap<C: KeyCrypto>(&self, crypto: &C, password: &[u8]) -> Result<C::Handle> {
        let iv = self.key.iv_bytes()?;
        let salt = self.key.salt_bytes()?;
        let wrapped = self.key.key_bytes()?;

        let unwrapping_key = crypto.derive_key(password, &salt).await?;
        let handle = crypto
            .unwrap_key(&wrapped, &unwrapping_key, &iv, self.usage)
            .await?;
        debug!(usage = %self.usage, key_type = ?self.key.key_type, "unwrapped key");
        Ok(handle)
    }
}

/// Prepare to unwrap a signing key. The password is supplied later via
/// [`UnwrapRequest::unwrap`].
///
/// `usage` must be exactly `"sign"` (private keys) or `"verify"` (public
/// keys).
pub fn unwrap_signing_key(source: impl KeySource, usage: &str) -> Result<UnwrapRequest> {
    let key = source.into_wrapped_key()?;
    let usage = usage.parse::<KeyUsage>()?;
    UnwrapRequest::new(key, usage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pem::{pack_key, unpack_key};
    use std::sync::Mutex;

    /// Deterministic stand-in for the real primitives.
    ///
    /// "Wrapping" XORs the material with the key and iv, so unwrapping with
    /// the wrong password produces different bytes.
    #[derive(Default)]
    struct FakeCrypto {
        counter: Mutex<u8>,
        fail_derivation: bool,
    }

    fn keystream(key: &WrappingKey, iv: &[u8; IV_LEN], len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| key[i % WRAPPING_KEY_LEN] ^ iv[i % IV_LEN])
            .collect()
    }

    #[async_trait]
    impl KeyCrypto for FakeCrypto {
        type Handle = (KeyUsage, Vec<u8>);

        fn fill_random(&self, buf: &mut [u8]) -> Result<()> {
            let mut counter = self.counter.lock().unwrap();
            *counter += 1;
            buf.fill(*counter);
            Ok(())
        }

        async fn derive_key(
            &self,
            password: &[u8],
            salt: &[u8; SALT_LEN],
        ) -> Result<WrappingKey> {
            if self.fail_derivation {
                return Err(EasySignError::with_kind(
                    ErrorCategory::Internal,
                    ErrorKind::KeyDerivation,
                    "simulated derivation failure",
                ));
            }
            let mut key = Zeroizing::new([0u8; WRAPPING_KEY_LEN]);
            for (i, byte) in key.iter_mut().enumerate() {
                let p = password.get(i % password.len().max(1)).copied().unwrap_or(0);
                *byte = p ^ salt[i % SALT_LEN];
            }
            Ok(key)
        }

        async fn generate_key_pair(&self) -> Result<KeyPairMaterial> {
            Ok(KeyPairMaterial {
                public: b"public material".to_vec(),
                private: Zeroizing::new(b"private material".to_vec()),
            })
        }

        async fn wrap_key(
            &self,
            material: &[u8],
            wrapping_key: &WrappingKey,
            iv: &[u8; IV_LEN],
        ) -> Result<Vec<u8>> {
            let stream = keystream(wrapping_key, iv, material.len());
            Ok(material.iter().zip(stream).map(|(m, k)| m ^ k).collect())
        }

        async fn unwrap_key(
            &self,
            wrapped: &[u8],
            unwrapping_key: &WrappingKey,
            iv: &[u8; IV_LEN],
            usage: KeyUsage,
        ) -> Result<Self::Handle> {
            let stream = keystream(unwrapping_key, iv, wrapped.len());
            Ok((usage, wrapped.iter().zip(stream).map(|(w, k)| w ^ k).collect()))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        records: Vec<(KeyType, Vec<u8>)>,
    }

    impl DebugSink for RecordingSink {
        fn record(&mut self, key_type: KeyType, material: &[u8]) {
            self.records.push((key_type, material.to_vec()));
        }
    }

    #[tokio::test]
    async fn test_generate_assigns_types_and_fresh_params() {
        let crypto = FakeCrypto::default();
        let pair = generate_signing_keys(&crypto, b"private pw", b"public pw", None)
            .await
            .unwrap();

        assert_eq!(pair.private.key_type, Some(KeyType::Private));
        assert_eq!(pair.public.key_type, Some(KeyType::Public));
        // Private iv/salt are drawn first, then public.
        assert_eq!(pair.private.iv_bytes().unwrap(), [1u8; IV_LEN]);
        assert_eq!(pair.private.salt_bytes().unwrap(), [2u8; SALT_LEN]);
        assert_eq!(pair.public.iv_bytes().unwrap(), [3u8; IV_LEN]);
        assert_eq!(pair.public.salt_bytes().unwrap(), [4u8; SALT_LEN]);
    }

    #[tokio::test]
    async fn test_pack_unpack_generated_pair() {
        let crypto = FakeCrypto::default();
        let pair = generate_signing_keys(&crypto, b"a", b"b", None).await.unwrap();

        for key in [&pair.public, &pair.private] {
            let pem = pack_key(key).unwrap();
            assert_eq!(&unpack_key(&pem).unwrap(), key);
        }
    }

    #[tokio::test]
    async fn test_unwrap_with_right_and_wrong_password() {
        let crypto = FakeCrypto::default();
        let pair = generate_signing_keys(&crypto, b"private pw", b"public pw", None)
            .await
            .unwrap();

        let request = unwrap_signing_key(&pair.private, "sign").unwrap();
        let (usage, material) = request.unwrap(&crypto, b"private pw").await.unwrap();
        assert_eq!(usage, KeyUsage::Sign);
        assert_eq!(material, b"private material");

        let (_, material) = request.unwrap(&crypto, b"wrong pw").await.unwrap();
        assert_ne!(material, b"private material");

        let pem = pack_key(&pair.public).unwrap();
        let request = unwrap_signing_key(pem.as_str(), "verify").unwrap();
        let (usage, material) = request.unwrap(&crypto, b"public pw").await.unwrap();
        assert_eq!(usage, KeyUsage::Verify);
        assert_eq!(material, b"public material");
    }

    #[tokio::test]
    async fn test_invalid_usage_is_rejected() {
        let crypto = FakeCrypto::default();
        let pair = generate_signing_keys(&crypto, b"a", b"b", None).await.unwrap();

        let err = unwrap_signing_key(&pair.private, "encrypt").unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::InvalidUsage));
        assert!(err.to_string().contains("encrypt"));

        let err = unwrap_signing_key(&pair.private, "Sign").unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::InvalidUsage));
    }

    #[tokio::test]
    async fn test_usage_must_match_key_type() {
        let crypto = FakeCrypto::default();
        let pair = generate_signing_keys(&crypto, b"a", b"b", None).await.unwrap();

        let err = unwrap_signing_key(&pair.public, "sign").unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::InvalidUsage));
        let err = unwrap_signing_key(&pair.private, "verify").unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::InvalidUsage));

        // Without markers the type is unknown, so either usage is accepted.
        let mut untyped = pair.public.clone();
        untyped.key_type = None;
        assert!(unwrap_signing_key(&untyped, "sign").is_ok());
        assert!(unwrap_signing_key(&untyped, "verify").is_ok());
    }

    #[tokio::test]
    async fn test_collaborator_errors_pass_through() {
        let crypto = FakeCrypto {
            fail_derivation: true,
            ..FakeCrypto::default()
        };
        let err = generate_signing_keys(&crypto, b"a", b"b", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::KeyDerivation));
        assert_eq!(err.message(), "simulated derivation failure");
        assert!(err.source_error().is_none());
    }

    #[tokio::test]
    async fn test_debug_sink_only_when_supplied() {
        let crypto = FakeCrypto::default();
        let mut sink = RecordingSink::default();
        generate_signing_keys(&crypto, b"a", b"b", Some(&mut sink))
            .await
            .unwrap();

        assert_eq!(
            sink.records,
            vec![
                (KeyType::Public, b"public material".to_vec()),
                (KeyType::Private, b"private material".to_vec()),
            ]
        );
    }

    #[test]
    fn test_usage_parse() {
        assert_eq!("sign".parse::<KeyUsage>().unwrap(), KeyUsage::Sign);
        assert_eq!("verify".parse::<KeyUsage>().unwrap(), KeyUsage::Verify);
        assert_eq!(KeyUsage::Sign.key_type(), KeyType::Private);
        assert_eq!(KeyUsage::Verify.key_type(), KeyType::Public);
    }
}
