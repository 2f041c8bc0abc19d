//! Software implementation of the key primitives
//!
//! - PBKDF2-HMAC (SHA-384 or SHA-512) derives a 256-bit wrapping key from a
//!   password and 16-byte salt
//! - AES-256-CBC with PKCS#7 padding wraps the key material
//! - ECDSA over P-384 for the signing key pair
//!
//! Key material layout:
//! - private: the 48-byte secret scalar
//! - public: the 97-byte uncompressed SEC1 point

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use async_trait::async_trait;
use hmac::Hmac;
use p384::SecretKey;
use p384::ecdsa::signature::{Signer, Verifier};
use p384::ecdsa::{Signature, SigningKey, VerifyingKey};
use p384::elliptic_curve::sec1::ToEncodedPoint;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Sha384, Sha512};
use tracing::trace;
use zeroize::Zeroizing;

use crate::error::{EasySignError, ErrorCategory, ErrorKind, Result};
use crate::keys::{KeyCrypto, KeyPairMaterial, KeyUsage, WRAPPING_KEY_LEN, WrappingKey};
use crate::pem::{IV_LEN, SALT_LEN};

/// Default PBKDF2 iteration count
pub const DEFAULT_ITERATIONS: u32 = 500_000;

/// Length of a fixed-size P-384 ECDSA signature (r || s)
pub const SIGNATURE_LEN: usize = 96;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Hash used as the PBKDF2 PRF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KdfHash {
    Sha384,
    #[default]
    Sha512,
}

/// Password-based key derivation parameters.
///
/// The same parameters must be used to unwrap a key as were used to wrap
/// it; they are not recorded in the packed format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub iterations: u32,
    pub hash: KdfHash,
}

impl KdfParams {
    pub fn new(iterations: u32, hash: KdfHash) -> Result<Self> {
        if iterations == 0 {
            return Err(EasySignError::with_kind(
                ErrorCategory::User,
                ErrorKind::KeyDerivation,
                "PBKDF2 iteration count must be at least 1",
            ));
        }
        Ok(Self { iterations, hash })
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
            hash: KdfHash::default(),
        }
    }
}

/// [`KeyCrypto`] backed by the RustCrypto crates and the OS random source.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftwareCrypto {
    params: KdfParams,
}

impl SoftwareCrypto {
    pub fn new(params: KdfParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> KdfParams {
        self.params
    }
}

/// An unwrapped P-384 key, restricted to the usage it was unwrapped for.
#[derive(Debug, Clone)]
pub enum SigningKeyHandle {
    Signing(SigningKey),
    Verifying(VerifyingKey),
}

impl SigningKeyHandle {
    pub fn usage(&self) -> KeyUsage {
        match self {
            SigningKeyHandle::Signing(_) => KeyUsage::Sign,
            SigningKeyHandle::Verifying(_) => KeyUsage::Verify,
        }
    }

    /// Sign `message`, returning the fixed-size `r || s` signature.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        match self {
            SigningKeyHandle::Signing(key) => {
                let signature: Signature = key.sign(message);
                Ok(signature.to_bytes().to_vec())
            }
            SigningKeyHandle::Verifying(_) => Err(wrong_usage(KeyUsage::Sign)),
        }
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        let SigningKeyHandle::Verifying(key) = self else {
            return Err(wrong_usage(KeyUsage::Verify));
        };
        if signature.len() != SIGNATURE_LEN {
            return Err(EasySignError::with_kind(
                ErrorCategory::User,
                ErrorKind::BinaryFormat,
                format!(
                    "signature must be {} bytes, got {}",
                    SIGNATURE_LEN,
                    signature.len()
                ),
            ));
        }
        let signature = Signature::from_slice(signature).map_err(|_| bad_signature())?;
        key.verify(message, &signature).map_err(|_| bad_signature())
    }
}

fn wrong_usage(usage: KeyUsage) -> EasySignError {
    EasySignError::with_kind(
        ErrorCategory::User,
        ErrorKind::InvalidUsage,
        format!("key was not unwrapped for '{}'", usage),
    )
}

fn bad_signature() -> EasySignError {
    EasySignError::with_kind(
        ErrorCategory::User,
        ErrorKind::SignatureInvalid,
        "signature does not match the message",
    )
}

fn auth_failed() -> EasySignError {
    EasySignError::with_kind(
        ErrorCategory::User,
        ErrorKind::AuthenticationFailed,
        "corrupt key, tampered-with data, or bad passphrase",
    )
}

/// Derive a wrapping key with PBKDF2.
fn pbkdf2_derive(password: &[u8], salt: &[u8], params: &KdfParams) -> Result<WrappingKey> {
    let mut key = Zeroizing::new([0u8; WRAPPING_KEY_LEN]);
    let derived = match params.hash {
        KdfHash::Sha384 => {
            pbkdf2::pbkdf2::<Hmac<Sha384>>(password, salt, params.iterations, &mut key[..])
        }
        KdfHash::Sha512 => {
            pbkdf2::pbkdf2::<Hmac<Sha512>>(password, salt, params.iterations, &mut key[..])
        }
    };
    derived.map_err(|_| {
        EasySignError::with_kind(
            ErrorCategory::Internal,
            ErrorKind::KeyDerivation,
            "PBKDF2 key derivation failed",
        )
    })?;
    Ok(key)
}

#[async_trait]
impl KeyCrypto for SoftwareCrypto {
    type Handle = SigningKeyHandle;

    fn fill_random(&self, buf: &mut [u8]) -> Result<()> {
        OsRng.try_fill_bytes(buf).map_err(|e| {
            EasySignError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::RandomSource,
                format!("failed to read from the OS random source: {}", e),
                e,
            )
        })
    }

    async fn derive_key(&self, password: &[u8], salt: &[u8; SALT_LEN]) -> Result<WrappingKey> {
        let password = Zeroizing::new(password.to_vec());
        let salt = *salt;
        let params = self.params;
        trace!(iterations = params.iterations, hash = ?params.hash, "deriving wrapping key");

        // PBKDF2 is slow; under Tokio it runs on the blocking pool. Other
        // executors get an inline derivation.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return pbkdf2_derive(&password, &salt, &params);
        };
        runtime
            .spawn_blocking(move || pbkdf2_derive(&password, &salt, &params))
            .await
            .map_err(|e| {
                EasySignError::with_kind_and_source(
                    ErrorCategory::Internal,
                    ErrorKind::InternalInvariant,
                    "key derivation task did not complete",
                    e,
                )
            })?
    }

    async fn generate_key_pair(&self) -> Result<KeyPairMaterial> {
        let secret = SecretKey::random(&mut OsRng);
        let public = secret.public_key().to_encoded_point(false);
        Ok(KeyPairMaterial {
            public: public.as_bytes().to_vec(),
            private: Zeroizing::new(secret.to_bytes().to_vec()),
        })
    }

    async fn wrap_key(
        &self,
        material: &[u8],
        wrapping_key: &WrappingKey,
        iv: &[u8; IV_LEN],
    ) -> Result<Vec<u8>> {
        let key: &[u8; WRAPPING_KEY_LEN] = wrapping_key;
        Ok(Aes256CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(material))
    }

    async fn unwrap_key(
        &self,
        wrapped: &[u8],
        unwrapping_key: &WrappingKey,
        iv: &[u8; IV_LEN],
        usage: KeyUsage,
    ) -> Result<SigningKeyHandle> {
        let key: &[u8; WRAPPING_KEY_LEN] = unwrapping_key;
        let material = Zeroizing::new(
            Aes256CbcDec::new(key.into(), iv.into())
                .decrypt_padded_vec_mut::<Pkcs7>(wrapped)
                .map_err(|_| auth_failed())?,
        );

        // A wrong password usually breaks the padding, but not always; the
        // key import below catches the rest.
        match usage {
            KeyUsage::Sign => SigningKey::from_slice(&material)
                .map(SigningKeyHandle::Signing)
                .map_err(|_| auth_failed()),
            KeyUsage::Verify => VerifyingKey::from_sec1_bytes(&material)
                .map(SigningKeyHandle::Verifying)
                .map_err(|_| auth_failed()),
        }
    }
}
