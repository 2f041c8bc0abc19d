//! Packing of wrapped keys into PEM-style text
//!
//! A packed key is the byte layout `iv(16) || salt(16) || wrapped key(n)`,
//! Base64 encoded and framed as:
//!
//! ```text
//! -----BEGIN PUBLIC KEY-----
//! <base64 body>
//! -----END PUBLIC KEY-----
//! ```
//!
//! The framing belongs to this crate only; the body is not SPKI or PKCS#8.
//! Text without markers is accepted as a bare body of unknown key type.

use std::fmt;
use std::str::FromStr;

use tracing::debug;

use crate::codec::{self, Base64};
use crate::error::{EasySignError, ErrorCategory, ErrorKind, Result};

/// Length of the AES-CBC initialization vector in bytes
pub const IV_LEN: usize = 16;

/// Length of the PBKDF2 salt in bytes
pub const SALT_LEN: usize = 16;

/// Fixed header in front of the wrapped key bytes
pub const HEADER_LEN: usize = IV_LEN + SALT_LEN;

/// Payload marker for an initialization vector.
#[derive(Debug)]
pub enum Iv {}

/// Payload marker for a key-derivation salt.
#[derive(Debug)]
pub enum Salt {}

/// Payload marker for wrapped (encrypted) key bytes.
#[derive(Debug)]
pub enum WrappedKeyBytes {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    Public,
    Private,
}

impl KeyType {
    /// Upper-case tag used in BEGIN/END markers.
    pub fn as_str(self) -> &'static str {
        match self {
            KeyType::Public => "PUBLIC",
            KeyType::Private => "PRIVATE",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyType {
    type Err = EasySignError;

    fn from_str(tag: &str) -> Result<Self> {
        if tag.eq_ignore_ascii_case("PUBLIC") {
            Ok(KeyType::Public)
        } else if tag.eq_ignore_ascii_case("PRIVATE") {
            Ok(KeyType::Private)
        } else {
            Err(EasySignError::with_kind(
                ErrorCategory::User,
                ErrorKind::UnsupportedKeyType,
                format!("unsupported key type {}", tag.to_ascii_uppercase()),
            ))
        }
    }
}

/// Structured view of a packed key: three independently encoded fields.
///
/// `key_type` is `None` when the key came from bare Base64 text without
/// BEGIN/END markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    pub key_type: Option<KeyType>,
    pub iv: Base64<Iv>,
    pub salt: Base64<Salt>,
    pub key: Base64<WrappedKeyBytes>,
}

impl WrappedKey {
    pub fn new(
        key_type: Option<KeyType>,
        iv: &[u8; IV_LEN],
        salt: &[u8; SALT_LEN],
        wrapped: &[u8],
    ) -> Self {
        Self {
            key_type,
            iv: Base64::encode(iv),
            salt: Base64::encode(salt),
            key: Base64::encode(wrapped),
        }
    }

    /// Split a packed buffer at its fixed offsets.
    pub fn from_packed_bytes(key_type: Option<KeyType>, packed: &[u8]) -> Result<Self> {
        if packed.len() < HEADER_LEN {
            return Err(EasySignError::with_kind(
                ErrorCategory::User,
                ErrorKind::TruncatedBuffer,
                format!(
                    "packed key is {} bytes; at least {} are needed for iv and salt",
                    packed.len(),
                    HEADER_LEN
                ),
            ));
        }
        let (iv, rest) = packed.split_at(IV_LEN);
        let (salt, wrapped) = rest.split_at(SALT_LEN);
        Ok(Self {
            key_type,
            iv: Base64::encode(iv),
            salt: Base64::encode(salt),
            key: Base64::encode(wrapped),
        })
    }

    /// Concatenate `iv || salt || key` after checking the field sizes.
    pub fn to_packed_bytes(&self) -> Result<Vec<u8>> {
        let iv = self.iv_bytes()?;
        let salt = self.salt_bytes()?;
        let wrapped = self.key_bytes()?;

        let mut packed = Vec::with_capacity(HEADER_LEN + wrapped.len());
        packed.extend_from_slice(&iv);
        packed.extend_from_slice(&salt);
        packed.extend_from_slice(&wrapped);
        Ok(packed)
    }

    pub fn iv_bytes(&self) -> Result<[u8; IV_LEN]> {
        decode_fixed(&self.iv, "iv")
    }

    pub fn salt_bytes(&self) -> Result<[u8; SALT_LEN]> {
        decode_fixed(&self.salt, "salt")
    }

    pub fn key_bytes(&self) -> Result<Vec<u8>> {
        self.key.decode()
    }
}

fn decode_fixed<const N: usize, K>(field: &Base64<K>, name: &str) -> Result<[u8; N]> {
    let bytes = field.decode()?;
    <[u8; N]>::try_from(bytes.as_slice()).map_err(|_| {
        EasySignError::with_kind(
            ErrorCategory::User,
            ErrorKind::BinaryFormat,
            format!("{} must decode to {} bytes, got {}", name, N, bytes.len()),
        )
    })
}

/// Anything that can be turned into packed key text.
///
/// A [`WrappedKey`] is framed with markers for its type (a key without a
/// type packs to the bare Base64 body). Text is taken as already packed
/// and only trimmed.
pub trait PackSource {
    fn into_packed(self, fold: bool) -> Result<String>;
}

impl PackSource for &WrappedKey {
    fn into_packed(self, fold: bool) -> Result<String> {
        let packed = self.to_packed_bytes()?;
        let body = codec::encode(&packed, fold);
        debug!(
            key_type = ?self.key_type,
            packed_len = packed.len(),
            fold,
            "packed key"
        );
        Ok(match self.key_type {
            Some(key_type) => frame(key_type, &body),
            None => body,
        })
    }
}

impl PackSource for WrappedKey {
    fn into_packed(self, fold: bool) -> Result<String> {
        (&self).into_packed(fold)
    }
}

impl PackSource for &str {
    fn into_packed(self, _fold: bool) -> Result<String> {
        Ok(self.trim().to_string())
    }
}

impl PackSource for &String {
    fn into_packed(self, fold: bool) -> Result<String> {
        self.as_str().into_packed(fold)
    }
}

impl PackSource for String {
    fn into_packed(self, fold: bool) -> Result<String> {
        self.as_str().into_packed(fold)
    }
}

/// Anything that can be turned into a [`WrappedKey`].
///
/// A [`WrappedKey`] passes through unchanged; text is parsed as PEM or as
/// a bare Base64 body.
pub trait KeySource {
    fn into_wrapped_key(self) -> Result<WrappedKey>;
}

impl KeySource for WrappedKey {
    fn into_wrapped_key(self) -> Result<WrappedKey> {
        Ok(self)
    }
}

impl KeySource for &WrappedKey {
    fn into_wrapped_key(self) -> Result<WrappedKey> {
        Ok(self.clone())
    }
}

impl KeySource for &str {
    fn into_wrapped_key(self) -> Result<WrappedKey> {
        unpack_text(self)
    }
}

impl KeySource for &String {
    fn into_wrapped_key(self) -> Result<WrappedKey> {
        unpack_text(self)
    }
}

impl KeySource for String {
    fn into_wrapped_key(self) -> Result<WrappedKey> {
        unpack_text(&self)
    }
}

/// Pack a key as PEM text with a single-line body.
pub fn pack_key(source: impl PackSource) -> Result<String> {
    source.into_packed(false)
}

/// Pack a key as PEM text with the body folded at 76 characters.
pub fn pack_key_folded(source: impl PackSource) -> Result<String> {
    source.into_packed(true)
}

/// Unpack PEM or bare Base64 text into its structured form.
pub fn unpack_key(source: impl KeySource) -> Result<WrappedKey> {
    source.into_wrapped_key()
}

fn frame(key_type: KeyType, body: &str) -> String {
    format!(
        "-----BEGIN {t} KEY-----\n{body}\n-----END {t} KEY-----\n",
        t = key_type,
        body = body
    )
}

fn unpack_text(packed: &str) -> Result<WrappedKey> {
    let packed = packed.trim();

    let (key_type, body) = match (leading_marker(packed), trailing_marker(packed)) {
        (None, None) => (None, packed),
        (Some((begin, body_start)), Some((end, body_end))) => {
            if !begin.eq_ignore_ascii_case(end) {
                return Err(mismatched_types(Some(begin), Some(end)));
            }
            let body = packed.get(body_start..body_end).ok_or_else(|| {
                EasySignError::with_kind(
                    ErrorCategory::User,
                    ErrorKind::MalformedFraming,
                    "BEGIN and END key markers overlap",
                )
            })?;
            (Some(begin.parse::<KeyType>()?), body.trim())
        }
        (begin, end) => {
            return Err(mismatched_types(
                begin.map(|(tag, _)| tag),
                end.map(|(tag, _)| tag),
            ));
        }
    };

    let buf = codec::decode(body)?;
    debug!(key_type = ?key_type, packed_len = buf.len(), "unpacked key");
    WrappedKey::from_packed_bytes(key_type, &buf)
}

fn mismatched_types(begin: Option<&str>, end: Option<&str>) -> EasySignError {
    let tag = |t: Option<&str>| t.map_or_else(|| "(none)".to_string(), str::to_ascii_uppercase);
    EasySignError::with_kind(
        ErrorCategory::User,
        ErrorKind::MismatchedKeyTypes,
        format!("mismatched key types: {} vs {}", tag(begin), tag(end)),
    )
}

fn is_tag_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &text[prefix.len()..])
}

fn strip_suffix_ignore_case<'a>(text: &'a str, suffix: &str) -> Option<&'a str> {
    let split = text.len().checked_sub(suffix.len())?;
    let tail = text.get(split..)?;
    tail.eq_ignore_ascii_case(suffix).then(|| &text[..split])
}

/// `-----BEGIN <TAG> KEY-----` at the start: returns the tag and the
/// offset just past the marker.
fn leading_marker(text: &str) -> Option<(&str, usize)> {
    let rest = strip_prefix_ignore_case(text, "-----BEGIN ")?;
    let tag_len = rest.find(|c: char| !is_tag_char(c)).unwrap_or(rest.len());
    if tag_len == 0 {
        return None;
    }
    let after = strip_prefix_ignore_case(&rest[tag_len..], " KEY-----")?;
    Some((&rest[..tag_len], text.len() - after.len()))
}

/// `-----END <TAG> KEY-----` at the end: returns the tag and the offset
/// where the marker starts.
fn trailing_marker(text: &str) -> Option<(&str, usize)> {
    let head = strip_suffix_ignore_case(text, " KEY-----")?;
    let tag_start = head
        .char_indices()
        .rev()
        .find(|&(_, c)| !is_tag_char(c))
        .map_or(0, |(i, c)| i + c.len_utf8());
    if tag_start == head.len() {
        return None;
    }
    let before = strip_suffix_ignore_case(&head[..tag_start], "-----END ")?;
    Some((&head[tag_start..], before.len()))
}
