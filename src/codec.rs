//! Base64 encoding with optional line folding
//!
//! Standard alphabet (`A-Z`, `a-z`, `0-9`, `+`, `/`) with `=` padding.
//! Encoding can fold output with CRLF every 76 characters for display.
//! Decoding accepts space, tab, CR and LF anywhere in the input and ignores
//! them, so folded or indented text decodes to the same bytes.
//!
//! Decoding validates the whole input before producing any output. The
//! only accepted shape is: alphabet characters and whitespace, then at
//! most two contiguous `=`, then trailing whitespace.

use std::fmt;
use std::marker::PhantomData;

use crate::error::{EasySignError, ErrorCategory, ErrorKind, Result};

const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// Folded output carries a CRLF after this many encoded characters.
pub const LINE_WIDTH: usize = 76;

const PAD: u8 = b'=';

/// Maximum number of trailing pad characters.
const MAX_PAD: usize = 2;

/// Encode bytes as Base64, optionally folding lines with CRLF.
///
/// Unfolded output is exactly `4 * ceil(len / 3)` characters. Empty input
/// encodes to the empty string.
pub fn encode(bytes: &[u8], fold: bool) -> String {
    let encoded_len = bytes.len().div_ceil(3) * 4;
    let breaks = if fold {
        encoded_len.saturating_sub(1) / LINE_WIDTH
    } else {
        0
    };
    let mut out = String::with_capacity(encoded_len + 2 * breaks);
    // Count of encoded characters written, not including line breaks.
    let mut written = 0;

    for chunk in bytes.chunks(3) {
        if fold && written > 0 && written % LINE_WIDTH == 0 {
            out.push_str("\r\n");
        }

        let b0 = u32::from(chunk[0]);
        let b1 = chunk.get(1).copied().map_or(0, u32::from);
        let b2 = chunk.get(2).copied().map_or(0, u32::from);
        let group = (b0 << 16) | (b1 << 8) | b2;

        out.push(sextet_char(group >> 18));
        out.push(sextet_char(group >> 12));
        out.push(if chunk.len() > 1 {
            sextet_char(group >> 6)
        } else {
            PAD as char
        });
        out.push(if chunk.len() > 2 {
            sextet_char(group)
        } else {
            PAD as char
        });
        written += 4;
    }

    out
}

/// Decode Base64 text, ignoring whitespace anywhere in the input.
///
/// A trailing group of two or three characters yields one or two bytes. A
/// dangling single character carries fewer than eight bits and yields
/// nothing.
///
/// Padding must follow at least one alphabet character. This is stricter
/// than a bare `\s*[A-Za-z0-9+/\s]+={0,2}\s*` pattern, which would also
/// accept `" =="` as an empty buffer: here `" =="` is illegal while
/// `"A\n="` decodes to an empty buffer.
pub fn decode(text: &str) -> Result<Vec<u8>> {
    validate(text)?;

    let mut out = Vec::with_capacity(text.len() / 4 * 3 + 2);
    let mut group: u32 = 0;
    let mut filled = 0;

    for value in text.bytes().filter_map(sextet_value) {
        group = (group << 6) | u32::from(value);
        filled += 1;
        if filled == 4 {
            out.push((group >> 16) as u8);
            out.push((group >> 8) as u8);
            out.push(group as u8);
            group = 0;
            filled = 0;
        }
    }

    match filled {
        2 => out.push((group >> 4) as u8),
        3 => {
            out.push((group >> 10) as u8);
            out.push((group >> 2) as u8);
        }
        _ => {}
    }

    Ok(out)
}

/// Structural check: would [`decode`] accept this text?
///
/// This is a shape check on the characters only. It says nothing about
/// what the decoded bytes represent.
pub fn is_base64(text: &str) -> bool {
    validate(text).is_ok()
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Body,
    Padding(usize),
    Trailer,
}

fn validate(text: &str) -> Result<()> {
    let mut section = Section::Body;
    let mut seen_symbol = false;

    for (offset, ch) in text.char_indices() {
        let is_space = matches!(ch, ' ' | '\t' | '\r' | '\n');
        section = match (section, ch) {
            (_, _) if is_space => match section {
                Section::Body => Section::Body,
                Section::Padding(_) | Section::Trailer => Section::Trailer,
            },
            (Section::Body, '=') if seen_symbol => Section::Padding(1),
            (Section::Padding(n), '=') if n < MAX_PAD => Section::Padding(n + 1),
            (_, '=') => return Err(illegal_padding(offset)),
            (Section::Body, c) if c.is_ascii() && sextet_value(c as u8).is_some() => {
                seen_symbol = true;
                Section::Body
            }
            (_, c) => return Err(illegal_character(c, offset)),
        };
    }

    Ok(())
}

fn illegal_character(ch: char, offset: usize) -> EasySignError {
    EasySignError::with_kind(
        ErrorCategory::User,
        ErrorKind::IllegalCharacter,
        format!("illegal character {:?} at offset {} in base64 string", ch, offset),
    )
}

fn illegal_padding(offset: usize) -> EasySignError {
    EasySignError::with_kind(
        ErrorCategory::User,
        ErrorKind::IllegalCharacter,
        format!("illegal padding at offset {} in base64 string", offset),
    )
}

fn sextet_char(value: u32) -> char {
    ALPHABET[(value & 0x3f) as usize] as char
}

fn sextet_value(byte: u8) -> Option<u8> {
    match byte {
        b'A'..=b'Z' => Some(byte - b'A'),
        b'a'..=b'z' => Some(byte - b'a' + 26),
        b'0'..=b'9' => Some(byte - b'0' + 52),
        b'+' => Some(62),
        b'/' => Some(63),
        _ => None,
    }
}

/// Base64 text tagged with the kind of payload it encodes.
///
/// `K` is a compile-time marker only; nothing about it is stored in the
/// string or checked at runtime. Two values with different `K` are
/// different types even though both are plain Base64 at runtime.
pub struct Base64<K> {
    text: String,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Base64<K> {
    /// Encode bytes (unfolded) into tagged text.
    pub fn encode(bytes: &[u8]) -> Self {
        Self::from_encoded(encode(bytes, false))
    }

    /// Tag existing text after checking it is structurally Base64.
    pub fn parse(text: impl Into<String>) -> Result<Self> {
        let text = text.into();
        validate(&text)?;
        Ok(Self::from_encoded(text))
    }

    fn from_encoded(text: String) -> Self {
        Self {
            text,
            _kind: PhantomData,
        }
    }

    pub fn decode(&self) -> Result<Vec<u8>> {
        decode(&self.text)
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn into_string(self) -> String {
        self.text
    }
}

impl<K> Clone for Base64<K> {
    fn clone(&self) -> Self {
        Self::from_encoded(self.text.clone())
    }
}

impl<K> PartialEq for Base64<K> {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

impl<K> Eq for Base64<K> {}

impl<K> fmt::Debug for Base64<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Base64").field(&self.text).finish()
    }
}

impl<K> fmt::Display for Base64<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl<K> AsRef<str> for Base64<K> {
    fn as_ref(&self) -> &str {
        &self.text
    }
}
