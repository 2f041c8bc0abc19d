//! Key file operations
//!
//! High-level operations behind the CLI: generating a key pair into two
//! PEM files, inspecting a key file, and signing/verifying files with an
//! unwrapped key.

use crate::codec;
use crate::error::{EasySignError, ErrorCategory, ErrorKind, Result};
use crate::keys::{self, KeyCrypto, UnwrapRequest};
use crate::passphrase::PassphraseReader;
use crate::pem::{self, WrappedKey};
use crate::provider::SigningKeyHandle;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::info;

/// Options for [`generate_key_files`].
#[derive(Debug, Clone, Copy, Default)]
pub struct KeygenOptions {
    /// Fold the Base64 body at 76 characters.
    pub fold: bool,
    /// Replace existing key files.
    pub force: bool,
}

/// Generate a signing key pair and write each half as a PEM file.
///
/// Reads the private key passphrase first, then the public key passphrase.
/// Both files are written atomically with mode 0o600 on Unix systems.
pub async fn generate_key_files<C: KeyCrypto>(
    private_path: &Path,
    public_path: &Path,
    passphrase_reader: &mut dyn PassphraseReader,
    crypto: &C,
    options: KeygenOptions,
) -> Result<()> {
    if !options.force {
        for path in [private_path, public_path] {
            if path.exists() {
                return Err(EasySignError::with_kind(
                    ErrorCategory::User,
                    ErrorKind::Io,
                    format!(
                        "{} already exists; pass --force to replace it",
                        path.display()
                    ),
                ));
            }
        }
    }

    let private_passphrase = passphrase_reader.read_passphrase("Private key passphrase")?;
    let public_passphrase = passphrase_reader.read_passphrase("Public key passphrase")?;

    let pair = keys::generate_signing_keys(crypto, &private_passphrase, &public_passphrase, None)
        .await
        .map_err(|e| e.with_context("key generation failed"))?;

    let pack = |key: &WrappedKey| {
        if options.fold {
            pem::pack_key_folded(key)
        } else {
            pem::pack_key(key)
        }
    };
    let private_pem = pack(&pair.private)?;
    let public_pem = pack(&pair.public)?;

    // Both halves are staged before either is renamed into place, so a
    // failure here leaves no private key without its public partner.
    let private_file = stage_file(private_path, private_pem.as_bytes())
        .map_err(|e| e.with_context(format!("failed to write to {}", private_path.display())))?;
    let public_file = stage_file(public_path, public_pem.as_bytes())
        .map_err(|e| e.with_context(format!("failed to write to {}", public_path.display())))?;

    persist_file(private_file, private_path)?;
    if let Err(e) = persist_file(public_file, public_path) {
        let _ = fs::remove_file(private_path);
        return Err(e.with_context(format!("failed to write to {}", public_path.display())));
    }

    info!(
        private = %private_path.display(),
        public = %public_path.display(),
        "wrote key pair"
    );
    Ok(())
}

/// Read and unpack a key file without unwrapping it.
pub fn inspect_key_file(path: &Path) -> Result<WrappedKey> {
    let text = read_text(path)?;
    pem::unpack_key(&text)
        .map_err(|e| e.with_context(format!("failed to unpack {}", path.display())))
}

/// Sign a file with a private key file, writing a Base64 signature.
pub async fn sign_file<C>(
    key_path: &Path,
    input_path: &Path,
    signature_path: &Path,
    passphrase_reader: &mut dyn PassphraseReader,
    crypto: &C,
) -> Result<()>
where
    C: KeyCrypto<Handle = SigningKeyHandle>,
{
    let request = load_request(key_path, "sign")?;
    let message = fs::read(input_path).map_err(|e| read_error(input_path, e))?;
    let passphrase = passphrase_reader.read_passphrase("Private key passphrase")?;
    let handle = request
        .unwrap(crypto, &passphrase)
        .await
        .map_err(|e| e.with_context("failed to unlock private key"))?;

    let signature = handle.sign(&message)?;
    let mut text = codec::encode(&signature, false);
    text.push('\n');
    write_file_atomic(signature_path, text.as_bytes())
        .map_err(|e| e.with_context(format!("failed to write to {}", signature_path.display())))?;
    Ok(())
}

/// Verify a Base64 signature over a file with a public key file.
pub async fn verify_file<C>(
    key_path: &Path,
    input_path: &Path,
    signature_path: &Path,
    passphrase_reader: &mut dyn PassphraseReader,
    crypto: &C,
) -> Result<()>
where
    C: KeyCrypto<Handle = SigningKeyHandle>,
{
    let request = load_request(key_path, "verify")?;
    let message = fs::read(input_path).map_err(|e| read_error(input_path, e))?;
    let signature_text = read_text(signature_path)?;
    let signature = codec::decode(&signature_text)
        .map_err(|e| e.with_context(format!("failed to decode {}", signature_path.display())))?;
    let passphrase = passphrase_reader.read_passphrase("Public key passphrase")?;
    let handle = request
        .unwrap(crypto, &passphrase)
        .await
        .map_err(|e| e.with_context("failed to unlock public key"))?;

    handle.verify(&message, &signature)
}

fn load_request(key_path: &Path, usage: &str) -> Result<UnwrapRequest> {
    let text = read_text(key_path)?;
    keys::unwrap_signing_key(&text, usage)
        .map_err(|e| e.with_context(format!("cannot use {} to {}", key_path.display(), usage)))
}

fn read_text(path: &Path) -> Result<String> {
    let bytes = fs::read(path).map_err(|e| read_error(path, e))?;
    String::from_utf8(bytes).map_err(|e| {
        EasySignError::with_kind_and_source(
            ErrorCategory::User,
            ErrorKind::Io,
            format!("{} is not valid UTF-8", path.display()),
            e,
        )
    })
}

/// Write a file atomically (tempfile + fsync + rename) with mode 0o600 on Unix.
///
/// Either the previous file or the complete new file exists afterwards,
/// never a partial one.
fn write_file_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let temp_file = stage_file(path, contents)?;
    persist_file(temp_file, path)
}

/// Write `contents` to a synced tempfile next to `path`, with mode 0o600 on
/// Unix. Nothing is visible at `path` until [`persist_file`].
fn stage_file(path: &Path, contents: &[u8]) -> Result<NamedTempFile> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut temp_file = NamedTempFile::new_in(dir).map_err(|e| {
        EasySignError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::Io,
            "failed to create tempfile",
            e,
        )
    })?;

    temp_file.write_all(contents).map_err(|e| {
        EasySignError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::Io,
            "failed to write to tempfile",
            e,
        )
    })?;
    // Flush and fsync() such that the rename later, if it succeeds, will
    // always point to a valid file.
    temp_file.flush().map_err(|e| {
        EasySignError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::Io,
            "failed to flush tempfile",
            e,
        )
    })?;
    temp_file.as_file().sync_all().map_err(|e| {
        EasySignError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::Io,
            "failed to sync file prior to rename",
            e,
        )
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = temp_file
            .as_file()
            .metadata()
            .map_err(|e| {
                EasySignError::with_kind_and_source(
                    ErrorCategory::Internal,
                    ErrorKind::Io,
                    "failed to get tempfile metadata",
                    e,
                )
            })?
            .permissions();
        perms.set_mode(0o600);
        temp_file.as_file().set_permissions(perms).map_err(|e| {
            EasySignError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::Io,
                "failed to set tempfile permissions",
                e,
            )
        })?;
    }
    Ok(temp_file)
}

fn persist_file(temp_file: NamedTempFile, path: &Path) -> Result<()> {
    temp_file.persist(path).map_err(|e| {
        EasySignError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::Io,
            format!("failed to rename to target file {}", path.display()),
            e,
        )
    })?;
    Ok(())
}

fn read_error(path: &Path, err: io::Error) -> EasySignError {
    let category = if err.kind() == io::ErrorKind::NotFound {
        ErrorCategory::User
    } else {
        ErrorCategory::Internal
    };
    EasySignError::with_kind_and_source(
        category,
        ErrorKind::Io,
        format!("failed to read from {}", path.display()),
        err,
    )
}
