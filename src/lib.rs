//! EasySign - Password-wrapped ECDSA P-384 signing keys in PEM-style text

#![forbid(unsafe_code)]

pub mod codec;
pub mod error;
pub mod key_files;
pub mod keys;
pub mod passphrase;
pub mod pem;
pub mod provider;
