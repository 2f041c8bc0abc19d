//! EasySign CLI - Password-wrapped ECDSA P-384 signing keys
//!
//! Generates key pairs into PEM-style files, and signs and verifies files
//! with them. Every key file is wrapped with AES-256-CBC under a
//! PBKDF2-derived key.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use std::io;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

use easysign::key_files::{self, KeygenOptions};
use easysign::passphrase::{PassphraseReader, ReaderPassphraseReader, TerminalPassphraseReader};
use easysign::provider::{DEFAULT_ITERATIONS, KdfHash, KdfParams, SoftwareCrypto};

#[derive(Parser)]
#[command(name = "easysign")]
#[command(version)]
#[command(about = "Password-wrapped ECDSA P-384 signing keys.", long_about = None)]
struct Cli {
    /// Read passphrases from stdin, one per line, instead of from terminal
    #[arg(long, global = true)]
    passphrase_stdin: bool,

    /// PBKDF2 iteration count; must match the count the key was wrapped with
    #[arg(long, global = true, value_name = "N", default_value_t = DEFAULT_ITERATIONS)]
    kdf_iterations: u32,

    /// PBKDF2 hash; must match the hash the key was wrapped with
    #[arg(long, global = true, value_enum, default_value_t = HashArg::Sha512)]
    kdf_hash: HashArg,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum HashArg {
    Sha384,
    Sha512,
}

impl From<HashArg> for KdfHash {
    fn from(arg: HashArg) -> Self {
        match arg {
            HashArg::Sha384 => KdfHash::Sha384,
            HashArg::Sha512 => KdfHash::Sha512,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a key pair; prompts for the private key passphrase, then
    /// the public key passphrase
    #[command(alias = "g")]
    Keygen {
        /// Path to write the wrapped private key to
        #[arg(long, value_name = "FILE")]
        private_out: PathBuf,

        /// Path to write the wrapped public key to
        #[arg(long, value_name = "FILE")]
        public_out: PathBuf,

        /// Fold the Base64 body into 76-character lines
        #[arg(long)]
        fold: bool,

        /// Replace existing key files
        #[arg(long)]
        force: bool,
    },

    /// Show the type, iv, salt and size of a key file without unwrapping it
    #[command(alias = "i")]
    Inspect {
        /// Path to the key file
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,
    },

    /// Sign a file with a private key
    #[command(alias = "s")]
    Sign {
        /// Path to the private key file
        #[arg(short, long, value_name = "FILE")]
        key: PathBuf,

        /// Path to the file to sign
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        /// Path to write the Base64 signature to
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
    },

    /// Verify a file's signature with a public key
    #[command(alias = "v")]
    Verify {
        /// Path to the public key file
        #[arg(short, long, value_name = "FILE")]
        key: PathBuf,

        /// Path to the signed file
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        /// Path to the Base64 signature
        #[arg(short, long, value_name = "FILE")]
        signature: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let params = KdfParams::new(cli.kdf_iterations, cli.kdf_hash.into())
        .context("invalid key derivation parameters")?;
    let crypto = SoftwareCrypto::new(params);
    let mut reader = get_passphrase_reader(cli.passphrase_stdin);

    match cli.command {
        Commands::Keygen {
            private_out,
            public_out,
            fold,
            force,
        } => {
            let options = KeygenOptions { fold, force };
            key_files::generate_key_files(&private_out, &public_out, &mut *reader, &crypto, options)
                .await?;
        }
        Commands::Inspect { input } => {
            let key = key_files::inspect_key_file(&input)?;
            let key_type = key
                .key_type
                .map_or("unknown", |key_type| key_type.as_str());
            println!("type: {}", key_type);
            println!("iv: {}", key.iv);
            println!("salt: {}", key.salt);
            println!("wrapped key: {} bytes", key.key_bytes()?.len());
        }
        Commands::Sign { key, input, output } => {
            key_files::sign_file(&key, &input, &output, &mut *reader, &crypto).await?;
        }
        Commands::Verify {
            key,
            input,
            signature,
        } => {
            key_files::verify_file(&key, &input, &signature, &mut *reader, &crypto)
                .await
                .with_context(|| format!("verification of {} failed", input.display()))?;
            println!("signature OK");
        }
    }
    Ok(())
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "easysign=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn get_passphrase_reader(use_stdin: bool) -> Box<dyn PassphraseReader> {
    if use_stdin {
        Box::new(ReaderPassphraseReader::new(Box::new(io::stdin().lock())))
    } else {
        Box::new(TerminalPassphraseReader)
    }
}
