//! fishbox CLI - passphrase-based file encryption
//!
//! Encrypts FILE to FILE.3fish, or decrypts FILE.3fish back to FILE. The
//! direction is taken from the file name.

use std::error::Error as StdError;
use std::path::PathBuf;
use std::process;

use clap::{ArgAction, Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use fishbox::config::{Config, OutputPolicy};
use fishbox::error::{FishboxError, Result};
use fishbox::file_ops::{self, Direction};
use fishbox::kdf::{self, KeyDerivation};
use fishbox::passphrase::{PassphraseReader, ReaderPassphraseReader, TerminalPassphraseReader};

#[derive(Parser)]
#[command(name = "fishbox")]
#[command(version)]
#[command(about = "Passphrase-based file encryption.", long_about = None)]
struct Cli {
    /// File to encrypt, or a .3fish file to decrypt
    #[arg(value_name = "FILE")]
    file: PathBuf,

    /// Write the result here instead of next to FILE
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Read passphrase from stdin instead of from terminal
    #[arg(long)]
    passphrase_stdin: bool,

    /// Key derivation strategy; decryption must use the one used to encrypt
    #[arg(long, value_enum, default_value_t = KdfChoice::Argon2)]
    kdf: KdfChoice,

    /// Re-hash count for --kdf iterated
    #[arg(long, value_name = "N", default_value_t = kdf::DEFAULT_HASH_ROUNDS)]
    hash_rounds: u32,

    /// Argon2id passes
    #[arg(long, value_name = "N", default_value_t = kdf::DEFAULT_ARGON2_TIME)]
    argon2_time: u32,

    /// Argon2id memory in KiB
    #[arg(long, value_name = "KIB", default_value_t = kdf::DEFAULT_ARGON2_MEMORY_KIB)]
    argon2_memory: u32,

    /// Argon2id lanes
    #[arg(long, value_name = "N", default_value_t = kdf::DEFAULT_ARGON2_LANES)]
    argon2_lanes: u32,

    /// Write decrypted output directly, even if authentication then fails
    #[arg(long)]
    commit_unverified: bool,

    /// Derive the nonce from passphrase, file name and time only
    #[arg(long)]
    no_os_random: bool,

    /// More log output (-v, -vv); RUST_LOG overrides
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum KdfChoice {
    Argon2,
    Iterated,
}

impl Cli {
    fn config(&self) -> Config {
        let kdf = match self.kdf {
            KdfChoice::Argon2 => KeyDerivation::Argon2 {
                time_cost: self.argon2_time,
                memory_kib: self.argon2_memory,
                parallelism: self.argon2_lanes,
            },
            KdfChoice::Iterated => KeyDerivation::IteratedHash {
                rounds: self.hash_rounds,
            },
        };
        let output_policy = if self.commit_unverified {
            OutputPolicy::CommitUnverified
        } else {
            OutputPolicy::VerifyBeforeCommit
        };
        Config {
            kdf,
            nonce_randomness: !self.no_os_random,
            output_policy,
        }
    }
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // --help and --version go to stdout and are not failures.
            let failed = e.use_stderr();
            let _ = e.print();
            process::exit(if failed { 1 } else { 0 });
        }
    };

    init_logging(cli.verbose);

    if let Err(e) = run(&cli) {
        eprintln!("Error: {}", render_chain(&e));
        process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = cli.config();
    let direction = Direction::infer(&cli.file);
    let output = match &cli.output {
        Some(path) => path.clone(),
        None => file_ops::output_path(&cli.file, direction)?,
    };
    let mut reader = get_passphrase_reader(cli.passphrase_stdin);
    match direction {
        Direction::Encrypt => file_ops::encrypt_file(&cli.file, &output, &mut *reader, &config),
        Direction::Decrypt => {
            let verdict = file_ops::decrypt_file(&cli.file, &output, &mut *reader, &config)?;
            println!("{}", verdict);
            Ok(())
        }
    }
}

fn get_passphrase_reader(use_stdin: bool) -> Box<dyn PassphraseReader> {
    if use_stdin {
        Box::new(ReaderPassphraseReader::new(Box::new(std::io::stdin())))
    } else {
        Box::new(TerminalPassphraseReader)
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// `outer: inner: root`, following `source()` links.
fn render_chain(err: &FishboxError) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}
