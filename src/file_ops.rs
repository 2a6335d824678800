//! File encryption/decryption operations
//!
//! This module provides the file-level entry points: opening the input,
//! choosing the output name from the `.3fish` suffix convention, and making
//! sure output only lands on disk in a trustworthy state.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::config::{Config, OutputPolicy};
use crate::error::{ErrorCategory, ErrorKind, FishboxError, Result};
use crate::filecrypt;
use crate::header::NonceSeed;
use crate::integrity::Verdict;
use crate::passphrase::PassphraseReader;

/// Extension marking encrypted files.
pub const EXTENSION: &str = "3fish";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

impl Direction {
    /// Files ending in `.3fish` are decrypted; everything else is encrypted.
    pub fn infer(path: &Path) -> Self {
        if path.extension().is_some_and(|ext| ext == EXTENSION) {
            Direction::Decrypt
        } else {
            Direction::Encrypt
        }
    }
}

/// The default output path: `.3fish` appended on encryption, stripped on decryption.
pub fn output_path(input: &Path, direction: Direction) -> Result<PathBuf> {
    match direction {
        Direction::Encrypt => {
            let mut name = OsString::from(input.as_os_str());
            name.push(".");
            name.push(EXTENSION);
            Ok(PathBuf::from(name))
        }
        Direction::Decrypt => {
            let stripped = input.with_extension("");
            if stripped.file_name().is_none() || stripped == input {
                return Err(FishboxError::with_kind(
                    ErrorCategory::User,
                    ErrorKind::Usage,
                    format!("cannot derive an output name from {}", input.display()),
                ));
            }
            Ok(stripped)
        }
    }
}

/// Encrypt a file with a passphrase
///
/// The header records the input's size as reported by the filesystem, and the
/// nonce is derived from the output file name, the current time and (unless
/// disabled) OS randomness. The output is assembled in a temporary file next
/// to `output_path` and moved into place with mode 0o600 on success.
pub fn encrypt_file(
    input_path: &Path,
    output_path: &Path,
    passphrase_reader: &mut dyn PassphraseReader,
    config: &Config,
) -> Result<()> {
    ensure_distinct(input_path, output_path)?;
    let input = open_input(input_path)?;
    let length = input
        .metadata()
        .map_err(|e| FishboxError::io(format!("failed to stat {}", input_path.display()), e))?
        .len();
    let passphrase = passphrase_reader.read_passphrase()?;

    let seed = NonceSeed::now(
        output_path.as_os_str().as_encoded_bytes(),
        config.nonce_randomness,
    );
    let mut temp = temp_beside(output_path)?;
    {
        let mut reader = BufReader::new(input);
        let mut writer = BufWriter::new(&mut temp);
        filecrypt::encrypt_stream(
            config,
            &passphrase,
            &seed,
            length,
            &mut reader,
            &mut writer,
        )
        .map_err(|e| e.with_context("encryption failed"))?;
    }
    persist_secure(temp, output_path)?;
    info!(input = %input_path.display(), output = %output_path.display(), bytes = length, "encrypted");
    Ok(())
}

/// Decrypt a file with a passphrase
///
/// A wrong passphrase is detected from the commitment block before any output
/// file is created. What happens afterwards depends on `config.output_policy`:
///
/// - [`OutputPolicy::VerifyBeforeCommit`]: plaintext goes to a temporary file
///   that is only moved to `output_path` if the tag verifies. Any other
///   verdict becomes an error and nothing is left behind.
/// - [`OutputPolicy::CommitUnverified`]: plaintext is written straight to
///   `output_path` and the verdict is returned for the caller to report.
pub fn decrypt_file(
    input_path: &Path,
    output_path: &Path,
    passphrase_reader: &mut dyn PassphraseReader,
    config: &Config,
) -> Result<Verdict> {
    ensure_distinct(input_path, output_path)?;
    let mut reader = BufReader::new(open_input(input_path)?);
    let passphrase = passphrase_reader.read_passphrase()?;
    let decryptor = filecrypt::open_artifact(config, &passphrase, &mut reader)
        .map_err(|e| e.with_context("failed to decrypt"))?;
    drop(passphrase);

    let verdict = match config.output_policy {
        OutputPolicy::VerifyBeforeCommit => {
            let mut temp = temp_beside(output_path)?;
            let verdict = {
                let mut writer = BufWriter::new(&mut temp);
                decryptor
                    .decrypt_into(&mut reader, &mut writer)
                    .map_err(|e| e.with_context("failed to decrypt"))?
            };
            if !verdict.is_authenticated() {
                // Dropping the temporary file removes it.
                return Err(verdict_error(verdict));
            }
            persist_secure(temp, output_path)?;
            verdict
        }
        OutputPolicy::CommitUnverified => {
            let mut writer = BufWriter::new(create_secure(output_path)?);
            let verdict = decryptor
                .decrypt_into(&mut reader, &mut writer)
                .map_err(|e| e.with_context("failed to decrypt"))?;
            if !verdict.is_authenticated() {
                warn!(%verdict, output = %output_path.display(), "plaintext written without authentication");
            }
            verdict
        }
    };

    info!(input = %input_path.display(), output = %output_path.display(), %verdict, "decrypted");
    Ok(verdict)
}

fn verdict_error(verdict: Verdict) -> FishboxError {
    let kind = match verdict {
        Verdict::Unauthenticated => ErrorKind::Unauthenticated,
        _ => ErrorKind::AuthenticationFailed,
    };
    FishboxError::with_kind(
        ErrorCategory::User,
        kind,
        format!("{}; output discarded", verdict),
    )
}

/// Refuses an output that resolves to the input file, however it is spelled.
fn ensure_distinct(input: &Path, output: &Path) -> Result<()> {
    let same = input == output
        || matches!(
            (fs::canonicalize(input), fs::canonicalize(output)),
            (Ok(a), Ok(b)) if a == b
        );
    if same {
        return Err(FishboxError::with_kind(
            ErrorCategory::User,
            ErrorKind::Usage,
            format!("output {} is the input file", output.display()),
        ));
    }
    Ok(())
}

fn open_input(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| read_error(path, e))
}

fn temp_beside(path: &Path) -> Result<NamedTempFile> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    NamedTempFile::new_in(dir).map_err(|e| {
        FishboxError::with_kind_and_source(
            ErrorCategory::User,
            ErrorKind::FileWrite,
            format!("failed to create temporary file in {}", dir.display()),
            e,
        )
    })
}

/// Syncs `temp` to disk and renames it to `path` with restrictive permissions.
fn persist_secure(temp: NamedTempFile, path: &Path) -> Result<()> {
    // fsync() first such that the rename, if it succeeds, always points to a
    // complete file.
    temp.as_file().sync_all().map_err(|e| {
        FishboxError::io("failed to sync file prior to rename", e)
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))
            .map_err(|e| FishboxError::io("failed to set tempfile permissions", e))?;
    }

    temp.persist(path).map_err(|e| {
        FishboxError::with_kind_and_source(
            ErrorCategory::User,
            ErrorKind::FileWrite,
            format!("failed to rename to target file {}", path.display()),
            e,
        )
    })?;
    Ok(())
}

/// Create file with secure permissions (0o600 on Unix)
fn create_secure(path: &Path) -> Result<File> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path).map_err(|e| {
        FishboxError::with_kind_and_source(
            ErrorCategory::User,
            ErrorKind::FileWrite,
            format!("failed to open {}", path.display()),
            e,
        )
    })
}

fn read_error(path: &Path, err: io::Error) -> FishboxError {
    let (category, kind) = if err.kind() == io::ErrorKind::NotFound {
        (ErrorCategory::User, ErrorKind::FileNotFound)
    } else {
        (ErrorCategory::Internal, ErrorKind::Io)
    };
    FishboxError::with_kind_and_source(
        category,
        kind,
        format!("Could not open {}", path.display()),
        err,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::KeyDerivation;
    use crate::passphrase::ConstantPassphraseReader;
    use std::fs;
    use tempfile::TempDir;

    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;

    fn config() -> Config {
        Config {
            kdf: KeyDerivation::IteratedHash { rounds: 100 },
            ..Config::default()
        }
    }

    fn reader(passphrase: &[u8]) -> ConstantPassphraseReader {
        ConstantPassphraseReader::new(passphrase.to_vec())
    }

    #[test]
    fn test_direction_and_output_path() {
        let plain = Path::new("dir/report.pdf");
        assert_eq!(Direction::infer(plain), Direction::Encrypt);
        let sealed = output_path(plain, Direction::Encrypt).unwrap();
        assert_eq!(sealed, Path::new("dir/report.pdf.3fish"));

        assert_eq!(Direction::infer(&sealed), Direction::Decrypt);
        assert_eq!(output_path(&sealed, Direction::Decrypt).unwrap(), plain);
    }

    #[test]
    fn test_extensionless_output_paths() {
        assert_eq!(
            output_path(Path::new("notes"), Direction::Encrypt).unwrap(),
            Path::new("notes.3fish")
        );
        assert_eq!(
            output_path(Path::new("notes.3fish"), Direction::Decrypt).unwrap(),
            Path::new("notes")
        );
        let err = output_path(Path::new("notes"), Direction::Decrypt)
            .expect_err("expected usage error");
        assert_eq!(err.kind, Some(ErrorKind::Usage));
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let plain_path = temp_dir.path().join("plain.txt");
        let crypt_path = temp_dir.path().join("plain.txt.3fish");
        let decrypted_path = temp_dir.path().join("decrypted.txt");

        let plaintext = vec![0x61u8; 100];
        fs::write(&plain_path, &plaintext).unwrap();

        encrypt_file(&plain_path, &crypt_path, &mut reader(b"correct-horse"), &config()).unwrap();
        assert_eq!(fs::metadata(&crypt_path).unwrap().len(), 5 * 64);

        let verdict =
            decrypt_file(&crypt_path, &decrypted_path, &mut reader(b"correct-horse"), &config())
                .unwrap();
        assert_eq!(verdict, Verdict::Authenticated);
        assert_eq!(fs::read(&decrypted_path).unwrap(), plaintext);
    }

    #[test]
    fn test_empty_file() {
        let temp_dir = TempDir::new().unwrap();
        let plain_path = temp_dir.path().join("empty.txt");
        let crypt_path = temp_dir.path().join("empty.txt.3fish");
        let decrypted_path = temp_dir.path().join("decrypted.txt");

        fs::write(&plain_path, b"").unwrap();
        encrypt_file(&plain_path, &crypt_path, &mut reader(b"test"), &config()).unwrap();
        decrypt_file(&crypt_path, &decrypted_path, &mut reader(b"test"), &config()).unwrap();

        assert_eq!(fs::read(&decrypted_path).unwrap(), b"");
    }

    #[test]
    fn test_wrong_passphrase_creates_no_output() {
        for policy in [OutputPolicy::VerifyBeforeCommit, OutputPolicy::CommitUnverified] {
            let temp_dir = TempDir::new().unwrap();
            let plain_path = temp_dir.path().join("plain.txt");
            let crypt_path = temp_dir.path().join("plain.txt.3fish");
            let decrypted_path = temp_dir.path().join("decrypted.txt");

            fs::write(&plain_path, b"secret").unwrap();
            encrypt_file(&plain_path, &crypt_path, &mut reader(b"correct-horse"), &config())
                .unwrap();

            let config = Config {
                output_policy: policy,
                ..config()
            };
            let err = decrypt_file(&crypt_path, &decrypted_path, &mut reader(b"wrong"), &config)
                .expect_err("expected invalid passphrase");
            assert_eq!(err.kind, Some(ErrorKind::InvalidPassphrase));
            assert!(!decrypted_path.exists(), "{:?}", policy);
            assert_eq!(fs::read_dir(temp_dir.path()).unwrap().count(), 2);
        }
    }

    #[test]
    fn test_tampered_file_policies() {
        let temp_dir = TempDir::new().unwrap();
        let plain_path = temp_dir.path().join("plain.txt");
        let crypt_path = temp_dir.path().join("plain.txt.3fish");
        let decrypted_path = temp_dir.path().join("decrypted.txt");

        fs::write(&plain_path, vec![0x42u8; 300]).unwrap();
        encrypt_file(&plain_path, &crypt_path, &mut reader(b"pw"), &config()).unwrap();

        let mut artifact = fs::read(&crypt_path).unwrap();
        artifact[64 * 3 + 10] ^= 0x04;
        fs::write(&crypt_path, &artifact).unwrap();

        let err = decrypt_file(&crypt_path, &decrypted_path, &mut reader(b"pw"), &config())
            .expect_err("expected authentication failure");
        assert_eq!(err.kind, Some(ErrorKind::AuthenticationFailed));
        assert!(!decrypted_path.exists());

        let legacy = Config {
            output_policy: OutputPolicy::CommitUnverified,
            ..config()
        };
        let verdict = decrypt_file(&crypt_path, &decrypted_path, &mut reader(b"pw"), &legacy).unwrap();
        assert_eq!(verdict, Verdict::AuthenticationFailure);
        assert_eq!(fs::read(&decrypted_path).unwrap().len(), 300);
    }

    #[test]
    fn test_missing_tag_is_discarded_by_default() {
        let temp_dir = TempDir::new().unwrap();
        let plain_path = temp_dir.path().join("plain.txt");
        let crypt_path = temp_dir.path().join("plain.txt.3fish");
        let decrypted_path = temp_dir.path().join("decrypted.txt");

        fs::write(&plain_path, b"hello").unwrap();
        encrypt_file(&plain_path, &crypt_path, &mut reader(b"pw"), &config()).unwrap();
        let artifact = fs::read(&crypt_path).unwrap();
        fs::write(&crypt_path, &artifact[..artifact.len() - 64]).unwrap();

        let err = decrypt_file(&crypt_path, &decrypted_path, &mut reader(b"pw"), &config())
            .expect_err("expected unauthenticated");
        assert_eq!(err.kind, Some(ErrorKind::Unauthenticated));
        assert!(!decrypted_path.exists());
    }

    #[test]
    fn test_missing_input() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("missing.txt");
        let out = temp_dir.path().join("missing.txt.3fish");

        let err = encrypt_file(&missing, &out, &mut reader(b"pw"), &config())
            .expect_err("expected missing file");
        assert_eq!(err.kind, Some(ErrorKind::FileNotFound));
        assert_eq!(err.category, ErrorCategory::User);
        assert!(!out.exists());
    }

    #[test]
    fn test_two_encryptions_differ() {
        let temp_dir = TempDir::new().unwrap();
        let plain_path = temp_dir.path().join("plain.txt");
        let first = temp_dir.path().join("first.3fish");
        let second = temp_dir.path().join("second.3fish");

        fs::write(&plain_path, vec![7u8; 130]).unwrap();
        encrypt_file(&plain_path, &first, &mut reader(b"pw"), &config()).unwrap();
        encrypt_file(&plain_path, &second, &mut reader(b"pw"), &config()).unwrap();

        let a = fs::read(&first).unwrap();
        let b = fs::read(&second).unwrap();
        assert_ne!(a[..64], b[..64]);
        assert_ne!(a[128..], b[128..]);
    }

    #[test]
    fn test_aliased_output_is_refused() {
        let temp_dir = TempDir::new().unwrap();
        let plain_path = temp_dir.path().join("plain.txt");
        let crypt_path = temp_dir.path().join("plain.txt.3fish");
        fs::write(&plain_path, b"keep me").unwrap();
        encrypt_file(&plain_path, &crypt_path, &mut reader(b"pw"), &config()).unwrap();
        let artifact = fs::read(&crypt_path).unwrap();

        fs::create_dir(temp_dir.path().join("sub")).unwrap();
        let alias = temp_dir.path().join("sub").join("..").join("plain.txt.3fish");
        let legacy = Config {
            output_policy: OutputPolicy::CommitUnverified,
            ..config()
        };
        let err = decrypt_file(&crypt_path, &alias, &mut reader(b"pw"), &legacy)
            .expect_err("expected aliased output to be refused");
        assert_eq!(err.kind, Some(ErrorKind::Usage));
        assert_eq!(fs::read(&crypt_path).unwrap(), artifact);

        let alias = temp_dir.path().join("sub").join("..").join("plain.txt");
        let err = encrypt_file(&plain_path, &alias, &mut reader(b"pw"), &config())
            .expect_err("expected aliased output to be refused");
        assert_eq!(err.kind, Some(ErrorKind::Usage));
        assert_eq!(fs::read(&plain_path).unwrap(), b"keep me");
    }

    #[test]
    #[cfg(unix)]
    fn test_file_permissions() {
        let temp_dir = TempDir::new().unwrap();
        let plain_path = temp_dir.path().join("plain.txt");
        let crypt_path = temp_dir.path().join("plain.txt.3fish");
        let decrypted_path = temp_dir.path().join("decrypted.txt");

        fs::write(&plain_path, b"test").unwrap();
        encrypt_file(&plain_path, &crypt_path, &mut reader(b"test"), &config()).unwrap();
        decrypt_file(&crypt_path, &decrypted_path, &mut reader(b"test"), &config()).unwrap();

        for path in [&crypt_path, &decrypted_path] {
            let mode = fs::metadata(path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600, "{}", path.display());
        }
    }
}
