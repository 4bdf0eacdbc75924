//! Password-based whole-file encryption.
//!
//! File format: `[16-byte random salt][AES-256-CBC ciphertext, PKCS#7 padded]`.
//! The 32-byte key and 16-byte IV are the first 48 bytes of
//! PBKDF2-HMAC-SHA1(password, salt, 100 000 iterations).
//!
//! Results follow the transfer-log convention: elapsed milliseconds on
//! success, a negative code otherwise. A wrong password surfaces as the same
//! generic failure as any I/O error.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use aes::Aes256;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use sha1::Sha1;
use tracing::debug;

use crate::error::EngineError;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

pub const SALT_LEN: usize = 16;
const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Generic failure code (I/O error, bad padding, wrong password)
pub const FAILURE_CODE: i64 = -1;
/// Source file does not exist
pub const NOT_FOUND_CODE: i64 = -2;

/// Outcome of an encrypt or decrypt call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoOutcome {
    Completed { elapsed_ms: i64 },
    NotFound,
    Failed,
}

impl CryptoOutcome {
    /// Numeric code as recorded in a TransferRecord.
    pub fn code(&self) -> i64 {
        match self {
            CryptoOutcome::Completed { elapsed_ms } => *elapsed_ms,
            CryptoOutcome::NotFound => NOT_FOUND_CODE,
            CryptoOutcome::Failed => FAILURE_CODE,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CryptoOutcome::Completed { .. })
    }
}

/// Encrypt `source` into `dest`. `source` and `dest` may be the same path.
pub fn encrypt_file(source: &Path, dest: &Path, password: &str) -> Result<CryptoOutcome, EngineError> {
    run_transform(source, dest, password, encrypt_bytes)
}

/// Decrypt `source` (salt-prefixed ciphertext) into `dest`.
pub fn decrypt_file(source: &Path, dest: &Path, password: &str) -> Result<CryptoOutcome, EngineError> {
    run_transform(source, dest, password, decrypt_bytes)
}

fn run_transform(
    source: &Path,
    dest: &Path,
    password: &str,
    transform: fn(&[u8], &str) -> io::Result<Vec<u8>>,
) -> Result<CryptoOutcome, EngineError> {
    require_present("source", source.as_os_str().to_string_lossy().as_ref())?;
    require_present("destination", dest.as_os_str().to_string_lossy().as_ref())?;
    require_present("password", password)?;

    if !source.exists() {
        return Ok(CryptoOutcome::NotFound);
    }

    let started = Instant::now();
    let result = fs::read(source)
        .and_then(|input| transform(&input, password))
        .and_then(|output| write_replacing(dest, &output));

    match result {
        Ok(()) => Ok(CryptoOutcome::Completed {
            elapsed_ms: started.elapsed().as_millis() as i64,
        }),
        Err(e) => {
            debug!(source = %source.display(), error = %e, "Crypto transform failed");
            Ok(CryptoOutcome::Failed)
        }
    }
}

fn require_present(field: &str, value: &str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::configuration(field, "must not be blank"));
    }
    Ok(())
}

fn derive_key_iv(password: &str, salt: &[u8]) -> ([u8; KEY_LEN], [u8; IV_LEN]) {
    let mut material = [0u8; KEY_LEN + IV_LEN];
    pbkdf2::pbkdf2_hmac::<Sha1>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut material);

    let mut key = [0u8; KEY_LEN];
    let mut iv = [0u8; IV_LEN];
    key.copy_from_slice(&material[..KEY_LEN]);
    iv.copy_from_slice(&material[KEY_LEN..]);
    (key, iv)
}

fn encrypt_bytes(plaintext: &[u8], password: &str) -> io::Result<Vec<u8>> {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let (key, iv) = derive_key_iv(password, &salt);

    let cipher = Aes256CbcEnc::new_from_slices(&key, &iv)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut output = Vec::with_capacity(SALT_LEN + ciphertext.len());
    output.extend_from_slice(&salt);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

fn decrypt_bytes(input: &[u8], password: &str) -> io::Result<Vec<u8>> {
    if input.len() < SALT_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "input shorter than salt prefix",
        ));
    }
    let (salt, ciphertext) = input.split_at(SALT_LEN);
    let (key, iv) = derive_key_iv(password, salt);

    let cipher = Aes256CbcDec::new_from_slices(&key, &iv)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid padding"))
}

/// Write through a sibling temp file so the destination is replaced only once
/// the full output exists.
fn write_replacing(dest: &Path, data: &[u8]) -> io::Result<()> {
    let tmp = temp_sibling(dest);
    if let Err(e) = fs::write(&tmp, data).and_then(|_| fs::rename(&tmp, dest)) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

fn temp_sibling(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{name}.crypt-tmp"))
}
