//! Password-based AES-256-GCM encryption with scrypt key derivation.
//!
//! Blob layout: `nonce (12) || ciphertext || tag (16) || salt (32)`.
//! The salt is fresh per call and always sits at the tail, so it can be split
//! off without any header. Decryption tries the configured cost tier first
//! and then exactly one legacy tier, which keeps blobs written by older
//! releases readable.
//!
//! The blob does not record its scrypt parameters. A blob written under the
//! current tier only decrypts where the same strength and lanes are
//! configured; the legacy set is fixed at `p = 1` on every machine.

pub mod password;

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::config::CryptoConfig;
use crate::fs::write_atomically;
use crate::{Result, StashError};

/// Suffix appended to encrypted files, after every other suffix.
pub const ENCRYPTED_SUFFIX: &str = ".enc";

pub const SALT_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;
pub const KEY_SIZE: usize = 32;
pub const MIN_BLOB_SIZE: usize = SALT_SIZE + NONCE_SIZE + TAG_SIZE;

/// Reserved prefix of a future self-describing blob format.
const VERSIONED_MAGIC: &[u8; 4] = b"ENC2";

const SCRYPT_R: u32 = 8;
const LEGACY_LOG_N: u8 = 15;
const LEGACY_P: u32 = 1;

/// Cost tier for new encryptions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KdfStrength {
    /// N = 2^17
    #[default]
    Standard,
    /// N = 2^18
    High,
    /// N = 2^20
    Paranoid,
}

impl KdfStrength {
    pub fn log_n(self) -> u8 {
        match self {
            KdfStrength::Standard => 17,
            KdfStrength::High => 18,
            KdfStrength::Paranoid => 20,
        }
    }
}

/// One scrypt parameter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub log_n: u8,
    pub r: u32,
    pub p: u32,
}

impl KdfParams {
    pub fn new(log_n: u8, r: u32, p: u32) -> Self {
        Self { log_n, r, p }
    }

    fn to_scrypt(self) -> Result<scrypt::Params> {
        scrypt::Params::new(self.log_n, self.r, self.p, KEY_SIZE)
            .map_err(|e| StashError::Config(format!("invalid scrypt parameters: {}", e)))
    }
}

/// Parallelization lanes when none are configured: half the cores, 1..=6.
pub fn default_lanes() -> u32 {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cores / 2).clamp(1, 6) as u32
}

/// Derive a 32-byte key from `password` and `salt`.
pub fn derive_key(
    password: &[u8],
    salt: &[u8],
    params: KdfParams,
) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    if password.is_empty() {
        return Err(StashError::Validation("password cannot be empty".into()));
    }
    if salt.len() != SALT_SIZE {
        return Err(StashError::Validation(format!(
            "invalid salt length: expected {}, got {}",
            SALT_SIZE,
            salt.len()
        )));
    }

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    scrypt::scrypt(password, salt, &params.to_scrypt()?, key.as_mut())
        .map_err(|e| StashError::Decryption(format!("key derivation failed: {}", e)))?;
    Ok(key)
}

/// Encrypts and decrypts blobs with a current and a legacy parameter set.
#[derive(Debug, Clone)]
pub struct CryptoEngine {
    current: KdfParams,
    legacy: KdfParams,
}

impl CryptoEngine {
    pub fn from_config(config: &CryptoConfig) -> Self {
        let lanes = config.lanes.unwrap_or_else(default_lanes);
        Self {
            current: KdfParams::new(config.strength.log_n(), SCRYPT_R, lanes),
            legacy: KdfParams::new(LEGACY_LOG_N, SCRYPT_R, LEGACY_P),
        }
    }

    /// Explicit parameter sets; tests use this with cheap costs.
    pub fn with_params(current: KdfParams, legacy: KdfParams) -> Self {
        Self { current, legacy }
    }

    pub fn encrypt(&self, plaintext: &[u8], password: &str) -> Result<Vec<u8>> {
        if plaintext.is_empty() {
            return Err(StashError::Validation("cannot encrypt empty data".into()));
        }
        if password.is_empty() {
            return Err(StashError::Validation("password cannot be empty".into()));
        }

        let mut salt = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);
        let key = derive_key(password.as_bytes(), &salt, self.current)?;

        let cipher = Aes256Gcm::new_from_slice(key.as_ref())
            .map_err(|e| StashError::Validation(format!("failed to create cipher: {}", e)))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| StashError::Validation(format!("encryption failed: {}", e)))?;

        let mut blob = Vec::with_capacity(NONCE_SIZE + sealed.len() + SALT_SIZE);
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&sealed);
        blob.extend_from_slice(&salt);
        Ok(blob)
    }

    pub fn decrypt(&self, blob: &[u8], password: &str) -> Result<Vec<u8>> {
        if blob.len() < MIN_BLOB_SIZE {
            return Err(StashError::Format(format!(
                "invalid encrypted data: too short ({} bytes)",
                blob.len()
            )));
        }
        if blob.starts_with(VERSIONED_MAGIC) {
            return Err(StashError::Format(
                "versioned (ENC2) encryption format is not supported yet".into(),
            ));
        }

        let (body, salt) = blob.split_at(blob.len() - SALT_SIZE);
        let (nonce, sealed) = body.split_at(NONCE_SIZE);

        for params in self.parameter_sets() {
            let key = derive_key(password.as_bytes(), salt, params)?;
            let cipher = Aes256Gcm::new_from_slice(key.as_ref())
                .map_err(|e| StashError::Decryption(format!("failed to create cipher: {}", e)))?;
            match cipher.decrypt(Nonce::from_slice(nonce), sealed) {
                Ok(plaintext) => return Ok(plaintext),
                Err(_) => debug!("Decryption failed with log2(N)={}", params.log_n),
            }
        }

        Err(StashError::Decryption(
            "decryption failed with every parameter set (wrong password or corrupted data)".into(),
        ))
    }

    fn parameter_sets(&self) -> Vec<KdfParams> {
        if self.current == self.legacy {
            vec![self.current]
        } else {
            vec![self.current, self.legacy]
        }
    }

    /// Encrypt `path` into `<path>.enc`. The plaintext file is left in place.
    pub fn encrypt_file(&self, path: &Path, password: &str) -> Result<PathBuf> {
        let name = file_name(path);
        info!("Encrypting file: {}", name);

        let data = fs::read(path)?;
        let blob = self.encrypt(&data, password)?;
        let output = encrypted_path(path);
        write_atomically(&output, &blob)?;
        Ok(output)
    }

    /// Decrypt `<path>.enc` into `<path>`. The encrypted file is left in place.
    pub fn decrypt_file(&self, path: &Path, password: &str) -> Result<PathBuf> {
        let output = decrypted_path(path).ok_or_else(|| {
            StashError::Validation(format!("{} has no {} suffix", path.display(), ENCRYPTED_SUFFIX))
        })?;
        let blob = fs::read(path)?;
        let plaintext = self.decrypt(&blob, password)?;
        write_atomically(&output, &plaintext)?;
        Ok(output)
    }
}

/// `<path>.enc`
pub fn encrypted_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(ENCRYPTED_SUFFIX);
    PathBuf::from(name)
}

/// `<path>.enc` -> `<path>`; `None` when the suffix is missing.
pub fn decrypted_path(path: &Path) -> Option<PathBuf> {
    let s = path.to_str()?;
    s.strip_suffix(ENCRYPTED_SUFFIX)
        .filter(|rest| !rest.is_empty())
        .map(PathBuf::from)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cheap_engine() -> CryptoEngine {
        CryptoEngine::with_params(KdfParams::new(6, 8, 1), KdfParams::new(4, 8, 1))
    }

    #[test]
    fn test_round_trip() {
        let engine = cheap_engine();
        let plaintext = b"cold storage is patient";
        let blob = engine.encrypt(plaintext, "Correct-Horse-9").unwrap();
        assert_eq!(blob.len(), NONCE_SIZE + plaintext.len() + TAG_SIZE + SALT_SIZE);
        assert_eq!(engine.decrypt(&blob, "Correct-Horse-9").unwrap(), plaintext);
    }

    #[test]
    fn test_salt_and_nonce_fresh_per_call() {
        let engine = cheap_engine();
        let a = engine.encrypt(b"same", "pw").unwrap();
        let b = engine.encrypt(b"same", "pw").unwrap();
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
        assert_ne!(a[a.len() - SALT_SIZE..], b[b.len() - SALT_SIZE..]);
    }

    #[test]
    fn test_every_single_byte_flip_fails() {
        let engine = cheap_engine();
        let blob = engine.encrypt(b"tamper evident", "pw").unwrap();

        for i in 0..blob.len() {
            let mut corrupted = blob.clone();
            corrupted[i] ^= 0x01;
            assert!(
                engine.decrypt(&corrupted, "pw").is_err(),
                "flip at byte {} decrypted",
                i
            );
        }
    }

    #[test]
    fn test_wrong_password_fails() {
        let engine = cheap_engine();
        let blob = engine.encrypt(b"secret", "right").unwrap();
        assert!(matches!(
            engine.decrypt(&blob, "wrong"),
            Err(StashError::Decryption(_))
        ));
    }

    #[test]
    fn test_legacy_parameters_still_decrypt() {
        let legacy = KdfParams::new(4, 8, 1);
        let old_engine = CryptoEngine::with_params(legacy, legacy);
        let blob = old_engine.encrypt(b"written long ago", "pw").unwrap();

        let engine = cheap_engine();
        assert_eq!(engine.decrypt(&blob, "pw").unwrap(), b"written long ago");
    }

    #[test]
    fn test_legacy_set_ignores_configured_lanes() {
        for lanes in [1, 3, 6] {
            let engine = CryptoEngine::from_config(&CryptoConfig {
                strength: KdfStrength::default(),
                lanes: Some(lanes),
            });
            assert_eq!(engine.legacy, KdfParams::new(15, 8, 1));
            assert_eq!(engine.current.p, lanes);
        }
    }

    #[test]
    fn test_unknown_parameters_fail() {
        let other = KdfParams::new(5, 8, 1);
        let stranger = CryptoEngine::with_params(other, other);
        let blob = stranger.encrypt(b"data", "pw").unwrap();
        assert!(cheap_engine().decrypt(&blob, "pw").is_err());
    }

    #[test]
    fn test_too_short_rejected() {
        let err = cheap_engine().decrypt(&[0u8; MIN_BLOB_SIZE - 1], "pw").unwrap_err();
        assert!(err.to_string().contains("too short"));
    }

    #[test]
    fn test_versioned_prefix_rejected() {
        let mut blob = vec![0u8; 80];
        blob[..4].copy_from_slice(b"ENC2");
        let err = cheap_engine().decrypt(&blob, "pw").unwrap_err();
        assert!(matches!(err, StashError::Format(_)));
        assert!(err.to_string().contains("not supported"));
    }

    #[test]
    fn test_empty_inputs_rejected() {
        let engine = cheap_engine();
        assert!(matches!(engine.encrypt(b"", "pw"), Err(StashError::Validation(_))));
        assert!(matches!(engine.encrypt(b"x", ""), Err(StashError::Validation(_))));
    }

    #[test]
    fn test_file_round_trip_and_paths() -> Result<()> {
        let engine = cheap_engine();
        let dir = TempDir::new()?;
        let plain = dir.path().join("photos.tar.gz-part00001");
        fs::write(&plain, b"part bytes")?;

        let enc = engine.encrypt_file(&plain, "pw")?;
        assert_eq!(enc, dir.path().join("photos.tar.gz-part00001.enc"));

        fs::remove_file(&plain)?;
        let dec = engine.decrypt_file(&enc, "pw")?;
        assert_eq!(dec, plain);
        assert_eq!(fs::read(&dec)?, b"part bytes");
        Ok(())
    }

    #[test]
    fn test_decrypted_path_requires_suffix() {
        assert_eq!(decrypted_path(Path::new("a/b.enc")), Some(PathBuf::from("a/b")));
        assert_eq!(decrypted_path(Path::new("a/b.txt")), None);
    }

    #[test]
    fn test_strength_tiers() {
        assert_eq!(KdfStrength::default().log_n(), 17);
        assert!(KdfStrength::Paranoid.log_n() > KdfStrength::High.log_n());
        assert!((1..=6).contains(&default_lanes()));
    }
}
