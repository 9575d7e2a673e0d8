//! Encrypted configuration values. A value carrying the `{encrypted}`
//! prefix is unsealed at startup with an AES-256-GCM key reassembled from
//! masked fragments stored under the operator's home directory.

use crate::config::Config;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose, Engine as _};
use log::{info, warn};
use prometheus::IntCounter;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;
use thiserror::Error;
use zeroize::Zeroizing;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const SEGMENT_LEN: usize = 8;
const ENCRYPTED_PREFIX: &str = "{encrypted}";
const MASK_FILE: &str = "unseal.mask";
const SEGMENT_FILES: [&str; 4] = ["unseal.seg1", "unseal.seg2", "unseal.seg3", "unseal.seg4"];
const ENV_OVERRIDE: &str = "CORRIDOR_SECRET_HOME";

#[derive(Error, Debug)]
pub enum SecretError {
    #[error("unable to locate a home directory for secret storage")]
    MissingHomeDir,

    #[error("secret storage already contains key material")]
    KeyExists,

    #[error("secret key has not been initialized (run --init-secret-key first)")]
    KeyMissing,

    #[error("secret storage permissions are insecure (expected 0700)")]
    InsecurePermissions,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("base64 decoding error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("invalid sealed payload: {0}")]
    Payload(String),

    #[error("unsealed secret is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

struct UnsealTelemetry {
    success: IntCounter,
    failure: IntCounter,
}

fn telemetry() -> &'static UnsealTelemetry {
    static TELEMETRY: OnceLock<UnsealTelemetry> = OnceLock::new();
    TELEMETRY.get_or_init(|| {
        let success = IntCounter::new(
            "corridor_secret_unseal_success_total",
            "Encrypted configuration values successfully unsealed",
        )
        .expect("unseal success counter");
        let failure = IntCounter::new(
            "corridor_secret_unseal_failure_total",
            "Encrypted configuration values that failed to unseal",
        )
        .expect("unseal failure counter");
        for counter in [&success, &failure] {
            if let Err(e) = prometheus::register(Box::new(counter.clone())) {
                warn!("Failed to register unseal metric: {}", e);
            }
        }
        UnsealTelemetry { success, failure }
    })
}

/// Seals and unseals configuration secrets against on-disk key material.
pub struct SecretStore {
    home: PathBuf,
}

impl SecretStore {
    /// Store rooted at `~/.corridor-bridge`, or wherever
    /// `CORRIDOR_SECRET_HOME` points.
    pub fn new() -> Result<Self, SecretError> {
        Ok(Self {
            home: resolve_home()?,
        })
    }

    #[cfg(test)]
    fn with_home(home: PathBuf) -> Self {
        Self { home }
    }

    pub fn encrypted_prefix() -> &'static str {
        ENCRYPTED_PREFIX
    }

    /// Generate fresh key material. Refuses to clobber an existing key
    /// unless `overwrite` is set.
    pub fn init_key(&self, overwrite: bool) -> Result<(), SecretError> {
        self.ensure_home()?;
        if self.key_material_exists() {
            if !overwrite {
                return Err(SecretError::KeyExists);
            }
            self.remove_key_material()?;
        }

        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut key[..]);
        let mut mask = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut mask[..]);

        self.persist_key(&key, &mask)?;
        info!("Initialized secret key in {}", self.home.display());
        Ok(())
    }

    /// Seal a plaintext into the canonical `{encrypted}<base64>` token.
    pub fn seal(&self, plaintext: &str) -> Result<String, SecretError> {
        self.ensure_key()?;
        let key = self.recover_key()?;
        let cipher = Aes256Gcm::new_from_slice(&key[..])
            .map_err(|e| SecretError::Crypto(e.to_string()))?;
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|e| SecretError::Crypto(e.to_string()))?;

        let mut bundle = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        bundle.extend_from_slice(&nonce);
        bundle.extend_from_slice(&ciphertext);
        Ok(format!(
            "{}{}",
            ENCRYPTED_PREFIX,
            general_purpose::STANDARD.encode(bundle)
        ))
    }

    /// Unseal a `{encrypted}` token back to its plaintext.
    pub fn open(&self, value: &str) -> Result<String, SecretError> {
        self.ensure_key()?;
        let payload = value.strip_prefix(ENCRYPTED_PREFIX).unwrap_or(value);
        let bundle = general_purpose::STANDARD.decode(payload.trim())?;
        if bundle.len() <= NONCE_LEN {
            return Err(SecretError::Payload(
                "payload too short for nonce and ciphertext".to_string(),
            ));
        }

        let (nonce, ciphertext) = bundle.split_at(NONCE_LEN);
        let key = self.recover_key()?;
        let cipher = Aes256Gcm::new_from_slice(&key[..])
            .map_err(|e| SecretError::Crypto(e.to_string()))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| SecretError::Crypto(e.to_string()))?;
        Ok(String::from_utf8(plaintext)?)
    }

    /// Replace a sealed field with its plaintext. Returns `true` when the
    /// field was sealed.
    pub fn unseal_field(&self, field: &mut String, name: &str) -> Result<bool, SecretError> {
        if !field.starts_with(ENCRYPTED_PREFIX) {
            return Ok(false);
        }
        match self.open(field) {
            Ok(secret) => {
                *field = secret;
                telemetry().success.inc();
                info!("Unsealed encrypted value for {}", name);
                Ok(true)
            }
            Err(e) => {
                telemetry().failure.inc();
                Err(e)
            }
        }
    }

    pub fn apply_to_config(&self, config: &mut Config) -> Result<(), SecretError> {
        self.unseal_field(&mut config.credentials.password, "credentials.password")?;
        self.unseal_field(
            &mut config.credentials.client_secret,
            "credentials.client_secret",
        )?;
        Ok(())
    }

    fn persist_key(
        &self,
        key: &Zeroizing<[u8; KEY_LEN]>,
        mask: &Zeroizing<[u8; KEY_LEN]>,
    ) -> Result<(), SecretError> {
        #[cfg(unix)]
        self.check_permissions()?;

        fs::write(
            self.home.join(MASK_FILE),
            general_purpose::STANDARD.encode(&mask[..]),
        )?;

        for (idx, chunk) in key.chunks(SEGMENT_LEN).enumerate() {
            let masked: Vec<u8> = chunk
                .iter()
                .zip(&mask[idx * SEGMENT_LEN..])
                .map(|(k, m)| k ^ m)
                .collect();
            fs::write(
                self.home.join(SEGMENT_FILES[idx]),
                general_purpose::STANDARD.encode(masked),
            )?;
        }
        Ok(())
    }

    fn recover_key(&self) -> Result<Zeroizing<[u8; KEY_LEN]>, SecretError> {
        let mask_encoded = fs::read_to_string(self.home.join(MASK_FILE))?;
        let mask = general_purpose::STANDARD.decode(mask_encoded.trim())?;
        if mask.len() != KEY_LEN {
            return Err(SecretError::Payload("mask length mismatch".to_string()));
        }

        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        for (idx, file) in SEGMENT_FILES.iter().enumerate() {
            let encoded = fs::read_to_string(self.home.join(file))?;
            let segment = general_purpose::STANDARD.decode(encoded.trim())?;
            if segment.len() != SEGMENT_LEN {
                return Err(SecretError::Payload(format!(
                    "segment {} length mismatch",
                    idx + 1
                )));
            }
            for (offset, byte) in segment.iter().enumerate() {
                let pos = idx * SEGMENT_LEN + offset;
                key[pos] = byte ^ mask[pos];
            }
        }
        Ok(key)
    }

    fn ensure_home(&self) -> Result<(), SecretError> {
        if !self.home.exists() {
            fs::create_dir_all(&self.home)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&self.home, fs::Permissions::from_mode(0o700))?;
            }
        }
        #[cfg(unix)]
        self.check_permissions()?;
        Ok(())
    }

    #[cfg(unix)]
    fn check_permissions(&self) -> Result<(), SecretError> {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&self.home)?.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            return Err(SecretError::InsecurePermissions);
        }
        Ok(())
    }

    fn ensure_key(&self) -> Result<(), SecretError> {
        if !self.key_material_exists() {
            return Err(SecretError::KeyMissing);
        }
        #[cfg(unix)]
        self.check_permissions()?;
        Ok(())
    }

    fn key_material_exists(&self) -> bool {
        self.home.join(MASK_FILE).exists()
            && SEGMENT_FILES
                .iter()
                .all(|file| self.home.join(file).exists())
    }

    fn remove_key_material(&self) -> Result<(), SecretError> {
        let mask = self.home.join(MASK_FILE);
        if mask.exists() {
            fs::remove_file(mask)?;
        }
        for file in SEGMENT_FILES {
            let path = self.home.join(file);
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

fn resolve_home() -> Result<PathBuf, SecretError> {
    if let Ok(dir) = std::env::var(ENV_OVERRIDE) {
        return Ok(PathBuf::from(dir));
    }
    let home = dirs::home_dir().ok_or(SecretError::MissingHomeDir)?;
    Ok(home.join(".corridor-bridge"))
}

pub fn config_has_encrypted_values(config: &Config) -> bool {
    config.credentials.password.starts_with(ENCRYPTED_PREFIX)
        || config.credentials.client_secret.starts_with(ENCRYPTED_PREFIX)
}
