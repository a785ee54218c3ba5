use anyhow::{anyhow, Result};
use base64::{engine::general_purpose, Engine as _};
use ring::{aead, pbkdf2, rand::{SecureRandom, SystemRandom}};
use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use std::num::NonZeroU32;
use tracing::{info, warn};

const KEY_SALT: &[u8] = b"dexero-credentials-v1";
const PBKDF2_ITERATIONS: u32 = 100_000;
const NONCE_LEN: usize = 12;
const PREFIX: &str = "enc";
const KEYCHAIN_SERVICE: &str = "dexero";
const KEYCHAIN_ACCOUNT: &str = "encryption_key";

/// AES-256-GCM cipher keyed from a master secret.
pub struct Cipher {
    key: aead::LessSafeKey,
    rng: SystemRandom,
}

impl Cipher {
    pub fn new(secret: &str) -> Result<Self> {
        if secret.trim().is_empty() {
            return Err(anyhow!("Encryption secret is empty"));
        }
        Ok(Cipher {
            key: derive_key(secret.as_bytes())?,
            rng: SystemRandom::new(),
        })
    }

    /// Uses the configured secret, or the one kept in the OS keychain (created on first use).
    pub fn from_config(configured: Option<&str>) -> Result<Self> {
        if let Some(secret) = configured.filter(|s| !s.trim().is_empty()) {
            return Self::new(secret);
        }
        let secret = load_or_create_keychain_secret()?;
        Self::new(&secret)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| anyhow!("Failed to generate nonce"))?;

        let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);
        let mut in_out = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(nonce, aead::Aad::empty(), &mut in_out)
            .map_err(|_| anyhow!("Encryption failed"))?;

        Ok(format!(
            "{}:{}:{}",
            PREFIX,
            general_purpose::STANDARD.encode(nonce_bytes),
            general_purpose::STANDARD.encode(in_out)
        ))
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<String> {
        let parts: Vec<&str> = ciphertext.split(':').collect();
        if parts.len() != 3 || parts[0] != PREFIX {
            return Err(anyhow!("Invalid encrypted payload"));
        }
        let nonce_bytes = general_purpose::STANDARD
            .decode(parts[1])
            .map_err(|e| anyhow!("Decode nonce: {}", e))?;
        let mut data = general_purpose::STANDARD
            .decode(parts[2])
            .map_err(|e| anyhow!("Decode ciphertext: {}", e))?;

        let nonce = aead::Nonce::assume_unique_for_key(
            nonce_bytes
                .as_slice()
                .try_into()
                .map_err(|_| anyhow!("Invalid nonce length"))?,
        );

        let decrypted = self
            .key
            .open_in_place(nonce, aead::Aad::empty(), &mut data)
            .map_err(|_| anyhow!("Decryption failed"))?;
        Ok(String::from_utf8(decrypted.to_vec())?)
    }
}

/// A secret whose stored form is always ciphertext. Only [`Sealed::reveal`] yields plaintext.
#[derive(Clone, PartialEq, Eq)]
pub struct Sealed(String);

impl Sealed {
    pub fn seal(cipher: &Cipher, plaintext: &str) -> Result<Self> {
        Ok(Sealed(cipher.encrypt(plaintext)?))
    }

    pub fn reveal(&self, cipher: &Cipher) -> Result<String> {
        cipher.decrypt(&self.0)
    }

    pub fn ciphertext(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Sealed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Sealed(***)")
    }
}

impl ToSql for Sealed {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0.as_str()))
    }
}

impl FromSql for Sealed {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_str().map(|raw| Sealed(raw.to_string()))
    }
}

fn load_or_create_keychain_secret() -> Result<String> {
    let entry = keyring::Entry::new(KEYCHAIN_SERVICE, KEYCHAIN_ACCOUNT)
        .map_err(|e| anyhow!("Keychain error: {}", e))?;
    match entry.get_password() {
        Ok(secret) => Ok(secret),
        Err(keyring::Error::NoEntry) => {
            let rng = SystemRandom::new();
            let mut bytes = [0u8; 32];
            rng.fill(&mut bytes)
                .map_err(|_| anyhow!("Failed to generate encryption key"))?;
            let secret = general_purpose::STANDARD.encode(bytes);
            entry
                .set_password(&secret)
                .map_err(|e| anyhow!("Keychain store error: {}", e))?;
            info!("generated a new credential encryption key in the OS keychain");
            Ok(secret)
        }
        Err(e) => {
            warn!(error = %e, "keychain unavailable; set ENCRYPTION_KEY instead");
            Err(anyhow!("Keychain fetch error: {}", e))
        }
    }
}

fn derive_key(secret: &[u8]) -> Result<aead::LessSafeKey> {
    let mut key_bytes = [0u8; 32];
    let iterations = NonZeroU32::new(PBKDF2_ITERATIONS).ok_or_else(|| anyhow!("Invalid iterations"))?;
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        KEY_SALT,
        secret,
        &mut key_bytes,
    );
    let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, &key_bytes)
        .map_err(|_| anyhow!("Invalid key material"))?;
    Ok(aead::LessSafeKey::new(unbound))
}
