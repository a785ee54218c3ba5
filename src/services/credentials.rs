use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::config::SeedSecrets;
use crate::db::{Database, StoredCredentials};
use crate::error::CredentialError;
use crate::models::{Credentials, CredentialsUpdate, TokenSet};
use crate::services::crypto::{Cipher, Sealed};

/// Encrypting facade over the singleton credentials row.
#[derive(Clone)]
pub struct CredentialStore {
    db: Arc<Mutex<Database>>,
    cipher: Arc<Cipher>,
}

impl CredentialStore {
    pub fn new(db: Arc<Mutex<Database>>, cipher: Arc<Cipher>) -> Self {
        CredentialStore { db, cipher }
    }

    pub fn load(&self) -> Result<Credentials, CredentialError> {
        let stored = {
            let db = self.db.lock().map_err(|_| CredentialError::LockPoisoned)?;
            db.get_or_create_credentials()?
        };

        let vision_credentials = match self.reveal(&stored.vision_credentials)? {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        };

        Ok(Credentials {
            dext_api_key: self.reveal(&stored.dext_api_key)?,
            xero_client_id: self.reveal(&stored.xero_client_id)?,
            xero_client_secret: self.reveal(&stored.xero_client_secret)?,
            xero_access_token: self.reveal(&stored.xero_access_token)?,
            xero_refresh_token: self.reveal(&stored.xero_refresh_token)?,
            xero_token_expires_at: stored.xero_token_expires_at,
            openai_api_key: self.reveal(&stored.openai_api_key)?,
            vision_credentials,
        })
    }

    /// Applies a partial update. Blank values are ignored, as are absent ones.
    pub fn update(&self, update: CredentialsUpdate) -> Result<(), CredentialError> {
        let vision = match non_blank(update.vision_credentials) {
            Some(raw) => {
                let parsed: serde_json::Value = serde_json::from_str(&raw)?;
                Some(parsed.to_string())
            }
            None => None,
        };

        self.modify(|stored, cipher| {
            overwrite(&mut stored.dext_api_key, update.dext_api_key, cipher)?;
            overwrite(&mut stored.xero_client_id, update.xero_client_id, cipher)?;
            overwrite(&mut stored.xero_client_secret, update.xero_client_secret, cipher)?;
            overwrite(&mut stored.openai_api_key, update.openai_api_key, cipher)?;
            overwrite(&mut stored.vision_credentials, vision, cipher)?;
            Ok(())
        })?;
        info!("credentials updated");
        Ok(())
    }

    /// Persists a token pair. A missing refresh token keeps the one already stored.
    pub fn store_tokens(&self, tokens: &TokenSet) -> Result<(), CredentialError> {
        self.modify(|stored, cipher| {
            stored.xero_access_token = Some(Sealed::seal(cipher, &tokens.access_token)?);
            if let Some(refresh) = &tokens.refresh_token {
                stored.xero_refresh_token = Some(Sealed::seal(cipher, refresh)?);
            }
            stored.xero_token_expires_at = Some(tokens.expires_at);
            Ok(())
        })?;
        debug!(expires_at = %tokens.expires_at, "stored ledger tokens");
        Ok(())
    }

    /// Fills empty fields from environment-provided secrets; never overwrites stored ones.
    pub fn seed(&self, seed: &SeedSecrets) -> Result<(), CredentialError> {
        self.modify(|stored, cipher| {
            fill_empty(&mut stored.dext_api_key, seed.dext_api_key.as_deref(), cipher)?;
            fill_empty(&mut stored.xero_client_id, seed.xero_client_id.as_deref(), cipher)?;
            fill_empty(&mut stored.xero_client_secret, seed.xero_client_secret.as_deref(), cipher)?;
            fill_empty(&mut stored.openai_api_key, seed.openai_api_key.as_deref(), cipher)?;
            Ok(())
        })
    }

    fn modify<F>(&self, apply: F) -> Result<(), CredentialError>
    where
        F: FnOnce(&mut StoredCredentials, &Cipher) -> Result<(), CredentialError>,
    {
        let db = self.db.lock().map_err(|_| CredentialError::LockPoisoned)?;
        let mut stored = db.get_or_create_credentials()?;
        apply(&mut stored, &self.cipher)?;
        db.save_credentials(&stored)?;
        Ok(())
    }

    fn reveal(&self, sealed: &Option<Sealed>) -> Result<Option<String>, CredentialError> {
        sealed
            .as_ref()
            .map(|value| value.reveal(&self.cipher))
            .transpose()
            .map_err(CredentialError::from)
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn overwrite(slot: &mut Option<Sealed>, value: Option<String>, cipher: &Cipher) -> Result<(), CredentialError> {
    if let Some(plaintext) = non_blank(value) {
        *slot = Some(Sealed::seal(cipher, plaintext.trim())?);
    }
    Ok(())
}

fn fill_empty(slot: &mut Option<Sealed>, value: Option<&str>, cipher: &Cipher) -> Result<(), CredentialError> {
    if slot.is_none() {
        if let Some(plaintext) = value.filter(|v| !v.trim().is_empty()) {
            *slot = Some(Sealed::seal(cipher, plaintext.trim())?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn store() -> (CredentialStore, Arc<Mutex<Database>>) {
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let cipher = Arc::new(Cipher::new("test-secret").unwrap());
        (CredentialStore::new(db.clone(), cipher), db)
    }

    #[test]
    fn first_load_is_empty() {
        let (store, _) = store();
        let credentials = store.load().unwrap();
        assert!(credentials.dext_api_key.is_none());
        assert!(credentials.vision_credentials.is_none());
    }

    #[test]
    fn partial_update_keeps_other_fields_and_encrypts_at_rest() {
        let (store, db) = store();
        store
            .update(CredentialsUpdate {
                dext_api_key: Some("dext-key".to_string()),
                xero_client_id: Some("client-id".to_string()),
                ..Default::default()
            })
            .unwrap();
        store
            .update(CredentialsUpdate {
                openai_api_key: Some("sk-test".to_string()),
                xero_client_id: Some("   ".to_string()),
                ..Default::default()
            })
            .unwrap();

        let credentials = store.load().unwrap();
        assert_eq!(credentials.dext_api_key.as_deref(), Some("dext-key"));
        assert_eq!(credentials.xero_client_id.as_deref(), Some("client-id"));
        assert_eq!(credentials.openai_api_key.as_deref(), Some("sk-test"));

        let raw = db.lock().unwrap().raw_credential_column("dext_api_key").unwrap().unwrap();
        assert!(raw.starts_with("enc:"));
        assert!(!raw.contains("dext-key"));
    }

    #[test]
    fn invalid_vision_json_is_rejected_without_writing() {
        let (store, _) = store();
        let result = store.update(CredentialsUpdate {
            dext_api_key: Some("dext-key".to_string()),
            vision_credentials: Some("{not json".to_string()),
            ..Default::default()
        });
        assert!(matches!(result, Err(CredentialError::InvalidJson(_))));
        assert!(store.load().unwrap().dext_api_key.is_none());

        store
            .update(CredentialsUpdate {
                vision_credentials: Some(r#"{"type":"service_account"}"#.to_string()),
                ..Default::default()
            })
            .unwrap();
        let vision = store.load().unwrap().vision_credentials.unwrap();
        assert_eq!(vision["type"], "service_account");
    }

    #[test]
    fn token_rotation_keeps_existing_refresh_token() {
        let (store, _) = store();
        let expires_at = Utc::now() + Duration::hours(1);
        store
            .store_tokens(&TokenSet {
                access_token: "access-1".to_string(),
                refresh_token: Some("refresh-1".to_string()),
                expires_at,
            })
            .unwrap();
        store
            .store_tokens(&TokenSet {
                access_token: "access-2".to_string(),
                refresh_token: None,
                expires_at,
            })
            .unwrap();

        let credentials = store.load().unwrap();
        assert_eq!(credentials.xero_access_token.as_deref(), Some("access-2"));
        assert_eq!(credentials.xero_refresh_token.as_deref(), Some("refresh-1"));
        assert_eq!(credentials.xero_token_expires_at, Some(expires_at));
    }

    #[test]
    fn seed_only_fills_missing_values() {
        let (store, _) = store();
        store
            .update(CredentialsUpdate {
                dext_api_key: Some("stored".to_string()),
                ..Default::default()
            })
            .unwrap();
        store
            .seed(&SeedSecrets {
                dext_api_key: Some("from-env".to_string()),
                openai_api_key: Some("sk-env".to_string()),
                ..Default::default()
            })
            .unwrap();

        let credentials = store.load().unwrap();
        assert_eq!(credentials.dext_api_key.as_deref(), Some("stored"));
        assert_eq!(credentials.openai_api_key.as_deref(), Some("sk-env"));
    }
}
