use anyhow::{anyhow, Context, Result};
use std::sync::{Arc, Mutex};

use crate::config::AppConfig;
use crate::db::Database;
use crate::services::credentials::CredentialStore;
use crate::services::crypto::Cipher;
use crate::services::dext::DextClient;
use crate::services::openai::OpenAiTaxCodeClassifier;
use crate::services::sync::SyncService;
use crate::services::validator::Validator;
use crate::services::xero::XeroClient;

/// Everything a command needs, wired once at startup.
pub struct AppState {
    pub db: Arc<Mutex<Database>>,
    pub credentials: CredentialStore,
    pub sync: SyncService,
}

impl AppState {
    pub fn open(config: &AppConfig) -> Result<Self> {
        if let Some(parent) = config.database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let db = Database::new(&config.database_path)
            .with_context(|| format!("opening {}", config.database_path.display()))?;
        let cipher = Cipher::from_config(config.encryption_key.as_deref())?;
        Self::build(config, db, cipher)
    }

    pub fn build(config: &AppConfig, db: Database, cipher: Cipher) -> Result<Self> {
        let db = Arc::new(Mutex::new(db));
        let credentials = CredentialStore::new(db.clone(), Arc::new(cipher));
        credentials.seed(&config.seed)?;

        let classifier = OpenAiTaxCodeClassifier::new(&config.validator, credentials.clone())?;
        let validator = Validator::new(&config.validator, Arc::new(classifier))
            .map_err(|e| anyhow!("VAT number pattern: {}", e))?;
        let dext = DextClient::new(&config.dext, credentials.clone())?;
        let xero = XeroClient::new(config.xero.clone(), credentials.clone())?;

        Ok(AppState {
            sync: SyncService::new(db.clone(), dext, validator, xero),
            db,
            credentials,
        })
    }
}
