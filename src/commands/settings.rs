use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{Credentials, CredentialsUpdate};
use crate::services::state::AppState;
use crate::utils::mask_secret;

/// Credentials as shown to an operator: secrets masked, token state visible.
#[derive(Debug, Serialize)]
pub struct SettingsView {
    pub dext_api_key: Option<String>,
    pub xero_client_id: Option<String>,
    pub xero_client_secret: Option<String>,
    pub xero_connected: bool,
    pub xero_token_expires_at: Option<DateTime<Utc>>,
    pub openai_api_key: Option<String>,
    pub vision_credentials_configured: bool,
}

impl SettingsView {
    fn from_credentials(credentials: &Credentials) -> Self {
        let mask = |value: &Option<String>| value.as_deref().map(mask_secret);
        SettingsView {
            dext_api_key: mask(&credentials.dext_api_key),
            xero_client_id: credentials.xero_client_id.clone(),
            xero_client_secret: mask(&credentials.xero_client_secret),
            xero_connected: credentials.xero_access_token.is_some(),
            xero_token_expires_at: credentials.xero_token_expires_at,
            openai_api_key: mask(&credentials.openai_api_key),
            vision_credentials_configured: credentials.vision_credentials.is_some(),
        }
    }
}

pub fn get_settings(state: &AppState) -> Result<SettingsView> {
    let credentials = state.credentials.load()?;
    Ok(SettingsView::from_credentials(&credentials))
}

pub fn save_settings(state: &AppState, update: CredentialsUpdate) -> Result<SettingsView> {
    state.credentials.update(update)?;
    get_settings(state)
}
