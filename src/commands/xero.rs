use anyhow::Result;
use serde_json::{json, Value};

use crate::services::state::AppState;
use crate::services::xero::{AuthState, RefreshOutcome};

/// Builds the consent URL with a fresh `state` value the caller should check on callback.
pub fn auth_url(state: &AppState) -> Result<Value> {
    let csrf = uuid::Uuid::new_v4().to_string();
    let url = state.sync.xero().authorization_url(&csrf)?;
    Ok(json!({ "url": url, "state": csrf }))
}

pub async fn callback(state: &AppState, code: &str) -> Result<Value> {
    let expires_at = state.sync.xero().exchange_code(code).await?;
    Ok(json!({ "authenticated": true, "expires_at": expires_at }))
}

pub async fn refresh(state: &AppState) -> Result<Value> {
    let outcome = state.sync.xero().refresh_token().await?;
    let expires_at = match state.sync.xero().auth_state()? {
        AuthState::Authenticated { expires_at } => Some(expires_at),
        AuthState::Unauthenticated => None,
    };
    Ok(json!({
        "refreshed": outcome == RefreshOutcome::Refreshed,
        "expires_at": expires_at,
    }))
}
