use anyhow::{anyhow, Result};
use serde_json::{json, Value};

use crate::error::SyncError;
use crate::models::{DateRange, Invoice, InvoiceFilter, PushResult, SyncReport, ValidationResult};
use crate::services::state::AppState;

pub async fn sync(state: &AppState, range: DateRange) -> Result<SyncReport> {
    Ok(state.sync.sync_batch(range).await?)
}

pub fn list(state: &AppState, filter: &InvoiceFilter) -> Result<Vec<Invoice>> {
    Ok(state.sync.list_invoices(filter)?)
}

pub fn show(state: &AppState, id: &str) -> Result<Invoice> {
    state
        .sync
        .get_invoice(id)?
        .ok_or_else(|| anyhow!(SyncError::NotFound(id.to_string())))
}

pub async fn validate(state: &AppState, id: &str) -> Result<ValidationResult> {
    Ok(state.sync.validate_one(id).await?)
}

pub async fn push(state: &AppState, id: &str) -> Result<PushResult> {
    Ok(state.sync.push_one(id).await?)
}

pub async fn verify(state: &AppState, id: &str) -> Result<Value> {
    let reconciled = state.sync.verify_one(id).await?;
    Ok(json!({ "id": id, "reconciled": reconciled }))
}
