use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// A raw record as delivered by the capture service, before normalization.
pub type RawInvoiceRecord = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Pending,
    Validated,
    Pushed,
    Error,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Validated => "validated",
            InvoiceStatus::Pushed => "pushed",
            InvoiceStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(InvoiceStatus::Pending),
            "validated" => Some(InvoiceStatus::Validated),
            "pushed" => Some(InvoiceStatus::Pushed),
            "error" => Some(InvoiceStatus::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for InvoiceStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for InvoiceStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        InvoiceStatus::parse(raw).ok_or_else(|| FromSqlError::Other(format!("unknown status {raw}").into()))
    }
}

/// Error slot of an invoice: either the validator's messages or the ledger's rejection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InvoiceErrors {
    Validation(Vec<String>),
    Ledger {
        #[serde(rename = "ledgerError")]
        ledger_error: String,
    },
}

impl InvoiceErrors {
    pub fn is_empty(&self) -> bool {
        match self {
            InvoiceErrors::Validation(errors) => errors.is_empty(),
            InvoiceErrors::Ledger { ledger_error } => ledger_error.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub source_id: String,
    pub supplier_name: String,
    pub tax_number: Option<String>,
    pub tax_code: Option<String>,
    pub amount: f64,
    pub invoice_date: NaiveDate,
    pub status: InvoiceStatus,
    pub confidence_score: f64,
    pub validation_errors: Option<InvoiceErrors>,
    pub ledger_id: Option<String>,
    pub source_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Invoice {
    /// Records a validation outcome. A failed outcome moves the invoice to ERROR.
    pub fn apply_validation(&mut self, result: &ValidationResult) {
        self.confidence_score = result.confidence_score;
        if result.is_valid {
            self.status = InvoiceStatus::Validated;
            self.validation_errors = None;
        } else {
            self.status = InvoiceStatus::Error;
            let mut errors = result.errors.clone();
            if errors.is_empty() {
                errors.push(format!(
                    "Confidence score {:.2} is below the required threshold",
                    result.confidence_score
                ));
            }
            self.validation_errors = Some(InvoiceErrors::Validation(errors));
        }
        self.touch();
    }

    /// Records a push outcome; the ledger error replaces any earlier messages.
    pub fn apply_push(&mut self, result: &PushResult) {
        match result {
            PushResult::Pushed { ledger_id } => {
                self.ledger_id = Some(ledger_id.clone());
                self.status = InvoiceStatus::Pushed;
            }
            PushResult::Failed { error } => {
                self.status = InvoiceStatus::Error;
                let ledger_error = if error.is_empty() {
                    "unknown ledger error".to_string()
                } else {
                    error.clone()
                };
                self.validation_errors = Some(InvoiceErrors::Ledger { ledger_error });
            }
        }
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub confidence_score: f64,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn faulted(message: impl std::fmt::Display) -> Self {
        ValidationResult {
            is_valid: false,
            confidence_score: 0.0,
            errors: vec![format!("Validation error: {message}")],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PushResult {
    Pushed { ledger_id: String },
    Failed { error: String },
}

impl PushResult {
    pub fn is_success(&self) -> bool {
        matches!(self, PushResult::Pushed { .. })
    }
}

/// Inclusive date window for fetching and listing invoices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvoiceFilter {
    pub status: Option<InvoiceStatus>,
    pub range: DateRange,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MalformedEntry {
    pub position: usize,
    pub source_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    pub fetched: usize,
    pub created: usize,
    pub skipped_duplicates: usize,
    pub pushed: usize,
    pub rejected: usize,
    pub push_failed: usize,
    pub malformed: Vec<MalformedEntry>,
    pub fetch_error: Option<String>,
}

/// Decrypted view of the singleton credentials record.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    pub dext_api_key: Option<String>,
    pub xero_client_id: Option<String>,
    pub xero_client_secret: Option<String>,
    pub xero_access_token: Option<String>,
    pub xero_refresh_token: Option<String>,
    pub xero_token_expires_at: Option<DateTime<Utc>>,
    pub openai_api_key: Option<String>,
    pub vision_credentials: Option<serde_json::Value>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("dext_api_key", &self.dext_api_key.as_ref().map(|_| "***"))
            .field("xero_client_id", &self.xero_client_id)
            .field("xero_client_secret", &self.xero_client_secret.as_ref().map(|_| "***"))
            .field("xero_access_token", &self.xero_access_token.as_ref().map(|_| "***"))
            .field("xero_refresh_token", &self.xero_refresh_token.as_ref().map(|_| "***"))
            .field("xero_token_expires_at", &self.xero_token_expires_at)
            .field("openai_api_key", &self.openai_api_key.as_ref().map(|_| "***"))
            .field("vision_credentials", &self.vision_credentials.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Partial update; `None` fields are left untouched.
#[derive(Clone, Default, Deserialize)]
pub struct CredentialsUpdate {
    pub dext_api_key: Option<String>,
    pub xero_client_id: Option<String>,
    pub xero_client_secret: Option<String>,
    pub openai_api_key: Option<String>,
    /// Raw JSON text, rejected if it does not parse.
    pub vision_credentials: Option<String>,
}

impl CredentialsUpdate {
    pub fn is_empty(&self) -> bool {
        [
            &self.dext_api_key,
            &self.xero_client_id,
            &self.xero_client_secret,
            &self.openai_api_key,
            &self.vision_credentials,
        ]
        .iter()
        .all(|field| field.as_deref().map_or(true, |v| v.trim().is_empty()))
    }
}

/// Tokens returned by the ledger's identity endpoint, ready to persist.
#[derive(Clone)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"***")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "***"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}
