use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::XeroConfig;
use crate::error::ConnectorError;
use crate::models::{Credentials, Invoice, PushResult, TokenSet};
use crate::services::credentials::CredentialStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticated { expires_at: DateTime<Utc> },
}

impl AuthState {
    pub fn from_credentials(credentials: &Credentials, now: DateTime<Utc>) -> Self {
        match (&credentials.xero_access_token, credentials.xero_token_expires_at) {
            (Some(_), Some(expires_at)) if now < expires_at => AuthState::Authenticated { expires_at },
            _ => AuthState::Unauthenticated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    StillValid,
    Refreshed,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct XeroInvoice {
    #[serde(rename = "Type")]
    pub invoice_type: String,
    pub contact: XeroContact,
    pub line_items: Vec<XeroLineItem>,
    pub date: String,
    pub due_date: String,
    pub reference: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct XeroContact {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct XeroLineItem {
    pub description: String,
    pub quantity: f64,
    pub unit_amount: f64,
    pub account_code: String,
}

/// Accounting-ledger client. Owns the OAuth token lifecycle; at most one refresh runs at a time.
pub struct XeroClient {
    http: reqwest::Client,
    config: XeroConfig,
    credentials: CredentialStore,
    refresh_lock: Mutex<()>,
}

impl XeroClient {
    pub fn new(config: XeroConfig, credentials: CredentialStore) -> Result<Self, ConnectorError> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(XeroClient {
            http,
            config,
            credentials,
            refresh_lock: Mutex::new(()),
        })
    }

    pub fn auth_state(&self) -> Result<AuthState, ConnectorError> {
        Ok(AuthState::from_credentials(&self.credentials.load()?, Utc::now()))
    }

    /// Browser URL that starts the authorization-code flow.
    pub fn authorization_url(&self, state: &str) -> Result<String, ConnectorError> {
        let client_id = self
            .credentials
            .load()?
            .xero_client_id
            .ok_or(ConnectorError::MissingCredential("Xero client ID"))?;
        let url = reqwest::Url::parse_with_params(
            &self.config.authorize_url,
            &[
                ("response_type", "code"),
                ("client_id", client_id.as_str()),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("scope", self.config.scope.as_str()),
                ("state", state),
            ],
        )
        .map_err(|e| ConnectorError::Config(format!("authorize url: {e}")))?;
        Ok(url.to_string())
    }

    /// Exchanges the code from the redirect callback and stores the resulting tokens.
    pub async fn exchange_code(&self, code: &str) -> Result<DateTime<Utc>, ConnectorError> {
        let _guard = self.refresh_lock.lock().await;
        let credentials = self.credentials.load()?;
        let tokens = self
            .request_tokens(
                &credentials,
                &[
                    ("grant_type", "authorization_code"),
                    ("code", code),
                    ("redirect_uri", self.config.redirect_uri.as_str()),
                ],
            )
            .await?;
        self.credentials.store_tokens(&tokens)?;
        info!(expires_at = %tokens.expires_at, "Xero authorization completed");
        Ok(tokens.expires_at)
    }

    /// Refreshes the access token unless the current one is still valid.
    pub async fn refresh_token(&self) -> Result<RefreshOutcome, ConnectorError> {
        let _guard = self.refresh_lock.lock().await;
        let credentials = self.credentials.load()?;
        if let AuthState::Authenticated { .. } = AuthState::from_credentials(&credentials, Utc::now()) {
            debug!("Xero token still valid, skipping refresh");
            return Ok(RefreshOutcome::StillValid);
        }

        let refresh_token = credentials
            .xero_refresh_token
            .clone()
            .ok_or(ConnectorError::MissingCredential("Xero refresh token"))?;
        let tokens = self
            .request_tokens(
                &credentials,
                &[("grant_type", "refresh_token"), ("refresh_token", refresh_token.as_str())],
            )
            .await?;
        self.credentials.store_tokens(&tokens)?;
        info!(expires_at = %tokens.expires_at, "refreshed Xero access token");
        Ok(RefreshOutcome::Refreshed)
    }

    /// Current access token, refreshing first when it is absent or expired.
    pub async fn access_token(&self) -> Result<String, ConnectorError> {
        let credentials = self.credentials.load()?;
        if let (AuthState::Authenticated { .. }, Some(token)) = (
            AuthState::from_credentials(&credentials, Utc::now()),
            credentials.xero_access_token.clone(),
        ) {
            return Ok(token);
        }

        self.refresh_token().await?;
        self.credentials
            .load()?
            .xero_access_token
            .ok_or(ConnectorError::MissingCredential("Xero access token"))
    }

    /// Posts an invoice as a bill. Every failure is folded into [`PushResult::Failed`].
    pub async fn push_invoice(&self, invoice: &Invoice) -> PushResult {
        match self.try_push_invoice(invoice).await {
            Ok(ledger_id) => {
                info!(source_id = %invoice.source_id, ledger_id = %ledger_id, "pushed invoice to Xero");
                PushResult::Pushed { ledger_id }
            }
            Err(err) => {
                warn!(source_id = %invoice.source_id, error = %err, "pushing invoice to Xero failed");
                PushResult::Failed { error: err.to_string() }
            }
        }
    }

    async fn try_push_invoice(&self, invoice: &Invoice) -> Result<String, ConnectorError> {
        let token = self.access_token().await?;
        let payload = self.build_invoice(invoice);
        let response = self
            .authorized(self.http.post(format!("{}/Invoices", self.api_url())), &token)
            .json(&payload)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ConnectorError::from_response(response).await);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ConnectorError::Decode(format!("invoice response: {e}")))?;
        body.get("InvoiceID")
            .or_else(|| body.pointer("/Invoices/0/InvoiceID"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ConnectorError::Decode("response has no InvoiceID".to_string()))
    }

    /// True iff a bank transaction carries this invoice's reference. False on any failure.
    pub async fn verify_bank_transaction(&self, invoice: &Invoice) -> bool {
        match self.try_verify_bank_transaction(invoice).await {
            Ok(found) => found,
            Err(err) => {
                warn!(source_id = %invoice.source_id, error = %err, "bank transaction verification failed");
                false
            }
        }
    }

    async fn try_verify_bank_transaction(&self, invoice: &Invoice) -> Result<bool, ConnectorError> {
        let token = self.access_token().await?;
        let filter = format!("Reference==\"{}\"", self.reference(invoice));
        let response = self
            .authorized(self.http.get(format!("{}/BankTransactions", self.api_url())), &token)
            .query(&[("where", filter.as_str())])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ConnectorError::from_response(response).await);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ConnectorError::Decode(format!("bank transactions: {e}")))?;
        Ok(body
            .get("BankTransactions")
            .and_then(Value::as_array)
            .map(|transactions| !transactions.is_empty())
            .unwrap_or(false))
    }

    pub fn build_invoice(&self, invoice: &Invoice) -> XeroInvoice {
        let due_date = invoice.invoice_date + Duration::days(self.config.payment_terms_days);
        XeroInvoice {
            invoice_type: "ACCPAY".to_string(),
            contact: XeroContact {
                name: invoice.supplier_name.clone(),
            },
            line_items: vec![XeroLineItem {
                description: self.config.line_description.clone(),
                quantity: 1.0,
                unit_amount: invoice.amount,
                account_code: self.config.account_code.clone(),
            }],
            date: invoice.invoice_date.format("%Y-%m-%d").to_string(),
            due_date: due_date.format("%Y-%m-%d").to_string(),
            reference: self.reference(invoice),
            status: "AUTHORISED".to_string(),
        }
    }

    pub fn reference(&self, invoice: &Invoice) -> String {
        format!("{}-{}", self.config.reference_prefix, invoice.source_id)
    }

    fn api_url(&self) -> &str {
        self.config.api_url.trim_end_matches('/')
    }

    fn authorized(&self, builder: reqwest::RequestBuilder, token: &str) -> reqwest::RequestBuilder {
        let builder = builder.bearer_auth(token).header("Accept", "application/json");
        match &self.config.tenant_id {
            Some(tenant) => builder.header("xero-tenant-id", tenant),
            None => builder,
        }
    }

    async fn request_tokens(
        &self,
        credentials: &Credentials,
        form: &[(&str, &str)],
    ) -> Result<TokenSet, ConnectorError> {
        let client_id = credentials
            .xero_client_id
            .as_deref()
            .ok_or(ConnectorError::MissingCredential("Xero client ID"))?;
        let client_secret = credentials
            .xero_client_secret
            .as_deref()
            .ok_or(ConnectorError::MissingCredential("Xero client secret"))?;

        let response = self
            .http
            .post(&self.config.token_url)
            .basic_auth(client_id, Some(client_secret))
            .form(form)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ConnectorError::from_response(response).await);
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| ConnectorError::Decode(format!("token response: {e}")))?;
        let expires_at = expiry_after(Utc::now(), body.expires_in)?;
        Ok(TokenSet {
            access_token: body.access_token,
            refresh_token: body.refresh_token,
            expires_at,
        })
    }
}

/// Expiry for a token issued at `now` with the server-reported lifetime in seconds.
fn expiry_after(now: DateTime<Utc>, expires_in: i64) -> Result<DateTime<Utc>, ConnectorError> {
    if expires_in <= 0 {
        return Err(ConnectorError::Decode(format!("token expires_in must be positive, got {expires_in}")));
    }
    Duration::try_seconds(expires_in)
        .and_then(|ttl| now.checked_add_signed(ttl))
        .ok_or_else(|| ConnectorError::Decode(format!("token expires_in out of range: {expires_in}")))
}
