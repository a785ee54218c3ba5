use thiserror::Error;

/// Failures surfaced by the sync orchestrator and the manual control operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("invoice {0} not found")]
    NotFound(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("a sync is already in progress")]
    SyncInProgress,

    #[error("sync batch aborted, nothing was saved: {0}")]
    BatchAborted(String),

    #[error(transparent)]
    Credentials(#[from] CredentialError),

    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),
}

/// Transport-level failures of the Dext and Xero connectors.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("remote returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("{0} is not configured")]
    MissingCredential(&'static str),

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Credentials(#[from] CredentialError),
}

impl ConnectorError {
    pub(crate) async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        ConnectorError::Status { status, body }
    }
}

/// A raw capture record that cannot be turned into an invoice.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MalformedRecordError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("field `{field}` is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("classifier unavailable: {0}")]
    Unavailable(String),

    #[error("classifier rate limited")]
    RateLimited,

    #[error("classifier returned a malformed response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for ClassifierError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClassifierError::Unavailable("request timed out".to_string())
        } else {
            ClassifierError::Unavailable(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential store error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("vision credentials are not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("credential store lock poisoned")]
    LockPoisoned,
}

impl From<anyhow::Error> for CredentialError {
    fn from(err: anyhow::Error) -> Self {
        CredentialError::Crypto(err.to_string())
    }
}
