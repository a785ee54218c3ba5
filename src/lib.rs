pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod models;
pub mod services;
pub mod utils;

pub use config::{AppConfig, MIN_CONFIDENCE_SCORE};
pub use error::{ClassifierError, ConnectorError, CredentialError, MalformedRecordError, SyncError};
pub use models::{Invoice, InvoiceStatus, PushResult, SyncReport, ValidationResult};
pub use services::state::AppState;
