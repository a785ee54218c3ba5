use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::DextConfig;
use crate::error::{ConnectorError, MalformedRecordError};
use crate::models::{DateRange, Invoice, InvoiceStatus, RawInvoiceRecord};
use crate::services::credentials::CredentialStore;
use crate::utils::{parse_decimal, parse_iso_date, sha256_json};

#[derive(Deserialize)]
struct InvoiceEnvelope {
    invoices: Vec<RawInvoiceRecord>,
}

/// Capture-service client: pulls raw invoice records and turns them into invoices.
pub struct DextClient {
    http: reqwest::Client,
    base_url: String,
    credentials: CredentialStore,
}

impl DextClient {
    pub fn new(config: &DextConfig, credentials: CredentialStore) -> Result<Self, ConnectorError> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(DextClient {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    /// Fetches records, logging and swallowing any failure as an empty feed.
    pub async fn fetch_invoices(&self, range: DateRange) -> Vec<RawInvoiceRecord> {
        match self.try_fetch_invoices(range).await {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "fetching invoices from Dext failed");
                Vec::new()
            }
        }
    }

    pub async fn try_fetch_invoices(&self, range: DateRange) -> Result<Vec<RawInvoiceRecord>, ConnectorError> {
        let api_key = self.api_key()?;
        let mut query = Vec::new();
        if let Some(start) = range.start {
            query.push(("start_date", start.format("%Y-%m-%d").to_string()));
        }
        if let Some(end) = range.end {
            query.push(("end_date", end.format("%Y-%m-%d").to_string()));
        }

        let response = self
            .http
            .get(format!("{}/invoices", self.base_url))
            .bearer_auth(api_key)
            .query(&query)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ConnectorError::from_response(response).await);
        }

        let envelope: InvoiceEnvelope = response
            .json()
            .await
            .map_err(|e| ConnectorError::Decode(format!("invoice envelope: {e}")))?;
        debug!(count = envelope.invoices.len(), "fetched invoices from Dext");
        Ok(envelope.invoices)
    }

    /// Fetches one record by its Dext id; `None` on any failure.
    pub async fn get_invoice_details(&self, source_id: &str) -> Option<RawInvoiceRecord> {
        let result: Result<RawInvoiceRecord, ConnectorError> = async {
            let api_key = self.api_key()?;
            let response = self
                .http
                .get(format!("{}/invoices/{}", self.base_url, source_id))
                .bearer_auth(api_key)
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(ConnectorError::from_response(response).await);
            }
            response
                .json()
                .await
                .map_err(|e| ConnectorError::Decode(format!("invoice details: {e}")))
        }
        .await;

        match result {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(source_id, error = %err, "fetching invoice details from Dext failed");
                None
            }
        }
    }

    fn api_key(&self) -> Result<String, ConnectorError> {
        self.credentials
            .load()?
            .dext_api_key
            .ok_or(ConnectorError::MissingCredential("Dext API key"))
    }
}

/// Maps a raw capture record onto a fresh PENDING invoice.
pub fn normalize(raw: &RawInvoiceRecord) -> Result<Invoice, MalformedRecordError> {
    let source_id = match raw.get("id") {
        Some(Value::String(id)) if !id.trim().is_empty() => id.trim().to_string(),
        Some(Value::Number(id)) => id.to_string(),
        Some(Value::String(_)) | Some(Value::Null) | None => return Err(MalformedRecordError::MissingField("id")),
        Some(other) => {
            return Err(MalformedRecordError::InvalidField {
                field: "id",
                reason: format!("expected string or number, got {other}"),
            })
        }
    };

    let supplier_name = required_str(raw, "supplier_name")?;

    let amount_value = present(raw, "amount").ok_or(MalformedRecordError::MissingField("amount"))?;
    let amount = parse_decimal(amount_value).ok_or_else(|| MalformedRecordError::InvalidField {
        field: "amount",
        reason: format!("not a decimal: {amount_value}"),
    })?;

    let raw_date = required_str(raw, "date")?;
    let invoice_date = parse_iso_date(&raw_date).ok_or_else(|| MalformedRecordError::InvalidField {
        field: "date",
        reason: format!("not an ISO-8601 date: {raw_date}"),
    })?;

    let now = Utc::now();
    Ok(Invoice {
        id: uuid::Uuid::new_v4().to_string(),
        source_id,
        supplier_name,
        tax_number: optional_str(raw, "vat_number"),
        tax_code: optional_str(raw, "vat_code"),
        amount,
        invoice_date,
        status: InvoiceStatus::Pending,
        confidence_score: 0.0,
        validation_errors: None,
        ledger_id: None,
        source_hash: sha256_json(&Value::Object(raw.clone())),
        created_at: now,
        updated_at: now,
    })
}

fn present<'a>(raw: &'a RawInvoiceRecord, field: &str) -> Option<&'a Value> {
    raw.get(field).filter(|v| !v.is_null())
}

fn required_str(raw: &RawInvoiceRecord, field: &'static str) -> Result<String, MalformedRecordError> {
    match present(raw, field) {
        Some(Value::String(value)) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        Some(Value::String(_)) | None => Err(MalformedRecordError::MissingField(field)),
        Some(other) => Err(MalformedRecordError::InvalidField {
            field,
            reason: format!("expected a string, got {other}"),
        }),
    }
}

fn optional_str(raw: &RawInvoiceRecord, field: &str) -> Option<String> {
    match present(raw, field)? {
        Value::String(value) => Some(value.trim().to_string()).filter(|v| !v.is_empty()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::CredentialsUpdate;
    use crate::services::crypto::Cipher;
    use chrono::NaiveDate;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record(value: Value) -> RawInvoiceRecord {
        value.as_object().cloned().unwrap()
    }

    fn client(base_url: &str, api_key: Option<&str>) -> DextClient {
        client_with_timeout(base_url, api_key, Duration::from_secs(5))
    }

    fn client_with_timeout(base_url: &str, api_key: Option<&str>, timeout: Duration) -> DextClient {
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let store = CredentialStore::new(db, Arc::new(Cipher::new("test-secret").unwrap()));
        store
            .update(CredentialsUpdate {
                dext_api_key: api_key.map(str::to_string),
                ..Default::default()
            })
            .unwrap();
        let config = DextConfig { base_url: base_url.to_string(), timeout };
        DextClient::new(&config, store).unwrap()
    }

    #[test]
    fn normalizes_a_complete_record() {
        let invoice = normalize(&record(json!({
            "id": "dx-100",
            "supplier_name": "Acme Ltd",
            "vat_number": "GB123456789",
            "vat_code": "INPUT2",
            "amount": "150.00",
            "date": "2024-03-15T09:00:00"
        })))
        .unwrap();

        assert_eq!(invoice.source_id, "dx-100");
        assert_eq!(invoice.amount, 150.0);
        assert_eq!(invoice.invoice_date, NaiveDate::from_ymd_opt(2024, 3, 15).unwrap());
        assert_eq!(invoice.status, InvoiceStatus::Pending);
        assert_eq!(invoice.tax_number.as_deref(), Some("GB123456789"));
        assert_eq!(invoice.confidence_score, 0.0);
    }

    #[test]
    fn numeric_ids_and_missing_optional_fields_are_accepted() {
        let invoice = normalize(&record(json!({
            "id": 42,
            "supplier_name": "Acme Ltd",
            "amount": 10,
            "date": "2024-03-15"
        })))
        .unwrap();
        assert_eq!(invoice.source_id, "42");
        assert!(invoice.tax_number.is_none());
        assert!(invoice.tax_code.is_none());
    }

    #[test]
    fn rejects_missing_and_malformed_required_fields() {
        let base = json!({"id": "dx-1", "supplier_name": "Acme", "amount": 5, "date": "2024-01-01"});

        let mut missing_id = record(base.clone());
        missing_id.remove("id");
        assert_eq!(normalize(&missing_id).unwrap_err(), MalformedRecordError::MissingField("id"));

        let mut blank_supplier = record(base.clone());
        blank_supplier.insert("supplier_name".to_string(), json!(" "));
        assert_eq!(
            normalize(&blank_supplier).unwrap_err(),
            MalformedRecordError::MissingField("supplier_name")
        );

        let mut bad_amount = record(base.clone());
        bad_amount.insert("amount".to_string(), json!("ten pounds"));
        assert!(matches!(
            normalize(&bad_amount),
            Err(MalformedRecordError::InvalidField { field: "amount", .. })
        ));

        for grouped in ["1,250", "1,250.00", "1 250"] {
            let mut grouped_amount = record(base.clone());
            grouped_amount.insert("amount".to_string(), json!(grouped));
            assert!(
                matches!(
                    normalize(&grouped_amount),
                    Err(MalformedRecordError::InvalidField { field: "amount", .. })
                ),
                "{grouped} should be rejected"
            );
        }

        let mut bad_date = record(base);
        bad_date.insert("date".to_string(), json!("15/01/2024"));
        assert!(matches!(
            normalize(&bad_date),
            Err(MalformedRecordError::InvalidField { field: "date", .. })
        ));
    }

    #[tokio::test]
    async fn fetch_sends_bearer_auth_and_date_range() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/invoices"))
            .and(header("Authorization", "Bearer dext-key"))
            .and(query_param("start_date", "2024-01-01"))
            .and(query_param("end_date", "2024-01-31"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "invoices": [
                    {"id": "dx-1", "supplier_name": "Acme", "amount": 5, "date": "2024-01-02"},
                    {"id": "dx-2", "supplier_name": "Beta", "amount": 7, "date": "2024-01-03"}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dext = client(&server.uri(), Some("dext-key"));
        let range = DateRange {
            start: NaiveDate::from_ymd_opt(2024, 1, 1),
            end: NaiveDate::from_ymd_opt(2024, 1, 31),
        };
        let records = dext.fetch_invoices(range).await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["id"], "dx-2");
    }

    #[tokio::test]
    async fn fetch_failures_become_an_empty_feed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/invoices"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let dext = client(&server.uri(), Some("dext-key"));
        assert!(matches!(
            dext.try_fetch_invoices(DateRange::default()).await,
            Err(ConnectorError::Status { status: 503, .. })
        ));
        assert!(dext.fetch_invoices(DateRange::default()).await.is_empty());
    }

    #[tokio::test]
    async fn slow_fetch_times_out_into_an_empty_feed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/invoices"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"invoices": []}))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let dext = client_with_timeout(&server.uri(), Some("dext-key"), Duration::from_millis(50));
        match dext.try_fetch_invoices(DateRange::default()).await {
            Err(ConnectorError::Http(err)) => assert!(err.is_timeout()),
            other => panic!("expected a timeout, got {other:?}"),
        }
        assert!(dext.fetch_invoices(DateRange::default()).await.is_empty());
    }

    #[tokio::test]
    async fn fetch_without_api_key_makes_no_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let dext = client(&server.uri(), None);
        assert!(matches!(
            dext.try_fetch_invoices(DateRange::default()).await,
            Err(ConnectorError::MissingCredential(_))
        ));
    }

    #[tokio::test]
    async fn invoice_details_returns_none_on_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/invoices/dx-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "dx-1", "supplier_name": "Acme"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/invoices/dx-404"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dext = client(&server.uri(), Some("dext-key"));
        let details = dext.get_invoice_details("dx-1").await.unwrap();
        assert_eq!(details["supplier_name"], "Acme");
        assert!(dext.get_invoice_details("dx-404").await.is_none());
    }
}
