use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;

use crate::models::{Invoice, InvoiceErrors, InvoiceFilter};
use crate::services::crypto::Sealed;

const INVOICE_COLUMNS: &str = "id, source_id, supplier_name, tax_number, tax_code, amount, invoice_date,
    status, confidence_score, validation_errors, ledger_id, source_hash, created_at, updated_at";

/// Credentials row as stored: every secret is ciphertext.
#[derive(Debug, Clone, Default)]
pub struct StoredCredentials {
    pub dext_api_key: Option<Sealed>,
    pub xero_client_id: Option<Sealed>,
    pub xero_client_secret: Option<Sealed>,
    pub xero_access_token: Option<Sealed>,
    pub xero_refresh_token: Option<Sealed>,
    pub xero_token_expires_at: Option<DateTime<Utc>>,
    pub openai_api_key: Option<Sealed>,
    pub vision_credentials: Option<Sealed>,
}

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn new(db_path: &Path) -> SqlResult<Self> {
        Self::with_connection(Connection::open(db_path)?)
    }

    pub fn open_in_memory() -> SqlResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> SqlResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let mut db = Database { conn };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&mut self) -> SqlResult<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                name TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )?;

        let migrations = vec![
            (
                "001_create_invoices.sql",
                include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations/001_create_invoices.sql")),
            ),
            (
                "002_create_credentials.sql",
                include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations/002_create_credentials.sql")),
            ),
        ];

        for (name, sql) in migrations {
            let applied: Option<String> = self
                .conn
                .query_row(
                    "SELECT name FROM schema_migrations WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?;

            if applied.is_none() {
                let tx = self.conn.transaction()?;
                tx.execute_batch(sql)?;
                tx.execute(
                    "INSERT INTO schema_migrations (name, applied_at) VALUES (?1, datetime('now'))",
                    params![name],
                )?;
                tx.commit()?;
            }
        }

        Ok(())
    }

    pub fn insert_invoice(&self, invoice: &Invoice) -> SqlResult<()> {
        insert_into(&self.conn, invoice)
    }

    /// Inserts every invoice in one transaction; on any failure none are kept.
    pub fn insert_invoices(&mut self, invoices: &[Invoice]) -> SqlResult<()> {
        let tx = self.conn.transaction()?;
        for invoice in invoices {
            insert_into(&tx, invoice)?;
        }
        tx.commit()
    }

    pub fn update_invoice(&self, invoice: &Invoice) -> SqlResult<()> {
        let errors = encode_errors(invoice.validation_errors.as_ref())?;
        self.conn.execute(
            "UPDATE invoices SET
                supplier_name = ?2, tax_number = ?3, tax_code = ?4, amount = ?5, invoice_date = ?6,
                status = ?7, confidence_score = ?8, validation_errors = ?9, ledger_id = ?10,
                updated_at = ?11
             WHERE id = ?1",
            params![
                invoice.id,
                invoice.supplier_name,
                invoice.tax_number,
                invoice.tax_code,
                invoice.amount,
                invoice.invoice_date,
                invoice.status,
                invoice.confidence_score,
                errors,
                invoice.ledger_id,
                invoice.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_invoice_by_id(&self, id: &str) -> SqlResult<Option<Invoice>> {
        let sql = format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = ?1");
        self.conn.query_row(&sql, params![id], invoice_from_row).optional()
    }

    pub fn get_invoice_by_source_id(&self, source_id: &str) -> SqlResult<Option<Invoice>> {
        let sql = format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE source_id = ?1");
        self.conn.query_row(&sql, params![source_id], invoice_from_row).optional()
    }

    pub fn list_invoices(&self, filter: &InvoiceFilter) -> SqlResult<Vec<Invoice>> {
        let mut conditions = Vec::new();
        let mut values: Vec<String> = Vec::new();
        if let Some(status) = filter.status {
            values.push(status.as_str().to_string());
            conditions.push(format!("status = ?{}", values.len()));
        }
        if let Some(start) = filter.range.start {
            values.push(start.format("%Y-%m-%d").to_string());
            conditions.push(format!("invoice_date >= ?{}", values.len()));
        }
        if let Some(end) = filter.range.end {
            values.push(end.format("%Y-%m-%d").to_string());
            conditions.push(format!("invoice_date <= ?{}", values.len()));
        }

        let mut sql = format!("SELECT {INVOICE_COLUMNS} FROM invoices");
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY invoice_date DESC, created_at DESC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), invoice_from_row)?;
        rows.collect()
    }

    /// Returns the singleton credentials row, creating an empty one on first access.
    pub fn get_or_create_credentials(&self) -> SqlResult<StoredCredentials> {
        self.conn.execute(
            "INSERT OR IGNORE INTO credentials (id, updated_at) VALUES (1, ?1)",
            params![Utc::now()],
        )?;
        self.conn.query_row(
            "SELECT dext_api_key, xero_client_id, xero_client_secret, xero_access_token,
                    xero_refresh_token, xero_token_expires_at, openai_api_key, vision_credentials
             FROM credentials WHERE id = 1",
            [],
            |row| {
                Ok(StoredCredentials {
                    dext_api_key: row.get(0)?,
                    xero_client_id: row.get(1)?,
                    xero_client_secret: row.get(2)?,
                    xero_access_token: row.get(3)?,
                    xero_refresh_token: row.get(4)?,
                    xero_token_expires_at: row.get(5)?,
                    openai_api_key: row.get(6)?,
                    vision_credentials: row.get(7)?,
                })
            },
        )
    }

    pub fn save_credentials(&self, credentials: &StoredCredentials) -> SqlResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO credentials (
                id, dext_api_key, xero_client_id, xero_client_secret, xero_access_token,
                xero_refresh_token, xero_token_expires_at, openai_api_key, vision_credentials, updated_at
            ) VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                credentials.dext_api_key,
                credentials.xero_client_id,
                credentials.xero_client_secret,
                credentials.xero_access_token,
                credentials.xero_refresh_token,
                credentials.xero_token_expires_at,
                credentials.openai_api_key,
                credentials.vision_credentials,
                Utc::now(),
            ],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> SqlResult<()> {
        self.conn.execute_batch(sql)
    }

    #[cfg(test)]
    pub(crate) fn raw_credential_column(&self, column: &str) -> SqlResult<Option<String>> {
        let sql = format!("SELECT {column} FROM credentials WHERE id = 1");
        self.conn.query_row(&sql, [], |row| row.get(0))
    }
}

fn insert_into(conn: &Connection, invoice: &Invoice) -> SqlResult<()> {
    let errors = encode_errors(invoice.validation_errors.as_ref())?;
    conn.execute(
        "INSERT INTO invoices (
            id, source_id, supplier_name, tax_number, tax_code, amount, invoice_date,
            status, confidence_score, validation_errors, ledger_id, source_hash, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            invoice.id,
            invoice.source_id,
            invoice.supplier_name,
            invoice.tax_number,
            invoice.tax_code,
            invoice.amount,
            invoice.invoice_date,
            invoice.status,
            invoice.confidence_score,
            errors,
            invoice.ledger_id,
            invoice.source_hash,
            invoice.created_at,
            invoice.updated_at,
        ],
    )?;
    Ok(())
}

fn encode_errors(errors: Option<&InvoiceErrors>) -> SqlResult<Option<String>> {
    errors
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn invoice_from_row(row: &Row<'_>) -> SqlResult<Invoice> {
    let errors: Option<String> = row.get(9)?;
    let validation_errors = errors
        .map(|raw| serde_json::from_str::<InvoiceErrors>(&raw))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e)))?;

    Ok(Invoice {
        id: row.get(0)?,
        source_id: row.get(1)?,
        supplier_name: row.get(2)?,
        tax_number: row.get(3)?,
        tax_code: row.get(4)?,
        amount: row.get(5)?,
        invoice_date: row.get(6)?,
        status: row.get(7)?,
        confidence_score: row.get(8)?,
        validation_errors,
        ledger_id: row.get(10)?,
        source_hash: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{DateRange, InvoiceStatus};
    use chrono::NaiveDate;

    pub(crate) fn invoice(source_id: &str, date: (i32, u32, u32), status: InvoiceStatus) -> Invoice {
        let now = Utc::now();
        Invoice {
            id: uuid::Uuid::new_v4().to_string(),
            source_id: source_id.to_string(),
            supplier_name: "Acme Ltd".to_string(),
            tax_number: Some("GB123456789".to_string()),
            tax_code: Some("INPUT2".to_string()),
            amount: 150.0,
            invoice_date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
            status,
            confidence_score: 0.0,
            validation_errors: None,
            ledger_id: None,
            source_hash: "hash".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn migrations_are_idempotent() {
        let mut db = Database::open_in_memory().unwrap();
        db.run_migrations().unwrap();
        let count: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn stores_and_reads_back_error_slot() {
        let db = Database::open_in_memory().unwrap();
        let mut record = invoice("dx-1", (2024, 1, 10), InvoiceStatus::Error);
        record.validation_errors = Some(InvoiceErrors::Ledger { ledger_error: "rejected".to_string() });
        db.insert_invoice(&record).unwrap();

        let loaded = db.get_invoice_by_id(&record.id).unwrap().unwrap();
        assert_eq!(loaded.source_id, "dx-1");
        assert_eq!(loaded.status, InvoiceStatus::Error);
        assert_eq!(loaded.validation_errors, record.validation_errors);
        assert_eq!(loaded.invoice_date, record.invoice_date);
        assert!(db.get_invoice_by_source_id("dx-1").unwrap().is_some());
        assert!(db.get_invoice_by_source_id("dx-2").unwrap().is_none());
    }

    #[test]
    fn batch_insert_is_all_or_nothing() {
        let mut db = Database::open_in_memory().unwrap();
        let batch = vec![
            invoice("dx-1", (2024, 1, 10), InvoiceStatus::Pushed),
            invoice("dx-2", (2024, 1, 11), InvoiceStatus::Error),
            invoice("dx-1", (2024, 1, 12), InvoiceStatus::Error),
        ];
        assert!(db.insert_invoices(&batch).is_err());
        assert!(db.list_invoices(&InvoiceFilter::default()).unwrap().is_empty());

        db.insert_invoices(&batch[..2]).unwrap();
        assert_eq!(db.list_invoices(&InvoiceFilter::default()).unwrap().len(), 2);
    }

    #[test]
    fn list_filters_by_status_and_inclusive_range() {
        let db = Database::open_in_memory().unwrap();
        db.insert_invoice(&invoice("a", (2024, 1, 1), InvoiceStatus::Pushed)).unwrap();
        db.insert_invoice(&invoice("b", (2024, 2, 1), InvoiceStatus::Error)).unwrap();
        db.insert_invoice(&invoice("c", (2024, 3, 1), InvoiceStatus::Pushed)).unwrap();

        let pushed = db
            .list_invoices(&InvoiceFilter { status: Some(InvoiceStatus::Pushed), ..Default::default() })
            .unwrap();
        assert_eq!(pushed.iter().map(|i| i.source_id.as_str()).collect::<Vec<_>>(), vec!["c", "a"]);

        let range = DateRange {
            start: NaiveDate::from_ymd_opt(2024, 2, 1),
            end: NaiveDate::from_ymd_opt(2024, 3, 1),
        };
        let windowed = db.list_invoices(&InvoiceFilter { status: None, range }).unwrap();
        assert_eq!(windowed.len(), 2);
    }

    #[test]
    fn update_refreshes_mutable_fields() {
        let db = Database::open_in_memory().unwrap();
        let mut record = invoice("dx-9", (2024, 1, 10), InvoiceStatus::Validated);
        db.insert_invoice(&record).unwrap();

        record.status = InvoiceStatus::Pushed;
        record.ledger_id = Some("xero-1".to_string());
        record.touch();
        db.update_invoice(&record).unwrap();

        let loaded = db.get_invoice_by_id(&record.id).unwrap().unwrap();
        assert_eq!(loaded.status, InvoiceStatus::Pushed);
        assert_eq!(loaded.ledger_id.as_deref(), Some("xero-1"));
    }

    #[test]
    fn credentials_row_is_created_lazily_and_empty() {
        let db = Database::open_in_memory().unwrap();
        let first = db.get_or_create_credentials().unwrap();
        assert!(first.dext_api_key.is_none());
        assert!(first.xero_token_expires_at.is_none());
        let again = db.get_or_create_credentials().unwrap();
        assert!(again.openai_api_key.is_none());
    }
}
