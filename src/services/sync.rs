use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::db::Database;
use crate::error::SyncError;
use crate::models::{
    DateRange, Invoice, InvoiceFilter, InvoiceStatus, MalformedEntry, PushResult, SyncReport, ValidationResult,
};
use crate::services::dext::{normalize, DextClient};
use crate::services::validator::Validator;
use crate::services::xero::XeroClient;
use crate::utils::format_decimal;

/// Runs the fetch → dedupe → validate → push pipeline and the manual per-invoice operations.
pub struct SyncService {
    db: Arc<Mutex<Database>>,
    dext: DextClient,
    validator: Validator,
    xero: XeroClient,
    sync_lock: tokio::sync::Mutex<()>,
}

impl SyncService {
    pub fn new(db: Arc<Mutex<Database>>, dext: DextClient, validator: Validator, xero: XeroClient) -> Self {
        SyncService {
            db,
            dext,
            validator,
            xero,
            sync_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn xero(&self) -> &XeroClient {
        &self.xero
    }

    /// Syncs one batch from the capture service.
    ///
    /// Duplicates and malformed records are skipped individually. New invoices are
    /// written in a single transaction at the end; a store fault anywhere aborts the
    /// whole batch and nothing is kept. Only one batch may run at a time.
    pub async fn sync_batch(&self, range: DateRange) -> Result<SyncReport, SyncError> {
        let _in_flight = self.sync_lock.try_lock().map_err(|_| SyncError::SyncInProgress)?;

        let mut report = SyncReport::default();
        let records = match self.dext.try_fetch_invoices(range).await {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "fetching invoices from Dext failed, treating feed as empty");
                report.fetch_error = Some(err.to_string());
                Vec::new()
            }
        };
        report.fetched = records.len();

        let mut staged: Vec<Invoice> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for (position, raw) in records.iter().enumerate() {
            let mut invoice = match normalize(raw) {
                Ok(invoice) => invoice,
                Err(err) => {
                    warn!(position, error = %err, "skipping malformed Dext record");
                    report.malformed.push(MalformedEntry {
                        position,
                        source_id: raw.get("id").map(|id| id.as_str().map(str::to_string).unwrap_or_else(|| id.to_string())),
                        reason: err.to_string(),
                    });
                    continue;
                }
            };

            if seen.contains(&invoice.source_id) {
                debug!(source_id = %invoice.source_id, "duplicate record within batch");
                report.skipped_duplicates += 1;
                continue;
            }
            let existing = self.find_by_source_id(&invoice.source_id).map_err(abort)?;
            if let Some(existing) = existing {
                if existing.source_hash != invoice.source_hash {
                    info!(source_id = %invoice.source_id, "record changed upstream since it was synced, ignoring");
                }
                report.skipped_duplicates += 1;
                continue;
            }
            seen.insert(invoice.source_id.clone());

            self.process_new(&mut invoice, &mut report).await;
            staged.push(invoice);
        }

        {
            let mut db = self.db.lock().map_err(|_| abort(SyncError::LockPoisoned("database")))?;
            db.insert_invoices(&staged).map_err(abort)?;
        }
        report.created = staged.len();

        info!(
            fetched = report.fetched,
            created = report.created,
            pushed = report.pushed,
            rejected = report.rejected,
            push_failed = report.push_failed,
            duplicates = report.skipped_duplicates,
            malformed = report.malformed.len(),
            "sync batch committed"
        );
        Ok(report)
    }

    async fn process_new(&self, invoice: &mut Invoice, report: &mut SyncReport) {
        let validation = self.validator.validate(invoice).await;
        invoice.apply_validation(&validation);

        if invoice.status != InvoiceStatus::Validated {
            debug!(source_id = %invoice.source_id, errors = ?validation.errors, "invoice failed validation");
            report.rejected += 1;
            return;
        }

        debug!(
            source_id = %invoice.source_id,
            amount = %format_decimal(invoice.amount),
            "pushing validated invoice"
        );
        let push = self.xero.push_invoice(invoice).await;
        invoice.apply_push(&push);
        if push.is_success() {
            report.pushed += 1;
        } else {
            report.push_failed += 1;
        }
    }

    /// Re-validates one stored invoice and saves the outcome immediately.
    pub async fn validate_one(&self, id: &str) -> Result<ValidationResult, SyncError> {
        let mut invoice = self.load(id)?;
        if invoice.status == InvoiceStatus::Pushed {
            return Err(SyncError::Precondition(format!(
                "invoice {id} has already been pushed to the ledger"
            )));
        }

        let result = self.validator.validate(&invoice).await;
        invoice.apply_validation(&result);
        self.save(&invoice)?;
        Ok(result)
    }

    /// Pushes one VALIDATED invoice and saves the outcome immediately.
    pub async fn push_one(&self, id: &str) -> Result<PushResult, SyncError> {
        let mut invoice = self.load(id)?;
        if invoice.status != InvoiceStatus::Validated {
            return Err(SyncError::Precondition(format!(
                "invoice {id} must be validated before pushing (status is {})",
                invoice.status
            )));
        }
        if invoice.confidence_score < self.validator.min_confidence() {
            return Err(SyncError::Precondition(format!(
                "invoice {id} confidence {:.2} is below the required threshold",
                invoice.confidence_score
            )));
        }

        let result = self.xero.push_invoice(&invoice).await;
        invoice.apply_push(&result);
        self.save(&invoice)?;
        Ok(result)
    }

    /// Checks the ledger for a bank transaction matching a stored invoice.
    pub async fn verify_one(&self, id: &str) -> Result<bool, SyncError> {
        let invoice = self.load(id)?;
        Ok(self.xero.verify_bank_transaction(&invoice).await)
    }

    pub fn get_invoice(&self, id: &str) -> Result<Option<Invoice>, SyncError> {
        let db = self.db.lock().map_err(|_| SyncError::LockPoisoned("database"))?;
        Ok(db.get_invoice_by_id(id)?)
    }

    pub fn list_invoices(&self, filter: &InvoiceFilter) -> Result<Vec<Invoice>, SyncError> {
        let db = self.db.lock().map_err(|_| SyncError::LockPoisoned("database"))?;
        Ok(db.list_invoices(filter)?)
    }

    fn find_by_source_id(&self, source_id: &str) -> Result<Option<Invoice>, SyncError> {
        let db = self.db.lock().map_err(|_| SyncError::LockPoisoned("database"))?;
        Ok(db.get_invoice_by_source_id(source_id)?)
    }

    fn load(&self, id: &str) -> Result<Invoice, SyncError> {
        self.get_invoice(id)?.ok_or_else(|| SyncError::NotFound(id.to_string()))
    }

    fn save(&self, invoice: &Invoice) -> Result<(), SyncError> {
        let db = self.db.lock().map_err(|_| SyncError::LockPoisoned("database"))?;
        db.update_invoice(invoice)?;
        Ok(())
    }
}

fn abort(err: impl std::fmt::Display) -> SyncError {
    SyncError::BatchAborted(err.to_string())
}
