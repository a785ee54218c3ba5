use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ValidatorConfig;
use crate::error::ClassifierError;
use crate::models::{Invoice, ValidationResult};

// Sub-check weights in points out of 100; they partition the full score.
const VAT_NUMBER_POINTS: u32 = 30;
const VAT_CODE_POINTS: u32 = 40;
const AMOUNT_POINTS: u32 = 30;

/// Tax types accepted by the ledger for purchase invoices.
const KNOWN_XERO_TAX_TYPES: &[&str] = &[
    "INPUT", "INPUT2", "INPUTY23", "RRINPUT", "ZERORATEDINPUT", "EXEMPTINPUT", "NONE", "GSTONIMPORTS",
    "ECZRINPUT", "ECACQUISITIONS", "REVERSECHARGES", "CAPEXINPUT", "CAPEXINPUT2", "CAPEXSRINPUT",
    "BASEXCLUDED", "OUTPUT", "OUTPUT2", "RROUTPUT", "ZERORATEDOUTPUT", "EXEMPTOUTPUT",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxCodeVerdict {
    pub is_valid: bool,
    pub category: Option<String>,
    pub reason: String,
}

/// Semantic check of a VAT code. Implementations may call out to a remote service.
#[async_trait]
pub trait TaxCodeClassifier: Send + Sync {
    async fn classify(&self, tax_code: &str) -> Result<TaxCodeVerdict, ClassifierError>;
}

/// Offline classifier over the ledger's published tax types.
#[derive(Debug, Default, Clone, Copy)]
pub struct KnownTaxCodes;

#[async_trait]
impl TaxCodeClassifier for KnownTaxCodes {
    async fn classify(&self, tax_code: &str) -> Result<TaxCodeVerdict, ClassifierError> {
        let normalized = tax_code.trim().to_ascii_uppercase();
        if KNOWN_XERO_TAX_TYPES.contains(&normalized.as_str()) {
            Ok(TaxCodeVerdict {
                is_valid: true,
                category: Some(normalized),
                reason: "known tax type".to_string(),
            })
        } else {
            Ok(TaxCodeVerdict {
                is_valid: false,
                category: None,
                reason: format!("{normalized} is not a known tax type"),
            })
        }
    }
}

pub struct Validator {
    min_confidence: f64,
    vat_pattern: Regex,
    classifier: Arc<dyn TaxCodeClassifier>,
}

impl Validator {
    pub fn new(config: &ValidatorConfig, classifier: Arc<dyn TaxCodeClassifier>) -> Result<Self, regex::Error> {
        let prefixes = if config.vat_country_prefixes.is_empty() {
            "[A-Z]{2}".to_string()
        } else {
            let escaped: Vec<String> = config.vat_country_prefixes.iter().map(|p| regex::escape(p)).collect();
            format!("(?:{})", escaped.join("|"))
        };
        Ok(Validator {
            min_confidence: config.min_confidence,
            vat_pattern: Regex::new(&format!("^{prefixes}[0-9A-Z]{{2,12}}$"))?,
            classifier,
        })
    }

    pub fn min_confidence(&self) -> f64 {
        self.min_confidence
    }

    /// Scores an invoice. Never fails: faults are folded into the result.
    pub async fn validate(&self, invoice: &Invoice) -> ValidationResult {
        if !invoice.amount.is_finite() {
            return ValidationResult::faulted("amount is not a finite number");
        }

        let mut points = 0u32;
        let mut errors = Vec::new();

        match self.check_vat_number(invoice.tax_number.as_deref()) {
            Ok(()) => points += VAT_NUMBER_POINTS,
            Err(error) => errors.push(error),
        }

        match self.check_vat_code(invoice.tax_code.as_deref()).await {
            Ok(Ok(())) => points += VAT_CODE_POINTS,
            Ok(Err(error)) => errors.push(error),
            Err(fault) => return ValidationResult::faulted(fault),
        }

        if invoice.amount > 0.0 {
            points += AMOUNT_POINTS;
        } else {
            errors.push("Invalid amount".to_string());
        }

        let confidence_score = (f64::from(points) / 100.0).min(1.0);
        let is_valid = confidence_score >= self.min_confidence && errors.is_empty();
        debug!(
            source_id = %invoice.source_id,
            confidence_score,
            is_valid,
            "validated invoice"
        );

        ValidationResult { is_valid, confidence_score, errors }
    }

    fn check_vat_number(&self, vat_number: Option<&str>) -> Result<(), String> {
        let Some(raw) = vat_number.filter(|v| !v.trim().is_empty()) else {
            return Err("VAT number is missing".to_string());
        };
        let normalized: String = raw.chars().filter(|c| !c.is_whitespace()).collect::<String>().to_ascii_uppercase();
        if self.vat_pattern.is_match(&normalized) {
            Ok(())
        } else {
            Err("Invalid VAT number format".to_string())
        }
    }

    /// Outer error is a fault that voids the whole result; inner error is an ordinary failed check.
    async fn check_vat_code(&self, vat_code: Option<&str>) -> Result<Result<(), String>, ClassifierError> {
        let Some(code) = vat_code.filter(|v| !v.trim().is_empty()) else {
            return Ok(Err("VAT code is missing".to_string()));
        };
        match self.classifier.classify(code.trim()).await {
            Ok(verdict) if verdict.is_valid => Ok(Ok(())),
            Ok(verdict) => Ok(Err(format!("Invalid VAT code: {}", verdict.reason))),
            Err(ClassifierError::Malformed(message)) => Err(ClassifierError::Malformed(message)),
            Err(err) => Ok(Err(format!("AI validation error: {err}"))),
        }
    }
}
