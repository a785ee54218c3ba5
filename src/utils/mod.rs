use chrono::{DateTime, NaiveDate, NaiveDateTime};
use sha2::{Digest, Sha256};

pub fn format_decimal(value: f64) -> String {
    format!("{:.2}", value)
}

/// Accepts a JSON number or a plain numeric string such as `"150.00"`.
///
/// Grouping and locale separators (`"1,250"`, `"1 250"`) are rejected.
pub fn parse_decimal(value: &serde_json::Value) -> Option<f64> {
    let parsed = match value {
        serde_json::Value::Number(number) => number.as_f64(),
        serde_json::Value::String(raw) => raw.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    parsed.is_finite().then_some(parsed)
}

/// Parses an ISO-8601 date, or the date part of an ISO-8601 date-time.
pub fn parse_iso_date(value: &str) -> Option<NaiveDate> {
    let raw = value.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(datetime) = DateTime::parse_from_rfc3339(raw) {
        return Some(datetime.date_naive());
    }
    let formats = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];
    for fmt in formats.iter() {
        if let Ok(datetime) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(datetime.date());
        }
    }
    None
}

/// Masks a secret for display, keeping only its last four characters.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{}", tail)
}

pub fn sha256_json(value: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
