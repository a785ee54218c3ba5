pub mod invoices;
pub mod settings;
pub mod xero;
