pub mod credentials;
pub mod crypto;
pub mod dext;
pub mod openai;
pub mod state;
pub mod sync;
pub mod validator;
pub mod xero;
