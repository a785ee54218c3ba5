use async_trait::async_trait;
use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::ValidatorConfig;
use crate::error::ClassifierError;
use crate::services::credentials::CredentialStore;
use crate::services::validator::{KnownTaxCodes, TaxCodeClassifier, TaxCodeVerdict};

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    temperature: f32,
    messages: Vec<Message>,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: String,
}

/// Asks a chat-completions model whether a VAT code is valid.
///
/// Falls back to [`KnownTaxCodes`] while no OpenAI key is configured.
pub struct OpenAiTaxCodeClassifier {
    http: reqwest::Client,
    api_url: String,
    model: String,
    schema: JSONSchema,
    credentials: CredentialStore,
    fallback: KnownTaxCodes,
}

impl OpenAiTaxCodeClassifier {
    pub fn new(config: &ValidatorConfig, credentials: CredentialStore) -> Result<Self, ClassifierError> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(OpenAiTaxCodeClassifier {
            http,
            api_url: config.openai_url.clone(),
            model: config.openai_model.clone(),
            schema: verdict_schema()?,
            credentials,
            fallback: KnownTaxCodes,
        })
    }

    async fn call_openai(&self, api_key: &str, user_prompt: &str) -> Result<String, ClassifierError> {
        let request = ChatRequest {
            model: self.model.clone(),
            temperature: 0.0,
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: system_prompt(),
                },
                Message {
                    role: "user".to_string(),
                    content: user_prompt.to_string(),
                },
            ],
            response_format: ResponseFormat {
                format_type: "json_object".to_string(),
            },
        };

        let response = self
            .http
            .post(&self.api_url)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ClassifierError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClassifierError::Unavailable(format!("OpenAI error {}: {}", status, body)));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| ClassifierError::Malformed(format!("chat response: {e}")))?;
        let content = body
            .choices
            .first()
            .ok_or_else(|| ClassifierError::Malformed("Empty response".to_string()))?
            .message
            .content
            .trim()
            .to_string();
        Ok(content)
    }
}

#[async_trait]
impl TaxCodeClassifier for OpenAiTaxCodeClassifier {
    async fn classify(&self, tax_code: &str) -> Result<TaxCodeVerdict, ClassifierError> {
        let api_key = self
            .credentials
            .load()
            .map_err(|e| ClassifierError::Unavailable(e.to_string()))?
            .openai_api_key;
        let Some(api_key) = api_key else {
            debug!("no OpenAI key configured, using the known tax type list");
            return self.fallback.classify(tax_code).await;
        };

        let user = format!("Validate and categorize this VAT code: {}", tax_code);
        let raw = self.call_openai(&api_key, &user).await?;
        let mut value = parse_json(&raw);

        if !value.as_ref().map(|v| self.schema.is_valid(v)).unwrap_or(false) {
            warn!("VAT code verdict did not match the schema, asking for a repair");
            let fix_prompt = format!(
                "Fix this JSON so it matches the schema exactly. Output JSON only. JSON:\n{}",
                raw
            );
            let repaired = self.call_openai(&api_key, &fix_prompt).await?;
            value = parse_json(&repaired);
        }

        let value = value?;
        if !self.schema.is_valid(&value) {
            return Err(ClassifierError::Malformed("verdict does not match the schema".to_string()));
        }
        serde_json::from_value(value).map_err(|e| ClassifierError::Malformed(e.to_string()))
    }
}

fn parse_json(raw: &str) -> Result<Value, ClassifierError> {
    serde_json::from_str::<Value>(raw).map_err(|e| ClassifierError::Malformed(format!("Invalid JSON: {}", e)))
}

fn verdict_schema() -> Result<JSONSchema, ClassifierError> {
    let schema = json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["is_valid", "reason"],
        "properties": {
            "is_valid": {"type": "boolean"},
            "category": {"type": ["string", "null"]},
            "reason": {"type": "string"}
        }
    });

    JSONSchema::compile(&schema).map_err(|e| ClassifierError::Malformed(format!("verdict schema: {e}")))
}

fn system_prompt() -> String {
    r#"You are a VAT code validation expert for a UK accounting ledger. Return JSON only and match the schema exactly.
Fields:
- is_valid (boolean): true if the code is a recognised VAT/tax code for purchase invoices
- category (string|null): the tax category, e.g. "standard", "reduced", "zero-rated", "exempt"
- reason (string, short)
"#
    .to_string()
}
