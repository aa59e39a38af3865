use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::models::schema::ValueType;
use crate::services::generation::{GenerationRequest, Generator, GeneratorError, ValueSchema};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Client for the Gemini `generateContent` API in JSON response mode.
pub struct GeminiGenerator {
    http: Client,
    base_url: String,
    model: String,
    api_key: String,
}

#[derive(Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    text: Option<String>,
}

impl GeminiGenerator {
    pub fn new(
        base_url: String,
        model: String,
        api_key: String,
        timeout: Duration,
    ) -> Result<Self, GeneratorError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            api_key,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        )
    }
}

#[async_trait]
impl Generator for GeminiGenerator {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, GeneratorError> {
        let body = json!({
            "systemInstruction": { "parts": [{ "text": request.instructions }] },
            "contents": [{
                "role": "user",
                "parts": [{ "text": format!("DOCUMENT TEXT:\n{}", request.context) }]
            }],
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseSchema": response_schema(&request.schema),
                "temperature": 0.0
            }
        });

        let response = self
            .http
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(GeneratorError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(response_text(&text))
    }
}

/// Gemini `responseSchema` for a value schema. Every field is required and nullable.
pub fn response_schema(schema: &ValueSchema) -> Value {
    let mut properties = Map::new();
    for field in &schema.fields {
        let mut property = match field.value_type {
            ValueType::Number => json!({ "type": "NUMBER" }),
            ValueType::Date => json!({ "type": "STRING", "format": "date" }),
            ValueType::Text => json!({ "type": "STRING" }),
        };
        property["nullable"] = Value::Bool(true);
        property["description"] = Value::String(field.description.clone());
        properties.insert(field.key.clone(), property);
    }
    let keys: Vec<&str> = schema.fields.iter().map(|f| f.key.as_str()).collect();
    json!({
        "type": "OBJECT",
        "properties": properties,
        "required": keys,
        "propertyOrdering": keys,
    })
}

/// Model text of the first candidate. A body that is not a response envelope is
/// passed through unchanged so validation can report on it.
fn response_text(body: &str) -> String {
    let Ok(envelope) = serde_json::from_str::<GenerateContentResponse>(body) else {
        return body.to_string();
    };
    envelope
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<String>()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::generation::ValueField;

    #[test]
    fn builds_nullable_required_schema() {
        let schema = ValueSchema {
            fields: vec![
                ValueField {
                    key: "B2".into(),
                    description: "Revenue | 2023".into(),
                    value_type: ValueType::Number,
                },
                ValueField {
                    key: "C2".into(),
                    description: "Close date | 2023".into(),
                    value_type: ValueType::Date,
                },
            ],
        };
        let value = response_schema(&schema);
        assert_eq!(value["type"], "OBJECT");
        assert_eq!(value["required"], json!(["B2", "C2"]));
        assert_eq!(value["propertyOrdering"], json!(["B2", "C2"]));
        assert_eq!(value["properties"]["B2"]["type"], "NUMBER");
        assert_eq!(value["properties"]["B2"]["nullable"], true);
        assert_eq!(value["properties"]["C2"]["format"], "date");
        assert_eq!(value["properties"]["C2"]["description"], "Close date | 2023");
    }

    #[test]
    fn joins_candidate_parts() {
        let body = r#"{"candidates":[{"content":{"parts":[{"text":"{\"B2\":"},{"text":" 1}"}],"role":"model"}}]}"#;
        assert_eq!(response_text(body), r#"{"B2": 1}"#);
    }

    #[test]
    fn blocked_prompt_yields_empty_text() {
        let body = r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#;
        assert_eq!(response_text(body), "");
    }

    #[test]
    fn unexpected_body_is_passed_through() {
        assert_eq!(response_text("not json"), "not json");
    }

    #[test]
    fn endpoint_uses_model_path() {
        let generator = GeminiGenerator::new(
            "http://localhost:8080/".into(),
            "gemini-2.5-flash".into(),
            "key".into(),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            generator.endpoint(),
            "http://localhost:8080/v1beta/models/gemini-2.5-flash:generateContent"
        );
    }
}
