#![allow(dead_code)]
//! The LLM extractor contract (§6) plus a reference implementation reusing
//! this codebase's existing OpenRouter request/response plumbing (JSON
//! schema response format, bearer auth, provider pinning for cache
//! consistency) — adapted from the hierarchical-structure prompt shape to
//! the field-extraction prompt shape this pipeline needs.

use std::collections::BTreeMap;
use std::env;

use anyhow::{Context, Result as AnyResult};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ExtractorError;
use crate::model::Schema;

const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
const DEFAULT_MODEL: &str = "google/gemini-3-flash-preview";
const DEFAULT_LANGUAGE_REGION: &str = "pt-BR";

/// Constraints passed to an LLM call: which fields to extract (already
/// reduced to the missing set for a hybrid call) and a language hint.
#[derive(Debug, Clone)]
pub struct LlmConstraints {
    pub language_region: String,
}

impl Default for LlmConstraints {
    fn default() -> Self {
        Self {
            language_region: DEFAULT_LANGUAGE_REGION.to_string(),
        }
    }
}

/// The LLM contract: `llm_extract(elements, schema, constraints) -> mapping`.
#[async_trait]
pub trait LlmExtractor: Send + Sync {
    async fn extract(
        &self,
        document_text: &str,
        schema: &Schema,
        constraints: &LlmConstraints,
    ) -> Result<BTreeMap<String, Option<String>>, ExtractorError>;
}

/// OpenRouter-backed reference implementation.
#[derive(Clone)]
pub struct OpenRouterExtractor {
    client: Client,
    api_key: String,
    model: String,
}

impl OpenRouterExtractor {
    pub fn from_env() -> AnyResult<Self> {
        let api_key = env::var("OPENROUTER_API_KEY")
            .context("OPENROUTER_API_KEY environment variable not set")?;
        Ok(Self {
            client: Client::new(),
            api_key,
            model: env::var("OPENROUTER_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    fn build_schema_json(schema: &Schema) -> serde_json::Value {
        let mut properties = serde_json::Map::new();
        for field in schema.fields() {
            properties.insert(
                field.name.clone(),
                serde_json::json!({
                    "type": ["string", "null"],
                    "description": field.description,
                }),
            );
        }
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": schema.field_names(),
            "additionalProperties": false,
        })
    }

    fn build_prompt(document_text: &str, schema: &Schema, constraints: &LlmConstraints) -> Vec<Message> {
        let truncated = truncate_for_context(document_text, 150_000);
        let system = format!(
            "You are a precise document field extractor. Extract exactly the requested \
             fields from the document text below. Respond only with values you can find \
             verbatim or near-verbatim in the document; use null when a field is absent. \
             Language/region hint: {}.\n\n--- DOCUMENT START ---\n{}\n--- DOCUMENT END ---",
            constraints.language_region, truncated
        );

        let field_list = schema
            .fields()
            .iter()
            .map(|f| format!("- {}: {}", f.name, f.description))
            .collect::<Vec<_>>()
            .join("\n");

        let user = format!(
            "Extract these fields as a flat JSON object (field name -> string value or null):\n{}",
            field_list
        );

        vec![Message::system(system), Message::user(user)]
    }
}

#[async_trait]
impl LlmExtractor for OpenRouterExtractor {
    async fn extract(
        &self,
        document_text: &str,
        schema: &Schema,
        constraints: &LlmConstraints,
    ) -> Result<BTreeMap<String, Option<String>>, ExtractorError> {
        let messages = Self::build_prompt(document_text, schema, constraints);
        let schema_json = Self::build_schema_json(schema);

        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            max_tokens: Some(4096),
            response_format: Some(ResponseFormat::JsonSchema {
                json_schema: JsonSchemaFormat {
                    name: "field_extraction".to_string(),
                    schema: schema_json,
                },
            }),
            provider: Some(ProviderRouting {
                only: Some(vec!["Google".to_string()]),
                allow_fallbacks: Some(false),
            }),
        };

        debug!("Sending field-extraction request to OpenRouter: model={}", request.model);

        let response = self
            .client
            .post(OPENROUTER_API_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| ExtractorError::Llm(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ExtractorError::Llm(format!("OpenRouter error ({}): {}", status, text)));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ExtractorError::Llm(format!("failed to parse response envelope: {}", e)))?;

        info!(
            "OpenRouter field extraction: {} tokens (prompt: {}, completion: {})",
            parsed.usage.total_tokens, parsed.usage.prompt_tokens, parsed.usage.completion_tokens
        );

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ExtractorError::Llm("empty response from provider".to_string()))?;

        parse_field_map(&content, schema)
    }
}

fn parse_field_map(
    raw: &str,
    schema: &Schema,
) -> Result<BTreeMap<String, Option<String>>, ExtractorError> {
    let json_str = extract_json_block(raw);

    let value: serde_json::Value = serde_json::from_str(json_str)
        .map_err(|e| ExtractorError::Llm(format!("malformed JSON from provider: {}", e)))?;

    let obj = value
        .as_object()
        .ok_or_else(|| ExtractorError::Llm("provider response was not a JSON object".to_string()))?;

    let mut out = BTreeMap::new();
    for field in schema.fields() {
        let v = obj.get(&field.name).and_then(|v| match v {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) if s.trim().is_empty() => None,
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        });
        out.insert(field.name.clone(), v);
    }

    Ok(out)
}

fn extract_json_block(response: &str) -> &str {
    if response.contains("```json") {
        response
            .split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .unwrap_or(response)
            .trim()
    } else if response.contains("```") {
        response.split("```").nth(1).unwrap_or(response).trim()
    } else {
        response.trim()
    }
}

fn truncate_for_context(text: &str, max_chars: usize) -> &str {
    if text.len() <= max_chars {
        text
    } else {
        let mut end = max_chars;
        while !text.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        &text[..end]
    }
}

// ============================================================================
// Request/response wire types (ported from this codebase's OpenRouter client)
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider: Option<ProviderRouting>,
}

#[derive(Debug, Serialize)]
struct ProviderRouting {
    #[serde(skip_serializing_if = "Option::is_none")]
    only: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    allow_fallbacks: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseFormat {
    JsonSchema { json_schema: JsonSchemaFormat },
}

#[derive(Debug, Serialize)]
struct JsonSchemaFormat {
    name: String,
    schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::new(vec![
            ("nome".to_string(), "Full name".to_string()),
            ("cpf".to_string(), "CPF number".to_string()),
        ])
        .unwrap()
    }

    #[test]
    fn parse_field_map_fills_missing_as_null() {
        let raw = r#"{"nome": "João Silva"}"#;
        let map = parse_field_map(raw, &schema()).unwrap();
        assert_eq!(map.get("nome").unwrap().as_deref(), Some("João Silva"));
        assert_eq!(map.get("cpf").unwrap(), &None);
    }

    #[test]
    fn parse_field_map_strips_code_fences() {
        let raw = "```json\n{\"nome\": \"Maria\", \"cpf\": null}\n```";
        let map = parse_field_map(raw, &schema()).unwrap();
        assert_eq!(map.get("nome").unwrap().as_deref(), Some("Maria"));
        assert_eq!(map.get("cpf").unwrap(), &None);
    }

    #[test]
    fn parse_field_map_rejects_malformed_json() {
        let raw = "not json at all";
        assert!(parse_field_map(raw, &schema()).is_err());
    }
}
