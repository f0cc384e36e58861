//! Core request/response types for the extraction pipeline.
//!
//! Re-encoded as explicit records with enumerated fields per the design
//! notes: no loose `HashMap<String, serde_json::Value>` config soup, and the
//! method tag is a proper tagged enum rather than a bare string.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::ExtractorError;

/// An ordered mapping `field_name -> description`. Field names are unique;
/// order is preserved because it is part of what callers compare when they
/// ask "did I send the same schema" in the UI, even though the cache key
/// itself is order-independent (§4.1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    fields: Vec<SchemaField>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    pub description: String,
}

impl Schema {
    /// Build a schema from an ordered list of (name, description) pairs.
    /// Rejects empty schemas and duplicate field names.
    pub fn new(fields: Vec<(String, String)>) -> Result<Self, ExtractorError> {
        if fields.is_empty() {
            return Err(ExtractorError::Validation(
                "schema must contain at least one field".to_string(),
            ));
        }

        let mut seen = HashSet::with_capacity(fields.len());
        for (name, _) in &fields {
            if name.trim().is_empty() {
                return Err(ExtractorError::Validation(
                    "schema field name must not be empty".to_string(),
                ));
            }
            if !seen.insert(name.clone()) {
                return Err(ExtractorError::Validation(format!(
                    "duplicate schema field name: {}",
                    name
                )));
            }
        }

        Ok(Self {
            fields: fields
                .into_iter()
                .map(|(name, description)| SchemaField { name, description })
                .collect(),
        })
    }

    /// Build a schema from a caller-supplied JSON object (`field_name ->
    /// description`). `serde_json`'s `preserve_order` feature is required
    /// so the object's key order survives into the schema unchanged — a
    /// plain `BTreeMap<String, String>` would silently re-sort the caller's
    /// declared field order alphabetically, which this is an ordered
    /// mapping precisely to avoid (§3).
    pub fn from_json_str(raw: &str) -> Result<Self, ExtractorError> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| ExtractorError::Validation(format!("invalid schema JSON: {}", e)))?;
        let obj = value
            .as_object()
            .ok_or_else(|| ExtractorError::Validation("schema JSON must be an object".to_string()))?;

        let fields = obj
            .iter()
            .map(|(name, description)| {
                let description = description.as_str().ok_or_else(|| {
                    ExtractorError::Validation(format!("schema field {:?} description must be a string", name))
                })?;
                Ok((name.clone(), description.to_string()))
            })
            .collect::<Result<Vec<(String, String)>, ExtractorError>>()?;

        Self::new(fields)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &[SchemaField] {
        &self.fields
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    pub fn description_for(&self, field_name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name == field_name)
            .map(|f| f.description.as_str())
    }

    /// Build a reduced schema containing only the requested field names, in
    /// this schema's original order.
    pub fn subset(&self, names: &HashSet<String>) -> Self {
        Self {
            fields: self
                .fields
                .iter()
                .filter(|f| names.contains(&f.name))
                .cloned()
                .collect(),
        }
    }

    /// Canonical serialisation used by the fingerprinter: keys sorted,
    /// whitespace stripped, so reordering a schema never changes the cache
    /// key (§8 round-trip property).
    pub fn canonical_json(&self) -> String {
        let mut sorted = self.fields.clone();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));

        let mut out = String::from("{");
        for (i, field) in sorted.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&format!(
                "{:?}:{:?}",
                field.name.trim(),
                field.description.split_whitespace().collect::<Vec<_>>().join(" ")
            ));
        }
        out.push('}');
        out
    }
}

/// An immutable extraction request.
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub pdf_bytes: Vec<u8>,
    pub label: String,
    pub schema: Schema,
}

impl ExtractionRequest {
    pub fn new(pdf_bytes: Vec<u8>, label: String, schema: Schema) -> Result<Self, ExtractorError> {
        if pdf_bytes.is_empty() {
            return Err(ExtractorError::Validation(
                "pdf_bytes must not be empty".to_string(),
            ));
        }
        if label.trim().is_empty() {
            return Err(ExtractorError::Validation(
                "label must not be empty".to_string(),
            ));
        }
        Ok(Self {
            pdf_bytes,
            label,
            schema,
        })
    }
}

/// Which execution path produced a result. A tagged variant, not a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    CacheL1,
    CacheL2,
    Template,
    Hybrid,
    Llm,
    Error,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::CacheL1 => "cache_l1",
            Method::CacheL2 => "cache_l2",
            Method::Template => "template",
            Method::Hybrid => "hybrid",
            Method::Llm => "llm",
            Method::Error => "error",
        }
    }
}

/// Method-specific sub-fields. Kept as a flat optional bag rather than one
/// struct per method since `Metadata` is serialised as-is to callers and most
/// fields are mutually exclusive per method.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    pub method: Option<Method>,
    pub time_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_fields: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_fields: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coalesced: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempted_method: Option<Method>,
}

impl Metadata {
    pub fn new(method: Method, time_seconds: f64) -> Self {
        Self {
            method: Some(method),
            time_seconds,
            ..Default::default()
        }
    }
}

/// An immutable extraction result. Once constructed it is never mutated in
/// place — the orchestrator builds a fresh one per request (§3 invariant:
/// cache entries are immutable once written).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub success: bool,
    pub data: std::collections::BTreeMap<String, Option<String>>,
    pub metadata: Metadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExtractionResult {
    pub fn failure(schema: &Schema, metadata: Metadata, error: impl Into<String>) -> Self {
        let data = schema
            .field_names()
            .into_iter()
            .map(|name| (name, None))
            .collect();
        Self {
            success: false,
            data,
            metadata,
            error: Some(error.into()),
        }
    }

    /// Returns true if `data`'s keys are exactly `schema`'s keys (§8 invariant).
    pub fn has_schema_keys(&self, schema: &Schema) -> bool {
        let expected: HashSet<&str> = schema.field_names().iter().map(String::as_str).collect();
        let expected: HashSet<String> = expected.into_iter().map(String::from).collect();
        let actual: HashSet<String> = self.data.keys().cloned().collect();
        expected == actual
    }
}

/// Monotonic-ish wall clock seconds, used only for `time_seconds` reporting.
pub fn now_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// ISO8601 timestamp, reused by templates and results for `created_at` /
/// `updated_at` fields. Ported from the teacher's dependency-free formatter
/// rather than pulling in `chrono`, since nothing else in this crate needs a
/// full calendar library.
pub fn now_iso8601() -> String {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = duration.as_secs();
    let days_since_epoch = secs / 86400;
    let time_of_day = secs % 86400;
    let hours = time_of_day / 3600;
    let minutes = (time_of_day % 3600) / 60;
    let seconds = time_of_day % 60;

    let mut year = 1970i32;
    let mut remaining_days = days_since_epoch as i32;

    loop {
        let days_in_year = if is_leap_year(year) { 366 } else { 365 };
        if remaining_days < days_in_year {
            break;
        }
        remaining_days -= days_in_year;
        year += 1;
    }

    let days_in_months: [i32; 12] = if is_leap_year(year) {
        [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    } else {
        [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    };

    let mut month = 1;
    for days in days_in_months {
        if remaining_days < days {
            break;
        }
        remaining_days -= days;
        month += 1;
    }
    let day = remaining_days + 1;

    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        year, month, day, hours, minutes, seconds
    )
}

fn is_leap_year(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || (year % 400 == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_rejects_empty() {
        assert!(Schema::new(vec![]).is_err());
    }

    #[test]
    fn schema_rejects_duplicates() {
        let fields = vec![
            ("nome".to_string(), "Full name".to_string()),
            ("nome".to_string(), "Name again".to_string()),
        ];
        assert!(Schema::new(fields).is_err());
    }

    #[test]
    fn canonical_json_ignores_order() {
        let a = Schema::new(vec![
            ("nome".to_string(), "Full name".to_string()),
            ("cpf".to_string(), "CPF number".to_string()),
        ])
        .unwrap();
        let b = Schema::new(vec![
            ("cpf".to_string(), "CPF number".to_string()),
            ("nome".to_string(), "Full name".to_string()),
        ])
        .unwrap();
        assert_eq!(a.canonical_json(), b.canonical_json());
    }

    #[test]
    fn canonical_json_strips_whitespace_differences() {
        let a = Schema::new(vec![("nome".to_string(), "Full  name".to_string())]).unwrap();
        let b = Schema::new(vec![("nome".to_string(), "Full name".to_string())]).unwrap();
        assert_eq!(a.canonical_json(), b.canonical_json());
    }

    #[test]
    fn from_json_str_preserves_declared_field_order() {
        let raw = r#"{"seccional": "Seccional da OAB", "nome": "Nome completo", "cpf": "Número do CPF"}"#;
        let schema = Schema::from_json_str(raw).unwrap();
        assert_eq!(schema.field_names(), vec!["seccional", "nome", "cpf"]);
    }

    #[test]
    fn from_json_str_rejects_non_object() {
        assert!(Schema::from_json_str("[1, 2, 3]").is_err());
    }

    #[test]
    fn from_json_str_rejects_non_string_description() {
        assert!(Schema::from_json_str(r#"{"nome": 123}"#).is_err());
    }

    #[test]
    fn result_has_schema_keys() {
        let schema = Schema::new(vec![
            ("nome".to_string(), "Full name".to_string()),
            ("cpf".to_string(), "CPF".to_string()),
        ])
        .unwrap();
        let metadata = Metadata::new(Method::Llm, 0.1);
        let result = ExtractionResult::failure(&schema, metadata, "boom");
        assert!(result.has_schema_keys(&schema));
    }
}
