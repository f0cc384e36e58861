//! Per-label template store and the matcher/learner that operate on it
//! (§3 Template/Pattern, §4.3-4.5).

pub mod learner;
pub mod matcher;
pub mod store;

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::model::now_iso8601;
use crate::parser::BBox;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Right,
    Below,
    SameLine,
}

/// A per-field pattern disjunction, tried positional -> contextual -> regex
/// (§3 Pattern, §4.6). All three may be present; the extractor stops at the
/// first that produces a non-empty, validated candidate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldPattern {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub positional: Option<PositionalPattern>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contextual: Option<ContextualPattern>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regex: Option<RegexPattern>,
}

impl FieldPattern {
    pub fn is_empty(&self) -> bool {
        self.positional.is_none() && self.contextual.is_none() && self.regex.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionalPattern {
    pub region: BBox,
    pub page: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextualPattern {
    pub anchor_text: String,
    pub direction: Direction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegexPattern {
    pub pattern: String,
}

/// `(label, template_id)` identified; `label` is not unique (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub template_id: String,
    pub label: String,
    pub sample_count: u32,
    pub structural_signature: HashSet<String>,
    pub field_patterns: BTreeMap<String, FieldPattern>,
    pub field_confidence: BTreeMap<String, f64>,
    /// Frequency table of the training document(s)' non-stopword tokens,
    /// capped to the top 200 by frequency (§4.4 `S_tokens`). Stored as
    /// counts rather than raw text so matching stays cheap and the
    /// persisted record stays bounded in size regardless of document size.
    pub token_frequencies: BTreeMap<String, u32>,
    /// First 2 KB of the (normalised) training text, used for the
    /// longest-common-subsequence `S_characters` term (§4.4).
    pub sample_text_prefix: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Template {
    pub fn new(label: impl Into<String>, structural_signature: HashSet<String>) -> Self {
        let now = now_iso8601();
        Self {
            template_id: uuid::Uuid::new_v4().to_string(),
            label: label.into(),
            sample_count: 0,
            structural_signature,
            field_patterns: BTreeMap::new(),
            field_confidence: BTreeMap::new(),
            token_frequencies: BTreeMap::new(),
            sample_text_prefix: String::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Fields eligible for template-only extraction without LLM fallback
    /// (§3 invariant: `field_confidence[f] >= 0.8`).
    pub fn confident_fields(&self, threshold: f64) -> HashSet<String> {
        self.field_confidence
            .iter()
            .filter(|(_, &conf)| conf >= threshold)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Structural-signature delta against a freshly observed signature, used
    /// to decide whether a sibling template should be created (§4.5).
    pub fn signature_delta(&self, observed: &HashSet<String>) -> f64 {
        if self.structural_signature.is_empty() && observed.is_empty() {
            return 0.0;
        }
        let union: HashSet<&String> = self.structural_signature.union(observed).collect();
        let intersection: HashSet<&String> = self.structural_signature.intersection(observed).collect();
        if union.is_empty() {
            return 0.0;
        }
        1.0 - (intersection.len() as f64 / union.len() as f64)
    }
}

/// A compact view used by `GET /templates/:label` (§4.9) — sample counts,
/// confidence, signature, not the raw patterns, to keep the payload small.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSummary {
    pub template_id: String,
    pub sample_count: u32,
    pub structural_signature: Vec<String>,
    pub field_confidence: BTreeMap<String, f64>,
    pub updated_at: String,
}

impl From<&Template> for TemplateSummary {
    fn from(t: &Template) -> Self {
        Self {
            template_id: t.template_id.clone(),
            sample_count: t.sample_count,
            structural_signature: {
                let mut v: Vec<String> = t.structural_signature.iter().cloned().collect();
                v.sort();
                v
            },
            field_confidence: t.field_confidence.clone(),
            updated_at: t.updated_at.clone(),
        }
    }
}
