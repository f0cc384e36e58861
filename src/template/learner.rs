//! Pattern induction and confidence maintenance (§4.5), invoked after a full
//! LLM extraction succeeds.

use std::collections::BTreeMap;

use regex::Regex;

use crate::extract::apply_field_pattern;
use crate::model::{now_iso8601, Schema};
use crate::parser::ParsedDocument;
use crate::template::{
    ContextualPattern, Direction, FieldPattern, PositionalPattern, RegexPattern, Template,
};
use crate::template::matcher::{structural_signature, top_token_frequencies, normalized_prefix};

const EMA_ALPHA: f64 = 0.3;
const MAX_ANCHOR_TOKENS: usize = 6;
const MAX_REGEX_MATCHES: usize = 3;
const SIGNATURE_DELTA_THRESHOLD: f64 = 0.30;
const LINE_TOLERANCE: f64 = 0.01;

/// Decide whether to update an existing sibling in place or start a new one,
/// given the observed structural signature of this learning event (§3, §4.5).
/// The observed signature is the document's anchor tokens unioned with the
/// request schema's field names, per §3's definition of a structural
/// signature. Every candidate sibling for the label is compared against the
/// observed signature (analogous to `template::matcher::best_match`) and the
/// one with the smallest delta is updated in place; none of them within the
/// threshold starts a new sibling, never just the most-trained candidate.
pub fn select_template(
    label: &str,
    candidates: &[Template],
    document: &ParsedDocument,
    schema_field_names: &[String],
) -> Template {
    let observed = structural_signature(document, schema_field_names);

    let closest = candidates
        .iter()
        .map(|template| (template, template.signature_delta(&observed)))
        .filter(|(_, delta)| *delta <= SIGNATURE_DELTA_THRESHOLD)
        .min_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    match closest {
        Some((template, _)) => template.clone(),
        None => Template::new(label, observed),
    }
}

/// Induce or refine patterns for each non-null field in `result`, updating
/// `template` in place. Returns the updated template — callers persist it
/// via the template store.
pub fn learn(mut template: Template, document: &ParsedDocument, result: &BTreeMap<String, Option<String>>, schema: &Schema) -> Template {
    for field in schema.fields() {
        let Some(Some(value)) = result.get(&field.name).map(|v| v.as_ref().map(|s| s.as_str())) else {
            continue;
        };

        // Confidence update happens against the *pre-existing* pattern,
        // before it gets overwritten below — success = it already would
        // have produced this value (§4.5).
        if let Some(existing_pattern) = template.field_patterns.get(&field.name) {
            let predicted = apply_field_pattern(existing_pattern, document);
            let success = predicted.as_deref() == Some(value);
            update_confidence(&mut template, &field.name, success);
        } else {
            template.field_confidence.insert(field.name.clone(), 1.0);
        }

        let pattern = induce_pattern(document, value);
        if !pattern.is_empty() {
            template.field_patterns.insert(field.name.clone(), pattern);
        }
    }

    template.sample_count += 1;
    template.token_frequencies = top_token_frequencies(&document.full_text);
    template.sample_text_prefix = normalized_prefix(&document.full_text);
    template.updated_at = now_iso8601();
    template
}

fn update_confidence(template: &mut Template, field_name: &str, success: bool) {
    let old = template.field_confidence.get(field_name).copied().unwrap_or(1.0);
    let sample = if success { 1.0 } else { 0.0 };
    let new_conf = EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * old;
    template.field_confidence.insert(field_name.to_string(), new_conf);
}

fn induce_pattern(document: &ParsedDocument, value: &str) -> FieldPattern {
    FieldPattern {
        positional: induce_positional(document, value),
        contextual: induce_contextual(document, value),
        regex: induce_regex(document, value),
    }
}

/// Step 1: locate elements whose text contains `value`; record the smallest
/// containing element's bounding box and page.
fn induce_positional(document: &ParsedDocument, value: &str) -> Option<PositionalPattern> {
    document
        .elements
        .iter()
        .filter(|el| el.text.contains(value))
        .min_by(|a, b| a.bbox.area().partial_cmp(&b.bbox.area()).unwrap_or(std::cmp::Ordering::Equal))
        .map(|el| PositionalPattern {
            region: el.bbox,
            page: el.page,
        })
}

/// Step 2: search for a short anchor in the same line (to the left) or the
/// line above the element holding `value`. Whole-line pseudo-elements
/// (`ElementKind::Line`) are excluded: they always contain `value` trivially
/// and would otherwise be picked as the anchor position before any real
/// token is considered.
fn induce_contextual(document: &ParsedDocument, value: &str) -> Option<ContextualPattern> {
    let lines: Vec<Vec<&crate::parser::Element>> = document
        .lines(LINE_TOLERANCE)
        .into_iter()
        .map(|line| {
            line.into_iter()
                .filter(|el| el.kind != crate::parser::ElementKind::Line)
                .collect()
        })
        .collect();

    for (line_idx, line) in lines.iter().enumerate() {
        let Some(pos) = line.iter().position(|el| el.text.contains(value)) else {
            continue;
        };

        // Same-line anchor to the left.
        if pos > 0 {
            let anchor = line[pos - 1];
            if is_short_anchor(&anchor.text) {
                return Some(ContextualPattern {
                    anchor_text: anchor.text.clone(),
                    direction: Direction::Right,
                });
            }
        }

        // Anchor on the line above.
        if line_idx > 0 {
            if let Some(anchor) = lines[line_idx - 1].last() {
                if is_short_anchor(&anchor.text) {
                    return Some(ContextualPattern {
                        anchor_text: anchor.text.clone(),
                        direction: Direction::Below,
                    });
                }
            }
        }
    }

    None
}

fn is_short_anchor(text: &str) -> bool {
    let token_count = text.split_whitespace().count();
    token_count >= 1 && token_count <= MAX_ANCHOR_TOKENS
}

/// Step 3: induce a regex from the value's character classes, record only
/// if it matches at most `N=3` substrings across the document.
fn induce_regex(document: &ParsedDocument, value: &str) -> Option<RegexPattern> {
    let pattern = char_class_regex(value);
    let compiled = Regex::new(&pattern).ok()?;
    let match_count = compiled.find_iter(&document.full_text).count();
    if match_count >= 1 && match_count <= MAX_REGEX_MATCHES {
        Some(RegexPattern { pattern })
    } else {
        None
    }
}

#[derive(PartialEq)]
enum CharClass {
    Digit,
    Alpha,
    Other,
}

fn classify(c: char) -> CharClass {
    if c.is_ascii_digit() {
        CharClass::Digit
    } else if c.is_alphabetic() {
        CharClass::Alpha
    } else {
        CharClass::Other
    }
}

/// Build a regex from runs of same-class characters, e.g. `123.456.789-00`
/// -> `\d{3}\.\d{3}\.\d{3}-\d{2}`.
fn char_class_regex(value: &str) -> String {
    let mut pattern = String::new();
    let chars: Vec<char> = value.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let class = classify(chars[i]);
        let mut run_len = 1;
        while i + run_len < chars.len() && classify(chars[i + run_len]) == class {
            run_len += 1;
        }

        match class {
            CharClass::Digit => pattern.push_str(&format!(r"\d{{{}}}", run_len)),
            CharClass::Alpha => pattern.push_str(&format!(r"\w{{{}}}", run_len)),
            CharClass::Other => {
                for c in &chars[i..i + run_len] {
                    pattern.push_str(&regex::escape(&c.to_string()));
                }
            }
        }

        i += run_len;
    }
    pattern
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn char_class_regex_collapses_runs() {
        assert_eq!(char_class_regex("123.456.789-00"), r"\d{3}\.\d{3}\.\d{3}\-\d{2}");
    }

    #[test]
    fn is_short_anchor_respects_token_limit() {
        assert!(is_short_anchor("CPF:"));
        assert!(!is_short_anchor("um dois tres quatro cinco seis sete"));
    }

    #[test]
    fn ema_confidence_decays_on_failure() {
        let mut template = Template::new("oab", Default::default());
        template.field_confidence.insert("cpf".to_string(), 1.0);
        update_confidence(&mut template, "cpf", false);
        assert!((template.field_confidence["cpf"] - 0.7).abs() < 1e-9);
    }

    fn doc(text: &str) -> ParsedDocument {
        ParsedDocument {
            elements: vec![],
            full_text: text.to_string(),
            page_count: 1,
        }
    }

    #[test]
    fn select_template_picks_closest_sibling_not_most_trained() {
        let schema_names = vec!["nome".to_string()];

        // `high` has far more samples but a signature unrelated to the
        // incoming document; `low` has fewer samples but is the actual
        // structural match. The closest sibling must win regardless of
        // sample_count.
        let mut high = Template::new("oab", structural_signature(&doc("receita federal imposto"), &schema_names));
        high.sample_count = 50;
        let mut low = Template::new("oab", structural_signature(&doc("processo requerente nome"), &schema_names));
        low.sample_count = 2;
        let low_id = low.template_id.clone();

        let candidates = vec![high, low];
        let observed_doc = doc("processo requerente nome completo");
        let selected = select_template("oab", &candidates, &observed_doc, &schema_names);

        assert_eq!(selected.template_id, low_id);
    }

    #[test]
    fn select_template_starts_new_sibling_when_no_candidate_is_close() {
        let schema_names = vec!["nome".to_string()];
        let mut unrelated = Template::new("oab", structural_signature(&doc("receita federal imposto anual"), &schema_names));
        unrelated.sample_count = 10;

        let candidates = vec![unrelated.clone()];
        let observed_doc = doc("processo requerente nome completo");
        let selected = select_template("oab", &candidates, &observed_doc, &schema_names);

        assert_ne!(selected.template_id, unrelated.template_id);
        assert_eq!(selected.sample_count, 0);
    }
}
