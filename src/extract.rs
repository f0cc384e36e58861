//! The field extractor (§4.6): given `(parsed_document, template, schema)`,
//! applies each field's pattern disjunction (positional -> contextual ->
//! regex, stopping at the first non-empty result) and validates the
//! candidate through the value validator.

use std::collections::{BTreeMap, HashSet};

use regex::Regex;

use crate::model::Schema;
use crate::parser::{ElementKind, ParsedDocument};
use crate::template::{ContextualPattern, Direction, FieldPattern, PositionalPattern, RegexPattern, Template};
use crate::validator::{shape_hint_from_description, validate};

const POSITIONAL_TOLERANCE: f64 = 0.10;
const MAX_REGEX_MATCHES: usize = 3;

pub struct ExtractionOutcome {
    pub fields: BTreeMap<String, Option<String>>,
    pub fields_filled: HashSet<String>,
}

/// Apply `template`'s patterns against `document` for every field in
/// `schema`, validating each candidate before accepting it.
pub fn extract(document: &ParsedDocument, template: &Template, schema: &Schema) -> ExtractionOutcome {
    let mut fields = BTreeMap::new();
    let mut fields_filled = HashSet::new();

    for field in schema.fields() {
        let candidate = template
            .field_patterns
            .get(&field.name)
            .and_then(|pattern| apply_field_pattern(pattern, document));

        let validated = candidate.and_then(|value| {
            let shape = shape_hint_from_description(&field.description);
            validate(&field.name, &value, shape)
        });

        if validated.is_some() {
            fields_filled.insert(field.name.clone());
        }
        fields.insert(field.name.clone(), validated);
    }

    ExtractionOutcome { fields, fields_filled }
}

/// Try a single field's pattern disjunction in order, stopping at the first
/// non-empty raw candidate (validation happens separately in `extract`, and
/// again ad hoc by the pattern learner when scoring confidence).
pub fn apply_field_pattern(pattern: &FieldPattern, document: &ParsedDocument) -> Option<String> {
    if let Some(positional) = &pattern.positional {
        if let Some(value) = apply_positional(positional, document) {
            return Some(value);
        }
    }
    if let Some(contextual) = &pattern.contextual {
        if let Some(value) = apply_contextual(contextual, document) {
            return Some(value);
        }
    }
    if let Some(regex) = &pattern.regex {
        if let Some(value) = apply_regex(regex, document) {
            return Some(value);
        }
    }
    None
}

/// A candidate element's centre must fall inside the pattern's region
/// expanded by 10% on each side; ties broken by smallest area (§4.6).
fn apply_positional(pattern: &PositionalPattern, document: &ParsedDocument) -> Option<String> {
    let region = pattern.region.expanded(POSITIONAL_TOLERANCE);

    document
        .elements
        .iter()
        .filter(|el| el.page == pattern.page)
        .filter(|el| {
            let (cx, cy) = el.bbox.center();
            region.contains_point(cx, cy)
        })
        .min_by(|a, b| a.bbox.area().partial_cmp(&b.bbox.area()).unwrap_or(std::cmp::Ordering::Equal))
        .map(|el| el.text.clone())
}

/// Accepts only an element in the recorded relative direction from the
/// anchor, on the same or adjacent line (§4.6). Whole-line pseudo-elements
/// (`ElementKind::Line`) are excluded from the search: they are not real
/// candidate values and, being whole-line spans, would otherwise always be
/// picked over the actual tokens they contain.
fn apply_contextual(pattern: &ContextualPattern, document: &ParsedDocument) -> Option<String> {
    let lines: Vec<Vec<&crate::parser::Element>> = document
        .lines(0.01)
        .into_iter()
        .map(|line| line.into_iter().filter(|el| el.kind != ElementKind::Line).collect())
        .collect();

    for (line_idx, line) in lines.iter().enumerate() {
        let Some(anchor_pos) = line.iter().position(|el| el.text == pattern.anchor_text) else {
            continue;
        };

        match pattern.direction {
            Direction::Right | Direction::SameLine => {
                if let Some(candidate) = line.get(anchor_pos + 1) {
                    return Some(candidate.text.clone());
                }
            }
            Direction::Below => {
                if let Some(next_line) = lines.get(line_idx + 1) {
                    if let Some(candidate) = next_line.first() {
                        return Some(candidate.text.clone());
                    }
                }
            }
        }
    }
    None
}

/// Accepts only when the global match count across the document is <= 3,
/// returning the first match (§4.6).
fn apply_regex(pattern: &RegexPattern, document: &ParsedDocument) -> Option<String> {
    let compiled = Regex::new(&pattern.pattern).ok()?;
    let matches: Vec<&str> = compiled.find_iter(&document.full_text).map(|m| m.as_str()).collect();
    if matches.is_empty() || matches.len() > MAX_REGEX_MATCHES {
        return None;
    }
    Some(matches[0].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{BBox, Element, ElementKind};

    fn element(text: &str, page: u32, bbox: BBox, line_index: usize) -> Element {
        Element {
            text: text.to_string(),
            page,
            bbox,
            kind: ElementKind::Paragraph,
            line_index,
        }
    }

    fn bbox(x0: f64, y0: f64, x1: f64, y1: f64) -> BBox {
        BBox { x0, y0, x1, y1 }
    }

    #[test]
    fn positional_pattern_matches_within_tolerance() {
        let doc = ParsedDocument {
            elements: vec![element("123.456.789-00", 0, bbox(0.4, 0.4, 0.6, 0.45), 0)],
            full_text: "123.456.789-00".to_string(),
            page_count: 1,
        };
        let pattern = PositionalPattern {
            region: bbox(0.4, 0.4, 0.6, 0.45),
            page: 0,
        };
        assert_eq!(apply_positional(&pattern, &doc), Some("123.456.789-00".to_string()));
    }

    #[test]
    fn contextual_pattern_matches_to_the_right() {
        let doc = ParsedDocument {
            elements: vec![
                element("CPF:", 0, bbox(0.0, 0.5, 0.1, 0.52), 0),
                element("123.456.789-00", 0, bbox(0.12, 0.5, 0.3, 0.52), 0),
            ],
            full_text: "CPF: 123.456.789-00".to_string(),
            page_count: 1,
        };
        let pattern = ContextualPattern {
            anchor_text: "CPF:".to_string(),
            direction: Direction::Right,
        };
        assert_eq!(apply_contextual(&pattern, &doc), Some("123.456.789-00".to_string()));
    }

    #[test]
    fn regex_pattern_rejects_too_many_matches() {
        let doc = ParsedDocument {
            elements: vec![],
            full_text: "111-11 222-22 333-33 444-44".to_string(),
            page_count: 1,
        };
        let pattern = RegexPattern {
            pattern: r"\d{3}\-\d{2}".to_string(),
        };
        assert_eq!(apply_regex(&pattern, &doc), None);
    }

    #[test]
    fn extract_validates_and_rejects_bad_values() {
        let schema = Schema::new(vec![("cpf".to_string(), "Número do CPF".to_string())]).unwrap();
        let mut template = Template::new("oab", Default::default());
        template.field_patterns.insert(
            "cpf".to_string(),
            FieldPattern {
                positional: None,
                contextual: None,
                regex: Some(RegexPattern { pattern: r"\d+".to_string() }),
            },
        );

        let doc = ParsedDocument {
            elements: vec![],
            full_text: "42".to_string(),
            page_count: 1,
        };

        let outcome = extract(&doc, &template, &schema);
        // "42" is not a valid 11-digit CPF, so it must be rejected to null.
        assert_eq!(outcome.fields.get("cpf").unwrap(), &None);
        assert!(!outcome.fields_filled.contains("cpf"));
    }
}
