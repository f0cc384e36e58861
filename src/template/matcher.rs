//! Template similarity scoring (§4.4): `S = 0.7*S_structural + 0.2*S_tokens
//! + 0.1*S_characters`, gated at `S >= 0.70` and `sample_count >= 2`.

use std::collections::{HashMap, HashSet};

use crate::parser::ParsedDocument;
use crate::stopwords::is_stopword;
use crate::template::Template;

const W_STRUCTURAL: f64 = 0.7;
const W_TOKENS: f64 = 0.2;
const W_CHARACTERS: f64 = 0.1;
const TOP_N_TOKENS: usize = 200;
const CHAR_PREFIX_LEN: usize = 2048;

pub const SIMILARITY_THRESHOLD: f64 = 0.70;
pub const MIN_SAMPLE_COUNT: u32 = 2;

/// Normalise a token: lowercase (case-folded), accents preserved per §4.4.
fn normalize_token(s: &str) -> String {
    s.to_lowercase()
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(normalize_token)
        .filter(|t| !t.is_empty() && !is_stopword(t))
        .collect()
}

fn token_frequencies(text: &str) -> HashMap<String, u32> {
    let mut freq: HashMap<String, u32> = HashMap::new();
    for token in tokenize(text) {
        *freq.entry(token).or_insert(0) += 1;
    }
    freq
}

/// Build the frequency table stored on a template at learning time, capped
/// to the top 200 most frequent tokens.
pub fn top_token_frequencies(text: &str) -> std::collections::BTreeMap<String, u32> {
    let mut freq: Vec<(String, u32)> = token_frequencies(text).into_iter().collect();
    freq.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    freq.into_iter().take(TOP_N_TOKENS).collect()
}

pub fn normalized_prefix(text: &str) -> String {
    let normalized: String = text.to_lowercase();
    let mut end = CHAR_PREFIX_LEN.min(normalized.len());
    while !normalized.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    normalized[..end].to_string()
}

fn jaccard<T: Eq + std::hash::Hash>(a: &HashSet<T>, b: &HashSet<T>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Jaccard over frequency-weighted multisets: each token contributes
/// `min(count_a, count_b)` to the intersection and `max(count_a, count_b)`
/// to the union.
fn multiset_jaccard(a: &HashMap<String, u32>, b: &HashMap<String, u32>) -> f64 {
    let keys: HashSet<&String> = a.keys().chain(b.keys()).collect();
    if keys.is_empty() {
        return 1.0;
    }
    let (mut intersection, mut union) = (0u64, 0u64);
    for key in keys {
        let ca = *a.get(key).unwrap_or(&0) as u64;
        let cb = *b.get(key).unwrap_or(&0) as u64;
        intersection += ca.min(cb);
        union += ca.max(cb);
    }
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Longest-common-subsequence ratio between two (already truncated,
/// normalised) strings: `2 * lcs_len / (len_a + len_b)`.
fn lcs_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for ca in &a {
        for (j, cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    let lcs_len = prev[b.len()];

    (2 * lcs_len) as f64 / (a.len() + b.len()) as f64
}

/// Detect the "anchor token" half of a document's structural signature:
/// case-folded, accent-preserving, stopword-stripped tokens found anywhere
/// in its text. Callers that need the full structural signature (§3: schema
/// keys plus anchor tokens) must union this with the request's schema field
/// names via `structural_signature`.
pub fn document_structural_tokens(document: &ParsedDocument) -> HashSet<String> {
    tokenize(&document.full_text).into_iter().collect()
}

/// The full structural signature (§3): the unordered set of schema keys
/// plus the document's anchor tokens.
pub fn structural_signature(document: &ParsedDocument, schema_field_names: &[String]) -> HashSet<String> {
    let mut signature = document_structural_tokens(document);
    signature.extend(schema_field_names.iter().map(|name| normalize_token(name)));
    signature
}

/// Compute `S` for a single template against a parsed document and the
/// schema of the incoming request (§4.4). Both sides of `S_structural` must
/// include the schema-key half of the signature for the comparison to be
/// meaningful.
pub fn similarity(template: &Template, document: &ParsedDocument, schema_field_names: &[String]) -> f64 {
    let doc_tokens = structural_signature(document, schema_field_names);
    let s_structural = jaccard(&template.structural_signature, &doc_tokens);

    let doc_freq = token_frequencies(&document.full_text);
    let doc_top: HashMap<String, u32> = {
        let mut v: Vec<(String, u32)> = doc_freq.into_iter().collect();
        v.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        v.into_iter().take(TOP_N_TOKENS).collect()
    };
    let template_freq: HashMap<String, u32> = template
        .token_frequencies
        .iter()
        .map(|(k, v)| (k.clone(), *v))
        .collect();
    let s_tokens = multiset_jaccard(&template_freq, &doc_top);

    let doc_prefix = normalized_prefix(&document.full_text);
    let s_characters = lcs_ratio(&template.sample_text_prefix, &doc_prefix);

    W_STRUCTURAL * s_structural + W_TOKENS * s_tokens + W_CHARACTERS * s_characters
}

/// Best `(template, S)` for a label's candidate templates, or `None` if no
/// template clears both the similarity and sample-count gates (§4.4).
pub fn best_match<'a>(
    templates: &'a [Template],
    document: &ParsedDocument,
    schema_field_names: &[String],
    similarity_threshold: f64,
    min_sample_count: u32,
) -> Option<(&'a Template, f64)> {
    templates
        .iter()
        .filter(|t| t.sample_count >= min_sample_count)
        .map(|t| (t, similarity(t, document, schema_field_names)))
        .filter(|(_, s)| *s >= similarity_threshold)
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ParsedDocument;

    fn doc(text: &str) -> ParsedDocument {
        ParsedDocument {
            elements: vec![],
            full_text: text.to_string(),
            page_count: 1,
        }
    }

    fn schema_names() -> Vec<String> {
        vec!["cpf".to_string(), "nome".to_string()]
    }

    #[test]
    fn identical_text_scores_near_one() {
        let text = "Processo número 123 CPF 456 requerente João";
        let mut template = Template::new("oab", structural_signature(&doc(text), &schema_names()));
        template.sample_count = 5;
        template.token_frequencies = top_token_frequencies(text);
        template.sample_text_prefix = normalized_prefix(text);

        let score = similarity(&template, &doc(text), &schema_names());
        assert!(score > 0.95, "expected near-1 similarity, got {}", score);
    }

    #[test]
    fn unrelated_text_scores_low() {
        let mut template = Template::new("oab", HashSet::from(["processo".to_string(), "requerente".to_string()]));
        template.sample_count = 5;
        template.token_frequencies = top_token_frequencies("processo requerente cpf");
        template.sample_text_prefix = normalized_prefix("processo requerente cpf");

        let other = doc("receita federal imposto declaração anual");
        let score = similarity(&template, &other, &schema_names());
        assert!(score < 0.3, "expected low similarity, got {}", score);
    }

    #[test]
    fn best_match_respects_min_sample_count() {
        let mut template = Template::new("oab", structural_signature(&doc("cpf nome endereco"), &schema_names()));
        template.sample_count = 1; // below MIN_SAMPLE_COUNT
        template.token_frequencies = top_token_frequencies("cpf nome endereco");
        template.sample_text_prefix = normalized_prefix("cpf nome endereco");

        let templates = vec![template];
        let result = best_match(&templates, &doc("cpf nome endereco"), &schema_names(), SIMILARITY_THRESHOLD, MIN_SAMPLE_COUNT);
        assert!(result.is_none());
    }

    #[test]
    fn lcs_ratio_identical_strings_is_one() {
        assert!((lcs_ratio("abcdef", "abcdef") - 1.0).abs() < 1e-9);
    }
}
