//! The value validator contract (§6) plus Brazilian-format reference
//! implementations for the shapes the spec names. This is explicitly not an
//! exhaustive regional validator catalogue — just cpf/cnpj/cep/phone/
//! currency/date/integer/text, the shapes §6 enumerates.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeHint {
    Cpf,
    Cnpj,
    Cep,
    Phone,
    Currency,
    Date,
    Integer,
    Text,
}

/// Derive a shape hint from a field description using a fixed keyword
/// dictionary (§6), e.g. "CPF" in the description selects `Cpf`.
pub fn shape_hint_from_description(description: &str) -> ShapeHint {
    let lower = description.to_lowercase();
    if lower.contains("cnpj") {
        ShapeHint::Cnpj
    } else if lower.contains("cpf") {
        ShapeHint::Cpf
    } else if lower.contains("cep") {
        ShapeHint::Cep
    } else if lower.contains("telefone") || lower.contains("celular") || lower.contains("phone") {
        ShapeHint::Phone
    } else if lower.contains("valor")
        || lower.contains("preço")
        || lower.contains("preco")
        || lower.contains("currency")
        || lower.contains("r$")
    {
        ShapeHint::Currency
    } else if lower.contains("data") || lower.contains("date") {
        ShapeHint::Date
    } else if lower.contains("número") || lower.contains("numero") || lower.contains("quantidade") || lower.contains("integer") {
        ShapeHint::Integer
    } else {
        ShapeHint::Text
    }
}

/// `validate(field_name, value, shape_hint) -> (normalised_value | null)`.
/// Validation either normalises the value or rejects it, yielding `None`.
pub fn validate(_field_name: &str, value: &str, shape: ShapeHint) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }

    match shape {
        ShapeHint::Cpf => validate_cpf(trimmed),
        ShapeHint::Cnpj => validate_cnpj(trimmed),
        ShapeHint::Cep => validate_cep(trimmed),
        ShapeHint::Phone => validate_phone(trimmed),
        ShapeHint::Currency => validate_currency(trimmed),
        ShapeHint::Date => validate_date(trimmed),
        ShapeHint::Integer => validate_integer(trimmed),
        ShapeHint::Text => Some(trimmed.to_string()),
    }
}

fn digits_only(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii_digit()).collect()
}

fn validate_cpf(value: &str) -> Option<String> {
    let digits = digits_only(value);
    if digits.len() != 11 {
        return None;
    }
    Some(format!(
        "{}.{}.{}-{}",
        &digits[0..3],
        &digits[3..6],
        &digits[6..9],
        &digits[9..11]
    ))
}

fn validate_cnpj(value: &str) -> Option<String> {
    let digits = digits_only(value);
    if digits.len() != 14 {
        return None;
    }
    Some(format!(
        "{}.{}.{}/{}-{}",
        &digits[0..2],
        &digits[2..5],
        &digits[5..8],
        &digits[8..12],
        &digits[12..14]
    ))
}

fn validate_cep(value: &str) -> Option<String> {
    let digits = digits_only(value);
    if digits.len() != 8 {
        return None;
    }
    Some(format!("{}-{}", &digits[0..5], &digits[5..8]))
}

fn validate_phone(value: &str) -> Option<String> {
    let digits = digits_only(value);
    match digits.len() {
        // Landline: DD NNNN-NNNN
        10 => Some(format!("({}) {}-{}", &digits[0..2], &digits[2..6], &digits[6..10])),
        // Mobile: DD 9NNNN-NNNN
        11 => Some(format!("({}) {}-{}", &digits[0..2], &digits[2..7], &digits[7..11])),
        _ => None,
    }
}

fn currency_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^-?\d{1,3}(\.\d{3})*(,\d{2})?$|^-?\d+(\.\d{2})?$").unwrap())
}

fn validate_currency(value: &str) -> Option<String> {
    let stripped = value.replace("R$", "").trim().to_string();
    if !currency_regex().is_match(&stripped) {
        return None;
    }

    // Normalise Brazilian "1.234,56" -> "1234.56"; leave plain "1234.56" as-is.
    let normalized = if stripped.contains(',') {
        stripped.replace('.', "").replace(',', ".")
    } else {
        stripped
    };

    normalized.parse::<f64>().ok().map(|v| format!("{:.2}", v))
}

fn date_regexes() -> &'static [Regex; 2] {
    static RE: OnceLock<[Regex; 2]> = OnceLock::new();
    RE.get_or_init(|| {
        [
            Regex::new(r"^(\d{2})/(\d{2})/(\d{4})$").unwrap(),
            Regex::new(r"^(\d{4})-(\d{2})-(\d{2})$").unwrap(),
        ]
    })
}

fn validate_date(value: &str) -> Option<String> {
    let regexes = date_regexes();

    if let Some(caps) = regexes[0].captures(value) {
        let (day, month, year) = (&caps[1], &caps[2], &caps[3]);
        return Some(format!("{}-{}-{}", year, month, day));
    }
    if regexes[1].is_match(value) {
        return Some(value.to_string());
    }
    None
}

fn validate_integer(value: &str) -> Option<String> {
    let digits = digits_only(value);
    if digits.is_empty() {
        return None;
    }
    digits.parse::<i64>().ok().map(|v| v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpf_accepts_and_formats() {
        assert_eq!(validate_cpf("12345678900"), Some("123.456.789-00".to_string()));
        assert_eq!(validate_cpf("123.456.789-00"), Some("123.456.789-00".to_string()));
    }

    #[test]
    fn cpf_rejects_wrong_length() {
        assert_eq!(validate_cpf("123"), None);
    }

    #[test]
    fn cep_formats() {
        assert_eq!(validate_cep("01310100"), Some("01310-100".to_string()));
    }

    #[test]
    fn phone_formats_mobile_and_landline() {
        assert_eq!(validate_phone("11987654321"), Some("(11) 98765-4321".to_string()));
        assert_eq!(validate_phone("1133334444"), Some("(11) 3333-4444".to_string()));
    }

    #[test]
    fn currency_normalises_brazilian_format() {
        assert_eq!(validate_currency("R$ 1.234,56"), Some("1234.56".to_string()));
    }

    #[test]
    fn date_normalises_br_to_iso() {
        assert_eq!(validate_date("31/12/2023"), Some("2023-12-31".to_string()));
        assert_eq!(validate_date("2023-12-31"), Some("2023-12-31".to_string()));
    }

    #[test]
    fn shape_hint_keyword_dictionary() {
        assert_eq!(shape_hint_from_description("Número do CPF"), ShapeHint::Cpf);
        assert_eq!(shape_hint_from_description("CNPJ da empresa"), ShapeHint::Cnpj);
        assert_eq!(shape_hint_from_description("Data de nascimento"), ShapeHint::Date);
        assert_eq!(shape_hint_from_description("Nome completo"), ShapeHint::Text);
    }

    #[test]
    fn validate_rejects_empty_value() {
        assert_eq!(validate("nome", "   ", ShapeHint::Text), None);
    }
}
