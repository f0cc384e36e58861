//! Fixed Brazilian-Portuguese stopword list used by the template matcher
//! (§4.4) to case-fold, accent-preserve and strip noise tokens before
//! computing `S_structural`/`S_tokens`. Data, not code — matches the
//! `legal_br` / `financial_br` language target this codebase's existing
//! configs already assume.

use std::collections::HashSet;
use std::sync::OnceLock;

const WORDS: &[&str] = &[
    "a", "o", "os", "as", "um", "uma", "uns", "umas", "de", "do", "da", "dos", "das", "em", "no",
    "na", "nos", "nas", "por", "para", "com", "sem", "sob", "sobre", "entre", "até", "desde",
    "e", "ou", "mas", "que", "se", "como", "quando", "onde", "qual", "quais", "quanto", "quanta",
    "é", "são", "foi", "foram", "ser", "está", "estão", "era", "eram", "tem", "têm", "ter",
    "seu", "sua", "seus", "suas", "este", "esta", "estes", "estas", "esse", "essa", "esses",
    "essas", "aquele", "aquela", "aqueles", "aquelas", "isso", "isto", "aquilo", "não", "sim",
    "já", "ainda", "também", "apenas", "muito", "mais", "menos", "bem", "mal", "todo", "toda",
    "todos", "todas", "cada", "outro", "outra", "outros", "outras", "mesmo", "mesma", "lhe",
    "lhes", "me", "te", "nos", "vos", "eu", "tu", "ele", "ela", "nós", "vós", "eles", "elas",
];

pub fn is_stopword(token: &str) -> bool {
    stopword_set().contains(token)
}

fn stopword_set() -> &'static HashSet<&'static str> {
    static SET: OnceLock<HashSet<&'static str>> = OnceLock::new();
    SET.get_or_init(|| WORDS.iter().copied().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_common_stopwords() {
        assert!(is_stopword("de"));
        assert!(is_stopword("não"));
        assert!(!is_stopword("cpf"));
    }
}
