//! Extract `backend:key` pairs from free-form user submissions.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::backends::Backend;

// Accepts `groq:gsk_...`, `google=AIza...` and `openrouter:"sk-..."`.
// Bare keys must look like an API key so URLs (`https://...`) are not picked up.
static KEY_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)(?P<backend>gemini|google|openrouter|groq|anthropic|openai)\s*[:=]\s*(?:"(?P<quoted>[^"]+)"|(?P<bare>[A-Za-z0-9_\-]{10,}))"#,
    )
    .ok()
});

/// A submitted credential, keyed by the name the user typed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedKey {
    /// Name as written (`google`, `gemini`, ...), lowercased.
    pub label: String,
    pub backend: Backend,
    pub secret: String,
}

/// Parse every recognised pair in `text`. A later pair with the same label
/// replaces an earlier one.
pub fn parse_credentials(text: &str) -> Vec<SubmittedKey> {
    let Some(pattern) = KEY_PATTERN.as_ref() else {
        return Vec::new();
    };
    let mut found: BTreeMap<String, SubmittedKey> = BTreeMap::new();
    for caps in pattern.captures_iter(text) {
        let label = caps["backend"].to_ascii_lowercase();
        let Some(value) = caps.name("quoted").or_else(|| caps.name("bare")) else {
            continue;
        };
        let value = value.as_str();
        if value.starts_with("//") {
            continue;
        }
        let Ok(backend) = label.parse::<Backend>() else {
            continue;
        };
        found.insert(
            label.clone(),
            SubmittedKey {
                label,
                backend,
                secret: value.to_string(),
            },
        );
    }
    found.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret_for<'a>(keys: &'a [SubmittedKey], label: &str) -> Option<&'a str> {
        keys.iter()
            .find(|k| k.label == label)
            .map(|k| k.secret.as_str())
    }

    #[test]
    fn parses_quoted_bare_and_equals_forms() {
        let keys = parse_credentials(r#"openrouter:"sk-abc123" groq:gsk_4567890123 google=AIzaXYZ12345"#);
        assert_eq!(secret_for(&keys, "openrouter"), Some("sk-abc123"));
        assert_eq!(secret_for(&keys, "groq"), Some("gsk_4567890123"));
        assert_eq!(secret_for(&keys, "google"), Some("AIzaXYZ12345"));
        let google = keys.iter().find(|k| k.label == "google").unwrap();
        assert_eq!(google.backend, Backend::Gemini);
    }

    #[test]
    fn short_bare_values_are_ignored() {
        let keys = parse_credentials("groq:gsk_1 openai:short");
        assert!(keys.is_empty());
    }

    #[test]
    fn urls_are_not_keys() {
        let keys = parse_credentials("see openai: https://platform.openai.com/api-keys");
        assert!(keys.is_empty());
    }

    #[test]
    fn case_insensitive_and_last_wins() {
        let keys = parse_credentials("GROQ: gsk_first_key_1 groq=gsk_second_key_2");
        assert_eq!(keys.len(), 1);
        assert_eq!(secret_for(&keys, "groq"), Some("gsk_second_key_2"));
    }
}
