use once_cell::sync::Lazy;
use regex::Regex;

/// Recognition artifacts where the recognizer repeats a short phrase.
const DUPLICATED_PHRASES: &[(&str, &str)] = &[
    ("slyšíme se dobrý den", "dobrý den"),
    ("dobry den dobry den", "dobrý den"),
    ("dobrý den dobrý den", "dobrý den"),
    ("jo jo", "jo"),
    ("ne ne", "ne"),
    ("tak tak", "tak"),
    ("já já", "já"),
    ("mám mám", "mám"),
    ("takhle takhle", "takhle"),
    ("uvažuji uvažuji", "uvažuji"),
];

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Cleans raw speech-to-text output before it reaches retrieval or the model.
pub fn normalize(raw: &str) -> String {
    let mut cleaned = WHITESPACE.replace_all(&raw.to_lowercase(), " ").trim().to_string();
    for (duplicated, single) in DUPLICATED_PHRASES {
        if cleaned.contains(duplicated) {
            cleaned = cleaned.replace(duplicated, single);
        }
    }
    WHITESPACE.replace_all(&cleaned, " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_duplicated_greeting() {
        assert_eq!(normalize("dobry den dobry den"), "dobrý den");
        assert_eq!(normalize("Dobry   Den dobry den"), "dobrý den");
    }

    #[test]
    fn collapses_whitespace_runs() {
        assert_eq!(normalize("  kolik \t to\n\nstojí  "), "kolik to stojí");
    }

    #[test]
    fn collapses_short_affirmatives() {
        assert_eq!(normalize("Jo jo, mám mám zájem"), "jo, mám zájem");
    }

    #[test]
    fn empty_input_is_fine() {
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("   "), "");
    }
}
