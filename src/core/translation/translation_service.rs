// Translation rendering for goal names, reward values and properties.
//
// A translation variable resolves to one entry per defined language. Texts
// are templates evaluated with the caller's params (usually `level` and the
// goal threshold); if any language's template fails to evaluate, every
// language falls back to its raw text so clients never see a half-rendered
// map.

use crate::core::engine::models::TranslatedText;
use crate::core::expr::{self, Params};

/// Sentinel for a translation variable with no text in the fallback
/// language.
pub fn not_translated_sentinel(translation_id: i32) -> String {
    format!("[not_translated]_{}", translation_id)
}

/// Render a translation variable's rows into a complete per-language map.
///
/// Guarantees on the result:
/// - the fallback language is always present,
/// - every language in `languages` is present (missing ones carry the
///   fallback text).
pub fn render_translation_map(
    translation_id: i32,
    rows: &[(String, String)],
    languages: &[String],
    fallback_language: &str,
    params: &Params,
) -> TranslatedText {
    let rendered: Result<Vec<(String, String)>, _> = rows
        .iter()
        .map(|(lang, text)| {
            expr::evaluate_string(text, params).map(|out| (lang.clone(), out))
        })
        .collect();

    let mut map: TranslatedText = match rendered {
        Ok(pairs) => pairs.into_iter().collect(),
        // rendering failed somewhere: degrade every language to raw text
        Err(_) => rows.iter().cloned().collect(),
    };

    if !map.contains_key(fallback_language) {
        map.insert(
            fallback_language.to_string(),
            not_translated_sentinel(translation_id),
        );
    }

    let fallback_text = map
        .get(fallback_language)
        .cloned()
        .unwrap_or_else(|| not_translated_sentinel(translation_id));

    for lang in languages {
        if !map.contains_key(lang) {
            map.insert(lang.clone(), fallback_text.clone());
        }
    }

    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::expr::level_params;

    fn rows(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(l, t)| (l.to_string(), t.to_string()))
            .collect()
    }

    fn langs(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_renders_templates_per_language() {
        let map = render_translation_map(
            7,
            &rows(&[("en", "'Reach ' + 'level '"), ("de", "'Stufe '")]),
            &langs(&["en", "de"]),
            "en",
            &level_params(2),
        );
        assert_eq!(map["en"], "Reach level ");
        assert_eq!(map["de"], "Stufe ");
    }

    #[test]
    fn test_missing_fallback_gets_sentinel() {
        // only a 'de' entry exists; 'en' is the fallback
        let map = render_translation_map(
            42,
            &rows(&[("de", "'Hallo'")]),
            &langs(&["en", "de"]),
            "en",
            &Params::new(),
        );
        assert_eq!(map["de"], "Hallo");
        assert_eq!(map["en"], "[not_translated]_42");
    }

    #[test]
    fn test_missing_language_falls_back() {
        let map = render_translation_map(
            1,
            &rows(&[("en", "'Hello'")]),
            &langs(&["en", "de", "fr"]),
            "en",
            &Params::new(),
        );
        assert_eq!(map["de"], "Hello");
        assert_eq!(map["fr"], "Hello");
    }

    #[test]
    fn test_failed_rendering_degrades_all_to_raw() {
        let map = render_translation_map(
            1,
            &rows(&[("en", "'ok'"), ("de", "broken +")]),
            &langs(&["en", "de"]),
            "en",
            &Params::new(),
        );
        // 'en' would have rendered fine, but the map degrades as a whole
        assert_eq!(map["en"], "'ok'");
        assert_eq!(map["de"], "broken +");
    }
}
