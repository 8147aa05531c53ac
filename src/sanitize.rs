#![forbid(unsafe_code)]

//! Text cleanup for values that end up inside a double-quoted shell argument
//! that doubles as an output filename.

/// Characters that Windows and most shells refuse inside a filename.
const RESERVED: &[char] = &['/', ':', '*', '?', '"', '<', '>', '|'];

/// Escapes `"` and `\` with a backslash, then drops every reserved filename
/// character and trims surrounding whitespace.
///
/// The stripping pass runs after escaping, so a `"` in the input loses its
/// quote but keeps the backslash that was added in front of it:
/// `Say "Hi"` becomes `Say \Hi\`.
pub fn sanitize(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        if ch == '"' || ch == '\\' {
            escaped.push('\\');
        }
        escaped.push(ch);
    }

    escaped.retain(|ch| !RESERVED.contains(&ch));
    escaped.trim().to_string()
}

/// Backslash-escapes double quotes only. Used for values that are quoted but
/// are not filenames (the chat font).
pub fn escape_quotes(text: &str) -> String {
    text.replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_stays_empty() {
        assert_eq!(sanitize(""), "");
        assert_eq!(sanitize("   "), "");
    }

    #[test]
    fn quotes_leave_their_escape_backslash_behind() {
        assert_eq!(sanitize(r#"Say "Hi""#), r"Say \Hi\");
    }

    #[test]
    fn backslashes_are_doubled() {
        assert_eq!(sanitize(r"a\b"), r"a\\b");
    }

    #[test]
    fn reserved_characters_are_removed() {
        let cleaned = sanitize("a/b:c*d?e<f>g|h");
        assert_eq!(cleaned, "abcdefgh");
    }

    #[test]
    fn output_is_trimmed_after_stripping() {
        assert_eq!(sanitize("  :: Speedrun | Day 3 ::  "), "Speedrun  Day 3");
    }

    #[test]
    fn never_contains_reserved_characters_or_outer_whitespace() {
        let samples = [
            "plain title",
            " leading and trailing ",
            r#"C:\games\"best"?.exe"#,
            "<<>>||**??//::",
            "\t tabbed |\n",
            "unicode ✨ / ok",
        ];
        for sample in samples {
            let cleaned = sanitize(sample);
            for reserved in ['/', ':', '*', '?', '<', '>', '|'] {
                assert!(
                    !cleaned.contains(reserved),
                    "{cleaned:?} still contains {reserved:?}"
                );
            }
            assert_eq!(cleaned, cleaned.trim(), "{cleaned:?} is not trimmed");
        }
    }

    #[test]
    fn escape_quotes_only_touches_double_quotes() {
        assert_eq!(escape_quotes(r#"Ari"al"#), r#"Ari\"al"#);
        assert_eq!(escape_quotes(r"Back\slash: ok"), r"Back\slash: ok");
    }
}
