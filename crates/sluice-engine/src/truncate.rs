/// First `max_chars` characters of `s`.
pub fn preview(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Make an error message safe to show a client: control characters become
/// spaces and the result is bounded to `max_chars` characters.
pub fn sanitize_error(message: &str, max_chars: usize) -> String {
    let cleaned: String = message
        .trim()
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    let bounded = preview(&cleaned, max_chars);
    if bounded.trim().is_empty() {
        "execution failed".to_string()
    } else {
        bounded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_short_is_unchanged() {
        assert_eq!(preview("hello", 200), "hello");
        assert_eq!(preview("", 3), "");
    }

    #[test]
    fn preview_counts_chars_not_bytes() {
        assert_eq!(preview("héllo wörld", 4), "héll");
        assert_eq!(preview("日本語テキスト", 3), "日本語");
    }

    #[test]
    fn sanitize_replaces_controls_and_bounds() {
        assert_eq!(sanitize_error("line1\nline2\tx", 500), "line1 line2 x");
        assert_eq!(sanitize_error(&"e".repeat(600), 500).chars().count(), 500);
    }

    #[test]
    fn sanitize_never_returns_empty() {
        assert_eq!(sanitize_error("  \n ", 500), "execution failed");
    }
}
