/// Escapes the three characters that can open markup: `&`, `<` and `>`.
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    push_escaped(&mut escaped, text);
    escaped
}

pub(crate) fn push_escaped(out: &mut String, text: &str) {
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
}

/// Escaping for values placed inside a double-quoted attribute.
pub(crate) fn push_escaped_attribute(out: &mut String, value: &str) {
    for ch in value.chars() {
        match ch {
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => push_escaped(out, ch.encode_utf8(&mut [0; 4])),
        }
    }
}

/// Only link schemes that cannot execute script survive into `href`.
pub(crate) fn is_safe_href(href: &str) -> bool {
    let trimmed = href.trim_start();
    let Some(colon) = trimmed.find(':') else {
        return true;
    };
    // A colon after the first path/query/fragment delimiter is not a scheme separator.
    if trimmed[..colon].contains(['/', '?', '#']) {
        return true;
    }

    let scheme = trimmed[..colon].to_ascii_lowercase();
    matches!(scheme.as_str(), "http" | "https" | "mailto")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_only_markup_openers() {
        assert_eq!(
            escape_html(r#"<a href="x">Tom & 'Jerry'</a>"#),
            r#"&lt;a href="x"&gt;Tom &amp; 'Jerry'&lt;/a&gt;"#
        );
    }

    #[test]
    fn attribute_escaping_covers_quotes() {
        let mut out = String::new();
        push_escaped_attribute(&mut out, r#"a"b'c<d"#);
        assert_eq!(out, "a&quot;b&#39;c&lt;d");
    }

    #[test]
    fn rejects_script_schemes() {
        assert!(is_safe_href("https://example.org/a:b"));
        assert!(is_safe_href("/docs/report.pdf"));
        assert!(is_safe_href("#source-2"));
        assert!(is_safe_href("MAILTO:team@example.org"));
        assert!(!is_safe_href("javascript:alert(1)"));
        assert!(!is_safe_href("  JavaScript:alert(1)"));
        assert!(!is_safe_href("data:text/html;base64,AAAA"));
    }
}
