//! Fast markup for a response that is still arriving.
//!
//! [`render`] is always handed the whole text received so far, never a delta,
//! so a token split across two batches renders correctly once it is complete.
//! Only a small markdown subset is recognised; everything else stays literal
//! text until the structural renderer takes over for the finished message.
//!
//! Stage order matters:
//! 1. escape `&`, `<`, `>` over the whole input
//! 2. lift closed code fences out as opaque segments; a trailing unclosed
//!    fence is kept verbatim, only its newlines become `<br>`
//! 3. inline code spans
//! 4. headings (`#` to `####`)
//! 5. bold, then italic
//! 6. horizontal rules
//! 7. flat list marker lines
//! 8. paragraph and line breaks
//! 9. code fences restored
//!
//! Line kinds (4, 6, 7) are classified on the raw line before inline spans are
//! formatted, so a `*` list marker is never read as the start of an italic span.

use std::sync::LazyLock;

use regex::Regex;

use crate::escape::escape_html;

/// A fence is only lifted once its closing marker has arrived.
static CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(\w*)\n?(.*?)```").expect("valid code fence regex"));
static INLINE_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`([^`\n]+)`").expect("valid inline code regex"));
static BOLD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\*\*([^*\s](?:[^\n]*?[^*\s])?)\*\*").expect("valid bold regex")
});
static ITALIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\*([^*\s](?:[^*\n]*?[^*\s])?)\*").expect("valid italic regex")
});
static PARAGRAPH_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n(?:[ \t]*\n)+").expect("valid paragraph break regex"));

const MAX_HEADING_LEVEL: usize = 4;
const UNORDERED_MARKER: &str = "•";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment<'a> {
    Prose(&'a str),
    CodeBlock { language: &'a str, code: &'a str },
    /// From an opening marker with no closing one to the end of the text.
    OpenFence(&'a str),
}

impl Segment<'_> {
    fn is_code_block(&self) -> bool {
        matches!(self, Self::CodeBlock { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Line<'a> {
    Heading { level: usize, content: &'a str },
    Rule,
    ListItem { marker: &'a str, content: &'a str },
    Text(&'a str),
}

impl Line<'_> {
    fn is_block(&self) -> bool {
        !matches!(self, Self::Text(_))
    }
}

/// Converts the accumulated response text into safe markup.
///
/// The result is wrapped in one `<p>` container; user text is escaped before
/// any tag is produced.
pub fn render(text: &str) -> String {
    let escaped = escape_html(text);
    let segments = split_code_blocks(&escaped);

    let mut body = String::with_capacity(escaped.len() + escaped.len() / 4);
    for (index, segment) in segments.iter().enumerate() {
        match segment {
            Segment::Prose(prose) => {
                // Newlines touching a closed code block belong to the block boundary.
                let mut prose = *prose;
                if index > 0 && segments[index - 1].is_code_block() {
                    prose = prose.trim_start_matches('\n');
                }
                if segments.get(index + 1).is_some_and(Segment::is_code_block) {
                    prose = prose.trim_end_matches('\n');
                }
                render_prose(prose, &mut body);
            }
            Segment::CodeBlock { language, code } => render_code_block(language, code, &mut body),
            Segment::OpenFence(pending) => body.push_str(&pending.replace('\n', "<br>")),
        }
    }

    format!("<p>{body}</p>")
}

fn split_code_blocks(escaped: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut last = 0;

    for captures in CODE_FENCE.captures_iter(escaped) {
        let (Some(whole), Some(language), Some(code)) =
            (captures.get(0), captures.get(1), captures.get(2))
        else {
            continue;
        };

        if whole.start() > last {
            segments.push(Segment::Prose(&escaped[last..whole.start()]));
        }
        segments.push(Segment::CodeBlock {
            language: language.as_str(),
            code: code.as_str().strip_suffix('\n').unwrap_or(code.as_str()),
        });
        last = whole.end();
    }

    let rest = &escaped[last..];
    match rest.find("```") {
        Some(open) => {
            if open > 0 {
                segments.push(Segment::Prose(&rest[..open]));
            }
            segments.push(Segment::OpenFence(&rest[open..]));
        }
        None if !rest.is_empty() || segments.is_empty() => segments.push(Segment::Prose(rest)),
        None => {}
    }
    segments
}

fn render_code_block(language: &str, code: &str, out: &mut String) {
    if language.is_empty() {
        out.push_str("<pre><code>");
    } else {
        out.push_str("<pre><code class=\"language-");
        out.push_str(language);
        out.push_str("\">");
    }
    // Already escaped once with the rest of the input.
    out.push_str(code);
    out.push_str("</code></pre>");
}

fn render_prose(prose: &str, out: &mut String) {
    for (index, paragraph) in PARAGRAPH_BREAK.split(prose).enumerate() {
        if index > 0 {
            out.push_str("</p><p>");
        }
        render_paragraph(paragraph, out);
    }
}

fn render_paragraph(paragraph: &str, out: &mut String) {
    let mut previous: Option<Line<'_>> = None;

    for raw in paragraph.split('\n') {
        let line = classify_line(raw);
        if previous.is_some_and(|previous| !previous.is_block()) && !line.is_block() {
            out.push_str("<br>");
        }

        match line {
            Line::Heading { level, content } => {
                out.push_str(&format!("<h{level}>"));
                render_inline(content, out);
                out.push_str(&format!("</h{level}>"));
            }
            Line::Rule => out.push_str("<hr>"),
            Line::ListItem { marker, content } => {
                out.push_str("<div class=\"list-item\"><span class=\"list-marker\">");
                out.push_str(marker);
                out.push_str("</span> ");
                render_inline(content, out);
                out.push_str("</div>");
            }
            Line::Text(text) => render_inline(text, out),
        }

        previous = Some(line);
    }
}

fn classify_line(line: &str) -> Line<'_> {
    if let Some((level, content)) = heading(line) {
        return Line::Heading { level, content };
    }
    if line.trim_end() == "---" {
        return Line::Rule;
    }
    if let Some((marker, content)) = list_item(line) {
        return Line::ListItem { marker, content };
    }
    Line::Text(line)
}

fn heading(line: &str) -> Option<(usize, &str)> {
    // Deepest level first so `####` is never read as `#` followed by text.
    (1..=MAX_HEADING_LEVEL).rev().find_map(|level| {
        let rest = line.strip_prefix(&"#".repeat(level))?;
        let content = rest.strip_prefix(' ')?;
        Some((level, content))
    })
}

fn list_item(line: &str) -> Option<(&str, &str)> {
    let trimmed = line.trim_start();

    for bullet in ['-', '*', '+'] {
        if let Some(content) = trimmed
            .strip_prefix(bullet)
            .and_then(|rest| rest.strip_prefix(' '))
        {
            return Some((UNORDERED_MARKER, content));
        }
    }

    let digits = trimmed.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    let content = trimmed[digits..].strip_prefix(". ")?;
    Some((&trimmed[..digits + 1], content))
}

fn render_inline(text: &str, out: &mut String) {
    let mut last = 0;

    for captures in INLINE_CODE.captures_iter(text) {
        let (Some(whole), Some(code)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        emphasize(&text[last..whole.start()], out);
        out.push_str("<code>");
        out.push_str(code.as_str());
        out.push_str("</code>");
        last = whole.end();
    }

    emphasize(&text[last..], out);
}

fn emphasize(text: &str, out: &mut String) {
    if !text.contains('*') {
        out.push_str(text);
        return;
    }

    // Italic spans never cross a bold boundary.
    let mut last = 0;
    for captures in BOLD.captures_iter(text) {
        let (Some(whole), Some(inner)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        italicize(&text[last..whole.start()], out);
        out.push_str("<strong>");
        italicize(inner.as_str(), out);
        out.push_str("</strong>");
        last = whole.end();
    }
    italicize(&text[last..], out);
}

fn italicize(text: &str, out: &mut String) {
    out.push_str(&ITALIC.replace_all(text, "<em>${1}</em>"));
}
