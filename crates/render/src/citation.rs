use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::document::{Document, Node};

static CITATION_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(\d+)\]").expect("valid citation regex"));

/// An inline `[N]` reference to the N-th source of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct CitationNode {
    pub index: u32,
}

/// Splits one text run on `[N]` markers.
///
/// Text around each marker is kept verbatim and non-empty. `[0]` and numbers
/// that overflow `u32` are not citations and stay in the text.
pub fn split_citations(text: &str) -> Vec<Node> {
    let mut nodes = Vec::new();
    let mut last = 0;

    for captures in CITATION_MARKER.captures_iter(text) {
        let (Some(whole), Some(digits)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        let Some(index) = digits.as_str().parse::<u32>().ok().filter(|index| *index > 0) else {
            continue;
        };

        if whole.start() > last {
            nodes.push(Node::text(&text[last..whole.start()]));
        }
        nodes.push(Node::Citation(CitationNode { index }));
        last = whole.end();
    }

    if last < text.len() {
        nodes.push(Node::text(&text[last..]));
    }
    nodes
}

/// Replaces citation markers in every text node of `document`.
///
/// Code spans and code blocks are left untouched. Returns how many citation
/// nodes were inserted.
pub fn extract_citations(document: &mut Document) -> usize {
    extract_in(&mut document.children)
}

fn extract_in(children: &mut Vec<Node>) -> usize {
    let mut inserted = 0;
    let mut rewritten = Vec::with_capacity(children.len());

    for mut node in children.drain(..) {
        match &mut node {
            Node::Text { text } if CITATION_MARKER.is_match(text.as_str()) => {
                let parts = split_citations(text);
                inserted += parts
                    .iter()
                    .filter(|part| matches!(part, Node::Citation(_)))
                    .count();
                rewritten.extend(parts);
                continue;
            }
            Node::Element { children, .. } => inserted += extract_in(children),
            _ => {}
        }
        rewritten.push(node);
    }

    *children = rewritten;
    inserted
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::document::{ElementKind, render_document};

    #[test]
    fn splits_text_around_markers() {
        assert_eq!(
            split_citations("Check [1] and [2]."),
            vec![
                Node::text("Check "),
                Node::Citation(CitationNode { index: 1 }),
                Node::text(" and "),
                Node::Citation(CitationNode { index: 2 }),
                Node::text("."),
            ]
        );
    }

    #[test]
    fn adjacent_markers_produce_no_empty_text() {
        assert_eq!(
            split_citations("[3][4]"),
            vec![
                Node::Citation(CitationNode { index: 3 }),
                Node::Citation(CitationNode { index: 4 }),
            ]
        );
    }

    #[test]
    fn zero_and_overflow_are_plain_text() {
        assert_eq!(
            split_citations("see [0] or [99999999999]"),
            vec![Node::text("see [0] or [99999999999]")]
        );
        assert_eq!(split_citations(""), Vec::<Node>::new());
    }

    #[test]
    fn extraction_descends_into_elements_but_not_code() {
        let mut document = render_document("**Bold [2]** text [1]\n\n`array[1]`\n\n```\nv[3]\n```\n");
        let inserted = extract_citations(&mut document);

        assert_eq!(inserted, 2);
        assert_eq!(
            document.children[0],
            Node::element(
                ElementKind::Paragraph,
                vec![
                    Node::element(
                        ElementKind::Strong,
                        vec![
                            Node::text("Bold "),
                            Node::Citation(CitationNode { index: 2 }),
                        ]
                    ),
                    Node::text(" text "),
                    Node::Citation(CitationNode { index: 1 }),
                ]
            )
        );
        assert_eq!(
            document.children[1],
            Node::element(
                ElementKind::Paragraph,
                vec![Node::InlineCode {
                    code: "array[1]".to_string()
                }]
            )
        );
    }
}
