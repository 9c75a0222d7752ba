use crate::citation::{CitationNode, extract_citations};
use crate::document::{Document, ElementKind, Node, render_document};
use crate::escape::{is_safe_href, push_escaped, push_escaped_attribute};

/// What a citation index points at when the message is displayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CitationTarget {
    /// Shown as the tooltip, usually the source's filename.
    pub label: String,
    pub href: Option<String>,
}

impl CitationTarget {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            href: None,
        }
    }

    pub fn with_href(mut self, href: impl Into<String>) -> Self {
        self.href = Some(href.into());
        self
    }
}

/// Maps a citation index to a source at render time.
pub trait CitationResolver {
    fn resolve(&self, index: u32) -> Option<CitationTarget>;
}

/// Resolver for messages that carry no sources.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCitations;

impl CitationResolver for NoCitations {
    fn resolve(&self, _index: u32) -> Option<CitationTarget> {
        None
    }
}

impl<F> CitationResolver for F
where
    F: Fn(u32) -> Option<CitationTarget>,
{
    fn resolve(&self, index: u32) -> Option<CitationTarget> {
        self(index)
    }
}

/// Full render of a finished message: parse, extract citations, write HTML.
pub fn render_final(text: &str, resolver: &dyn CitationResolver) -> String {
    let mut document = render_document(text);
    extract_citations(&mut document);
    render_html(&document, resolver)
}

pub fn render_html(document: &Document, resolver: &dyn CitationResolver) -> String {
    let mut writer = HtmlWriter {
        out: String::new(),
        resolver,
        in_table_head: false,
    };
    writer.nodes(&document.children);
    writer.out
}

struct HtmlWriter<'a> {
    out: String,
    resolver: &'a dyn CitationResolver,
    in_table_head: bool,
}

impl HtmlWriter<'_> {
    fn nodes(&mut self, nodes: &[Node]) {
        for node in nodes {
            self.node(node);
        }
    }

    fn node(&mut self, node: &Node) {
        match node {
            Node::Element { kind, children } => self.element(kind, children),
            Node::Text { text } => push_escaped(&mut self.out, text),
            Node::InlineCode { code } => {
                self.out.push_str("<code>");
                push_escaped(&mut self.out, code);
                self.out.push_str("</code>");
            }
            Node::CodeBlock { language, code } => {
                match language {
                    Some(language) => {
                        self.out.push_str("<pre><code class=\"language-");
                        push_escaped_attribute(&mut self.out, language);
                        self.out.push_str("\">");
                    }
                    None => self.out.push_str("<pre><code>"),
                }
                push_escaped(&mut self.out, code);
                self.out.push_str("</code></pre>\n");
            }
            Node::Citation(citation) => self.citation(*citation),
            Node::SoftBreak => self.out.push('\n'),
            Node::HardBreak => self.out.push_str("<br>\n"),
            Node::Rule => self.out.push_str("<hr>\n"),
        }
    }

    fn element(&mut self, kind: &ElementKind, children: &[Node]) {
        match kind {
            ElementKind::Paragraph => self.wrap("p", children, true),
            ElementKind::Heading { level } => {
                let tag = format!("h{level}");
                self.wrap(&tag, children, true);
            }
            ElementKind::BlockQuote => {
                self.out.push_str("<blockquote>\n");
                self.nodes(children);
                self.out.push_str("</blockquote>\n");
            }
            ElementKind::List { start: None } => {
                self.out.push_str("<ul>\n");
                self.nodes(children);
                self.out.push_str("</ul>\n");
            }
            ElementKind::List { start: Some(start) } => {
                if *start == 1 {
                    self.out.push_str("<ol>\n");
                } else {
                    self.out.push_str(&format!("<ol start=\"{start}\">\n"));
                }
                self.nodes(children);
                self.out.push_str("</ol>\n");
            }
            ElementKind::Item => self.wrap("li", children, true),
            ElementKind::Emphasis => self.wrap("em", children, false),
            ElementKind::Strong => self.wrap("strong", children, false),
            ElementKind::Strikethrough => self.wrap("del", children, false),
            ElementKind::Link { href, title } => {
                if !is_safe_href(href) {
                    self.nodes(children);
                    return;
                }
                self.out.push_str("<a href=\"");
                push_escaped_attribute(&mut self.out, href);
                self.out.push('"');
                if let Some(title) = title {
                    self.out.push_str(" title=\"");
                    push_escaped_attribute(&mut self.out, title);
                    self.out.push('"');
                }
                self.out.push('>');
                self.nodes(children);
                self.out.push_str("</a>");
            }
            ElementKind::Image { src, title } => {
                let alt = plain_text(children);
                if !is_safe_href(src) {
                    push_escaped(&mut self.out, &alt);
                    return;
                }
                self.out.push_str("<img src=\"");
                push_escaped_attribute(&mut self.out, src);
                self.out.push_str("\" alt=\"");
                push_escaped_attribute(&mut self.out, &alt);
                self.out.push('"');
                if let Some(title) = title {
                    self.out.push_str(" title=\"");
                    push_escaped_attribute(&mut self.out, title);
                    self.out.push('"');
                }
                self.out.push_str(">");
            }
            ElementKind::Table => {
                self.out.push_str("<table>\n");
                self.nodes(children);
                self.out.push_str("</table>\n");
            }
            ElementKind::TableHead => {
                // Header cells arrive directly under the head, without a row.
                self.in_table_head = true;
                self.out.push_str("<thead><tr>");
                self.nodes(children);
                self.out.push_str("</tr></thead>\n");
                self.in_table_head = false;
            }
            ElementKind::TableRow => {
                self.out.push_str("<tr>");
                self.nodes(children);
                self.out.push_str("</tr>\n");
            }
            ElementKind::TableCell => {
                let tag = if self.in_table_head { "th" } else { "td" };
                self.wrap(tag, children, false);
            }
            ElementKind::Container => self.nodes(children),
        }
    }

    fn wrap(&mut self, tag: &str, children: &[Node], block: bool) {
        self.out.push('<');
        self.out.push_str(tag);
        self.out.push('>');
        self.nodes(children);
        self.out.push_str("</");
        self.out.push_str(tag);
        self.out.push('>');
        if block {
            self.out.push('\n');
        }
    }

    fn citation(&mut self, citation: CitationNode) {
        let index = citation.index;
        let Some(target) = self.resolver.resolve(index) else {
            self.out.push_str(&format!(
                "<sup class=\"citation citation-unresolved\" data-citation=\"{index}\">[{index}]</sup>"
            ));
            return;
        };

        self.out.push_str(&format!(
            "<sup class=\"citation\" data-citation=\"{index}\">"
        ));
        match target.href.as_deref().filter(|href| is_safe_href(href)) {
            Some(href) => {
                self.out.push_str("<a href=\"");
                push_escaped_attribute(&mut self.out, href);
                self.out.push_str("\" title=\"");
                push_escaped_attribute(&mut self.out, &target.label);
                self.out.push_str(&format!("\">[{index}]</a>"));
            }
            None => {
                self.out.push_str("<span title=\"");
                push_escaped_attribute(&mut self.out, &target.label);
                self.out.push_str(&format!("\">[{index}]</span>"));
            }
        }
        self.out.push_str("</sup>");
    }
}

fn plain_text(nodes: &[Node]) -> String {
    let mut text = String::new();
    for node in nodes {
        match node {
            Node::Text { text: run } => text.push_str(run),
            Node::InlineCode { code } => text.push_str(code),
            Node::Element { children, .. } => text.push_str(&plain_text(children)),
            Node::Citation(citation) => text.push_str(&format!("[{}]", citation.index)),
            Node::SoftBreak | Node::HardBreak => text.push(' '),
            Node::CodeBlock { .. } | Node::Rule => {}
        }
    }
    text
}
