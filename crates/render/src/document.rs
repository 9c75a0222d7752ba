use pulldown_cmark::{CodeBlockKind, CowStr, Event, HeadingLevel, Options, Parser, Tag};
use serde::Serialize;

use crate::citation::CitationNode;

/// Structural tree of a finished message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Document {
    pub children: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Node {
    Element {
        kind: ElementKind,
        children: Vec<Node>,
    },
    Text {
        text: String,
    },
    InlineCode {
        code: String,
    },
    CodeBlock {
        language: Option<String>,
        code: String,
    },
    Citation(CitationNode),
    SoftBreak,
    HardBreak,
    Rule,
}

impl Node {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn element(kind: ElementKind, children: Vec<Node>) -> Self {
        Self::Element { kind, children }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ElementKind {
    Paragraph,
    Heading { level: u8 },
    BlockQuote,
    List { start: Option<u64> },
    Item,
    Emphasis,
    Strong,
    Strikethrough,
    Link { href: String, title: Option<String> },
    Image { src: String, title: Option<String> },
    Table,
    TableHead,
    TableRow,
    TableCell,
    /// Raw HTML blocks and footnote definitions; children only.
    Container,
}

enum Frame {
    Element {
        kind: ElementKind,
        children: Vec<Node>,
    },
    CodeBlock {
        language: Option<String>,
        code: String,
    },
}

/// Parses markdown (with tables and strikethrough) into a [`Document`].
///
/// Raw HTML is kept as text so the serializer escapes it. Adjacent text runs
/// are merged, which keeps `[12]` in a single node for citation extraction.
pub fn render_document(text: &str) -> Document {
    let options = Options::ENABLE_TABLES | Options::ENABLE_STRIKETHROUGH;
    let mut builder = TreeBuilder::default();
    for event in Parser::new_ext(text, options) {
        builder.handle(event);
    }
    builder.finish()
}

#[derive(Default)]
struct TreeBuilder {
    root: Vec<Node>,
    stack: Vec<Frame>,
}

impl TreeBuilder {
    fn handle(&mut self, event: Event<'_>) {
        match event {
            Event::Start(tag) => self.start(tag),
            Event::End(_) => self.end(),
            Event::Text(text) => self.text(&text),
            Event::Code(code) => self.push(Node::InlineCode {
                code: code.into_string(),
            }),
            Event::Html(html) | Event::InlineHtml(html) => self.text(&html),
            Event::FootnoteReference(label) => self.text(&format!("[^{label}]")),
            Event::SoftBreak => self.push(Node::SoftBreak),
            Event::HardBreak => self.push(Node::HardBreak),
            Event::Rule => self.push(Node::Rule),
            Event::TaskListMarker(checked) => self.text(if checked { "[x] " } else { "[ ] " }),
        }
    }

    fn start(&mut self, tag: Tag<'_>) {
        let kind = match tag {
            Tag::CodeBlock(kind) => {
                let language = match kind {
                    CodeBlockKind::Fenced(info) => info
                        .split_whitespace()
                        .next()
                        .filter(|language| !language.is_empty())
                        .map(str::to_string),
                    CodeBlockKind::Indented => None,
                };
                self.stack.push(Frame::CodeBlock {
                    language,
                    code: String::new(),
                });
                return;
            }
            Tag::Paragraph => ElementKind::Paragraph,
            Tag::Heading { level, .. } => ElementKind::Heading {
                level: heading_level(level),
            },
            Tag::BlockQuote => ElementKind::BlockQuote,
            Tag::List(start) => ElementKind::List { start },
            Tag::Item => ElementKind::Item,
            Tag::Emphasis => ElementKind::Emphasis,
            Tag::Strong => ElementKind::Strong,
            Tag::Strikethrough => ElementKind::Strikethrough,
            Tag::Link {
                dest_url, title, ..
            } => ElementKind::Link {
                href: dest_url.into_string(),
                title: non_empty(title),
            },
            Tag::Image {
                dest_url, title, ..
            } => ElementKind::Image {
                src: dest_url.into_string(),
                title: non_empty(title),
            },
            Tag::Table(_) => ElementKind::Table,
            Tag::TableHead => ElementKind::TableHead,
            Tag::TableRow => ElementKind::TableRow,
            Tag::TableCell => ElementKind::TableCell,
            Tag::HtmlBlock | Tag::FootnoteDefinition(_) | Tag::MetadataBlock(_) => {
                ElementKind::Container
            }
        };
        self.stack.push(Frame::Element {
            kind,
            children: Vec::new(),
        });
    }

    fn end(&mut self) {
        let node = match self.stack.pop() {
            Some(Frame::Element { kind, children }) => Node::Element { kind, children },
            Some(Frame::CodeBlock { language, code }) => Node::CodeBlock { language, code },
            None => return,
        };
        self.push(node);
    }

    fn text(&mut self, text: &str) {
        match self.stack.last_mut() {
            Some(Frame::CodeBlock { code, .. }) => code.push_str(text),
            _ => {
                let children = self.children_mut();
                if let Some(Node::Text { text: last }) = children.last_mut() {
                    last.push_str(text);
                } else {
                    children.push(Node::text(text));
                }
            }
        }
    }

    fn push(&mut self, node: Node) {
        self.children_mut().push(node);
    }

    fn children_mut(&mut self) -> &mut Vec<Node> {
        match self.stack.last_mut() {
            Some(Frame::Element { children, .. }) => children,
            // Code blocks only ever receive text.
            Some(Frame::CodeBlock { .. }) | None => &mut self.root,
        }
    }

    fn finish(mut self) -> Document {
        while !self.stack.is_empty() {
            self.end();
        }
        Document {
            children: self.root,
        }
    }
}

fn heading_level(level: HeadingLevel) -> u8 {
    match level {
        HeadingLevel::H1 => 1,
        HeadingLevel::H2 => 2,
        HeadingLevel::H3 => 3,
        HeadingLevel::H4 => 4,
        HeadingLevel::H5 => 5,
        HeadingLevel::H6 => 6,
    }
}

fn non_empty(value: CowStr<'_>) -> Option<String> {
    (!value.is_empty()).then(|| value.into_string())
}
