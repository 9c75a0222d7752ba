//! Markup for assistant responses.
//!
//! [`incremental::render`] runs on every flush while a turn is streaming.
//! Once the turn is final, [`render_final`] takes over for that message: a
//! full markdown parse whose citation markers become [`CitationNode`]s.
mod citation;
mod document;
mod escape;
mod html;
pub mod incremental;

pub use citation::{CitationNode, extract_citations, split_citations};
pub use document::{Document, ElementKind, Node, render_document};
pub use escape::escape_html;
pub use html::{CitationResolver, CitationTarget, NoCitations, render_final, render_html};
