//! Streaming chat client for a retrieval-augmented backend.
//!
//! [`chat::StreamController`] drives one turn at a time: it opens the
//! transport, batches text per frame, renders progress and materializes one
//! assistant message per turn.
pub mod chat;
pub mod cli;
pub mod discussion;
pub mod settings;
