use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How deep the backend searches the knowledge base for one question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearchMode {
    #[default]
    Quick,
    Enhanced,
    Deep,
}

impl ResearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Enhanced => "enhanced",
            Self::Deep => "deep",
        }
    }
}

impl fmt::Display for ResearchMode {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for ResearchMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "quick" => Ok(Self::Quick),
            "enhanced" => Ok(Self::Enhanced),
            "deep" => Ok(Self::Deep),
            other => Err(format!("unknown research mode '{other}'")),
        }
    }
}

/// Body of `POST /api/chat/stream`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub discussion_id: String,
    pub message: String,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_ids: Option<Vec<String>>,
    #[serde(default)]
    pub research_mode: ResearchMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
}

impl ChatRequest {
    pub fn new(
        discussion_id: impl Into<String>,
        message: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            discussion_id: discussion_id.into(),
            message: message.into(),
            provider: provider.into(),
            document_ids: None,
            attachment_ids: None,
            research_mode: ResearchMode::default(),
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_document_ids(mut self, document_ids: Vec<String>) -> Self {
        self.document_ids = (!document_ids.is_empty()).then_some(document_ids);
        self
    }

    pub fn with_attachment_ids(mut self, attachment_ids: Vec<String>) -> Self {
        self.attachment_ids = (!attachment_ids.is_empty()).then_some(attachment_ids);
        self
    }

    pub fn with_research_mode(mut self, research_mode: ResearchMode) -> Self {
        self.research_mode = research_mode;
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn omits_absent_optional_fields() {
        let request = ChatRequest::new("d-1", "What is carbon pricing?", "mistral")
            .with_document_ids(Vec::new())
            .with_research_mode(ResearchMode::Deep);

        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(
            body,
            json!({
                "discussion_id": "d-1",
                "message": "What is carbon pricing?",
                "provider": "mistral",
                "research_mode": "deep",
            })
        );
    }

    #[test]
    fn parses_research_mode_case_insensitively() {
        assert_eq!(" Enhanced ".parse::<ResearchMode>(), Ok(ResearchMode::Enhanced));
        assert!("exhaustive".parse::<ResearchMode>().is_err());
    }
}
