use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Who produced a content unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Originator {
    User,
    Agent,
    Tool,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentKind {
    Text,
    Code,
    Markup,
    Image,
    Audio,
    File,
    ToolResult,
}

impl std::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Text => "text",
            Self::Code => "code",
            Self::Markup => "markup",
            Self::Image => "image",
            Self::Audio => "audio",
            Self::File => "file",
            Self::ToolResult => "tool-result",
        };
        f.write_str(s)
    }
}

/// Metadata shared by every content unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentMeta {
    pub timestamp: DateTime<Utc>,
    pub originator: Originator,
    /// Annotations added during normalization (checksums, inferred MIME types).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl ContentMeta {
    #[must_use]
    pub fn now(originator: Originator) -> Self {
        Self {
            timestamp: Utc::now(),
            originator,
            attributes: BTreeMap::new(),
        }
    }
}

/// Binary payloads (`data`) are base64 encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ContentBody {
    Text {
        text: String,
    },
    Code {
        language: String,
        source: String,
        #[serde(default)]
        executable: bool,
    },
    Markup {
        html: String,
    },
    Image {
        format: String,
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alt: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        width: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        height: Option<u32>,
    },
    Audio {
        format: String,
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },
    File {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        data: String,
    },
    ToolResult {
        tool_call_id: String,
        output: Value,
        #[serde(default)]
        is_error: bool,
    },
}

/// One typed piece of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentUnit {
    #[serde(flatten)]
    pub body: ContentBody,
    pub meta: ContentMeta,
}

impl ContentUnit {
    #[must_use]
    pub fn new(body: ContentBody, originator: Originator) -> Self {
        Self {
            body,
            meta: ContentMeta::now(originator),
        }
    }

    #[must_use]
    pub fn text(text: impl Into<String>, originator: Originator) -> Self {
        Self::new(ContentBody::Text { text: text.into() }, originator)
    }

    #[must_use]
    pub fn tool_result(tool_call_id: impl Into<String>, output: Value, is_error: bool) -> Self {
        Self::new(
            ContentBody::ToolResult {
                tool_call_id: tool_call_id.into(),
                output,
                is_error,
            },
            Originator::Tool,
        )
    }

    #[must_use]
    pub fn kind(&self) -> ContentKind {
        match &self.body {
            ContentBody::Text { .. } => ContentKind::Text,
            ContentBody::Code { .. } => ContentKind::Code,
            ContentBody::Markup { .. } => ContentKind::Markup,
            ContentBody::Image { .. } => ContentKind::Image,
            ContentBody::Audio { .. } => ContentKind::Audio,
            ContentBody::File { .. } => ContentKind::File,
            ContentBody::ToolResult { .. } => ContentKind::ToolResult,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match &self.body {
            ContentBody::Text { text } => Some(text),
            _ => None,
        }
    }
}
