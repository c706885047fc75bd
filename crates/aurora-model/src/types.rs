// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// A single content part in a multi-part user message.
///
/// Images are data URLs (`data:<mime>;base64,<b64>`) or HTTPS URLs for
/// providers that accept remote references.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { image_url: String },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(image_url: impl Into<String>) -> Self {
        Self::Image {
            image_url: image_url.into(),
        }
    }
}

/// Parse a data URL of the form `data:<mime>;base64,<b64>` into
/// `(mime_type, base64_string)`.  Returns `Err` for non-data-URLs so callers
/// can fall back to treating the string as a plain HTTPS URL.
pub fn parse_data_url_parts(url: &str) -> Result<(String, String), &'static str> {
    let rest = url.strip_prefix("data:").ok_or("not a data URL")?;
    let (meta, b64) = rest.split_once(',').ok_or("malformed data URL")?;
    let mime = meta.strip_suffix(";base64").unwrap_or(meta).to_string();
    Ok((mime, b64.to_string()))
}

/// A single message in the conversation presented to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn tool_result(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::ToolResult {
                tool_call_id: id.into(),
                content: content.into(),
            },
        }
    }

    /// Construct a user message from content parts (text + images).
    /// A single text part collapses to `MessageContent::Text`.
    pub fn user_with_parts(parts: Vec<ContentPart>) -> Self {
        let content = if parts.is_empty() {
            MessageContent::Text(String::new())
        } else if parts.len() == 1 {
            if let ContentPart::Text { text } = &parts[0] {
                MessageContent::Text(text.clone())
            } else {
                MessageContent::ContentParts(parts)
            }
        } else {
            MessageContent::ContentParts(parts)
        };
        Self {
            role: Role::User,
            content,
        }
    }

    /// Plain text of this message when it has exactly one text part.
    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(t) => Some(t),
            MessageContent::ContentParts(parts) if parts.len() == 1 => match &parts[0] {
                ContentPart::Text { text } => Some(text),
                _ => None,
            },
            _ => None,
        }
    }

    /// True when this message carries at least one image part.
    pub fn has_images(&self) -> bool {
        matches!(
            &self.content,
            MessageContent::ContentParts(parts)
                if parts.iter().any(|p| matches!(p, ContentPart::Image { .. }))
        )
    }

    /// Approximate token count (4-chars-per-token heuristic; images use the
    /// typical 765-token vision estimate).
    pub fn approx_tokens(&self) -> usize {
        let chars = match &self.content {
            MessageContent::Text(t) => t.len(),
            MessageContent::ContentParts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.len(),
                    ContentPart::Image { .. } => 765 * 4,
                })
                .sum(),
            MessageContent::ToolCall { function, .. } => {
                function.name.len() + function.arguments.len()
            }
            MessageContent::ToolResult { content, .. } => content.len(),
        };
        (chars / 4).max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// The content of a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    ContentParts(Vec<ContentPart>),
    ToolCall {
        tool_call_id: String,
        function: FunctionCall,
    },
    ToolResult {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object
    pub arguments: String,
}

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: serde_json::Value,
}

/// Request sent to a model provider.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub stream: bool,
    /// Ephemeral prompt tail that must NOT be part of the cached prefix.
    /// The Anthropic driver appends it as a second system block without
    /// `cache_control`; the OpenAI-compatible driver appends it to the
    /// system message text.
    pub system_dynamic_suffix: Option<String>,
    /// Stable key forwarded to gateways that support an explicit prompt
    /// cache key (OpenRouter's `prompt_cache_key`).
    pub cache_key: Option<String>,
}

/// A single streamed event from the model.
#[derive(Debug, Clone)]
pub enum ResponseEvent {
    /// A text delta streamed from the model
    TextDelta(String),
    /// The model wants to call a tool.  Arguments may arrive across
    /// multiple deltas; `index` routes accumulation for parallel calls.
    ToolCall {
        index: u32,
        id: String,
        name: String,
        arguments: String,
    },
    /// A reasoning delta (extended thinking); not part of the answer text.
    ThinkingDelta(String),
    /// Final usage statistics
    Usage {
        input_tokens: u32,
        output_tokens: u32,
        cache_read_tokens: u32,
        cache_write_tokens: u32,
    },
    /// The stream finished normally
    Done,
    /// A recoverable error (non-fatal warning)
    Error(String),
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
