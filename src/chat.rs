//! Chat messages and prompt formatting.
//!
//! Messages are rendered through a Jinja chat template (the same
//! templates GGUF models embed in their metadata). Media parts render as
//! the session's media marker, so the formatted prompt lines up with the
//! media list handed to the generation request.

use std::path::PathBuf;

use minijinja::{context, Environment};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// ChatML, used when neither the caller nor the model supplies a template.
pub const CHATML_TEMPLATE: &str = "{% for message in messages %}<|im_start|>{{ message.role }}\n{{ message.content }}<|im_end|>\n{% endfor %}{% if add_generation_prompt %}<|im_start|>assistant\n{% endif %}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    /// An image or audio item. Rendered as the media marker.
    #[serde(alias = "image", alias = "image_url", alias = "input_audio")]
    Media {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    pub fn with_parts(role: Role, parts: Vec<ContentPart>) -> Self {
        Self {
            role,
            content: MessageContent::Parts(parts),
        }
    }

    /// Paths of media parts, in order.
    pub fn media_paths(&self) -> Vec<PathBuf> {
        match &self.content {
            MessageContent::Text(_) => Vec::new(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Media { path } => path.clone(),
                    ContentPart::Text { .. } => None,
                })
                .collect(),
        }
    }

    /// Flatten to text, with `marker` standing in for media parts.
    pub fn flatten(&self, marker: &str) -> String {
        match &self.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.as_str(),
                    ContentPart::Media { .. } => marker,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Parse an OpenAI-style JSON message array.
pub fn parse_messages_json(json: &str) -> Result<Vec<ChatMessage>> {
    serde_json::from_str(json)
        .map_err(|e| SessionError::InvalidRequest(format!("invalid chat messages: {e}")))
}

#[derive(Serialize)]
struct TemplateMessage<'a> {
    role: &'a str,
    content: String,
}

/// A Jinja chat template.
#[derive(Debug, Clone)]
pub struct ChatTemplate {
    source: String,
}

impl ChatTemplate {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn chatml() -> Self {
        Self::new(CHATML_TEMPLATE)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn render(
        &self,
        messages: &[ChatMessage],
        media_marker: &str,
        add_generation_prompt: bool,
    ) -> Result<String> {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.add_function("raise_exception", |message: String| -> std::result::Result<String, minijinja::Error> {
            Err(minijinja::Error::new(
                minijinja::ErrorKind::InvalidOperation,
                message,
            ))
        });

        let messages: Vec<TemplateMessage<'_>> = messages
            .iter()
            .map(|m| TemplateMessage {
                role: m.role.as_str(),
                content: m.flatten(media_marker),
            })
            .collect();

        Ok(env.render_str(
            &self.source,
            context! {
                messages => messages,
                add_generation_prompt => add_generation_prompt,
                bos_token => "",
                eos_token => "",
            },
        )?)
    }
}

impl Default for ChatTemplate {
    fn default() -> Self {
        Self::chatml()
    }
}
