use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Target push/chat provider a message is addressed to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Wechat,
    Dingtalk,
}

impl Platform {
    /// Every platform accepted at the boundary. The sender registry must cover all of them.
    pub const ALL: [Platform; 2] = [Platform::Wechat, Platform::Dingtalk];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Wechat => "wechat",
            Platform::Dingtalk => "dingtalk",
        }
    }

    pub fn from_str_value(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == s)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Platform-specific routing data carried alongside a message.
///
/// `user_id` is the only key any sender reads; it is typed here so a
/// non-string recipient is rejected while parsing instead of at send time.
/// Every other key is kept as-is so the wire form round-trips.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Extra {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

impl Extra {
    pub fn with_user_id(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            other: BTreeMap::new(),
        }
    }

    /// Recipient id, ignoring an empty string
    pub fn recipient(&self) -> Option<&str> {
        self.user_id.as_deref().filter(|s| !s.is_empty())
    }

    fn is_empty(&self) -> bool {
        self.user_id.is_none() && self.other.is_empty()
    }
}

/// A notification accepted at the boundary, immutable once parsed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub platform: Platform,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Extra::is_empty")]
    pub extra: Extra,
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Invalid request body: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("platform is required")]
    MissingPlatform,

    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("content is required")]
    EmptyContent,
}

/// Loose shape used only to tell a missing platform apart from an unknown one
#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    platform: Option<String>,
    #[serde(default)]
    content: String,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    extra: Option<Extra>,
}

impl Message {
    pub fn new(platform: Platform, content: impl Into<String>) -> Self {
        Self {
            platform,
            content: content.into(),
            summary: None,
            extra: Extra::default(),
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        let summary = summary.into();
        self.summary = if summary.is_empty() { None } else { Some(summary) };
        self
    }

    pub fn with_extra(mut self, extra: Extra) -> Self {
        self.extra = extra;
        self
    }

    /// Decode a JSON request body and validate it
    pub fn parse(data: &[u8]) -> Result<Self, MessageError> {
        let raw: RawMessage = serde_json::from_slice(data)?;

        let platform = match raw.platform.as_deref() {
            None | Some("") => return Err(MessageError::MissingPlatform),
            Some(name) => Platform::from_str_value(name)
                .ok_or_else(|| MessageError::UnsupportedPlatform(name.to_string()))?,
        };

        let message = Message {
            platform,
            content: raw.content,
            summary: raw.summary.filter(|s| !s.is_empty()),
            extra: raw.extra.unwrap_or_default(),
        };
        message.validate()?;
        Ok(message)
    }

    pub fn validate(&self) -> Result<(), MessageError> {
        if self.content.is_empty() {
            return Err(MessageError::EmptyContent);
        }
        Ok(())
    }

    /// Summary text, ignoring an empty string
    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref().filter(|s| !s.is_empty())
    }

    /// Short prefix of the content for log lines
    pub fn excerpt(&self) -> &str {
        excerpt(&self.content, EXCERPT_LEN)
    }
}

const EXCERPT_LEN: usize = 64;

/// Cut `text` to at most `max_len` bytes without splitting a UTF-8 char
pub fn excerpt(text: &str, max_len: usize) -> &str {
    if text.len() <= max_len {
        return text;
    }
    let mut end = max_len;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Prefix the content with the summary for providers without a summary field
pub fn compose_content(content: &str, summary: Option<&str>) -> String {
    match summary.filter(|s| !s.is_empty()) {
        Some(summary) => format!("【{}】\n\n{}", summary, content),
        None => content.to_string(),
    }
}
