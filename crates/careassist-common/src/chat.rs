use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// The portal page a conversation was launched from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    Visit,
    Appointment,
    Prescription,
    LabReport,
    General,
}

impl ContextKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Visit => "visit",
            Self::Appointment => "appointment",
            Self::Prescription => "prescription",
            Self::LabReport => "lab_report",
            Self::General => "general",
        }
    }

    /// Title given to a new session when the caller does not supply one.
    pub fn default_title(&self) -> &'static str {
        match self {
            Self::Visit => "Questions about a visit",
            Self::Appointment => "Questions about an appointment",
            Self::Prescription => "Questions about a prescription",
            Self::LabReport => "Questions about a lab report",
            Self::General => "General health questions",
        }
    }
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContextKind {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "visit" => Ok(Self::Visit),
            "appointment" => Ok(Self::Appointment),
            "prescription" => Ok(Self::Prescription),
            "lab_report" | "labreport" => Ok(Self::LabReport),
            "general" => Ok(Self::General),
            other => Err(Error::Validation(format!("unknown context type '{other}'"))),
        }
    }
}

/// Context classification plus the identifiers the assistant may reason about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatContext {
    pub kind: ContextKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl ChatContext {
    pub fn general() -> Self {
        Self {
            kind: ContextKind::General,
            context_id: None,
            data: serde_json::Map::new(),
        }
    }

    /// Render context data as `key: value` lines for prompting.
    pub fn render(&self) -> String {
        let mut lines = vec![format!("Context: {}", self.kind)];
        if let Some(id) = &self.context_id {
            lines.push(format!("Context id: {id}"));
        }
        for (key, value) in &self.data {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            lines.push(format!("{key}: {rendered}"));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Archived,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "active" => Ok(Self::Active),
            "archived" => Ok(Self::Archived),
            other => Err(Error::Validation(format!("unknown session status '{other}'"))),
        }
    }
}

/// A persistent conversation thread tied to one user, one subject and one context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub user_id: String,
    pub subject_id: String,
    pub context: ChatContext,
    pub title: String,
    pub status: SessionStatus,
    pub message_count: u64,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChatSession {
    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.user_id == user_id
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl FromStr for MessageRole {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(Error::Validation(format!("unknown message role '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenCounts {
    pub prompt: u32,
    pub completion: u32,
    pub total: u32,
}

impl TokenCounts {
    pub fn new(prompt: u32, completion: u32) -> Self {
        Self {
            prompt,
            completion,
            total: prompt.saturating_add(completion),
        }
    }
}

/// Provider bookkeeping attached to assistant messages.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessageMeta {
    pub provider: String,
    pub model: String,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenCounts>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl MessageMeta {
    pub fn is_failure(&self) -> bool {
        self.error_code.is_some()
    }
}

/// Persisted message row. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<MessageMeta>,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    /// Assistant placeholder written when the provider call failed.
    pub fn is_failed_reply(&self) -> bool {
        self.role == MessageRole::Assistant
            && self.meta.as_ref().is_some_and(MessageMeta::is_failure)
    }
}

/// Insert shape for messages before the store assigns id and timestamp.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    pub meta: Option<MessageMeta>,
}

impl NewMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: text.into(),
            meta: None,
        }
    }

    pub fn assistant(content: impl Into<String>, meta: MessageMeta) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            meta: Some(meta),
        }
    }
}
