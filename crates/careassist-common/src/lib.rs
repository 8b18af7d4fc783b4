pub mod chat;
pub mod error;

pub use chat::{
    ChatContext, ChatSession, ContextKind, MessageMeta, MessageRole, NewMessage, SessionStatus,
    StoredMessage, TokenCounts,
};
pub use error::{Error, ProviderError, Result};
