use std::sync::Arc;

use careassist_common::{
    ChatContext, ChatSession, Error, MessageRole, NewMessage, Result, SessionStatus, StoredMessage,
};
use careassist_config::{BudgetConfig, ChatConfig};
use careassist_db::{ConversationStore, Cursor, MessagePage, SessionFilter};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, instrument, warn};

use crate::budget::{TokenBudgetAllocator, TokenUsage};
use crate::gateway::{ChatOptions, ProviderGateway};
use crate::providers::ChatMessage;
use crate::subjects::SubjectDirectory;

/// Request to open a conversation from a portal page.
#[derive(Debug, Clone)]
pub struct StartChat {
    /// Defaults to the caller's own id.
    pub subject_id: Option<String>,
    pub context: ChatContext,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatStart {
    pub session: ChatSession,
    pub resumed: bool,
    pub messages: MessagePage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TurnError {
    pub code: String,
    pub message: String,
}

/// One user message and the assistant reply persisted for it. A failed
/// provider call still yields a turn: the reply is an empty placeholder and
/// `error` says why.
#[derive(Debug, Clone, Serialize)]
pub struct ChatTurn {
    pub user_message: StoredMessage,
    pub assistant_message: StoredMessage,
    pub usage: TokenUsage,
    pub error: Option<TurnError>,
}

struct Reply {
    message: NewMessage,
    usage: TokenUsage,
    error: Option<TurnError>,
}

/// Coordinates ownership checks, prompt budgeting, the provider gateway and
/// persistence for every chat operation.
pub struct ChatOrchestrator {
    store: Arc<ConversationStore>,
    gateway: Arc<ProviderGateway>,
    subjects: Arc<dyn SubjectDirectory>,
    allocator: TokenBudgetAllocator,
    max_history_messages: usize,
    system_prompt: String,
    page_size: usize,
    session_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ChatOrchestrator {
    pub fn new(
        store: Arc<ConversationStore>,
        gateway: Arc<ProviderGateway>,
        subjects: Arc<dyn SubjectDirectory>,
        budget: &BudgetConfig,
        chat: &ChatConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            subjects,
            allocator: TokenBudgetAllocator::new(budget.clone()),
            max_history_messages: budget.max_history_messages,
            system_prompt: chat.system_prompt.clone(),
            page_size: chat.history_page_size,
            session_locks: DashMap::new(),
        }
    }

    pub fn gateway(&self) -> &ProviderGateway {
        &self.gateway
    }

    /// Serialize mutations of one session. Callers check ownership first so
    /// unknown ids never get an entry.
    async fn lock_session(&self, session_id: &str) -> SessionGuard<'_> {
        let lock = self
            .session_locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        SessionGuard {
            locks: &self.session_locks,
            session_id: session_id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Load a session and make sure `user_id` owns it.
    fn owned_session(&self, user_id: &str, session_id: &str) -> Result<ChatSession> {
        let session = self
            .store
            .get_session(session_id)?
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;
        if !session.is_owned_by(user_id) {
            warn!(
                target: "security",
                user_id, session_id, "denied access to another user's chat session"
            );
            return Err(Error::Forbidden("session belongs to another user".to_string()));
        }
        Ok(session)
    }

    #[instrument(skip(self, start), fields(context = %start.context.kind))]
    pub async fn start_or_resume(&self, user_id: &str, start: StartChat) -> Result<ChatStart> {
        let subject_id = start
            .subject_id
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| user_id.to_string());

        if !self.subjects.owns_subject(user_id, &subject_id).await? {
            warn!(
                target: "security",
                user_id,
                subject_id = %subject_id,
                "denied chat start for a subject the user does not own"
            );
            return Err(Error::Forbidden(format!(
                "no access to subject {subject_id}"
            )));
        }

        let mut context = start.context;
        let directory_data = self
            .subjects
            .context_data(user_id, &subject_id, &context)
            .await?;
        context.data.extend(directory_data);

        let (session, resumed) = self.store.create_or_resume_session(
            user_id,
            &subject_id,
            &context,
            start.title.as_deref(),
        )?;
        let messages = self.store.list_messages(&session.id, self.page_size, None)?;
        info!(
            session_id = %session.id,
            resumed,
            messages = messages.total,
            "chat session ready"
        );

        Ok(ChatStart {
            session,
            resumed,
            messages,
        })
    }

    #[instrument(skip(self, text))]
    pub async fn send_message(&self, user_id: &str, session_id: &str, text: &str) -> Result<ChatTurn> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::Validation("message text must not be empty".to_string()));
        }

        self.owned_session(user_id, session_id)?;
        let _guard = self.lock_session(session_id).await;

        let session = self.owned_session(user_id, session_id)?;
        if session.status == SessionStatus::Archived {
            return Err(Error::Validation("session is archived".to_string()));
        }

        let history = self
            .store
            .recent_messages(session_id, self.max_history_messages)?;
        let reply = self.generate_reply(&session, &history, text).await?;

        let stored = self
            .store
            .append_messages(session_id, &[NewMessage::user(text), reply.message])?;
        let mut stored = stored.into_iter();
        let (Some(user_message), Some(assistant_message)) = (stored.next(), stored.next()) else {
            return Err(Error::Database(
                "message pair was not persisted".to_string(),
            ));
        };

        Ok(ChatTurn {
            user_message,
            assistant_message,
            usage: reply.usage,
            error: reply.error,
        })
    }

    /// Re-run the most recent turn when its reply is a failure placeholder.
    /// The placeholder is replaced; the user message is not duplicated.
    #[instrument(skip(self))]
    pub async fn retry_last_message(&self, user_id: &str, session_id: &str) -> Result<ChatTurn> {
        self.owned_session(user_id, session_id)?;
        let _guard = self.lock_session(session_id).await;

        let session = self.owned_session(user_id, session_id)?;
        if session.status == SessionStatus::Archived {
            return Err(Error::Validation("session is archived".to_string()));
        }

        let (user_message, failed) = match self.store.last_turn(session_id)? {
            Some((user, Some(reply))) if reply.is_failed_reply() => (user, reply),
            _ => return Err(Error::Validation("no failed turn to retry".to_string())),
        };

        let mut history = self
            .store
            .recent_messages(session_id, self.max_history_messages + 1)?;
        history.retain(|m| m.id != user_message.id);

        let reply = self
            .generate_reply(&session, &history, &user_message.content)
            .await?;
        let assistant_message =
            self.store
                .replace_failed_reply(session_id, &failed.id, &reply.message)?;
        info!(
            session_id,
            recovered = reply.error.is_none(),
            "retried failed turn"
        );

        Ok(ChatTurn {
            user_message,
            assistant_message,
            usage: reply.usage,
            error: reply.error,
        })
    }

    async fn generate_reply(
        &self,
        session: &ChatSession,
        history: &[StoredMessage],
        text: &str,
    ) -> Result<Reply> {
        let chat_history: Vec<ChatMessage> = history
            .iter()
            .filter_map(|m| match m.role {
                MessageRole::User => Some(ChatMessage::user(m.content.clone())),
                MessageRole::Assistant => Some(ChatMessage::assistant(m.content.clone())),
                MessageRole::System => None,
            })
            .collect();

        let context = session.context.render();
        let prompt = self
            .allocator
            .allocate(&self.system_prompt, &context, &chat_history, text)?;

        let system = if prompt.context.is_empty() {
            prompt.system
        } else {
            format!("{}\n\n{}", prompt.system, prompt.context)
        };
        let mut messages = prompt.history;
        messages.push(ChatMessage::user(prompt.user));

        let options = ChatOptions {
            system: Some(system),
            ..ChatOptions::default()
        };
        let response = self.gateway.chat(messages, &options).await;

        let (message, error) = match response.content {
            Some(content) => (NewMessage::assistant(content, response.meta), None),
            None => {
                let error = TurnError {
                    code: response
                        .meta
                        .error_code
                        .clone()
                        .unwrap_or_else(|| "upstream_error".to_string()),
                    message: response
                        .meta
                        .error_message
                        .clone()
                        .unwrap_or_else(|| "the assistant is unavailable".to_string()),
                };
                (NewMessage::assistant(String::new(), response.meta), Some(error))
            }
        };

        Ok(Reply {
            message,
            usage: prompt.usage,
            error,
        })
    }

    pub fn list_messages(
        &self,
        user_id: &str,
        session_id: &str,
        limit: Option<usize>,
        cursor: Option<&str>,
    ) -> Result<MessagePage> {
        self.owned_session(user_id, session_id)?;
        let cursor = cursor
            .filter(|c| !c.is_empty())
            .map(Cursor::parse)
            .transpose()?;
        self.store.list_messages(
            session_id,
            limit.unwrap_or(self.page_size),
            cursor.as_ref(),
        )
    }

    pub fn list_sessions(&self, user_id: &str, filter: &SessionFilter) -> Result<Vec<ChatSession>> {
        self.store.list_sessions(user_id, filter)
    }

    pub fn rename_session(&self, user_id: &str, session_id: &str, title: &str) -> Result<ChatSession> {
        let title = title.trim();
        if title.is_empty() {
            return Err(Error::Validation("title must not be empty".to_string()));
        }
        self.owned_session(user_id, session_id)?;
        self.store.update_session_title(session_id, title)
    }

    pub fn archive_session(&self, user_id: &str, session_id: &str) -> Result<ChatSession> {
        self.owned_session(user_id, session_id)?;
        self.store.archive_session(session_id)
    }

    /// Deleting a session that no longer exists is not an error.
    pub async fn delete_session(&self, user_id: &str, session_id: &str) -> Result<bool> {
        match self.owned_session(user_id, session_id) {
            Ok(_) => {}
            Err(Error::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        }
        let _guard = self.lock_session(session_id).await;

        match self.owned_session(user_id, session_id) {
            Ok(_) => {}
            Err(Error::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        }
        self.store.delete_session(session_id)
    }
}

/// Holds a session lock; the map entry goes away with its last holder.
struct SessionGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    session_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.session_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}
