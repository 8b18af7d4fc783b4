pub mod cursor;
pub mod idempotency_store;
pub mod session_store;

pub use cursor::Cursor;
pub use idempotency_store::{ClaimOutcome, IdempotencyRecords, IdempotencyStore, StoredResponse};
pub use session_store::{ConversationStore, MessagePage, SessionFilter};
