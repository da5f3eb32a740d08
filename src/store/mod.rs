//! Persistence layer — message and conversation storage.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use memory::MemoryStore;
pub use traits::{
    Conversation, ConversationId, ConversationStore, Message, MessageId, MessageKind,
    MessageStore, ThreadId,
};
