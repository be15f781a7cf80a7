//! Direct conversations, messages and the cached list read path.
//!
//! The store runs over a shared connection (`Arc<Mutex<Connection>>`) so the
//! orchestrator can compose its decision write with a message write in one
//! transaction; the `*_tx` functions in [`store`] operate on an open
//! transaction for exactly that purpose.

pub mod cache;
pub mod error;
pub mod store;
pub mod types;

pub use cache::ListCache;
pub use error::ConversationError;
pub use store::ConversationStore;
pub use types::{
    ChatType, ConversationListEntry, ConversationSummary, DirectConversation, DirectMessage,
    SenderKind,
};
