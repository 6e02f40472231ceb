pub mod conversations;
pub mod messages;
pub mod users;

pub use conversations::ResolvedConversation;
pub use users::RemovedConversation;
