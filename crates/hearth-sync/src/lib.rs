//! Client-side view of the messaging core: open conversations and the
//! conversation list are kept current by folding realtime notifications
//! into locally held state.

pub mod backend;
pub mod conversation;
pub mod days;
pub mod error;
pub mod list;
pub mod remote;

pub use backend::{Backend, Feed, LocalBackend};
pub use conversation::{ConversationView, OutgoingMessage, OutgoingStatus, ViewUpdate};
pub use days::{DayGroup, group_by_day};
pub use error::SyncError;
pub use list::ConversationListView;
pub use remote::RemoteBackend;
