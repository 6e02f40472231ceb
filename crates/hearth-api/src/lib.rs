pub mod auth;
pub mod conversations;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod service;
pub mod users;

pub use auth::{AppState, AppStateInner};
pub use error::ApiError;
pub use service::Messenger;
