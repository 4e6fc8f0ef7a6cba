pub mod chat_ws;
pub mod error;
pub mod map;
pub mod notifications_ws;
pub mod requests;
pub mod volunteers;
