//! Emergency-aid dispatch pipeline.
//!
//! Help requests arrive on the bus, get matched to a nearby volunteer, and
//! each match opens a short-lived two-party chat room served over WebSocket.

pub mod api;
pub mod auth;
pub mod chat;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod gateway;
pub mod matching;
pub mod service;
pub mod store;

pub use error::{Error, Rejection, Result};
pub use service::{AppState, Backends, Hub, Rooms, Service, router};
