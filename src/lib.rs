// Library root: the HTTP backend and the client-side helpers that talk to it.
// The binary entry point is src/main.rs.

pub mod api;
pub mod auth;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod health;
pub mod history;
pub mod lesson;
pub mod llm;
pub mod logger;
pub mod math;
pub mod relay;
pub mod store;
pub mod tts;
pub mod validate;
