#![forbid(unsafe_code)]

//! Chat relay that batches operator messages into a resumable agent CLI.

pub mod api;
pub mod chat;
pub mod config;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod slack;
pub mod transcription;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
