//! Persistence layer modules.
//!
//! The relay keeps no database: the active session id lives in a single
//! text file and the context preamble is read from disk on every submit.

pub mod context;
pub mod session_store;
