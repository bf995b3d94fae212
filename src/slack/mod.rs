//! Slack adapter: Socket Mode events in, Web API calls out.

pub mod blocks;
pub mod client;
pub mod commands;
pub mod events;

pub use client::SlackService;
pub use events::SlackBridge;
