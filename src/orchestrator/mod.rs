//! Relay orchestration.
//!
//! Covers the accumulation window, the single execution slot, agent
//! process spawning, payload assembly, the inactivity watchdog and the
//! actor that ties them together.

pub mod accumulator;
pub mod engine;
pub mod handle;
pub mod intermediate;
pub mod payload;
pub mod slot;
pub mod spawner;
pub mod watchdog;

pub use engine::{Engine, EngineDeps, EngineSettings};
pub use handle::{OrchestratorHandle, StatusSnapshot};
