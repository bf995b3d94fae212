//! Domain model module declarations.

pub mod batch;
pub mod control;
pub mod event;
pub mod question;
pub mod tier;
