//! Shared types, enums, and error plumbing used across the isol8 engine.

pub mod error;
pub mod types;

pub use error::EngineError;
pub use types::*;
