//! Shared types for the Snaplite daemon core.

pub mod errors;

pub use errors::{SnapError, SnapResult};
