//! roguehound common types and errors.
//!
//! This crate provides foundational types shared across rh-core modules:
//! - Severity bands and process states as exhaustive enums
//! - The canonical per-process sample record (`ProcessScore`)
//! - Common error types

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    Band, CaptureStatus, DominantResource, ProcessScore, ProcessState, SampleSet, SnapshotType,
};
