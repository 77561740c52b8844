//! Forensics pipeline: trace capture, decode, log query, and storage.

pub mod capture;
pub mod logs;
pub mod trace;

pub use capture::{
    identify_culprits, Culprit, Debounce, ForensicTools, ForensicsConfig, ForensicsJob,
    ForensicsWorker, SystemTools,
};
