//! Process data collection: OS adapters and the sampler.

pub mod gpu;
pub mod libproc;
pub mod sampler;

pub use libproc::{BsdInfo, MockSource, ProcessDataSource, Rusage, TaskInfo, Timebase};
pub use sampler::Sampler;

#[cfg(target_os = "macos")]
pub use libproc::LibprocSource;
