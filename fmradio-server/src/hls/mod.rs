//! Continuous segmented (HLS) output.

pub mod output;
pub mod supervisor;

pub use output::{clear_segment_dir, manifest_readiness, NotReady};
pub use supervisor::{ContinuousOutput, RunFn, RETRY_DELAY};
