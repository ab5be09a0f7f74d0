//! External process pipeline: launch, byte pumping, buffering and stats.

pub mod command;
pub mod lock;
pub mod relay;
pub mod stats;
pub mod supervisor;

pub use command::{ToolConfig, ToolTemplate, Tuning, MANIFEST_FILE};
pub use lock::DeviceLock;
pub use relay::{buffer_capacity, relay, RelayEnd};
pub use stats::{parse_stats, DemodStats};
pub use supervisor::{
    OutputMode, Pipeline, PipelineError, PipelineExit, PipelineSpec, TailObserver,
    LIVE_TAIL_LIMIT, SCAN_TAIL_LIMIT, TEARDOWN_GRACE,
};
