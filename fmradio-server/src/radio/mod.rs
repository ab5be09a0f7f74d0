//! Radio state and the operations exposed to the HTTP layer.

pub mod lease;
pub mod service;
pub mod state;

pub use service::RadioService;
pub use state::{RadioContext, RadioSettings, RadioState};
