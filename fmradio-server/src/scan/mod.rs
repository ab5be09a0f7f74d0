//! Spectrum scan: sequential probing and peak detection.

pub mod engine;
pub mod peaks;

pub use engine::{ScanEngine, SETTLE_DELAY};
