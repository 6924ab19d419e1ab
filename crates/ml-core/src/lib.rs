//! Detection data types and tracking shared by the pipeline.
//!
//! The TorchScript detector is only compiled with the `with-tch` feature so
//! the rest of the workspace builds without libtorch.

pub mod detection;
pub mod tracker;

#[cfg(feature = "with-tch")]
pub mod detector;

pub use detection::{Detection, DetectionBatch, iou};
pub use tracker::IouTracker;

#[cfg(feature = "with-tch")]
pub use tch;
