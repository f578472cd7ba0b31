//! splitnn-pipeline — image in, prediction out.
//!
//! [`preprocess`] holds the pure image stages, [`orchestrator`] runs local or
//! split inference, and [`remote`] serves the tail of a split network.

pub mod orchestrator;
pub mod preprocess;
pub mod remote;

pub use orchestrator::{InferenceResult, Orchestrator};
pub use preprocess::{normalize, pack_to_tensor, preprocess, reduce_channels, rescale};
pub use remote::RemoteStage;
