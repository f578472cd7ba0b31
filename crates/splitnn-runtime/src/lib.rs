//! splitnn-runtime — model execution.
//!
//! [`SessionManager`] owns compiled sessions per [`splitnn_types::Backend`]
//! and enforces last-request-wins backend selection. [`engine`] is the seam to
//! an inference engine; [`reference::DenseEngine`] is the built-in one.

// ── Module declarations ───────────────────────────────────────────────────────

pub mod engine;
pub mod fetch;
pub mod manager;
pub mod math;
pub mod reference;

// ── Public re-exports ─────────────────────────────────────────────────────────

pub use engine::{CompiledModel, InferenceEngine};
pub use fetch::fetch_model;
pub use manager::{CompileOutcome, CompileTask, InferenceOutput, SessionManager, SessionStatus};
pub use math::{argmax, softmax};
pub use reference::{Activation, DenseEngine, DenseLayer, DenseModel};
