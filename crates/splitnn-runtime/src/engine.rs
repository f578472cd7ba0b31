//! Inference engine seam.
//!
//! An [`InferenceEngine`] turns raw model bytes into a [`CompiledModel`] for
//! one backend. Compiled models have a single named input and a single named
//! output. Engines report failures through `anyhow`; the session manager maps
//! them onto the workspace error taxonomy.

use std::sync::Arc;

use async_trait::async_trait;
use splitnn_types::{Backend, Tensor};

#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Compile `model` for `backend`. May be slow; runs off the caller's path.
    async fn compile(
        &self,
        model: Arc<[u8]>,
        backend: Backend,
    ) -> anyhow::Result<Arc<dyn CompiledModel>>;
}

#[async_trait]
pub trait CompiledModel: Send + Sync {
    fn backend(&self) -> Backend;

    fn input_name(&self) -> &str;

    fn output_name(&self) -> &str;

    /// Execute on one input tensor.
    async fn run(&self, input: Tensor) -> anyhow::Result<Tensor>;
}
