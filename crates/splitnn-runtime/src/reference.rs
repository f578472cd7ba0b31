//! Reference dense-network engine.
//!
//! A model blob is a bincode-encoded [`DenseModel`]: a chain of fully
//! connected layers, each followed by an identity, ReLU or softmax
//! activation. Every [`Backend`] compiles to the same scalar kernels, which
//! keeps the whole split pipeline runnable without a native runtime.
//!
//! Input tensors are `f32` with `n * in_features` elements in any shape;
//! outputs are `[n, out_features]`.

use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use splitnn_types::{Backend, Result, SplitError, Tensor};

use crate::engine::{CompiledModel, InferenceEngine};
use crate::math::softmax;

const DEFAULT_INPUT_NAME: &str = "input";
const DEFAULT_OUTPUT_NAME: &str = "output";
/// Tensor name on the cut between head and tail.
const ACTIVATIONS_NAME: &str = "activations";

// ── Layers ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    Identity,
    Relu,
    Softmax,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseLayer {
    in_features: usize,
    out_features: usize,
    /// Row-major `[out_features, in_features]`.
    weights: Vec<f32>,
    bias: Vec<f32>,
    activation: Activation,
}

impl DenseLayer {
    pub fn new(
        in_features: usize,
        out_features: usize,
        weights: Vec<f32>,
        bias: Vec<f32>,
        activation: Activation,
    ) -> Result<Self> {
        let layer = Self { in_features, out_features, weights, bias, activation };
        layer.validate()?;
        Ok(layer)
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    fn validate(&self) -> Result<()> {
        if self.in_features == 0 || self.out_features == 0 {
            return Err(SplitError::InvalidParameter("layer dimensions must be non-zero".into()));
        }
        if self.weights.len() != self.in_features * self.out_features {
            return Err(SplitError::InvalidParameter(format!(
                "weights: expected {} values, got {}",
                self.in_features * self.out_features,
                self.weights.len()
            )));
        }
        if self.bias.len() != self.out_features {
            return Err(SplitError::InvalidParameter(format!(
                "bias: expected {} values, got {}",
                self.out_features,
                self.bias.len()
            )));
        }
        Ok(())
    }

    fn forward_row(&self, row: &[f32], out: &mut Vec<f32>) {
        let start = out.len();
        for (o, bias) in self.bias.iter().enumerate() {
            let w = &self.weights[o * self.in_features..(o + 1) * self.in_features];
            let dot: f32 = w.iter().zip(row).map(|(a, b)| a * b).sum();
            out.push(dot + bias);
        }
        let produced = &mut out[start..];
        match self.activation {
            Activation::Identity => {}
            Activation::Relu => produced.iter_mut().for_each(|v| *v = v.max(0.0)),
            Activation::Softmax => {
                let p = softmax(produced);
                produced.copy_from_slice(&p);
            }
        }
    }
}

// ── Model ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseModel {
    input_name: String,
    output_name: String,
    layers: Vec<DenseLayer>,
}

impl DenseModel {
    pub fn new(layers: Vec<DenseLayer>) -> Result<Self> {
        let model = Self {
            input_name: DEFAULT_INPUT_NAME.into(),
            output_name: DEFAULT_OUTPUT_NAME.into(),
            layers,
        };
        model.validate()?;
        Ok(model)
    }

    /// Deterministic pseudo-random weights for the layer widths in `dims`.
    /// Hidden layers use ReLU, the last layer softmax.
    pub fn seeded(dims: &[usize], seed: u64) -> Result<Self> {
        if dims.len() < 2 {
            return Err(SplitError::InvalidParameter(
                "need at least input and output widths".into(),
            ));
        }
        let mut rng = SplitMix64(seed);
        let last = dims.len() - 2;
        let layers = dims
            .windows(2)
            .enumerate()
            .map(|(i, pair)| {
                let (fan_in, fan_out) = (pair[0], pair[1]);
                let scale = 1.0 / (fan_in.max(1) as f32).sqrt();
                let weights = (0..fan_in * fan_out).map(|_| rng.next_signed() * scale).collect();
                let bias = (0..fan_out).map(|_| rng.next_signed() * 0.1).collect();
                let activation = if i == last { Activation::Softmax } else { Activation::Relu };
                DenseLayer::new(fan_in, fan_out, weights, bias, activation)
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(layers)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (model, _): (Self, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| SplitError::Serialization(e.to_string()))?;
        model.validate()?;
        Ok(model)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| SplitError::Serialization(e.to_string()))
    }

    pub fn layers(&self) -> &[DenseLayer] {
        &self.layers
    }

    pub fn in_features(&self) -> usize {
        self.layers.first().map_or(0, DenseLayer::in_features)
    }

    pub fn out_features(&self) -> usize {
        self.layers.last().map_or(0, DenseLayer::out_features)
    }

    /// Cut after the first `at` layers. The head's output and the tail's
    /// input are both named `activations`.
    pub fn split_at(&self, at: usize) -> Result<(Self, Self)> {
        if at == 0 || at >= self.layers.len() {
            return Err(SplitError::InvalidParameter(format!(
                "split point {at} outside 1..{}",
                self.layers.len()
            )));
        }
        let head = Self {
            input_name: self.input_name.clone(),
            output_name: ACTIVATIONS_NAME.into(),
            layers: self.layers[..at].to_vec(),
        };
        let tail = Self {
            input_name: ACTIVATIONS_NAME.into(),
            output_name: self.output_name.clone(),
            layers: self.layers[at..].to_vec(),
        };
        Ok((head, tail))
    }

    /// Run a batch of `values.len() / in_features` rows.
    pub fn forward(&self, values: &[f32]) -> anyhow::Result<(usize, Vec<f32>)> {
        let width = self.in_features();
        if values.is_empty() || values.len() % width != 0 {
            bail!(
                "input has {} elements, expected a non-zero multiple of {width}",
                values.len()
            );
        }
        let batch = values.len() / width;
        let mut current = values.to_vec();
        for layer in &self.layers {
            let mut next = Vec::with_capacity(batch * layer.out_features);
            for row in current.chunks_exact(layer.in_features) {
                layer.forward_row(row, &mut next);
            }
            current = next;
        }
        Ok((batch, current))
    }

    fn validate(&self) -> Result<()> {
        if self.layers.is_empty() {
            return Err(SplitError::InvalidParameter("model has no layers".into()));
        }
        for layer in &self.layers {
            layer.validate()?;
        }
        for (i, pair) in self.layers.windows(2).enumerate() {
            if pair[0].out_features != pair[1].in_features {
                return Err(SplitError::InvalidParameter(format!(
                    "layer {i} outputs {} features but layer {} expects {}",
                    pair[0].out_features,
                    i + 1,
                    pair[1].in_features
                )));
            }
        }
        Ok(())
    }
}

/// splitmix64, enough for reproducible test weights.
struct SplitMix64(u64);

impl SplitMix64 {
    fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Uniform in `[-1, 1)`.
    fn next_signed(&mut self) -> f32 {
        let unit = (self.next_u64() >> 40) as f32 / (1u64 << 24) as f32;
        unit * 2.0 - 1.0
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct DenseEngine;

#[async_trait]
impl InferenceEngine for DenseEngine {
    async fn compile(
        &self,
        model: Arc<[u8]>,
        backend: Backend,
    ) -> anyhow::Result<Arc<dyn CompiledModel>> {
        let model = DenseModel::from_bytes(&model).context("decoding dense model")?;
        debug!(
            %backend,
            layers = model.layers.len(),
            inputs = model.in_features(),
            outputs = model.out_features(),
            "dense model compiled"
        );
        Ok(Arc::new(CompiledDense { backend, model }))
    }
}

struct CompiledDense {
    backend: Backend,
    model: DenseModel,
}

#[async_trait]
impl CompiledModel for CompiledDense {
    fn backend(&self) -> Backend {
        self.backend
    }

    fn input_name(&self) -> &str {
        &self.model.input_name
    }

    fn output_name(&self) -> &str {
        &self.model.output_name
    }

    async fn run(&self, input: Tensor) -> anyhow::Result<Tensor> {
        let values = input
            .to_f32_vec()
            .with_context(|| format!("input `{}`", self.model.input_name))?;
        let (batch, output) = self.model.forward(&values)?;
        Ok(Tensor::from_f32(vec![batch, self.model.out_features()], &output)?)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_2x2() -> DenseLayer {
        DenseLayer::new(2, 2, vec![1.0, 0.0, 0.0, 1.0], vec![0.0, 0.0], Activation::Identity).unwrap()
    }

    #[test]
    fn layer_shape_validation() {
        assert!(DenseLayer::new(2, 2, vec![1.0; 3], vec![0.0; 2], Activation::Relu).is_err());
        assert!(DenseLayer::new(2, 2, vec![1.0; 4], vec![0.0; 1], Activation::Relu).is_err());
        assert!(DenseLayer::new(0, 2, vec![], vec![0.0; 2], Activation::Relu).is_err());
    }

    #[test]
    fn chain_validation() {
        let a = DenseLayer::new(2, 3, vec![0.0; 6], vec![0.0; 3], Activation::Relu).unwrap();
        assert!(DenseModel::new(vec![a, identity_2x2()]).is_err());
        assert!(DenseModel::new(vec![]).is_err());
    }

    #[test]
    fn relu_and_bias() {
        let layer =
            DenseLayer::new(2, 2, vec![1.0, 1.0, -1.0, -1.0], vec![0.5, 0.0], Activation::Relu)
                .unwrap();
        let model = DenseModel::new(vec![layer]).unwrap();
        let (batch, out) = model.forward(&[1.0, 2.0]).unwrap();
        assert_eq!(batch, 1);
        assert_eq!(out, vec![3.5, 0.0]);
    }

    #[test]
    fn batches_rows() {
        let model = DenseModel::new(vec![identity_2x2()]).unwrap();
        let (batch, out) = model.forward(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(batch, 2);
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn rejects_bad_input_length() {
        let model = DenseModel::new(vec![identity_2x2()]).unwrap();
        assert!(model.forward(&[1.0, 2.0, 3.0]).is_err());
        assert!(model.forward(&[]).is_err());
    }

    #[test]
    fn bytes_round_trip() {
        let model = DenseModel::seeded(&[4, 3, 2], 7).unwrap();
        let bytes = model.to_bytes().unwrap();
        assert_eq!(DenseModel::from_bytes(&bytes).unwrap(), model);
        assert!(DenseModel::from_bytes(&[0xff, 0x00]).is_err());
    }

    #[test]
    fn seeded_is_deterministic_and_ends_in_softmax() {
        let a = DenseModel::seeded(&[8, 4, 3], 42).unwrap();
        let b = DenseModel::seeded(&[8, 4, 3], 42).unwrap();
        assert_eq!(a, b);
        let (_, out) = a.forward(&[0.5; 8]).unwrap();
        let sum: f32 = out.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn split_composes_to_full_model() {
        let model = DenseModel::seeded(&[6, 5, 4, 3], 3).unwrap();
        let (head, tail) = model.split_at(1).unwrap();
        assert_eq!(head.output_name, "activations");
        assert_eq!(tail.input_name, "activations");

        let input = [0.1, 0.2, 0.3, 0.4, 0.5, 0.6];
        let (_, mid) = head.forward(&input).unwrap();
        let (_, split_out) = tail.forward(&mid).unwrap();
        let (_, full_out) = model.forward(&input).unwrap();
        assert_eq!(split_out, full_out);

        assert!(model.split_at(0).is_err());
        assert!(model.split_at(3).is_err());
    }

    #[tokio::test]
    async fn engine_runs_any_backend() {
        let bytes: Arc<[u8]> = DenseModel::seeded(&[4, 2], 1).unwrap().to_bytes().unwrap().into();
        for backend in Backend::ALL {
            let compiled = DenseEngine.compile(Arc::clone(&bytes), backend).await.unwrap();
            assert_eq!(compiled.backend(), backend);
            let out = compiled
                .run(Tensor::from_f32(vec![1, 2, 2], &[1.0, 0.0, 0.0, 1.0]).unwrap())
                .await
                .unwrap();
            assert_eq!(out.shape(), &[1, 2]);
        }
    }

    #[tokio::test]
    async fn engine_rejects_non_f32_input() {
        let bytes: Arc<[u8]> = DenseModel::seeded(&[2, 2], 1).unwrap().to_bytes().unwrap().into();
        let compiled = DenseEngine.compile(bytes, Backend::Cpu).await.unwrap();
        let input = Tensor::new(vec![2], splitnn_types::TypedArray::from_slice(&[1u8, 2u8])).unwrap();
        assert!(compiled.run(input).await.is_err());
    }

    #[tokio::test]
    async fn engine_rejects_garbage_blob() {
        let bytes: Arc<[u8]> = Arc::from(&b"not a model"[..]);
        assert!(DenseEngine.compile(bytes, Backend::Wasm).await.is_err());
    }
}
