// Configuration structs. Every field has a default so partial TOML files and
// environment overrides deserialize cleanly.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::error::SplitError;
use crate::model::{InferenceMode, ModelCatalog};
use crate::tensor::ElementKind;

// ── Preprocessing ─────────────────────────────────────────────────────────────

/// How a four-channel RGBA image is reduced before packing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelPolicy {
    /// Alpha value becomes the gray intensity (line art, masks, canvas strokes).
    Alpha,
    /// Perceptual luma, 0.299 R + 0.587 G + 0.114 B.
    Luma,
    /// Keep all four channels.
    Rgba,
}

impl ChannelPolicy {
    /// Channels left after reduction.
    pub fn channels(&self) -> usize {
        match self {
            Self::Alpha | Self::Luma => 1,
            Self::Rgba => 4,
        }
    }
}

impl FromStr for ChannelPolicy {
    type Err = SplitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "alpha" => Ok(Self::Alpha),
            "luma" => Ok(Self::Luma),
            "rgba" => Ok(Self::Rgba),
            other => Err(SplitError::InvalidParameter(format!("unknown channel policy: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Target width in pixels.
    pub width: u32,
    /// Target height in pixels.
    pub height: u32,
    pub policy: ChannelPolicy,
    /// Per-channel mean. Empty skips normalization.
    pub mean: Vec<f32>,
    /// Per-channel standard deviation. Empty skips normalization.
    pub std: Vec<f32>,
    /// Shape of the model input. `None` = `[1, 1, height, width]` for one
    /// channel, `[1, height, width, channels]` otherwise (packing keeps the
    /// channels interleaved).
    pub input_shape: Option<Vec<usize>>,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            width: 28,
            height: 28,
            policy: ChannelPolicy::Alpha,
            mean: vec![0.1307],
            std: vec![0.3081],
            input_shape: None,
        }
    }
}

impl PreprocessConfig {
    pub fn resolved_input_shape(&self) -> Vec<usize> {
        self.input_shape.clone().unwrap_or_else(|| {
            let (h, w) = (self.height as usize, self.width as usize);
            match self.policy.channels() {
                1 => vec![1, 1, h, w],
                c => vec![1, h, w, c],
            }
        })
    }
}

// ── Sessions ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Backend selected at startup.
    pub backend: Backend,
    /// Model URI loaded at startup, if any.
    pub model: Option<String>,
    /// Keep compiled sessions for backends that are no longer active.
    /// `false` drops them as soon as another backend becomes active.
    pub retain_inactive_sessions: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            model: None,
            retain_inactive_sessions: true,
        }
    }
}

// ── Transport ─────────────────────────────────────────────────────────────────

/// What goes over the socket for one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// JSON message carrying type, dtype, shape and base64 payload.
    #[default]
    Framed,
    /// Only the base64 payload; kind and shape are agreed out of band.
    Bare,
}

/// Kind and shape of a tensor agreed out of band (bare wire format only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorContract {
    pub kind: ElementKind,
    pub shape: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Remote tail address, `host:port`.
    pub remote: Option<String>,
    /// Reply deadline for one exchange. `None` waits forever.
    pub exchange_timeout_ms: Option<u64>,
    pub wire_format: WireFormat,
    /// Contract for inbound tensors when `wire_format = "bare"`.
    pub inbound_contract: Option<TensorContract>,
    /// Outbound command buffer between the handle and the connection task.
    pub command_capacity: usize,
    /// Inbound frames larger than this are rejected.
    pub max_frame_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            remote: None,
            exchange_timeout_ms: Some(30_000),
            wire_format: WireFormat::Framed,
            inbound_contract: None,
            command_capacity: 64,
            max_frame_bytes: 128 * 1024 * 1024,
        }
    }
}

impl TransportConfig {
    pub fn exchange_timeout(&self) -> Option<Duration> {
        self.exchange_timeout_ms.map(Duration::from_millis)
    }
}

// ── Top Level ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    pub mode: InferenceMode,
    pub preprocess: PreprocessConfig,
    pub session: SessionConfig,
    pub transport: TransportConfig,
    pub catalog: ModelCatalog,
}
