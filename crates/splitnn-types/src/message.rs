// Self-describing wire messages exchanged between the head and the tail.
//
// JSON layout:
//   {"type":"activations","data":{"tensor_shape":[1,8],"dtype":"float32",
//    "exchange":7},"raw":{"tensor":"<base64>"}}
//
// `data.exchange` is set by the head and echoed by the tail on both logits
// and error replies.

use serde::{Deserialize, Serialize};

use crate::tensor::{ElementKind, EncodedTensor};

// ── Message Type ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Intermediate activation sent from head to tail.
    Activations,
    /// Final output sent from tail to head.
    Logits,
    /// The remote stage failed; `data.reason` says why.
    Error,
}

// ── Frame Sections ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameData {
    #[serde(default)]
    pub tensor_shape: Vec<usize>,
    #[serde(default = "default_dtype")]
    pub dtype: ElementKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange: Option<u64>,
}

fn default_dtype() -> ElementKind {
    ElementKind::Float32
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FrameRaw {
    #[serde(default)]
    pub tensor: String,
}

// ── Wire Message ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub data: FrameData,
    #[serde(default)]
    pub raw: FrameRaw,
}

impl WireMessage {
    pub fn tensor(message_type: MessageType, tensor: EncodedTensor) -> Self {
        Self {
            message_type,
            data: FrameData {
                tensor_shape: tensor.shape,
                dtype: tensor.kind,
                reason: None,
                exchange: None,
            },
            raw: FrameRaw { tensor: tensor.payload },
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            message_type: MessageType::Error,
            data: FrameData {
                tensor_shape: Vec::new(),
                dtype: default_dtype(),
                reason: Some(reason.into()),
                exchange: None,
            },
            raw: FrameRaw::default(),
        }
    }

    pub fn with_exchange(mut self, exchange: Option<u64>) -> Self {
        self.data.exchange = exchange;
        self
    }

    pub fn into_encoded(self) -> EncodedTensor {
        EncodedTensor {
            kind: self.data.dtype,
            shape: self.data.tensor_shape,
            payload: self.raw.tensor,
        }
    }
}

// ── Correlation ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct Envelope {
    data: EnvelopeData,
}

#[derive(Deserialize)]
struct EnvelopeData {
    #[serde(default)]
    exchange: Option<u64>,
}

/// Read `data.exchange` from a framed message without decoding the tensor.
pub fn exchange_of(text: &str) -> Option<u64> {
    serde_json::from_str::<Envelope>(text).ok()?.data.exchange
}

// ── Tests ─────────────────────────────────────────────────────────────────────
