// splitnn-net::frame — one exchange payload ↔ one text frame.
//
// Framed: JSON `WireMessage` carrying type, dtype, shape, the exchange id and
//         the base64 tensor. Self-describing; remote failures travel as
//         `error` frames.
// Bare:   the base64 tensor only. Kind and shape of inbound tensors come from
//         the configured `TensorContract`. Replies cannot be correlated.

use splitnn_types::config::{TensorContract, TransportConfig, WireFormat};
use splitnn_types::message::{self, MessageType, WireMessage};
use splitnn_types::{Result, SplitError, Tensor};

use crate::tensor_codec;

/// Safety limit: reject any single frame larger than 128 MiB.
pub const MAX_FRAME_BYTES: usize = 128 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct FrameCodec {
    format: WireFormat,
    inbound: Option<TensorContract>,
    max_frame_bytes: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            format: WireFormat::Framed,
            inbound: None,
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }
}

impl FrameCodec {
    pub fn framed() -> Self {
        Self::default()
    }

    pub fn bare(inbound: TensorContract) -> Self {
        Self {
            format: WireFormat::Bare,
            inbound: Some(inbound),
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }

    pub fn from_config(config: &TransportConfig) -> Result<Self> {
        if config.wire_format == WireFormat::Bare && config.inbound_contract.is_none() {
            return Err(SplitError::Config(
                "bare wire format requires transport.inbound_contract".into(),
            ));
        }
        Ok(Self {
            format: config.wire_format,
            inbound: config.inbound_contract.clone(),
            max_frame_bytes: config.max_frame_bytes,
        })
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Whether replies carry the exchange id of their request.
    pub fn correlates(&self) -> bool {
        self.format == WireFormat::Framed
    }

    pub fn encode(&self, message_type: MessageType, tensor: &Tensor) -> Result<String> {
        self.encode_for(message_type, tensor, None)
    }

    /// Encode `tensor` tagged with `exchange`. Bare frames drop the tag.
    pub fn encode_for(
        &self,
        message_type: MessageType,
        tensor: &Tensor,
        exchange: Option<u64>,
    ) -> Result<String> {
        match self.format {
            WireFormat::Framed => {
                let msg = WireMessage::tensor(message_type, tensor_codec::encode_tensor(tensor))
                    .with_exchange(exchange);
                serde_json::to_string(&msg).map_err(|e| SplitError::Serialization(e.to_string()))
            }
            WireFormat::Bare => Ok(tensor_codec::encode(tensor.data())),
        }
    }

    /// Encode a failure report. Bare frames cannot carry one.
    pub fn encode_error(&self, reason: &str, exchange: Option<u64>) -> Option<String> {
        match self.format {
            WireFormat::Framed => {
                serde_json::to_string(&WireMessage::error(reason).with_exchange(exchange)).ok()
            }
            WireFormat::Bare => None,
        }
    }

    /// Exchange id carried by an inbound frame. Always `None` for bare frames.
    pub fn exchange_id(&self, text: &str) -> Option<u64> {
        match self.format {
            WireFormat::Framed if text.len() <= self.max_frame_bytes => message::exchange_of(text),
            _ => None,
        }
    }

    /// Decode an inbound frame that must carry a tensor of `expected` type.
    ///
    /// A framed `error` message surfaces as [`SplitError::InferenceFailed`].
    pub fn decode(&self, text: &str, expected: MessageType) -> Result<Tensor> {
        if text.len() > self.max_frame_bytes {
            return Err(SplitError::MalformedPayload(format!(
                "frame too large: {} bytes (max {})",
                text.len(),
                self.max_frame_bytes
            )));
        }

        match self.format {
            WireFormat::Framed => {
                let msg: WireMessage = serde_json::from_str(text)
                    .map_err(|e| SplitError::MalformedPayload(e.to_string()))?;
                match msg.message_type {
                    MessageType::Error => Err(SplitError::InferenceFailed(format!(
                        "remote stage: {}",
                        msg.data.reason.as_deref().unwrap_or("unknown error")
                    ))),
                    t if t != expected => Err(SplitError::MalformedPayload(format!(
                        "expected {expected:?} frame, got {t:?}"
                    ))),
                    _ => tensor_codec::decode_tensor(&msg.into_encoded()),
                }
            }
            WireFormat::Bare => {
                let contract = self.inbound.as_ref().ok_or_else(|| {
                    SplitError::Config("bare wire format requires an inbound contract".into())
                })?;
                let data = tensor_codec::decode(text, contract.kind, &contract.shape)?;
                Tensor::new(contract.shape.clone(), data)
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use splitnn_types::ElementKind;

    fn activation() -> Tensor {
        Tensor::from_f32(vec![1, 4], &[0.25, -1.0, 3.0, 0.0]).unwrap()
    }

    #[test]
    fn framed_round_trip() {
        let codec = FrameCodec::framed();
        let text = codec.encode(MessageType::Activations, &activation()).unwrap();
        assert!(text.starts_with(r#"{"type":"activations""#));
        let back = codec.decode(&text, MessageType::Activations).unwrap();
        assert_eq!(back, activation());
    }

    #[test]
    fn framed_rejects_unexpected_type() {
        let codec = FrameCodec::framed();
        let text = codec.encode(MessageType::Activations, &activation()).unwrap();
        let err = codec.decode(&text, MessageType::Logits).unwrap_err();
        assert!(matches!(err, SplitError::MalformedPayload(_)));
    }

    #[test]
    fn framed_error_frame_is_inference_failure() {
        let codec = FrameCodec::framed();
        let text = codec.encode_error("no tail model", None).unwrap();
        let err = codec.decode(&text, MessageType::Logits).unwrap_err();
        match err {
            SplitError::InferenceFailed(msg) => assert!(msg.contains("no tail model")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn framed_carries_exchange_id() {
        let codec = FrameCodec::framed();
        assert!(codec.correlates());
        let text = codec.encode_for(MessageType::Logits, &activation(), Some(9)).unwrap();
        assert_eq!(codec.exchange_id(&text), Some(9));
        assert_eq!(codec.decode(&text, MessageType::Logits).unwrap(), activation());

        let untagged = codec.encode(MessageType::Logits, &activation()).unwrap();
        assert_eq!(codec.exchange_id(&untagged), None);
        let error = codec.encode_error("tail down", Some(3)).unwrap();
        assert_eq!(codec.exchange_id(&error), Some(3));
    }

    #[test]
    fn overflowing_shape_is_malformed() {
        let text = r#"{"type":"activations","data":{"tensor_shape":[18446744073709551615,4],"dtype":"float32"},"raw":{"tensor":""}}"#;
        let err = FrameCodec::framed().decode(text, MessageType::Activations).unwrap_err();
        assert!(matches!(err, SplitError::MalformedPayload(_)));
    }

    #[test]
    fn bare_uses_contract() {
        let codec = FrameCodec::bare(TensorContract {
            kind: ElementKind::Float32,
            shape: vec![1, 4],
        });
        let text = codec.encode(MessageType::Activations, &activation()).unwrap();
        assert_eq!(text, tensor_codec::encode(activation().data()));
        assert_eq!(codec.decode(&text, MessageType::Logits).unwrap(), activation());
        assert!(codec.encode_error("x", Some(1)).is_none());
        assert!(!codec.correlates());
        assert_eq!(codec.exchange_id(&text), None);
    }

    #[test]
    fn bare_without_contract_is_config_error() {
        let cfg = TransportConfig {
            wire_format: WireFormat::Bare,
            ..Default::default()
        };
        assert!(matches!(FrameCodec::from_config(&cfg), Err(SplitError::Config(_))));
    }

    #[test]
    fn rejects_oversized_frame() {
        let codec = FrameCodec {
            max_frame_bytes: 16, // tiny limit for test
            ..FrameCodec::framed()
        };
        let text = codec.encode(MessageType::Activations, &activation()).unwrap();
        let err = codec.decode(&text, MessageType::Activations).unwrap_err();
        assert!(err.to_string().contains("frame too large"));
    }

    #[test]
    fn garbage_is_malformed() {
        let err = FrameCodec::framed().decode("{not json", MessageType::Logits).unwrap_err();
        assert!(matches!(err, SplitError::MalformedPayload(_)));
    }
}
