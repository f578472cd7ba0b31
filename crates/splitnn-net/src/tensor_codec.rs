// splitnn-net::tensor_codec — typed array ↔ text-safe string.
//
// The raw native-endian backing bytes are base64-encoded (standard alphabet,
// `=` padding) with no byte-order conversion. Peers must share endianness.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use splitnn_types::tensor::{byte_len, ElementKind, EncodedTensor, Tensor, TypedArray};
use splitnn_types::{Result, SplitError};

/// Encode the backing bytes of `array`.
pub fn encode(array: &TypedArray) -> String {
    STANDARD.encode(array.as_bytes())
}

/// Decode `text` and reinterpret it as `product(shape)` elements of `kind`.
pub fn decode(text: &str, kind: ElementKind, shape: &[usize]) -> Result<TypedArray> {
    let expected = byte_len(kind, shape)?;
    let bytes = STANDARD
        .decode(text)
        .map_err(|e| SplitError::MalformedPayload(e.to_string()))?;

    if bytes.len() != expected {
        return Err(SplitError::ShapeMismatch {
            expected,
            actual: bytes.len(),
        });
    }
    TypedArray::from_bytes(kind, bytes)
}

pub fn encode_tensor(tensor: &Tensor) -> EncodedTensor {
    EncodedTensor {
        kind: tensor.kind(),
        shape: tensor.shape().to_vec(),
        payload: encode(tensor.data()),
    }
}

pub fn decode_tensor(encoded: &EncodedTensor) -> Result<Tensor> {
    let data = decode(&encoded.payload, encoded.kind, &encoded.shape)?;
    Tensor::new(encoded.shape.clone(), data)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
