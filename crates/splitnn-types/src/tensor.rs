//! Typed numeric buffers and shaped tensors.
//!
//! A [`TypedArray`] is a byte store tagged with an [`ElementKind`]. Bytes are
//! kept in the platform's native byte order; the wire codec ships them
//! verbatim, so both ends of a split must share endianness (every target we
//! run on is little-endian).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SplitError};

// ── Element Kind ──────────────────────────────────────────────────────────────

/// Element type tag. Serialized names match the dtype strings used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float32,
    Float64,
    /// One byte per element, zero is `false`.
    Bool,
}

impl ElementKind {
    pub const ALL: [ElementKind; 11] = [
        Self::Int8,
        Self::Uint8,
        Self::Int16,
        Self::Uint16,
        Self::Int32,
        Self::Uint32,
        Self::Int64,
        Self::Uint64,
        Self::Float32,
        Self::Float64,
        Self::Bool,
    ];

    /// Bytes per element.
    pub fn width(&self) -> usize {
        match self {
            Self::Int8 | Self::Uint8 | Self::Bool => 1,
            Self::Int16 | Self::Uint16 => 2,
            Self::Int32 | Self::Uint32 | Self::Float32 => 4,
            Self::Int64 | Self::Uint64 | Self::Float64 => 8,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Int8    => "int8",
            Self::Uint8   => "uint8",
            Self::Int16   => "int16",
            Self::Uint16  => "uint16",
            Self::Int32   => "int32",
            Self::Uint32  => "uint32",
            Self::Int64   => "int64",
            Self::Uint64  => "uint64",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::Bool    => "bool",
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ElementKind {
    type Err = SplitError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| SplitError::InvalidParameter(format!("unknown element kind: {s}")))
    }
}

// ── Element ───────────────────────────────────────────────────────────────────

/// A Rust scalar that can be stored in a [`TypedArray`].
pub trait Element: Copy {
    const KIND: ElementKind;

    /// Append the native-endian bytes of `self`.
    fn put(self, out: &mut Vec<u8>);

    /// Read one element from exactly `KIND.width()` bytes.
    fn get(bytes: &[u8]) -> Self;
}

macro_rules! numeric_element {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const KIND: ElementKind = ElementKind::$kind;

                fn put(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_ne_bytes());
                }

                fn get(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; std::mem::size_of::<$ty>()];
                    buf.copy_from_slice(bytes);
                    <$ty>::from_ne_bytes(buf)
                }
            }
        )*
    };
}

numeric_element! {
    i8  => Int8,
    u8  => Uint8,
    i16 => Int16,
    u16 => Uint16,
    i32 => Int32,
    u32 => Uint32,
    i64 => Int64,
    u64 => Uint64,
    f32 => Float32,
    f64 => Float64,
}

impl Element for bool {
    const KIND: ElementKind = ElementKind::Bool;

    fn put(self, out: &mut Vec<u8>) {
        out.push(self as u8);
    }

    fn get(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

// ── Typed Array ───────────────────────────────────────────────────────────────

/// Tagged contiguous byte store.
///
/// Invariant: `bytes.len()` is a multiple of `kind.width()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedArray {
    kind: ElementKind,
    bytes: Vec<u8>,
}

impl TypedArray {
    pub fn from_slice<T: Element>(values: &[T]) -> Self {
        let mut bytes = Vec::with_capacity(values.len() * T::KIND.width());
        for v in values {
            v.put(&mut bytes);
        }
        Self { kind: T::KIND, bytes }
    }

    /// Wrap raw native-endian bytes. Fails if the length is not a whole
    /// number of elements.
    pub fn from_bytes(kind: ElementKind, bytes: Vec<u8>) -> Result<Self> {
        let width = kind.width();
        if bytes.len() % width != 0 {
            return Err(SplitError::ShapeMismatch {
                expected: bytes.len() / width * width,
                actual: bytes.len(),
            });
        }
        Ok(Self { kind, bytes })
    }

    pub fn kind(&self) -> ElementKind {
        self.kind
    }

    /// Element count.
    pub fn len(&self) -> usize {
        self.bytes.len() / self.kind.width()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Copy the elements out as `T`. The requested type must match the tag.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if T::KIND != self.kind {
            return Err(SplitError::InvalidParameter(format!(
                "cannot read {} array as {}",
                self.kind,
                T::KIND
            )));
        }
        Ok(self
            .bytes
            .chunks_exact(self.kind.width())
            .map(T::get)
            .collect())
    }
}

// ── Tensor ────────────────────────────────────────────────────────────────────

/// Number of elements described by `shape`, `None` if the product overflows.
/// The empty shape is a scalar.
pub fn element_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
}

/// Backing byte length of a `kind` tensor with `shape`.
pub fn byte_len(kind: ElementKind, shape: &[usize]) -> Result<usize> {
    element_count(shape)
        .and_then(|n| n.checked_mul(kind.width()))
        .ok_or_else(|| SplitError::MalformedPayload(format!("tensor shape {shape:?} overflows")))
}

/// A [`TypedArray`] with a row-major shape.
///
/// Invariant: `product(shape) == data.len()`. Zero extents are allowed so
/// empty arrays can travel through the codec.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: TypedArray,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: TypedArray) -> Result<Self> {
        let expected = byte_len(data.kind(), &shape)?;
        if expected != data.as_bytes().len() {
            return Err(SplitError::ShapeMismatch {
                expected,
                actual: data.as_bytes().len(),
            });
        }
        Ok(Self { shape, data })
    }

    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self> {
        Self::new(shape, TypedArray::from_slice(values))
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn kind(&self) -> ElementKind {
        self.data.kind()
    }

    pub fn data(&self) -> &TypedArray {
        &self.data
    }

    pub fn element_count(&self) -> usize {
        self.data.len()
    }

    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        self.data.to_vec::<f32>()
    }

    pub fn into_parts(self) -> (Vec<usize>, TypedArray) {
        (self.shape, self.data)
    }
}

// ── Encoded Tensor ────────────────────────────────────────────────────────────

/// A tensor whose bytes have been rendered text-safe by the tensor codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedTensor {
    pub kind: ElementKind,
    pub shape: Vec<usize>,
    /// Standard base64 with padding.
    pub payload: String,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widths() {
        assert_eq!(ElementKind::Bool.width(), 1);
        assert_eq!(ElementKind::Uint16.width(), 2);
        assert_eq!(ElementKind::Float32.width(), 4);
        assert_eq!(ElementKind::Int64.width(), 8);
    }

    #[test]
    fn kind_names_parse_back() {
        for k in ElementKind::ALL {
            assert_eq!(k.as_str().parse::<ElementKind>().unwrap(), k);
            let json = serde_json::to_string(&k).unwrap();
            assert_eq!(json, format!("\"{}\"", k.as_str()));
        }
    }

    #[test]
    fn typed_array_byte_length_invariant() {
        let arr = TypedArray::from_slice(&[1.5f64, -2.0, 3.25]);
        assert_eq!(arr.kind(), ElementKind::Float64);
        assert_eq!(arr.len(), 3);
        assert_eq!(arr.as_bytes().len(), 24);
        assert_eq!(arr.to_vec::<f64>().unwrap(), vec![1.5, -2.0, 3.25]);
    }

    #[test]
    fn from_bytes_rejects_partial_element() {
        let err = TypedArray::from_bytes(ElementKind::Int32, vec![0; 7]).unwrap_err();
        assert!(matches!(err, SplitError::ShapeMismatch { expected: 4, actual: 7 }));
    }

    #[test]
    fn to_vec_checks_kind() {
        let arr = TypedArray::from_slice(&[1u8, 2, 3]);
        assert!(arr.to_vec::<i8>().is_err());
        assert_eq!(arr.to_vec::<u8>().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn bool_is_one_byte() {
        let arr = TypedArray::from_slice(&[true, false, true]);
        assert_eq!(arr.as_bytes(), &[1, 0, 1]);
        assert_eq!(arr.to_vec::<bool>().unwrap(), vec![true, false, true]);
    }

    #[test]
    fn tensor_shape_must_match() {
        assert!(Tensor::from_f32(vec![2, 3], &[0.0; 6]).is_ok());
        let err = Tensor::from_f32(vec![2, 3], &[0.0; 5]).unwrap_err();
        assert!(matches!(err, SplitError::ShapeMismatch { expected: 24, actual: 20 }));
    }

    #[test]
    fn overflowing_shape_is_rejected() {
        assert_eq!(element_count(&[usize::MAX, 4]), None);
        assert_eq!(element_count(&[usize::MAX, 0]), Some(0));
        assert!(byte_len(ElementKind::Float32, &[usize::MAX / 2]).is_err());

        let err = Tensor::new(vec![usize::MAX, 4], TypedArray::from_slice::<f32>(&[])).unwrap_err();
        assert!(matches!(err, SplitError::MalformedPayload(_)));
    }

    #[test]
    fn empty_tensor() {
        let t = Tensor::from_f32(vec![0], &[]).unwrap();
        assert_eq!(t.element_count(), 0);
        assert!(t.data().is_empty());
    }

    #[test]
    fn encoded_tensor_serde() {
        let enc = EncodedTensor {
            kind: ElementKind::Float32,
            shape: vec![1, 6, 14, 14],
            payload: "AAAAAA==".into(),
        };
        let json = serde_json::to_string(&enc).unwrap();
        let round: EncodedTensor = serde_json::from_str(&json).unwrap();
        assert_eq!(enc, round);
    }
}
