pub mod backend;
pub mod config;
pub mod error;
pub mod message;
pub mod model;
pub mod tensor;

pub use backend::Backend;
pub use error::{Result, SplitError};
pub use model::InferenceMode;
pub use tensor::{ElementKind, EncodedTensor, Tensor, TypedArray};
