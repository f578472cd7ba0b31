//! Execution backend identities.
//!
//! The set is closed: every backend the engine seam can be asked to compile
//! for is listed here, and callers match on it exhaustively.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SplitError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Portable scalar CPU kernels.
    Cpu,
    /// WebAssembly with 128-bit SIMD.
    Wasm,
    /// GPU-accelerated execution (WebGL / WebGPU class devices).
    Gpu,
    /// Dedicated neural-network accelerator.
    Npu,
    /// Vendor-optimized CPU kernels (XNNPACK class).
    Xnnpack,
}

impl Backend {
    pub const ALL: [Backend; 5] = [
        Backend::Cpu,
        Backend::Wasm,
        Backend::Gpu,
        Backend::Npu,
        Backend::Xnnpack,
    ];

    /// Stable identifier used in configuration files and on the CLI.
    pub fn id(&self) -> &'static str {
        match self {
            Self::Cpu     => "cpu",
            Self::Wasm    => "wasm",
            Self::Gpu     => "gpu",
            Self::Npu     => "npu",
            Self::Xnnpack => "xnnpack",
        }
    }

    /// Human-readable name.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Cpu     => "Portable CPU",
            Self::Wasm    => "WebAssembly SIMD",
            Self::Gpu     => "GPU",
            Self::Npu     => "Neural accelerator",
            Self::Xnnpack => "XNNPACK CPU",
        }
    }
}

impl Default for Backend {
    fn default() -> Self {
        Self::Wasm
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Backend {
    type Err = SplitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|b| b.id().eq_ignore_ascii_case(s))
            .ok_or_else(|| SplitError::InvalidParameter(format!("unknown backend: {s}")))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
