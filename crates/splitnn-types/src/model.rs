// Model catalog: which models exist and whether they run locally or split.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SplitError;

// ── Inference Mode ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceMode {
    /// The whole network runs on this node.
    #[default]
    Local,
    /// The head runs here, the tail on a remote peer.
    #[serde(alias = "splitnn")]
    Split,
}

impl fmt::Display for InferenceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Split => write!(f, "split"),
        }
    }
}

impl FromStr for InferenceMode {
    type Err = SplitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "split" | "splitnn" => Ok(Self::Split),
            other => Err(SplitError::InvalidParameter(format!("unknown mode: {other}"))),
        }
    }
}

// ── Model Entry ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Display name, e.g. `"LeNet-5 SplitNN"`.
    pub name: String,
    /// URI or filesystem path of the model blob.
    pub path: String,
    pub mode: InferenceMode,
}

impl ModelEntry {
    fn new(name: &str, path: &str, mode: InferenceMode) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            mode,
        }
    }
}

// ── Model Catalog ─────────────────────────────────────────────────────────────

/// Models grouped by dataset name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelCatalog {
    datasets: BTreeMap<String, Vec<ModelEntry>>,
}

impl Default for ModelCatalog {
    fn default() -> Self {
        let mut datasets = BTreeMap::new();
        datasets.insert(
            "mnist".to_string(),
            vec![
                ModelEntry::new("LeNet-5", "models/mnist.bin", InferenceMode::Local),
                ModelEntry::new("Dense", "models/mnist_dense.bin", InferenceMode::Local),
                ModelEntry::new("LeNet-5 SplitNN", "models/client_mnist.bin", InferenceMode::Split),
            ],
        );
        datasets.insert(
            "quickdraw".to_string(),
            vec![ModelEntry::new("LeNet-5", "models/quickdraw.bin", InferenceMode::Local)],
        );
        Self { datasets }
    }
}

impl ModelCatalog {
    pub fn empty() -> Self {
        Self { datasets: BTreeMap::new() }
    }

    pub fn insert(&mut self, dataset: &str, entry: ModelEntry) {
        self.datasets.entry(dataset.to_string()).or_default().push(entry);
    }

    pub fn datasets(&self) -> impl Iterator<Item = &str> {
        self.datasets.keys().map(String::as_str)
    }

    pub fn models(&self, dataset: &str) -> &[ModelEntry] {
        self.datasets.get(dataset).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn find(&self, dataset: &str, name: &str) -> Option<&ModelEntry> {
        self.models(dataset).iter().find(|m| m.name == name)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
