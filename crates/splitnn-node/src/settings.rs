// Layered configuration: built-in defaults → TOML file → SPLITNN__* env.
// CLI flags are applied on top by the caller.

use std::path::Path;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};

use splitnn_types::config::SplitConfig;

pub const ENV_PREFIX: &str = "SPLITNN";

pub fn load(path: Option<&Path>) -> Result<SplitConfig> {
    load_with_prefix(path, ENV_PREFIX)
}

fn load_with_prefix(path: Option<&Path>, prefix: &str) -> Result<SplitConfig> {
    let mut builder = Config::builder()
        .add_source(Config::try_from(&SplitConfig::default()).context("encoding defaults")?);

    if let Some(path) = path {
        builder = builder.add_source(File::from(path).format(FileFormat::Toml));
    }

    builder = builder.add_source(Environment::with_prefix(prefix).separator("__"));

    builder
        .build()
        .and_then(|c| c.try_deserialize::<SplitConfig>())
        .with_context(|| match path {
            Some(p) => format!("loading configuration from {}", p.display()),
            None => "loading configuration".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use splitnn_types::config::{ChannelPolicy, WireFormat};
    use splitnn_types::{Backend, InferenceMode};

    #[test]
    fn defaults_without_sources() {
        let cfg = load_with_prefix(None, "SPLITNN_TEST_NONE").unwrap();
        assert_eq!(cfg, SplitConfig::default());
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
mode = "splitnn"

[preprocess]
policy = "luma"
width = 32

[session]
backend = "xnnpack"
model = "models/client_mnist.bin"

[transport]
remote = "10.0.0.2:9100"
wire_format = "bare"
inbound_contract = {{ kind = "float32", shape = [1, 10] }}
"#
        )
        .unwrap();

        let cfg = load_with_prefix(Some(file.path()), "SPLITNN_TEST_NONE").unwrap();
        assert_eq!(cfg.mode, InferenceMode::Split);
        assert_eq!(cfg.preprocess.policy, ChannelPolicy::Luma);
        assert_eq!(cfg.preprocess.width, 32);
        assert_eq!(cfg.preprocess.height, 28);
        assert_eq!(cfg.session.backend, Backend::Xnnpack);
        assert_eq!(cfg.session.model.as_deref(), Some("models/client_mnist.bin"));
        assert_eq!(cfg.transport.remote.as_deref(), Some("10.0.0.2:9100"));
        assert_eq!(cfg.transport.wire_format, WireFormat::Bare);
        assert_eq!(cfg.transport.inbound_contract.unwrap().shape, vec![1, 10]);
        assert!(cfg.catalog.find("mnist", "LeNet-5").is_some());
    }

    #[test]
    fn environment_overrides_file() {
        std::env::set_var("SPLITNN_ENVTEST__SESSION__BACKEND", "gpu");
        std::env::set_var("SPLITNN_ENVTEST__TRANSPORT__REMOTE", "tail.local:9100");
        let cfg = load_with_prefix(None, "SPLITNN_ENVTEST").unwrap();
        assert_eq!(cfg.session.backend, Backend::Gpu);
        assert_eq!(cfg.transport.remote.as_deref(), Some("tail.local:9100"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(load_with_prefix(Some(&path), "SPLITNN_TEST_NONE").is_err());
    }
}
