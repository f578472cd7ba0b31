//! splitnn-node — local and split inference from the command line.
//!
//! ```bash
//! # Cut a reference model in two
//! splitnn-node split-model --model models/mnist_dense.bin --at 1 \
//!     --head models/client_mnist.bin --tail models/server_mnist.bin
//!
//! # Machine A: serve the tail
//! RUST_LOG=info splitnn-node serve --listen 0.0.0.0:9100 --model models/server_mnist.bin
//!
//! # Machine B: run the head, exchange activations with A
//! splitnn-node infer --image digit.png --model models/client_mnist.bin \
//!     --mode split --remote 10.0.0.2:9100
//! ```

mod settings;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use splitnn_net::{FrameCodec, TcpConnector};
use splitnn_pipeline::{Orchestrator, RemoteStage};
use splitnn_runtime::{fetch_model, DenseEngine, DenseModel, SessionManager};
use splitnn_types::config::{ChannelPolicy, SplitConfig};
use splitnn_types::{Backend, InferenceMode};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "splitnn-node",
    version = env!("CARGO_PKG_VERSION"),
    about   = "Local and split neural-network inference"
)]
struct Cli {
    /// TOML configuration file. `SPLITNN__*` variables override it.
    #[arg(long, global = true, env = "SPLITNN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the tail of a split model over TCP.
    Serve {
        #[arg(long, default_value = "127.0.0.1:9100")]
        listen: String,
        /// Tail model path or URL.
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        backend: Option<Backend>,
    },

    /// Run one image through local or split inference.
    Infer {
        /// PNG image; any size, RGBA or not.
        #[arg(long)]
        image: PathBuf,
        /// Model path or URL (the head model in split mode).
        #[arg(long)]
        model: Option<String>,
        /// Pick model and mode from the catalog, e.g. `--dataset mnist`.
        #[arg(long, requires = "entry")]
        dataset: Option<String>,
        /// Catalog entry name, e.g. `--entry "LeNet-5 SplitNN"`.
        #[arg(long, requires = "dataset")]
        entry: Option<String>,
        #[arg(long)]
        mode: Option<InferenceMode>,
        /// Remote tail address, `host:port`.
        #[arg(long)]
        remote: Option<String>,
        #[arg(long)]
        backend: Option<Backend>,
        /// alpha | luma | rgba
        #[arg(long)]
        policy: Option<ChannelPolicy>,
    },

    /// List backend identifiers.
    Backends,

    /// List the model catalog.
    Catalog,

    /// Split a reference dense model into head and tail blobs.
    SplitModel {
        #[arg(long)]
        model: String,
        /// Number of layers kept in the head.
        #[arg(long)]
        at: usize,
        #[arg(long)]
        head: PathBuf,
        #[arg(long)]
        tail: PathBuf,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    // Default log level: INFO. Override with RUST_LOG=splitnn_net=debug etc.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli    = Cli::parse();
    let config = settings::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve { listen, model, backend } => {
            run_serve(config, &listen, model, backend).await
        }
        Command::Infer { image, model, dataset, entry, mode, remote, backend, policy } => {
            let overrides = InferOverrides { model, dataset, entry, mode, remote, backend, policy };
            run_infer(config, &image, overrides).await
        }
        Command::Backends => {
            for backend in Backend::ALL {
                println!("{:<8} {}", backend.id(), backend.display_name());
            }
            Ok(())
        }
        Command::Catalog => {
            print_catalog(&config);
            Ok(())
        }
        Command::SplitModel { model, at, head, tail } => {
            run_split_model(&model, at, &head, &tail).await
        }
    }
}

// ── Serve ─────────────────────────────────────────────────────────────────────

async fn run_serve(
    config: SplitConfig,
    listen: &str,
    model: Option<String>,
    backend: Option<Backend>,
) -> Result<()> {
    let uri = model
        .or(config.session.model.clone())
        .context("no tail model: pass --model or set session.model")?;
    let backend = backend.unwrap_or(config.session.backend);

    let sessions = SessionManager::new(
        Arc::new(DenseEngine),
        backend,
        config.session.retain_inactive_sessions,
    );
    sessions.load_model_from(&uri).await?;
    let outcome = sessions.select_backend(backend).wait().await;
    if !outcome.is_active() {
        bail!("tail session for {backend} not ready: {outcome:?}");
    }

    let stage    = Arc::new(RemoteStage::new(sessions, FrameCodec::from_config(&config.transport)?));
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {listen}"))?;

    info!(%listen, %backend, model = %uri, "serving tail stage — press Ctrl-C to stop");
    tokio::select! {
        res = stage.serve_tcp(listener) => res?,
        _ = tokio::signal::ctrl_c() => info!("Ctrl-C — shutting down"),
    }
    Ok(())
}

// ── Infer ─────────────────────────────────────────────────────────────────────

struct InferOverrides {
    model: Option<String>,
    dataset: Option<String>,
    entry: Option<String>,
    mode: Option<InferenceMode>,
    remote: Option<String>,
    backend: Option<Backend>,
    policy: Option<ChannelPolicy>,
}

/// Apply CLI flags on top of the layered configuration.
fn apply_overrides(mut config: SplitConfig, o: InferOverrides) -> Result<SplitConfig> {
    if let (Some(dataset), Some(name)) = (&o.dataset, &o.entry) {
        let entry = config
            .catalog
            .find(dataset, name)
            .with_context(|| format!("no catalog entry {name:?} in dataset {dataset:?}"))?
            .clone();
        config.session.model = Some(entry.path);
        config.mode = entry.mode;
    }
    if let Some(model) = o.model {
        config.session.model = Some(model);
    }
    if let Some(mode) = o.mode {
        config.mode = mode;
    }
    if let Some(remote) = o.remote {
        config.transport.remote = Some(remote);
    }
    if let Some(backend) = o.backend {
        config.session.backend = backend;
    }
    if let Some(policy) = o.policy {
        config.preprocess.policy = policy;
    }
    Ok(config)
}

async fn run_infer(config: SplitConfig, image: &Path, overrides: InferOverrides) -> Result<()> {
    let config = apply_overrides(config, overrides)?;
    if config.session.model.is_none() {
        bail!("no model: pass --model, --dataset/--entry or set session.model");
    }
    if config.mode == InferenceMode::Split && config.transport.remote.is_none() {
        bail!("split mode needs a remote stage: pass --remote or set transport.remote");
    }

    let pixels = image::open(image)
        .with_context(|| format!("opening {}", image.display()))?
        .to_rgba8();

    let mode = config.mode;
    let connector = TcpConnector::new(config.transport.max_frame_bytes);
    let orchestrator =
        Orchestrator::init(config, Arc::new(DenseEngine), Arc::new(connector)).await?;

    let outcome = orchestrator.infer(&pixels, mode).await;
    orchestrator.teardown().await;
    let result = outcome?;

    match result.prediction()? {
        Some((class, probability)) => println!(
            "class {class}  p={probability:.4}  mode={}  backend={}  local={:?}  total={:?}",
            result.mode, result.backend, result.local_elapsed, result.total_elapsed
        ),
        None => warn!("model produced an empty output"),
    }
    Ok(())
}

// ── Catalog ───────────────────────────────────────────────────────────────────

fn print_catalog(config: &SplitConfig) {
    for dataset in config.catalog.datasets() {
        println!("{dataset}");
        for entry in config.catalog.models(dataset) {
            println!("  {:<20} {:<6} {}", entry.name, entry.mode, entry.path);
        }
    }
}

// ── Split model ───────────────────────────────────────────────────────────────

async fn run_split_model(uri: &str, at: usize, head: &Path, tail: &Path) -> Result<()> {
    let bytes = fetch_model(uri).await?;
    let model = DenseModel::from_bytes(&bytes)
        .with_context(|| format!("{uri} is not a dense reference model"))?;
    let (head_model, tail_model) = model.split_at(at)?;

    tokio::fs::write(head, head_model.to_bytes()?)
        .await
        .with_context(|| format!("writing {}", head.display()))?;
    tokio::fs::write(tail, tail_model.to_bytes()?)
        .await
        .with_context(|| format!("writing {}", tail.display()))?;

    info!(
        layers = model.layers().len(),
        at,
        head = %head.display(),
        tail = %tail.display(),
        "model split"
    );
    Ok(())
}
