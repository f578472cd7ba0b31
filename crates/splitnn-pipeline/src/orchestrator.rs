//! Local / split inference orchestrator.
//!
//! [`Orchestrator`] is an explicit context object: the host builds it with
//! [`Orchestrator::init`], shares it by reference and ends it with
//! [`Orchestrator::teardown`]. One call runs strictly in order:
//!
//! ```text
//! local:  preprocess → session infer
//! split:  reserve exchange → preprocess → head infer → encode activations
//!         → send → await one reply → decode logits
//! ```
//!
//! Framed requests carry the exchange id and only the matching reply is
//! accepted. Bare frames cannot be matched, so a bare exchange that times out
//! drops the connection before a late reply can reach the next caller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use image::RgbaImage;
use tracing::{debug, info, warn};

use splitnn_net::{
    Connection, ConnectionObserver, Connector, ExchangeObserver, ExchangeSlot, FrameCodec,
};
use splitnn_runtime::{argmax, softmax, InferenceEngine, SessionManager};
use splitnn_types::config::SplitConfig;
use splitnn_types::message::MessageType;
use splitnn_types::{Backend, InferenceMode, Result, SplitError, Tensor};

use crate::preprocess::preprocess;

/// Tolerance for treating an output as already being a probability vector.
const DISTRIBUTION_EPSILON: f32 = 1e-3;

// ── Result ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct InferenceResult {
    /// Final model output (local output or remote logits).
    pub output: Tensor,
    pub mode: InferenceMode,
    /// Backend that ran the local part.
    pub backend: Backend,
    /// Time spent in the local session.
    pub local_elapsed: Duration,
    /// Wall-clock time of the whole call, preprocessing and exchange included.
    pub total_elapsed: Duration,
}

impl InferenceResult {
    pub fn logits(&self) -> Result<Vec<f32>> {
        self.output.to_f32_vec()
    }

    /// The output as a probability vector. Outputs that already form a
    /// distribution are returned as-is; anything else goes through softmax.
    pub fn probabilities(&self) -> Result<Vec<f32>> {
        let values = self.logits()?;
        let sum: f32 = values.iter().sum();
        let is_distribution = values.iter().all(|v| (0.0..=1.0).contains(v))
            && (sum - 1.0).abs() < DISTRIBUTION_EPSILON;
        Ok(if is_distribution { values } else { softmax(&values) })
    }

    /// Top class and its probability.
    pub fn prediction(&self) -> Result<Option<(usize, f32)>> {
        Ok(argmax(&self.probabilities()?))
    }
}

// ── Orchestrator ──────────────────────────────────────────────────────────────

pub struct Orchestrator {
    config: SplitConfig,
    sessions: Arc<SessionManager>,
    connection: Connection,
    slot: Arc<ExchangeSlot>,
    codec: FrameCodec,
}

impl Orchestrator {
    /// Build the context. Loads `session.model` and activates
    /// `session.backend` when a model is configured, and connects to
    /// `transport.remote` when one is set. A session that fails to compile or
    /// a remote that refuses the connection is logged, not fatal.
    pub async fn init(
        config: SplitConfig,
        engine: Arc<dyn InferenceEngine>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        let codec = FrameCodec::from_config(&config.transport)?;
        let sessions = SessionManager::new(
            engine,
            config.session.backend,
            config.session.retain_inactive_sessions,
        );
        let connection = Connection::with_capacity(connector, config.transport.command_capacity);

        let orchestrator = Self {
            config,
            sessions,
            connection,
            slot: ExchangeSlot::new(),
            codec,
        };

        if let Some(uri) = orchestrator.config.session.model.clone() {
            orchestrator.sessions.load_model_from(&uri).await?;
            let backend = orchestrator.config.session.backend;
            let outcome = orchestrator.sessions.select_backend(backend).wait().await;
            if !outcome.is_active() {
                warn!(%backend, ?outcome, "initial session not ready");
            }
        }

        if let Some(remote) = orchestrator.config.transport.remote.clone() {
            if let Err(e) = orchestrator.connect_remote(&remote, None).await {
                warn!(%remote, %e, "remote stage unreachable");
            }
        }

        info!(mode = %orchestrator.config.mode, "orchestrator ready");
        Ok(orchestrator)
    }

    pub fn config(&self) -> &SplitConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Connect (or reconnect) to the remote tail and wait for the handshake.
    /// `observer` additionally receives every connection callback.
    pub async fn connect_remote(
        &self,
        address: &str,
        observer: Option<Arc<dyn ConnectionObserver>>,
    ) -> Result<()> {
        let routed =
            ExchangeObserver::new(Arc::clone(&self.slot), observer).with_codec(self.codec.clone());
        self.connection.connect(address, Arc::new(routed)).await;
        self.connection.wait_open().await
    }

    pub async fn disconnect_remote(&self) {
        self.connection.disconnect().await;
    }

    pub async fn teardown(self) {
        self.connection.disconnect().await;
        info!("orchestrator torn down");
    }

    /// Run one image through the pipeline in `mode`.
    pub async fn infer(&self, image: &RgbaImage, mode: InferenceMode) -> Result<InferenceResult> {
        let started = Instant::now();
        match mode {
            InferenceMode::Local => {
                let input = preprocess(image, &self.config.preprocess)?;
                self.run_local(input, started).await
            }
            InferenceMode::Split => {
                let ticket = self.slot.reserve()?;
                let input = preprocess(image, &self.config.preprocess)?;
                let head = self.sessions.infer(input).await?;
                debug!(shape = ?head.tensor.shape(), "head activations ready");

                let exchange = ticket.id();
                let payload = self.codec.encode_for(
                    MessageType::Activations,
                    &head.tensor,
                    Some(exchange),
                )?;
                let timeout = self.config.transport.exchange_timeout();
                let reply = match ticket.exchange(&self.connection, payload, timeout).await {
                    Err(SplitError::ExchangeTimeout(limit)) if !self.codec.correlates() => {
                        warn!(exchange, ?limit, "bare exchange timed out, dropping connection");
                        self.connection.disconnect().await;
                        return Err(SplitError::ExchangeTimeout(limit));
                    }
                    other => other?,
                };
                let output = self.codec.decode(&reply, MessageType::Logits)?;

                let total_elapsed = started.elapsed();
                info!(
                    backend = %head.backend,
                    local_ms = head.elapsed.as_millis() as u64,
                    total_ms = total_elapsed.as_millis() as u64,
                    "split inference complete"
                );
                Ok(InferenceResult {
                    output,
                    mode,
                    backend: head.backend,
                    local_elapsed: head.elapsed,
                    total_elapsed,
                })
            }
        }
    }

    /// Local inference on an already preprocessed tensor.
    pub async fn infer_tensor(&self, input: Tensor) -> Result<InferenceResult> {
        self.run_local(input, Instant::now()).await
    }

    async fn run_local(&self, input: Tensor, started: Instant) -> Result<InferenceResult> {
        let out = self.sessions.infer(input).await?;
        let total_elapsed = started.elapsed();
        info!(
            backend = %out.backend,
            local_ms = out.elapsed.as_millis() as u64,
            "local inference complete"
        );
        Ok(InferenceResult {
            output: out.tensor,
            mode: InferenceMode::Local,
            backend: out.backend,
            local_elapsed: out.elapsed,
            total_elapsed,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use image::Rgba;
    use splitnn_net::{memory_link, Frame, MemoryListener};
    use splitnn_net::ConnectionState;
    use splitnn_runtime::{DenseEngine, DenseModel};
    use splitnn_types::config::{TensorContract, WireFormat};
    use splitnn_types::ElementKind;

    use crate::remote::RemoteStage;

    fn alpha_pattern(size: u32) -> RgbaImage {
        let pattern = [255u8, 0, 128];
        RgbaImage::from_fn(size, size, |x, y| {
            let i = (y * size + x) as usize;
            Rgba([0, 0, 0, pattern[i % pattern.len()]])
        })
    }

    async fn orchestrator(
        model: &DenseModel,
        config: SplitConfig,
    ) -> (Arc<Orchestrator>, MemoryListener) {
        let (connector, listener) = memory_link();
        let orch = Orchestrator::init(config, Arc::new(DenseEngine), Arc::new(connector))
            .await
            .unwrap();
        orch.sessions().load_model(model.to_bytes().unwrap());
        assert!(orch.sessions().select_backend(Backend::Cpu).wait().await.is_active());
        (Arc::new(orch), listener)
    }

    async fn tail_stage(tail: &DenseModel) -> Arc<RemoteStage> {
        let sessions = SessionManager::new(Arc::new(DenseEngine), Backend::Cpu, true);
        sessions.load_model(tail.to_bytes().unwrap());
        assert!(sessions.select_backend(Backend::Cpu).wait().await.is_active());
        Arc::new(RemoteStage::new(sessions, FrameCodec::framed()))
    }

    #[tokio::test]
    async fn local_end_to_end_sums_to_one() {
        let model = DenseModel::seeded(&[784, 32, 10], 5).unwrap();
        let (orch, _listener) = orchestrator(&model, SplitConfig::default()).await;

        let result = orch.infer(&alpha_pattern(280), InferenceMode::Local).await.unwrap();
        assert_eq!(result.output.shape(), &[1, 10]);
        let sum: f32 = result.logits().unwrap().iter().sum();
        assert!((sum - 1.0).abs() < 1e-5, "sum = {sum}");
        assert_eq!(result.backend, Backend::Cpu);
        assert!(result.prediction().unwrap().is_some());
    }

    #[tokio::test]
    async fn local_without_session_fails() {
        let (connector, _listener) = memory_link();
        let orch = Orchestrator::init(
            SplitConfig::default(),
            Arc::new(DenseEngine),
            Arc::new(connector),
        )
        .await
        .unwrap();
        let err = orch.infer(&alpha_pattern(28), InferenceMode::Local).await.unwrap_err();
        assert!(matches!(err, SplitError::NoSessionLoaded));
    }

    #[tokio::test]
    async fn init_loads_configured_model() {
        let model = DenseModel::seeded(&[784, 10], 9).unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&model.to_bytes().unwrap()).unwrap();

        let mut config = SplitConfig::default();
        config.session.model = Some(file.path().to_str().unwrap().to_string());
        config.session.backend = Backend::Xnnpack;

        let (connector, _listener) = memory_link();
        let orch = Orchestrator::init(config, Arc::new(DenseEngine), Arc::new(connector))
            .await
            .unwrap();
        assert_eq!(orch.sessions().active_backend(), Some(Backend::Xnnpack));
        let result = orch.infer(&alpha_pattern(28), InferenceMode::Local).await.unwrap();
        assert_eq!(result.backend, Backend::Xnnpack);
    }

    #[tokio::test]
    async fn split_matches_full_model() {
        let full = DenseModel::seeded(&[784, 16, 10], 11).unwrap();
        let (head, tail) = full.split_at(1).unwrap();

        let (split_orch, mut listener) = orchestrator(&head, SplitConfig::default()).await;
        let stage = tail_stage(&tail).await;
        let server = tokio::spawn(async move {
            let peer = listener.accept().await.unwrap();
            stage.serve_stream(Box::new(peer)).await;
        });
        split_orch.connect_remote("mem://tail", None).await.unwrap();

        let image = alpha_pattern(280);
        let split = split_orch.infer(&image, InferenceMode::Split).await.unwrap();
        assert_eq!(split.mode, InferenceMode::Split);

        let (local_orch, _l) = orchestrator(&full, SplitConfig::default()).await;
        let local = local_orch.infer(&image, InferenceMode::Local).await.unwrap();

        assert_eq!(split.output.shape(), local.output.shape());
        for (a, b) in split.logits().unwrap().iter().zip(local.logits().unwrap()) {
            assert!((a - b).abs() < 1e-6);
        }

        split_orch.disconnect_remote().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn split_over_tcp() {
        let full = DenseModel::seeded(&[784, 8, 4], 13).unwrap();
        let (head, tail) = full.split_at(1).unwrap();
        let stage = tail_stage(&tail).await;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(stage.serve_tcp(listener));

        let orch = Orchestrator::init(
            SplitConfig::default(),
            Arc::new(DenseEngine),
            Arc::new(splitnn_net::TcpConnector::default()),
        )
        .await
        .unwrap();
        orch.sessions().load_model(head.to_bytes().unwrap());
        orch.sessions().select_backend(Backend::Wasm).wait().await;
        orch.connect_remote(&addr, None).await.unwrap();

        let result = orch.infer(&alpha_pattern(28), InferenceMode::Split).await.unwrap();
        assert_eq!(result.output.shape(), &[1, 4]);
        let sum: f32 = result.logits().unwrap().iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);

        orch.teardown().await;
        server.abort();
    }

    #[tokio::test]
    async fn second_split_call_is_busy() {
        let head = DenseModel::seeded(&[784, 4], 17).unwrap();
        let (orch, mut listener) = orchestrator(&head, SplitConfig::default()).await;

        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        orch.connect_remote("mem://tail", None).await.unwrap();
        let mut peer = accept.await.unwrap();

        let first = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.infer(&alpha_pattern(28), InferenceMode::Split).await })
        };

        let Some(Frame::Text(request)) = peer.recv().await else {
            panic!("expected activations frame");
        };
        let codec = FrameCodec::framed();
        let activations = codec.decode(&request, MessageType::Activations).unwrap();
        assert_eq!(activations.shape(), &[1, 4]);

        let second = orch.infer(&alpha_pattern(28), InferenceMode::Split).await;
        assert!(matches!(second, Err(SplitError::ExchangeBusy)));

        let logits = Tensor::from_f32(vec![1, 3], &[0.1, 0.7, 0.2]).unwrap();
        let exchange = codec.exchange_id(&request);
        assert!(exchange.is_some());
        peer.push_text(codec.encode_for(MessageType::Logits, &logits, exchange).unwrap());

        let result = first.await.unwrap().unwrap();
        assert_eq!(result.output, logits);
        assert_eq!(result.prediction().unwrap(), Some((1, 0.7)));
    }

    #[tokio::test]
    async fn exchange_timeout_frees_the_slot() {
        let head = DenseModel::seeded(&[784, 4], 19).unwrap();
        let mut config = SplitConfig::default();
        config.transport.exchange_timeout_ms = Some(30);
        let (orch, mut listener) = orchestrator(&head, config).await;

        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        orch.connect_remote("mem://silent", None).await.unwrap();
        let _peer = accept.await.unwrap();

        for _ in 0..2 {
            let err = orch.infer(&alpha_pattern(28), InferenceMode::Split).await.unwrap_err();
            assert!(matches!(err, SplitError::ExchangeTimeout(_)));
        }
    }

    #[tokio::test]
    async fn late_reply_does_not_reach_next_exchange() {
        let head = DenseModel::seeded(&[784, 4], 37).unwrap();
        let mut config = SplitConfig::default();
        config.transport.exchange_timeout_ms = Some(300);
        let (orch, mut listener) = orchestrator(&head, config).await;

        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        orch.connect_remote("mem://slow", None).await.unwrap();
        let mut peer = accept.await.unwrap();

        let err = orch.infer(&alpha_pattern(28), InferenceMode::Split).await.unwrap_err();
        assert!(matches!(err, SplitError::ExchangeTimeout(_)));

        let second = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.infer(&alpha_pattern(28), InferenceMode::Split).await })
        };

        let codec = FrameCodec::framed();
        let mut requests = Vec::new();
        for _ in 0..2 {
            let Some(Frame::Text(request)) = peer.recv().await else {
                panic!("expected activations frame");
            };
            requests.push(codec.exchange_id(&request));
        }
        assert_ne!(requests[0], requests[1]);

        let stale = Tensor::from_f32(vec![1, 3], &[0.9, 0.05, 0.05]).unwrap();
        let fresh = Tensor::from_f32(vec![1, 3], &[0.05, 0.05, 0.9]).unwrap();
        peer.push_text(codec.encode_for(MessageType::Logits, &stale, requests[0]).unwrap());
        peer.push_text(codec.encode_for(MessageType::Logits, &fresh, requests[1]).unwrap());

        let result = second.await.unwrap().unwrap();
        assert_eq!(result.output, fresh);
    }

    #[tokio::test]
    async fn bare_timeout_drops_the_connection() {
        let head = DenseModel::seeded(&[784, 4], 41).unwrap();
        let mut config = SplitConfig::default();
        config.transport.exchange_timeout_ms = Some(30);
        config.transport.wire_format = WireFormat::Bare;
        config.transport.inbound_contract = Some(TensorContract {
            kind: ElementKind::Float32,
            shape: vec![1, 3],
        });
        let (orch, mut listener) = orchestrator(&head, config).await;

        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        orch.connect_remote("mem://bare", None).await.unwrap();
        let _peer = accept.await.unwrap();

        let err = orch.infer(&alpha_pattern(28), InferenceMode::Split).await.unwrap_err();
        assert!(matches!(err, SplitError::ExchangeTimeout(_)));
        assert_eq!(orch.connection().state(), ConnectionState::Closed);

        let err = orch.infer(&alpha_pattern(28), InferenceMode::Split).await.unwrap_err();
        assert!(matches!(err, SplitError::ConnectionClosed));
    }

    #[tokio::test]
    async fn remote_error_frame_fails_the_call() {
        let head = DenseModel::seeded(&[784, 4], 23).unwrap();
        let (orch, mut listener) = orchestrator(&head, SplitConfig::default()).await;

        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        orch.connect_remote("mem://tail", None).await.unwrap();
        let mut peer = accept.await.unwrap();

        let responder = tokio::spawn(async move {
            let Some(Frame::Text(request)) = peer.recv().await else {
                panic!("expected activations frame");
            };
            let codec = FrameCodec::framed();
            let reply = codec
                .encode_error("tail session missing", codec.exchange_id(&request))
                .unwrap();
            peer.push_text(reply);
            peer
        });

        let err = orch.infer(&alpha_pattern(28), InferenceMode::Split).await.unwrap_err();
        match err {
            SplitError::InferenceFailed(reason) => assert!(reason.contains("tail session missing")),
            other => panic!("unexpected error: {other}"),
        }
        let _peer = responder.await.unwrap();
    }

    #[tokio::test]
    async fn split_without_connection_is_closed() {
        let head = DenseModel::seeded(&[784, 4], 29).unwrap();
        let (orch, _listener) = orchestrator(&head, SplitConfig::default()).await;
        let err = orch.infer(&alpha_pattern(28), InferenceMode::Split).await.unwrap_err();
        assert!(matches!(err, SplitError::ConnectionClosed));
    }

    #[tokio::test]
    async fn remote_close_fails_pending_call() {
        let head = DenseModel::seeded(&[784, 4], 31).unwrap();
        let (orch, mut listener) = orchestrator(&head, SplitConfig::default()).await;

        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        orch.connect_remote("mem://tail", None).await.unwrap();
        let mut peer = accept.await.unwrap();

        let hang_up = tokio::spawn(async move {
            peer.recv().await.unwrap();
            peer.hang_up();
        });

        let err = orch.infer(&alpha_pattern(28), InferenceMode::Split).await.unwrap_err();
        assert!(matches!(err, SplitError::ConnectionClosed));
        hang_up.await.unwrap();
    }

    #[test]
    fn probabilities_pass_through_distributions() {
        let result = InferenceResult {
            output: Tensor::from_f32(vec![1, 2], &[0.25, 0.75]).unwrap(),
            mode: InferenceMode::Local,
            backend: Backend::Cpu,
            local_elapsed: Duration::ZERO,
            total_elapsed: Duration::ZERO,
        };
        assert_eq!(result.probabilities().unwrap(), vec![0.25, 0.75]);

        let logits = InferenceResult {
            output: Tensor::from_f32(vec![1, 2], &[2.0, 2.0]).unwrap(),
            ..result
        };
        assert_eq!(logits.probabilities().unwrap(), vec![0.5, 0.5]);
    }
}
