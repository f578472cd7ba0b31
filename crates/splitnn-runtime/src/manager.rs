//! Backend session manager.
//!
//! Holds the raw bytes of the last loaded model and one lazily compiled
//! session per backend. Backend selection is last-request-wins: every
//! `select_backend` and `load_model` call takes the next sequence number, and
//! a compile result is applied only if its number is still the latest.
//!
//! All mutation happens under one short `parking_lot` lock that is never held
//! across an await. Engine work (compile and run) executes on spawned tasks
//! so a panicking engine surfaces as an error instead of unwinding into the
//! caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use splitnn_types::{Backend, Result, SplitError, Tensor};

use crate::engine::{CompiledModel, InferenceEngine};
use crate::fetch::fetch_model;

// ── Outcomes ──────────────────────────────────────────────────────────────────

/// How a `select_backend` request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutcome {
    /// A new session was compiled and is now active.
    Ready,
    /// An existing session for the current model was reactivated.
    Reused,
    /// A later request overtook this one; its result was discarded.
    Superseded,
    /// The engine failed; the previously active session is unchanged.
    Failed(String),
    /// No model bytes are loaded yet.
    NoModel,
}

impl CompileOutcome {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Ready | Self::Reused)
    }
}

/// Awaitable handle returned by [`SessionManager::select_backend`].
/// Dropping it does not cancel the compile.
pub struct CompileTask {
    seq: u64,
    backend: Backend,
    state: TaskState,
}

enum TaskState {
    Done(CompileOutcome),
    Running(JoinHandle<CompileOutcome>),
}

impl CompileTask {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub async fn wait(self) -> CompileOutcome {
        match self.state {
            TaskState::Done(outcome) => outcome,
            TaskState::Running(handle) => handle
                .await
                .unwrap_or_else(|e| CompileOutcome::Failed(format!("compile task failed: {e}"))),
        }
    }
}

/// Output of one [`SessionManager::infer`] call.
#[derive(Debug, Clone)]
pub struct InferenceOutput {
    pub tensor: Tensor,
    pub elapsed: Duration,
    pub backend: Backend,
}

/// Point-in-time view of the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub selected: Backend,
    pub active: Option<Backend>,
    pub loading: bool,
    pub model_bytes: Option<usize>,
    pub cached: Vec<Backend>,
}

// ── Manager ───────────────────────────────────────────────────────────────────

struct Inner {
    model: Option<Arc<[u8]>>,
    selected: Backend,
    active: Option<Backend>,
    sessions: HashMap<Backend, Arc<dyn CompiledModel>>,
    latest_seq: u64,
    /// Sequence number of the outstanding compile, if the latest request has one.
    loading: Option<u64>,
}

pub struct SessionManager {
    engine: Arc<dyn InferenceEngine>,
    retain_inactive: bool,
    inner: Mutex<Inner>,
}

impl SessionManager {
    pub fn new(engine: Arc<dyn InferenceEngine>, initial: Backend, retain_inactive: bool) -> Arc<Self> {
        Arc::new(Self {
            engine,
            retain_inactive,
            inner: Mutex::new(Inner {
                model: None,
                selected: initial,
                active: None,
                sessions: HashMap::new(),
                latest_seq: 0,
                loading: None,
            }),
        })
    }

    /// Replace the model bytes. Drops every session and supersedes any
    /// outstanding compile; nothing is recompiled until the next selection.
    pub fn load_model(&self, bytes: impl Into<Arc<[u8]>>) {
        let bytes = bytes.into();
        let mut inner = self.inner.lock();
        inner.latest_seq += 1;
        inner.loading = None;
        inner.active = None;
        inner.sessions.clear();
        info!(bytes = bytes.len(), seq = inner.latest_seq, "model loaded");
        inner.model = Some(bytes);
    }

    /// Fetch `uri` and load it.
    pub async fn load_model_from(&self, uri: &str) -> Result<()> {
        let bytes = fetch_model(uri).await?;
        self.load_model(bytes);
        Ok(())
    }

    /// Make `backend` the selected backend. Returns immediately; the returned
    /// task resolves once the session is active, superseded or failed.
    pub fn select_backend(self: &Arc<Self>, backend: Backend) -> CompileTask {
        let mut inner = self.inner.lock();
        inner.latest_seq += 1;
        let seq = inner.latest_seq;
        inner.selected = backend;
        inner.loading = None;

        let done = |outcome| CompileTask { seq, backend, state: TaskState::Done(outcome) };

        let Some(model) = inner.model.clone() else {
            debug!(%backend, seq, "backend selected without a model");
            return done(CompileOutcome::NoModel);
        };

        if inner.sessions.contains_key(&backend) {
            inner.active = Some(backend);
            self.prune(&mut inner);
            info!(%backend, seq, "session reused");
            return done(CompileOutcome::Reused);
        }

        inner.loading = Some(seq);
        drop(inner);

        info!(%backend, seq, "compiling session");
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.compile(seq, backend, model).await });
        CompileTask { seq, backend, state: TaskState::Running(handle) }
    }

    async fn compile(&self, seq: u64, backend: Backend, model: Arc<[u8]>) -> CompileOutcome {
        let engine = Arc::clone(&self.engine);
        let result = tokio::spawn(async move { engine.compile(model, backend).await })
            .await
            .map_err(|e| format!("compile task failed: {e}"))
            .and_then(|r| r.map_err(|e| format!("{e:#}")));

        let mut inner = self.inner.lock();
        if inner.latest_seq != seq {
            warn!(%backend, seq, latest = inner.latest_seq, "discarding superseded compile");
            return CompileOutcome::Superseded;
        }
        inner.loading = None;

        match result {
            Ok(compiled) => {
                inner.sessions.insert(backend, compiled);
                inner.active = Some(backend);
                self.prune(&mut inner);
                info!(%backend, seq, "session ready");
                CompileOutcome::Ready
            }
            Err(reason) => {
                warn!(%backend, seq, error = %reason, "session compile failed");
                CompileOutcome::Failed(reason)
            }
        }
    }

    fn prune(&self, inner: &mut Inner) {
        if !self.retain_inactive {
            let active = inner.active;
            inner.sessions.retain(|b, _| Some(*b) == active);
        }
    }

    /// True while the latest selection is still compiling.
    pub fn is_loading(&self) -> bool {
        self.inner.lock().loading.is_some()
    }

    pub fn active_backend(&self) -> Option<Backend> {
        self.inner.lock().active
    }

    pub fn status(&self) -> SessionStatus {
        let inner = self.inner.lock();
        SessionStatus {
            selected: inner.selected,
            active: inner.active,
            loading: inner.loading.is_some(),
            model_bytes: inner.model.as_ref().map(|m| m.len()),
            cached: Backend::ALL
                .into_iter()
                .filter(|b| inner.sessions.contains_key(b))
                .collect(),
        }
    }

    /// Drop every cached session except the active one. Returns how many
    /// were released.
    pub fn release_inactive(&self) -> usize {
        let mut inner = self.inner.lock();
        let active = inner.active;
        let before = inner.sessions.len();
        inner.sessions.retain(|b, _| Some(*b) == active);
        let released = before - inner.sessions.len();
        if released > 0 {
            info!(released, "inactive sessions released");
        }
        released
    }

    /// Run the active session on `input`.
    pub async fn infer(&self, input: Tensor) -> Result<InferenceOutput> {
        let compiled = {
            let inner = self.inner.lock();
            inner
                .active
                .and_then(|b| inner.sessions.get(&b))
                .map(Arc::clone)
                .ok_or(SplitError::NoSessionLoaded)?
        };
        let backend = compiled.backend();
        let started = Instant::now();

        let tensor = tokio::spawn(async move { compiled.run(input).await })
            .await
            .map_err(|e| SplitError::InferenceFailed(format!("engine task failed: {e}")))?
            .map_err(|e| SplitError::InferenceFailed(format!("{e:#}")))?;

        let elapsed = started.elapsed();
        debug!(%backend, ?elapsed, shape = ?tensor.shape(), "inference complete");
        Ok(InferenceOutput { tensor, elapsed, backend })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
