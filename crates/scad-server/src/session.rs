use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use scad_ai::GenerationError;
use scad_compiler::{CompileError, CompiledMesh};
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use uuid::Uuid;

pub const DEFAULT_HISTORY_LIMIT: usize = 32;
pub const DEFAULT_MAX_SESSIONS: usize = 256;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Bounds on what the server keeps per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// Finished requests kept per session.
    pub history: usize,
    /// Live sessions; creating one more evicts the least recently active.
    pub max_sessions: usize,
    /// Sessions untouched for this long are reaped.
    pub idle_timeout: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            history: DEFAULT_HISTORY_LIMIT,
            max_sessions: DEFAULT_MAX_SESSIONS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Lifecycle of a single prompt submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Idle,
    Generating,
    Generated,
    Compiling,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal request transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: RequestState,
    pub to: RequestState,
}

impl RequestState {
    pub fn advance(self, to: RequestState) -> Result<RequestState, InvalidTransition> {
        use RequestState::*;

        match (self, to) {
            (Idle, Generating)
            | (Generating, Generated)
            | (Generating, Failed)
            | (Generated, Compiling)
            | (Compiling, Ready)
            | (Compiling, Failed) => Ok(to),
            (from, to) => Err(InvalidTransition { from, to }),
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RequestState::Idle => "idle",
            RequestState::Generating => "generating",
            RequestState::Generated => "generated",
            RequestState::Compiling => "compiling",
            RequestState::Ready => "ready",
            RequestState::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Generation,
    Compilation,
}

/// What the user is shown when a request does not reach `Ready`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub stage: FailureStage,
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

impl From<&GenerationError> for Failure {
    fn from(err: &GenerationError) -> Self {
        Self {
            stage: FailureStage::Generation,
            kind: err.kind(),
            message: err.to_string(),
            exit_code: None,
            stdout: None,
            stderr: None,
        }
    }
}

impl From<&CompileError> for Failure {
    fn from(err: &CompileError) -> Self {
        let exit_code = match err {
            CompileError::CompilerFailure { exit_code, .. } => *exit_code,
            _ => None,
        };
        let (stdout, stderr) = err
            .streams()
            .map(|(stdout, stderr)| (stdout.to_string(), stderr.to_string()))
            .unzip();
        Self {
            stage: FailureStage::Compilation,
            kind: err.kind(),
            message: err.to_string(),
            exit_code,
            stdout,
            stderr,
        }
    }
}

#[derive(Debug)]
pub struct RequestRecord {
    pub id: Uuid,
    pub prompt: String,
    pub state: RequestState,
    pub script: Option<String>,
    pub mesh: Option<CompiledMesh>,
    pub failure: Option<Failure>,
    pub submitted_at: u64,
    pub generation_ms: Option<f64>,
    pub compile_ms: Option<f64>,
}

impl RequestRecord {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            prompt: prompt.into(),
            state: RequestState::Idle,
            script: None,
            mesh: None,
            failure: None,
            submitted_at: unix_millis(),
            generation_ms: None,
            compile_ms: None,
        }
    }

    pub fn transition(&mut self, to: RequestState) -> Result<(), InvalidTransition> {
        self.state = self.state.advance(to)?;
        tracing::debug!(request = %self.id, state = %self.state, "request state changed");
        Ok(())
    }

    /// The mesh, only once the request is `Ready`.
    pub fn ready_mesh(&self) -> Option<&CompiledMesh> {
        match self.state {
            RequestState::Ready => self.mesh.as_ref(),
            _ => None,
        }
    }

    async fn discard(&self) {
        if let Some(mesh) = &self.mesh
            && let Err(err) = mesh.discard().await
        {
            tracing::warn!(request = %self.id, "failed to remove mesh: {err}");
        }
    }
}

/// One browser session. Submissions are serialized through `pipeline`;
/// finished requests land in `history`, oldest evicted first.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    pipeline: Mutex<()>,
    history: RwLock<VecDeque<RequestRecord>>,
    limit: usize,
    created: Instant,
    /// Milliseconds after `created` of the last use.
    last_active: AtomicU64,
}

impl Session {
    fn new(limit: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline: Mutex::new(()),
            history: RwLock::new(VecDeque::new()),
            limit: limit.max(1),
            created: Instant::now(),
            last_active: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn touch(&self) {
        let now = self.created.elapsed().as_millis() as u64;
        self.last_active.fetch_max(now, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_active.load(Ordering::Relaxed));
        self.created.elapsed().saturating_sub(last)
    }

    /// True while a submission holds the pipeline.
    pub fn is_busy(&self) -> bool {
        self.pipeline.try_lock().is_err()
    }

    pub async fn begin_request(&self) -> MutexGuard<'_, ()> {
        self.touch();
        self.pipeline.lock().await
    }

    pub async fn push(&self, record: RequestRecord) {
        let evicted = {
            let mut history = self.history.write().await;
            history.push_back(record);
            let excess = history.len().saturating_sub(self.limit);
            history.drain(..excess).collect::<Vec<_>>()
        };
        self.touch();

        for record in evicted {
            tracing::debug!(session = %self.id, request = %record.id, "evicting request from history");
            record.discard().await;
        }
    }

    pub async fn read<T>(&self, f: impl FnOnce(&VecDeque<RequestRecord>) -> T) -> T {
        let history = self.history.read().await;
        f(&history)
    }

    /// Empties the history and removes every mesh it held.
    pub async fn discard_all(&self) {
        let records = std::mem::take(&mut *self.history.write().await);
        for record in records {
            record.discard().await;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let meshes: Vec<CompiledMesh> = self
            .history
            .get_mut()
            .drain(..)
            .filter_map(|record| record.mesh)
            .collect();
        if meshes.is_empty() {
            return;
        }

        let remove = move || {
            for mesh in meshes {
                if let Err(err) = mesh.discard_blocking() {
                    tracing::warn!(mesh = %mesh.id, "failed to remove mesh: {err}");
                }
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(remove);
            }
            Err(_) => remove(),
        }
    }
}

#[derive(Debug)]
pub struct SessionStore {
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
    limits: SessionLimits,
}

impl SessionStore {
    pub fn new(limits: SessionLimits) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            limits: SessionLimits {
                max_sessions: limits.max_sessions.max(1),
                ..limits
            },
        }
    }

    /// Starts a session. At the cap, the least recently active session is
    /// ended first.
    pub async fn create(&self) -> Arc<Session> {
        let session = Arc::new(Session::new(self.limits.history));
        let evicted = {
            let mut sessions = self.sessions.write().await;
            let oldest = sessions
                .values()
                .max_by_key(|candidate| candidate.idle_for())
                .map(|candidate| candidate.id())
                .filter(|_| sessions.len() >= self.limits.max_sessions);
            let evicted = oldest.and_then(|id| sessions.remove(&id));
            sessions.insert(session.id(), Arc::clone(&session));
            evicted
        };
        tracing::info!(session = %session.id(), "session started");

        if let Some(evicted) = evicted {
            tracing::info!(session = %evicted.id(), "session evicted at capacity");
            evicted.discard_all().await;
        }
        session
    }

    pub async fn get(&self, id: Uuid) -> Option<Arc<Session>> {
        let session = self.sessions.read().await.get(&id).cloned();
        if let Some(session) = &session {
            session.touch();
        }
        session
    }

    /// Forgets the session and removes its meshes. A request still running
    /// in it keeps its own mesh until the last handle is dropped.
    pub async fn remove(&self, id: Uuid) -> bool {
        let removed = self.sessions.write().await.remove(&id);
        match removed {
            Some(session) => {
                tracing::info!(session = %id, "session ended");
                session.discard_all().await;
                true
            }
            None => false,
        }
    }

    /// Ends every session idle for longer than the configured timeout.
    /// Sessions with a submission in flight are left alone.
    pub async fn reap_idle(&self) -> usize {
        let idle_timeout = self.limits.idle_timeout;
        let expired: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            let ids: Vec<Uuid> = sessions
                .values()
                .filter(|session| session.idle_for() > idle_timeout && !session.is_busy())
                .map(|session| session.id())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        for session in &expired {
            tracing::info!(session = %session.id(), idle = ?session.idle_for(), "session expired");
            session.discard_all().await;
        }
        expired.len()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
