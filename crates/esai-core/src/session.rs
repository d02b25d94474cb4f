use esai_engine::{EngineError, EngineOptions, ExecutionError, PythonEngine, ScriptEngine};
use log::{info, warn};
use std::sync::{Arc, OnceLock, PoisonError};
use std::thread;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc, oneshot};

pub type EngineFactory =
    Arc<dyn Fn() -> Result<Box<dyn ScriptEngine>, EngineError> + Send + Sync>;

static GLOBAL_SESSION: OnceLock<Arc<ExecutionSession>> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
}

/// What to do with a run request while another run holds the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusyPolicy {
    #[default]
    Reject,
    Queue,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("interpreter failed to initialize: {0}")]
    Initialization(String),
    #[error("another run is still in progress")]
    Busy,
    #[error("interpreter worker stopped unexpectedly")]
    WorkerGone,
    #[error("output capture failed: {0}")]
    Capture(String),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

impl From<EngineError> for SessionError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Bootstrap(message) => Self::Initialization(message),
            EngineError::Execution(err) => Self::Execution(err),
            EngineError::Capture(message) => Self::Capture(message),
        }
    }
}

/// Output drained after one bracketed execution, plus the script failure if
/// it raised. Partial output is kept either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Captured {
    pub output: String,
    pub error: Option<ExecutionError>,
}

/// Proof that the caller holds the session gate.
#[derive(Debug)]
pub struct RunPermit {
    _guard: OwnedMutexGuard<()>,
}

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

enum Command {
    Rebind {
        reply: Reply<()>,
    },
    Run {
        source: String,
        name: String,
        reply: Reply<()>,
    },
    Drain {
        reply: Reply<String>,
    },
    RunCaptured {
        source: String,
        name: String,
        reply: Reply<Captured>,
    },
}

type SharedState = Arc<std::sync::Mutex<SessionState>>;

fn store_state(state: &SharedState, value: SessionState) {
    *state.lock().unwrap_or_else(PoisonError::into_inner) = value;
}

#[derive(Debug, Clone)]
pub struct SessionHandle {
    sender: mpsc::UnboundedSender<Command>,
    state: SharedState,
}

impl SessionHandle {
    fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    fn worker_gone(&self) -> SessionError {
        warn!("interpreter worker stopped; session is uninitialized");
        store_state(&self.state, SessionState::Uninitialized);
        SessionError::WorkerGone
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(build(reply))
            .map_err(|_| self.worker_gone())?;
        response
            .await
            .map_err(|_| self.worker_gone())?
            .map_err(SessionError::from)
    }

    /// Points the interpreter's stdout and stderr at a fresh buffer.
    pub async fn rebind(&self, _permit: &RunPermit) -> Result<(), SessionError> {
        self.request(|reply| Command::Rebind { reply }).await
    }

    pub async fn run(&self, _permit: &RunPermit, source: &str, name: &str) -> Result<(), SessionError> {
        self.request(|reply| Command::Run {
            source: source.to_string(),
            name: name.to_string(),
            reply,
        })
        .await
    }

    /// Reads and clears the capture buffer.
    pub async fn drain(&self, _permit: &RunPermit) -> Result<String, SessionError> {
        self.request(|reply| Command::Drain { reply }).await
    }

    /// Rebind, run and drain as a single worker command.
    pub async fn run_captured(
        &self,
        _permit: &RunPermit,
        source: &str,
        name: &str,
    ) -> Result<Captured, SessionError> {
        self.request(|reply| Command::RunCaptured {
            source: source.to_string(),
            name: name.to_string(),
            reply,
        })
        .await
    }
}

/// Process-wide handle to the embedded interpreter.
///
/// The interpreter lives on its own thread and is bootstrapped on the first
/// `ensure_ready`. Callers waiting while a bootstrap is in flight share it.
/// A failed bootstrap leaves the session uninitialized so a later request can
/// retry. There is no teardown.
pub struct ExecutionSession {
    factory: EngineFactory,
    handle: Mutex<Option<SessionHandle>>,
    state: SharedState,
    gate: Arc<Mutex<()>>,
}

impl ExecutionSession {
    pub fn new(factory: EngineFactory) -> Self {
        Self {
            factory,
            handle: Mutex::new(None),
            state: Arc::new(std::sync::Mutex::new(SessionState::Uninitialized)),
            gate: Arc::new(Mutex::new(())),
        }
    }

    pub fn python(options: EngineOptions) -> Self {
        Self::new(python_factory(options))
    }

    /// The shared session. Options only apply to the first call.
    pub fn install_global(options: EngineOptions) -> Arc<Self> {
        Arc::clone(GLOBAL_SESSION.get_or_init(|| Arc::new(Self::python(options))))
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SessionState) {
        store_state(&self.state, state);
    }

    pub fn is_busy(&self) -> bool {
        self.gate.try_lock().is_err()
    }

    pub async fn acquire(&self, policy: BusyPolicy) -> Result<RunPermit, SessionError> {
        let gate = Arc::clone(&self.gate);
        let guard = match policy {
            BusyPolicy::Reject => gate.try_lock_owned().map_err(|_| {
                warn!("rejecting run request: session busy");
                SessionError::Busy
            })?,
            BusyPolicy::Queue => gate.lock_owned().await,
        };
        Ok(RunPermit { _guard: guard })
    }

    pub async fn ensure_ready(&self) -> Result<SessionHandle, SessionError> {
        let mut slot = self.handle.lock().await;
        if let Some(handle) = slot.as_ref()
            && !handle.is_closed()
        {
            // A stale handle may have reported its worker gone after a restart.
            self.set_state(SessionState::Ready);
            return Ok(handle.clone());
        }
        if slot.take().is_some() {
            warn!("interpreter worker is gone; bootstrapping a new one");
        }

        self.set_state(SessionState::Initializing);
        info!("bootstrapping interpreter session");
        match self.bootstrap().await {
            Ok(handle) => {
                *slot = Some(handle.clone());
                self.set_state(SessionState::Ready);
                info!("interpreter session ready");
                Ok(handle)
            }
            Err(err) => {
                self.set_state(SessionState::Uninitialized);
                warn!("interpreter bootstrap failed: {err}");
                Err(err)
            }
        }
    }

    async fn bootstrap(&self) -> Result<SessionHandle, SessionError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let factory = Arc::clone(&self.factory);

        thread::Builder::new()
            .name("esai-interpreter".to_string())
            .spawn(move || worker_main(factory, receiver, ready_tx))
            .map_err(|err| {
                SessionError::Initialization(format!("failed spawning interpreter thread: {err}"))
            })?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(SessionHandle {
                sender,
                state: Arc::clone(&self.state),
            }),
            Ok(Err(err)) => Err(match err {
                EngineError::Bootstrap(message) => SessionError::Initialization(message),
                other => SessionError::Initialization(other.to_string()),
            }),
            Err(_) => Err(SessionError::Initialization(
                "interpreter thread exited during bootstrap".to_string(),
            )),
        }
    }
}

pub fn python_factory(options: EngineOptions) -> EngineFactory {
    Arc::new(move || {
        PythonEngine::new(&options).map(|engine| Box::new(engine) as Box<dyn ScriptEngine>)
    })
}

fn worker_main(
    factory: EngineFactory,
    mut receiver: mpsc::UnboundedReceiver<Command>,
    ready_tx: oneshot::Sender<Result<(), EngineError>>,
) {
    let mut engine = match factory() {
        Ok(engine) => engine,
        Err(err) => {
            let _ = ready_tx.send(Err(err));
            return;
        }
    };
    if ready_tx.send(Ok(())).is_err() {
        return;
    }

    while let Some(command) = receiver.blocking_recv() {
        let engine = engine.as_mut();
        match command {
            Command::Rebind { reply } => {
                let _ = reply.send(engine.rebind_output());
            }
            Command::Run {
                source,
                name,
                reply,
            } => {
                let _ = reply.send(engine.execute(&source, &name));
            }
            Command::Drain { reply } => {
                let _ = reply.send(engine.drain_output());
            }
            Command::RunCaptured {
                source,
                name,
                reply,
            } => {
                let _ = reply.send(run_captured(engine, &source, &name));
            }
        }
    }
}

fn run_captured(
    engine: &mut dyn ScriptEngine,
    source: &str,
    name: &str,
) -> Result<Captured, EngineError> {
    engine.rebind_output()?;
    let error = match engine.execute(source, name) {
        Ok(()) => None,
        Err(EngineError::Execution(err)) => Some(err),
        Err(other) => return Err(other),
    };
    let output = engine.drain_output()?;
    Ok(Captured { output, error })
}
