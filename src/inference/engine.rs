//! Inference engine implementation
//!
//! [`Engine`] is the object the surrounding application talks to. It owns the
//! stop words and load configuration, and forwards everything that touches
//! the model to a dedicated engine thread.
//!
//! # Architecture
//!
//! llama.cpp sessions are not `Send`, so the backend, the live session and
//! every generation run stay on one long-lived engine thread. The facade
//! sends it commands over a channel. Generated text, the run state and the
//! cancellation flag live in `Shared`, which both sides hold through an
//! `Arc`. Because runs execute on that single thread, two runs can never
//! overlap; starting a new one still cancels and waits for the current one.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use thiserror::Error;

use crate::inference::backend::{Backend, LoadParams, ModelSession, SessionInfo, TokenId};
use crate::inference::context::{ContextGauge, ContextWindow};
use crate::inference::model::ModelError;
use crate::inference::sampler::{SamplerParams, SamplerSettings};
use crate::inference::stop::StopMatcher;
use crate::inference::streaming::{StreamChannel, StreamEvent};
use crate::inference::worker::{self, GenerationOutcome, GenerationRequest, GenerationState};
use crate::storage::settings::EngineSettings;
use crate::types::message::ChatHistory;

/// Token budget used by [`Engine::start_generation_default`] until changed
pub const DEFAULT_MAX_TOKENS: u32 = 200;

/// Errors that can occur during inference operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("No model loaded")]
    NotLoaded,

    #[error("Generation in progress")]
    Busy,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Stop words must not be empty")]
    InvalidStopWord,

    #[error("Failed to initialize backend: {0}")]
    BackendInit(String),

    #[error("Model validation failed: {0}")]
    ModelValidation(String),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Failed to create context: {0}")]
    ContextCreate(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Evaluation failed: {0}")]
    Eval(String),

    #[error("Context window full: {needed} positions needed, capacity is {capacity}")]
    ContextFull { needed: usize, capacity: u32 },

    #[error("Sampling failed: {0}")]
    Sampling(String),

    #[error("Engine thread error: {0}")]
    Worker(String),
}

impl From<ModelError> for EngineError {
    fn from(e: ModelError) -> Self {
        EngineError::ModelValidation(e.to_string())
    }
}

/// Callback receiving [`StreamEvent`]s on the engine thread
///
/// A panicking listener is logged and otherwise ignored.
pub type Listener = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

#[derive(Debug)]
struct RunState {
    state: GenerationState,
    outcome: Option<GenerationOutcome>,
}

/// State visible to both the facade and the engine thread
pub(crate) struct Shared {
    run: Mutex<RunState>,
    run_finished: Condvar,
    generating: AtomicBool,
    cancel: AtomicBool,
    output: StreamChannel,
    gauge: Arc<ContextGauge>,
    pub(crate) sampler: SamplerSettings,
    listener: Mutex<Option<Listener>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            run: Mutex::new(RunState {
                state: GenerationState::Idle,
                outcome: None,
            }),
            run_finished: Condvar::new(),
            generating: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            output: StreamChannel::new(),
            gauge: Arc::new(ContextGauge::default()),
            sampler: SamplerSettings::default(),
            listener: Mutex::new(None),
        }
    }

    fn lock_run(&self) -> MutexGuard<'_, RunState> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listener(&self) -> Option<Listener> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Prompt evaluated; a pending cancellation keeps the run in `Stopping`.
    pub(crate) fn enter_generating(&self) {
        let mut run = self.lock_run();
        if run.state == GenerationState::Prompting {
            run.state = GenerationState::Generating;
        }
    }

    /// Hands a fragment to the poller and the listener.
    pub(crate) fn publish(&self, fragment: &str) {
        self.output.push(fragment);
        self.notify(&StreamEvent::Token(fragment.to_string()));
    }

    /// Calls the listener, containing any panic it raises.
    fn notify(&self, event: &StreamEvent) {
        let Some(listener) = self.listener() else {
            return;
        };
        if panic::catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
            tracing::warn!("Listener panicked while handling {:?}", event);
        }
    }

    fn begin_run(&self) {
        let mut run = self.lock_run();
        run.state = GenerationState::Prompting;
        run.outcome = None;
        self.cancel.store(false, Ordering::Release);
        self.generating.store(true, Ordering::Release);
    }

    fn finish_run(&self, outcome: GenerationOutcome) {
        let event = match &outcome {
            GenerationOutcome::Finished(reason) => StreamEvent::Done(reason.clone()),
            GenerationOutcome::Failed(e) => StreamEvent::Error(e.to_string()),
        };
        self.settle(outcome);
        self.notify(&event);
    }

    /// Records the outcome, returns to `Idle` and wakes every waiter.
    fn settle(&self, outcome: GenerationOutcome) {
        {
            let mut run = self.lock_run();
            run.state = GenerationState::Idle;
            run.outcome = Some(outcome);
            self.generating.store(false, Ordering::Release);
        }
        self.run_finished.notify_all();
    }

    /// Asks the active run to stop and blocks until it has.
    fn stop(&self) {
        {
            let mut run = self.lock_run();
            if run.state == GenerationState::Idle {
                return;
            }
            run.state = GenerationState::Stopping;
            self.cancel.store(true, Ordering::Release);
        }
        tracing::debug!("Cancellation requested");
        self.wait_idle();
    }

    fn wait_idle(&self) {
        let mut run = self.lock_run();
        while run.state != GenerationState::Idle {
            run = self
                .run_finished
                .wait(run)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn is_generating(&self) -> bool {
        self.generating.load(Ordering::Acquire)
    }
}

/// Vocabulary lookups answered even while a run is active
enum Query {
    Tokenize {
        text: String,
        reply: Sender<Result<Vec<TokenId>, EngineError>>,
    },
    Detokenize {
        tokens: Vec<TokenId>,
        reply: Sender<Result<String, EngineError>>,
    },
}

impl Query {
    fn answer(self, session: Option<&dyn ModelSession>) {
        match self {
            Query::Tokenize { text, reply } => {
                let result = session
                    .ok_or(EngineError::NotLoaded)
                    .and_then(|session| session.tokenize(&text));
                let _ = reply.send(result);
            }
            Query::Detokenize { tokens, reply } => {
                let result = session
                    .ok_or(EngineError::NotLoaded)
                    .and_then(|session| detokenize(session, &tokens));
                let _ = reply.send(result);
            }
        }
    }
}

/// Commands sent to the engine thread
enum Command {
    Load {
        params: LoadParams,
        reply: Sender<Result<SessionInfo, EngineError>>,
    },
    Unload {
        reply: Sender<()>,
    },
    Generate(GenerationRequest),
    Reset {
        reply: Sender<Result<(), EngineError>>,
    },
    Query(Query),
    Shutdown,
}

/// Stops the active run from any thread.
///
/// Obtained from [`Engine::cancel_handle`]; stays valid after the engine is
/// dropped, at which point it does nothing.
#[derive(Clone)]
pub struct CancelHandle {
    shared: Arc<Shared>,
}

impl CancelHandle {
    /// Same as [`Engine::stop_generation`]
    pub fn cancel(&self) {
        self.shared.stop();
    }

    pub fn is_generating(&self) -> bool {
        self.shared.is_generating()
    }
}

/// Single-session streaming text generation engine
///
/// Uses a dedicated engine thread for all model operations since the
/// underlying runtime types are not Send.
pub struct Engine {
    /// Channel to send commands to the engine thread
    command_tx: Sender<Command>,
    /// Handle to the engine thread
    worker_handle: Option<JoinHandle<()>>,
    shared: Arc<Shared>,
    /// Cached session info (set after a successful load)
    session: Option<SessionInfo>,
    gpu_layers: u32,
    offload_kqv: bool,
    threads: Option<u32>,
    stop_words: StopMatcher,
    max_tokens: u32,
}

impl Engine {
    /// Creates an engine driving `backend` and starts its engine thread.
    pub fn new(backend: impl Backend) -> Result<Self, EngineError> {
        let backend: Box<dyn Backend> = Box::new(backend);
        let backend_name = backend.name();
        let shared = Arc::new(Shared::new());
        let (command_tx, command_rx) = mpsc::channel::<Command>();

        let handle = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("llama-stream-engine".to_string())
                .spawn(move || engine_thread_main(backend, command_rx, shared))
                .map_err(|e| EngineError::Worker(e.to_string()))?
        };
        tracing::info!("Engine thread started ({} backend)", backend_name);

        Ok(Self {
            command_tx,
            worker_handle: Some(handle),
            shared,
            session: None,
            gpu_layers: 0,
            offload_kqv: true,
            threads: None,
            stop_words: StopMatcher::default(),
            max_tokens: DEFAULT_MAX_TOKENS,
        })
    }

    /// Creates an engine on the llama.cpp backend
    #[cfg(feature = "llama")]
    pub fn with_llama_cpp() -> Result<Self, EngineError> {
        Self::new(crate::inference::backend::LlamaCppBackend::new())
    }

    fn request<T>(&self, command: impl FnOnce(Sender<T>) -> Command) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.command_tx
            .send(command(reply_tx))
            .map_err(|e| EngineError::Worker(e.to_string()))?;
        reply_rx
            .recv()
            .map_err(|e| EngineError::Worker(e.to_string()))
    }

    /// Loads a model, replacing whatever session was active
    ///
    /// # Arguments
    /// * `path` - Path to the weight file
    /// * `context_size` - Context window capacity in tokens
    ///
    /// # Returns
    /// * `Ok(SessionInfo)` - Facts about the new session
    /// * `Err(EngineError)` - If the weights or the context could not be set
    ///   up; nothing is loaded afterwards
    pub fn load_model<P: AsRef<Path>>(
        &mut self,
        path: P,
        context_size: u32,
    ) -> Result<SessionInfo, EngineError> {
        self.stop_generation();

        let params = LoadParams {
            path: path.as_ref().to_path_buf(),
            context_size,
            gpu_layers: self.gpu_layers,
            offload_kqv: self.offload_kqv,
            threads: self.threads,
        };
        // The engine thread closes the old session before opening the new one
        self.session = None;

        let info = self.request(|reply| Command::Load { params, reply })??;
        self.session = Some(info.clone());
        Ok(info)
    }

    /// Unloads the current model. Does nothing when none is loaded.
    pub fn unload_model(&mut self) {
        self.stop_generation();
        if self.session.take().is_none() {
            return;
        }
        match self.request(|reply| Command::Unload { reply }) {
            Ok(()) => tracing::info!("Model unloaded"),
            Err(e) => tracing::warn!("Unload did not complete: {}", e),
        }
    }

    /// Returns true if a model is currently loaded
    pub fn is_model_loaded(&self) -> bool {
        self.session.is_some()
    }

    pub fn session_info(&self) -> Option<&SessionInfo> {
        self.session.as_ref()
    }

    /// Vocabulary size of the loaded model, 0 when nothing is loaded
    pub fn vocab_size(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.vocab_size)
    }

    /// Context capacity of the loaded model, 0 when nothing is loaded
    pub fn context_size(&self) -> u32 {
        self.session.as_ref().map_or(0, |s| s.context_size)
    }

    /// Layers to offload at the next load
    pub fn set_gpu_layers(&mut self, n: u32) {
        self.gpu_layers = n;
    }

    pub fn gpu_layers(&self) -> u32 {
        self.gpu_layers
    }

    /// K/Q/V placement at the next load
    pub fn set_offload_kqv(&mut self, offload: bool) {
        self.offload_kqv = offload;
    }

    pub fn offload_kqv(&self) -> bool {
        self.offload_kqv
    }

    /// Evaluation threads at the next load (`None` = all cores)
    pub fn set_threads(&mut self, threads: Option<u32>) {
        self.threads = threads.filter(|&t| t > 0);
    }

    pub fn set_temperature(&self, value: f32) {
        self.update_sampler(|p| p.temperature = value);
    }

    pub fn set_top_k(&self, value: u32) {
        self.update_sampler(|p| p.top_k = value);
    }

    pub fn set_top_p(&self, value: f32) {
        self.update_sampler(|p| p.top_p = value);
    }

    pub fn set_repeat_penalty(&self, value: f32) {
        self.update_sampler(|p| p.repeat_penalty = value);
    }

    pub fn set_presence_penalty(&self, value: f32) {
        self.update_sampler(|p| p.presence_penalty = value);
    }

    pub fn set_frequency_penalty(&self, value: f32) {
        self.update_sampler(|p| p.frequency_penalty = value);
    }

    /// Replaces every sampler parameter at once
    pub fn set_sampler_params(&self, params: SamplerParams) {
        self.update_sampler(|p| *p = params);
    }

    pub fn sampler_params(&self) -> SamplerParams {
        self.shared.sampler.snapshot().1
    }

    fn update_sampler(&self, apply: impl FnOnce(&mut SamplerParams)) {
        let params = self.shared.sampler.update(apply);
        tracing::debug!("Sampler parameters now {:?}", params);
    }

    /// Adds a stop phrase. Not allowed while generating.
    pub fn add_stop_word(&mut self, word: impl Into<String>) -> Result<(), EngineError> {
        if self.is_generating() {
            tracing::warn!("Rejected stop word change during generation");
            return Err(EngineError::Busy);
        }
        if !self.stop_words.push(word) {
            return Err(EngineError::InvalidStopWord);
        }
        Ok(())
    }

    /// Removes every stop phrase. Not allowed while generating.
    pub fn clear_stop_words(&mut self) -> Result<(), EngineError> {
        if self.is_generating() {
            tracing::warn!("Rejected stop word change during generation");
            return Err(EngineError::Busy);
        }
        self.stop_words.clear();
        Ok(())
    }

    pub fn stop_words(&self) -> &[String] {
        self.stop_words.phrases()
    }

    /// Token budget for [`Engine::start_generation_default`]
    pub fn set_max_tokens(&mut self, max_tokens: u32) {
        self.max_tokens = max_tokens.max(1);
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    /// Starts generating from `prompt` in the background
    ///
    /// Any active run is stopped first and waited for. Output is collected
    /// with [`Engine::drain_output`].
    ///
    /// # Arguments
    /// * `prompt` - The input prompt text
    /// * `max_tokens` - Upper bound on generated tokens (must be positive)
    pub fn start_generation(
        &mut self,
        prompt: impl Into<String>,
        max_tokens: u32,
    ) -> Result<(), EngineError> {
        let prompt = prompt.into();
        if self.session.is_none() {
            tracing::warn!("Generation requested with no model loaded");
            return Err(EngineError::NotLoaded);
        }
        if max_tokens == 0 {
            return Err(EngineError::InvalidRequest(
                "max_tokens must be positive".to_string(),
            ));
        }
        if prompt.is_empty() {
            return Err(EngineError::InvalidRequest("prompt is empty".to_string()));
        }

        self.stop_generation();

        let request = GenerationRequest::new(prompt, max_tokens, self.stop_words.clone());
        tracing::debug!("Queueing generation {}", request.id);
        self.shared.output.clear();
        self.shared.begin_run();

        if let Err(e) = self.command_tx.send(Command::Generate(request)) {
            let error = EngineError::Worker(e.to_string());
            self.shared
                .finish_run(GenerationOutcome::Failed(error.clone()));
            return Err(error);
        }
        Ok(())
    }

    /// [`Engine::start_generation`] with the stored token budget
    pub fn start_generation_default(&mut self, prompt: impl Into<String>) -> Result<(), EngineError> {
        self.start_generation(prompt, self.max_tokens)
    }

    /// Stops the active run and returns once it has ended.
    ///
    /// Text produced so far stays available to [`Engine::drain_output`].
    pub fn stop_generation(&self) {
        self.shared.stop();
    }

    /// Lock-free check for an active run
    pub fn is_generating(&self) -> bool {
        self.shared.is_generating()
    }

    pub fn state(&self) -> GenerationState {
        self.shared.lock_run().state
    }

    /// How the most recent run ended; `None` before the first run ends
    pub fn last_outcome(&self) -> Option<GenerationOutcome> {
        self.shared.lock_run().outcome.clone()
    }

    /// Blocks until no run is active.
    pub fn wait_until_idle(&self) {
        self.shared.wait_idle();
    }

    /// Takes all text generated since the previous call.
    pub fn drain_output(&self) -> String {
        self.shared.output.drain()
    }

    /// Fraction of the context window in use, in `[0, 1]`
    pub fn context_fill_ratio(&self) -> f32 {
        self.shared.gauge.fill_ratio()
    }

    pub fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, EngineError> {
        if self.session.is_none() {
            return Err(EngineError::NotLoaded);
        }
        let text = text.to_string();
        self.request(|reply| Command::Query(Query::Tokenize { text, reply }))?
    }

    pub fn detokenize(&self, tokens: &[TokenId]) -> Result<String, EngineError> {
        if self.session.is_none() {
            return Err(EngineError::NotLoaded);
        }
        let tokens = tokens.to_vec();
        self.request(|reply| Command::Query(Query::Detokenize { tokens, reply }))?
    }

    /// Clears the context window so the next prompt starts fresh.
    pub fn reset_context(&mut self) -> Result<(), EngineError> {
        if self.session.is_none() {
            return Err(EngineError::NotLoaded);
        }
        if self.is_generating() {
            return Err(EngineError::Busy);
        }
        self.request(|reply| Command::Reset { reply })?
    }

    /// Installs a callback for generated fragments and run completion.
    ///
    /// The callback runs on the engine thread and must not call blocking
    /// engine methods such as [`Engine::stop_generation`].
    pub fn set_listener<F>(&self, listener: F)
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        *self
            .shared
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(listener));
    }

    pub fn clear_listener(&self) {
        *self
            .shared
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Runs one generation to completion and returns its text.
    pub fn generate_blocking(
        &mut self,
        prompt: impl Into<String>,
        max_tokens: u32,
    ) -> Result<String, EngineError> {
        self.start_generation(prompt, max_tokens)?;
        self.wait_until_idle();
        let text = self.drain_output();
        match self.last_outcome() {
            Some(GenerationOutcome::Failed(e)) => Err(e),
            _ => Ok(text),
        }
    }

    /// Renders `history` into a prompt and generates the assistant's reply.
    pub fn generate_chat(
        &mut self,
        history: &ChatHistory,
        max_tokens: u32,
    ) -> Result<String, EngineError> {
        self.generate_blocking(history.render_prompt(), max_tokens)
    }

    /// Pushes persisted settings into the engine.
    ///
    /// Load options only take effect at the next [`Engine::load_model`].
    pub fn apply_settings(&mut self, settings: &EngineSettings) -> Result<(), EngineError> {
        if self.is_generating() {
            return Err(EngineError::Busy);
        }
        let mut settings = settings.clone();
        settings.validate();

        self.set_sampler_params(settings.sampler_params());
        self.gpu_layers = settings.gpu_layers;
        self.offload_kqv = settings.offload_kqv;
        self.set_threads(settings.threads);
        self.set_max_tokens(settings.max_tokens);
        self.stop_words = StopMatcher::new(settings.stop_words);
        tracing::debug!("Applied settings");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop_generation();
        let _ = self.command_tx.send(Command::Shutdown);
        // Wait for engine thread to release the session
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

fn detokenize(session: &dyn ModelSession, tokens: &[TokenId]) -> Result<String, EngineError> {
    let mut bytes = Vec::new();
    for &token in tokens {
        bytes.extend(session.token_to_bytes(token)?);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// The engine thread's view of the command channel
struct Inbox {
    commands: Receiver<Command>,
    /// Commands that arrived during a run, handled after it
    deferred: VecDeque<Command>,
}

impl Inbox {
    fn new(commands: Receiver<Command>) -> Self {
        Self {
            commands,
            deferred: VecDeque::new(),
        }
    }

    /// Next command to handle, or `None` once the facade is gone.
    fn next(&mut self) -> Option<Command> {
        match self.deferred.pop_front() {
            Some(command) => Some(command),
            None => self.commands.recv().ok(),
        }
    }

    /// Answers queued queries without blocking; defers everything else.
    fn serve_queries(&mut self, session: &dyn ModelSession) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Query(query) => query.answer(Some(session)),
                other => self.deferred.push_back(other),
            }
        }
    }
}

/// Fails the active run if the engine thread unwinds, so waiters wake up.
struct PanicGuard<'a> {
    shared: &'a Shared,
}

impl Drop for PanicGuard<'_> {
    fn drop(&mut self) {
        if !thread::panicking() {
            return;
        }
        tracing::error!("Engine thread panicked");
        if self.shared.lock_run().state != GenerationState::Idle {
            self.shared.settle(GenerationOutcome::Failed(EngineError::Worker(
                "engine thread panicked".to_string(),
            )));
        }
    }
}

/// Engine thread main loop
///
/// Owns the backend. Sessions are served by `run_session`, which returns
/// the command that ended them.
fn engine_thread_main(
    mut backend: Box<dyn Backend>,
    commands: Receiver<Command>,
    shared: Arc<Shared>,
) {
    let _guard = PanicGuard { shared: &shared };
    let mut inbox = Inbox::new(commands);
    let mut next = inbox.next();

    while let Some(command) = next.take() {
        match command {
            Command::Load { params, reply } => {
                next = run_session(backend.as_mut(), params, reply, &mut inbox, &shared);
                continue;
            }
            Command::Unload { reply } => {
                let _ = reply.send(());
            }
            Command::Generate(request) => {
                tracing::warn!("Generation {} dropped: no model loaded", request.id);
                shared.finish_run(GenerationOutcome::Failed(EngineError::NotLoaded));
            }
            Command::Reset { reply } => {
                let _ = reply.send(Err(EngineError::NotLoaded));
            }
            Command::Query(query) => query.answer(None),
            Command::Shutdown => {
                tracing::info!("Engine thread shutting down");
                return;
            }
        }
        next = inbox.next();
    }
    tracing::debug!("Command channel closed, engine thread exiting");
}

/// Opens a session and serves commands against it until one ends it.
fn run_session(
    backend: &mut dyn Backend,
    params: LoadParams,
    reply: Sender<Result<SessionInfo, EngineError>>,
    inbox: &mut Inbox,
    shared: &Shared,
) -> Option<Command> {
    tracing::info!(
        "Loading {} (context {}, {} gpu layers, {} backend)",
        params.path.display(),
        params.context_size,
        params.gpu_layers,
        backend.name()
    );

    let mut reply = Some(reply);
    let mut exit = None;
    let opened = backend.open(&params, &mut |session| {
        let window = ContextWindow::new(session.info().context_size, Arc::clone(&shared.gauge));
        if let Some(reply) = reply.take() {
            let _ = reply.send(Ok(session.info().clone()));
        }
        exit = serve_session(session, window, inbox, shared);
    });

    match opened {
        Ok(()) => tracing::info!("Session closed: {}", params.path.display()),
        Err(e) => {
            tracing::error!("Failed to load {}: {}", params.path.display(), e);
            if let Some(reply) = reply.take() {
                let _ = reply.send(Err(e));
            }
        }
    }
    exit
}

fn serve_session(
    session: &mut dyn ModelSession,
    mut window: ContextWindow,
    inbox: &mut Inbox,
    shared: &Shared,
) -> Option<Command> {
    loop {
        match inbox.next()? {
            Command::Generate(request) => {
                let outcome = worker::run(session, &mut window, &request, shared, &mut |s| {
                    inbox.serve_queries(s)
                });
                shared.finish_run(outcome);
            }
            Command::Reset { reply } => {
                session.clear_sequence();
                window.reset();
                tracing::debug!("Context reset");
                let _ = reply.send(Ok(()));
            }
            Command::Query(query) => query.answer(Some(&*session)),
            exit @ (Command::Load { .. } | Command::Unload { .. } | Command::Shutdown) => {
                return Some(exit);
            }
        }
    }
}
