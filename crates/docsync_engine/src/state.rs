//! Sync engine state machine.
//!
//! A run moves `Idle → Pulling → Pushing → Idle`. Any active state can move
//! to `Cancelling` on request; the run then stops at its next suspension
//! point and the engine returns to `Idle`. At most one run is active at a
//! time.

use crate::attachments::AttachmentSynchronizer;
use crate::cancel::CancelToken;
use crate::collector::LocalChangeCollector;
use crate::config::SyncConfig;
use crate::dispatcher::{PushSummary, UploadDispatcher};
use crate::error::{SyncError, SyncResult};
use crate::events::EventPublisher;
use crate::fetcher::{PullSummary, RemoteChangeFetcher};
use crate::store::LocalStore;
use crate::transport::SyncTransport;
use docsync_protocol::AttachmentRef;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// The current state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Engine is idle, not syncing.
    Idle,
    /// Engine is pulling changes from the backend.
    Pulling,
    /// Engine is pushing changes to the backend.
    Pushing,
    /// A cancel was requested and the run is winding down.
    Cancelling,
}

impl SyncState {
    /// Returns true if a run is in progress.
    pub fn is_active(&self) -> bool {
        !matches!(self, SyncState::Idle)
    }

    /// Returns true if the engine can start a new sync.
    pub fn can_start_sync(&self) -> bool {
        matches!(self, SyncState::Idle)
    }

    /// Returns the state name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Pulling => "pulling",
            SyncState::Pushing => "pushing",
            SyncState::Cancelling => "cancelling",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Total number of sync cycles completed.
    pub cycles_completed: u64,
    /// Total number of sync cycles that failed or were cancelled.
    pub cycles_failed: u64,
    /// Remote changes applied locally.
    pub documents_pulled: u64,
    /// Local changes accepted by the backend.
    pub documents_pushed: u64,
    /// Local changes rejected by the backend.
    pub documents_rejected: u64,
    /// Local changes that failed and stayed dirty.
    pub documents_errored: u64,
    /// Local edits overwritten by remote changes.
    pub local_edits_discarded: u64,
    /// Last successful sync time.
    pub last_sync_time: Option<Instant>,
    /// Duration of the last successful run.
    pub last_duration: Option<Duration>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Coarse result of a run, as reported to completion handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncResultKind {
    /// At least one remote change was applied or local change accepted.
    NewData,
    /// Both phases completed with nothing to do.
    NoData,
    /// The run failed or was cancelled.
    Failed,
}

/// Result of a successful sync cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncCycleResult {
    /// Pull phase counters.
    pub pull: PullSummary,
    /// Push phase counters.
    pub push: PushSummary,
    /// Attachment uploads requested by the push phase.
    pub uploads_requested: u64,
    /// Duration of the sync cycle.
    pub duration: Duration,
}

impl SyncCycleResult {
    /// Returns true if the run changed anything.
    pub fn has_new_data(&self) -> bool {
        self.pull.applied > 0 || self.push.accepted > 0
    }

    /// Returns the coarse result.
    pub fn kind(&self) -> SyncResultKind {
        if self.has_new_data() {
            SyncResultKind::NewData
        } else {
            SyncResultKind::NoData
        }
    }
}

/// Terminal outcome of a run.
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    /// The run finished both phases.
    Completed(SyncCycleResult),
    /// The run failed or was cancelled.
    Failed(SyncError),
}

impl SyncOutcome {
    /// Returns the coarse result.
    pub fn kind(&self) -> SyncResultKind {
        match self {
            SyncOutcome::Completed(result) => result.kind(),
            SyncOutcome::Failed(_) => SyncResultKind::Failed,
        }
    }

    /// Returns true for completed runs.
    pub fn is_success(&self) -> bool {
        matches!(self, SyncOutcome::Completed(_))
    }

    /// Returns the cycle result of a completed run.
    pub fn result(&self) -> Option<&SyncCycleResult> {
        match self {
            SyncOutcome::Completed(result) => Some(result),
            SyncOutcome::Failed(_) => None,
        }
    }

    /// Returns the error of a failed run.
    pub fn error(&self) -> Option<&SyncError> {
        match self {
            SyncOutcome::Completed(_) => None,
            SyncOutcome::Failed(err) => Some(err),
        }
    }
}

/// Receives the outcome of every run started with
/// [`SyncEngine::synchronize`] or [`SyncEngine::start`].
pub trait SyncListener: Send + Sync {
    /// Called once per run.
    fn on_outcome(&self, outcome: &SyncOutcome);
}

impl<F> SyncListener for F
where
    F: Fn(&SyncOutcome) + Send + Sync,
{
    fn on_outcome(&self, outcome: &SyncOutcome) {
        self(outcome)
    }
}

/// Resolves to the outcome of a started run.
#[derive(Debug)]
pub struct SyncTicket {
    rx: oneshot::Receiver<SyncOutcome>,
}

impl SyncTicket {
    /// Waits for the run to finish.
    pub async fn wait(self) -> SyncOutcome {
        self.rx
            .await
            .unwrap_or(SyncOutcome::Failed(SyncError::Closed))
    }
}

type CompletionHandler = Box<dyn FnOnce(SyncResultKind) + Send>;

enum Completion {
    Listener,
    Handler(CompletionHandler),
}

struct EngineInner<T: SyncTransport + 'static, S: LocalStore + 'static> {
    config: SyncConfig,
    transport: Arc<T>,
    store: Arc<S>,
    events: EventPublisher,
    attachments: AttachmentSynchronizer<T, S>,
    state: Mutex<SyncState>,
    run_token: Mutex<Option<CancelToken>>,
    listener: RwLock<Option<Arc<dyn SyncListener>>>,
    stats: RwLock<SyncStats>,
    closed: AtomicBool,
    runtime: Handle,
}

/// The sync engine manages synchronization with a remote backend.
///
/// Cloning the engine yields another handle to the same instance.
pub struct SyncEngine<T: SyncTransport + 'static, S: LocalStore + 'static> {
    inner: Arc<EngineInner<T, S>>,
}

impl<T: SyncTransport + 'static, S: LocalStore + 'static> Clone for SyncEngine<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: SyncTransport + 'static, S: LocalStore + 'static> SyncEngine<T, S> {
    /// Creates a new sync engine on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NoRuntime`] when called outside a runtime.
    pub fn new(config: SyncConfig, transport: T, store: Arc<S>) -> SyncResult<Self> {
        let runtime = Handle::try_current().map_err(|_| SyncError::NoRuntime)?;
        Ok(Self::with_runtime(config, transport, store, runtime))
    }

    /// Creates a new sync engine that runs its work on `runtime`.
    pub fn with_runtime(config: SyncConfig, transport: T, store: Arc<S>, runtime: Handle) -> Self {
        let transport = Arc::new(transport);
        let events = EventPublisher::new();
        let attachments = AttachmentSynchronizer::new(
            &config,
            Arc::clone(&transport),
            Arc::clone(&store),
            events.clone(),
            runtime.clone(),
        );
        Self {
            inner: Arc::new(EngineInner {
                config,
                transport,
                store,
                events,
                attachments,
                state: Mutex::new(SyncState::Idle),
                run_token: Mutex::new(None),
                listener: RwLock::new(None),
                stats: RwLock::new(SyncStats::default()),
                closed: AtomicBool::new(false),
                runtime,
            }),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Returns the event publisher.
    pub fn events(&self) -> &EventPublisher {
        &self.inner.events
    }

    /// Returns the attachment synchronizer.
    pub fn attachments(&self) -> &AttachmentSynchronizer<T, S> {
        &self.inner.attachments
    }

    /// Returns the local store.
    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    /// Returns the transport.
    pub fn transport(&self) -> &Arc<T> {
        &self.inner.transport
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.inner.state.lock()
    }

    /// Returns true while a run is in progress.
    pub fn is_running(&self) -> bool {
        self.state().is_active()
    }

    /// Returns true once [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.inner.stats.read().clone()
    }

    /// Sets the listener notified after runs started without a handler.
    pub fn set_listener(&self, listener: impl SyncListener + 'static) {
        *self.inner.listener.write() = Some(Arc::new(listener));
    }

    /// Removes the listener.
    pub fn clear_listener(&self) {
        *self.inner.listener.write() = None;
    }

    /// Starts a run and reports its outcome to the listener.
    ///
    /// # Errors
    ///
    /// Fails without side effects if a run is already active or the engine
    /// is closed.
    pub fn synchronize(&self) -> SyncResult<()> {
        self.start().map(|_| ())
    }

    /// Starts a run and returns a ticket resolving to its outcome.
    ///
    /// The listener is notified as well.
    pub fn start(&self) -> SyncResult<SyncTicket> {
        let token = self.begin()?;
        Ok(self.spawn_run(token, Completion::Listener))
    }

    /// Starts a run and calls `on_complete` exactly once with its result.
    ///
    /// The listener is not notified for this run. If the run cannot start,
    /// `on_complete` is called right away with [`SyncResultKind::Failed`].
    pub fn synchronize_with<F>(&self, on_complete: F)
    where
        F: FnOnce(SyncResultKind) + Send + 'static,
    {
        match self.begin() {
            Ok(token) => {
                self.spawn_run(token, Completion::Handler(Box::new(on_complete)));
            }
            Err(err) => {
                debug!(error = %err, "synchronization not started");
                on_complete(SyncResultKind::Failed);
            }
        }
    }

    /// Requests cancellation of the active run.
    ///
    /// Succeeds without effect when no run is active. Attachment transfers
    /// are not affected.
    pub fn cancel(&self) -> SyncResult<()> {
        if self.is_closed() {
            return Err(SyncError::Closed);
        }
        let mut state = self.inner.state.lock();
        match *state {
            SyncState::Idle | SyncState::Cancelling => Ok(()),
            SyncState::Pulling | SyncState::Pushing => {
                info!(from = %*state, "cancelling synchronization");
                *state = SyncState::Cancelling;
                if let Some(token) = self.inner.run_token.lock().as_ref() {
                    token.cancel();
                }
                Ok(())
            }
        }
    }

    /// Queues an upload for a locally changed attachment.
    pub fn notify_attachment_changed(&self, key: AttachmentRef) -> SyncResult<()> {
        if self.is_closed() {
            return Err(SyncError::Closed);
        }
        self.inner.attachments.upload(key).map(|_| ())
    }

    /// Tears the engine down.
    ///
    /// Cancels the active run and every attachment transfer, drops
    /// subscribers and the listener, and closes the transport. Every later
    /// operation fails with [`SyncError::Closed`].
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.inner.state.lock();
            if state.is_active() {
                *state = SyncState::Cancelling;
            }
            if let Some(token) = self.inner.run_token.lock().as_ref() {
                token.cancel();
            }
        }
        self.inner.attachments.shutdown();
        self.inner.events.clear();
        *self.inner.listener.write() = None;
        if let Err(err) = self.inner.transport.close() {
            warn!(error = %err, "transport did not close cleanly");
        }
        info!(solution = %self.inner.config.solution, "sync engine closed");
    }

    /// Claims the single run slot.
    fn begin(&self) -> SyncResult<CancelToken> {
        let mut state = self.inner.state.lock();
        if self.is_closed() {
            return Err(SyncError::Closed);
        }
        if !state.can_start_sync() {
            return Err(SyncError::AlreadyRunning);
        }
        *state = SyncState::Pulling;
        let token = CancelToken::new();
        *self.inner.run_token.lock() = Some(token.clone());
        Ok(token)
    }

    fn spawn_run(&self, token: CancelToken, completion: Completion) -> SyncTicket {
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            let started = Instant::now();
            info!(solution = %inner.config.solution, "synchronization started");

            // The cycle runs in its own task so a panic surfaces as a join
            // error instead of leaving the engine stuck in an active state.
            let cycle = {
                let inner = Arc::clone(&inner);
                let token = token.clone();
                let runtime = inner.runtime.clone();
                runtime.spawn(async move { inner.run_cycle(&token).await })
            };
            let outcome = match cycle.await {
                Ok(Ok(mut result)) => {
                    result.duration = started.elapsed();
                    SyncOutcome::Completed(result)
                }
                Ok(Err(err)) => SyncOutcome::Failed(err),
                Err(join) => {
                    error!(error = %join, "synchronization task aborted");
                    SyncOutcome::Failed(SyncError::Aborted(join.to_string()))
                }
            };
            inner.finish(&outcome);

            let notified = match completion {
                Completion::Listener => {
                    let listener = inner.listener.read().clone();
                    listener.map_or(Ok(()), |listener| {
                        panic::catch_unwind(AssertUnwindSafe(|| listener.on_outcome(&outcome)))
                    })
                }
                Completion::Handler(handler) => {
                    let kind = outcome.kind();
                    panic::catch_unwind(AssertUnwindSafe(move || handler(kind)))
                }
            };
            if notified.is_err() {
                error!("sync completion callback panicked");
            }
            // The ticket may have been dropped.
            let _ = tx.send(outcome);
        });
        SyncTicket { rx }
    }
}

impl<T: SyncTransport + 'static, S: LocalStore + 'static> EngineInner<T, S> {
    async fn run_cycle(&self, token: &CancelToken) -> SyncResult<SyncCycleResult> {
        let pull = RemoteChangeFetcher::new(
            &self.config,
            &*self.transport,
            &*self.store,
            &self.events,
            &self.attachments,
        )
        .fetch(token)
        .await?;

        if let Err(err) = self.attachments.reconcile_orphans() {
            warn!(error = %err, "orphaned attachments not reconciled");
        }
        self.enter_push()?;

        let collected = LocalChangeCollector::new(&*self.store).collect()?;
        let push = UploadDispatcher::new(&self.config, &*self.transport, &*self.store, &self.events)
            .dispatch(collected.documents, token)
            .await?;

        let mut uploads_requested = 0;
        for key in collected.attachments {
            match self.attachments.upload(key) {
                Ok(_) => uploads_requested += 1,
                Err(err) => debug!(error = %err, "attachment upload not queued"),
            }
        }
        if let Err(err) = self.attachments.resume_downloads() {
            warn!(error = %err, "pending downloads not resumed");
        }

        Ok(SyncCycleResult {
            pull,
            push,
            uploads_requested,
            duration: Duration::ZERO,
        })
    }

    /// Moves from pulling to pushing unless a cancel arrived in between.
    fn enter_push(&self) -> SyncResult<()> {
        let mut state = self.state.lock();
        match *state {
            SyncState::Pulling => {
                *state = SyncState::Pushing;
                Ok(())
            }
            SyncState::Cancelling => Err(SyncError::Cancelled),
            other => Err(SyncError::InvalidState {
                state: other.to_string(),
                operation: "push".into(),
            }),
        }
    }

    fn finish(&self, outcome: &SyncOutcome) {
        {
            let mut stats = self.stats.write();
            match outcome {
                SyncOutcome::Completed(result) => {
                    stats.cycles_completed += 1;
                    stats.documents_pulled += result.pull.applied;
                    stats.documents_pushed += result.push.accepted;
                    stats.documents_rejected += result.push.rejected;
                    stats.documents_errored += result.push.errored;
                    stats.local_edits_discarded += result.pull.discarded_local_edits;
                    stats.last_sync_time = Some(Instant::now());
                    stats.last_duration = Some(result.duration);
                    stats.last_error = None;
                }
                SyncOutcome::Failed(err) => {
                    stats.cycles_failed += 1;
                    stats.last_error = Some(err.to_string());
                }
            }
        }

        match outcome {
            SyncOutcome::Completed(result) => info!(
                pulled = result.pull.applied,
                accepted = result.push.accepted,
                rejected = result.push.rejected,
                duration_ms = result.duration.as_millis() as u64,
                "synchronization finished"
            ),
            SyncOutcome::Failed(err) if err.is_gone() => {
                warn!("synchronization failed: access token is no longer valid")
            }
            SyncOutcome::Failed(err) => warn!(error = %err, "synchronization failed"),
        }

        let mut state = self.state.lock();
        *self.run_token.lock() = None;
        *state = SyncState::Idle;
    }
}

impl<T: SyncTransport + 'static, S: LocalStore + 'static> fmt::Debug for SyncEngine<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngine")
            .field("solution", &self.inner.config.solution)
            .field("state", &self.state())
            .field("closed", &self.is_closed())
            .finish()
    }
}
