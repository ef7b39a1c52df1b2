use std::sync::{
    Arc, Mutex as StdMutex, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use hashbrown::HashSet;
use serde_json::Value;
use tokio::{
    sync::{Mutex, Semaphore, broadcast, mpsc, oneshot, watch},
    task::{JoinHandle, JoinSet},
    time::MissedTickBehavior,
};
use tracing::{debug, error, info, warn};

use crate::{
    channel::{ChannelError, Claim, ClaimOutcome, Mailbox},
    config::ProcessorConfig,
    notify::NotificationHook,
    op::ValidationError,
    request::{ErrorKind, Request, Response, ResponseError, decode_request},
    store::{Deadline, Execution, Interrupt, Store, StoreError, execute_request},
};

use super::{ProcessorError, events::ProcessorEvent, sweep};

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    pub claimed: u64,
    pub claims_lost: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub replayed: u64,
    pub requeued: u64,
    pub abandoned: u64,
    pub channel_failures: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    claimed: AtomicU64,
    claims_lost: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    replayed: AtomicU64,
    pub(crate) requeued: AtomicU64,
    pub(crate) abandoned: AtomicU64,
    channel_failures: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ProcessorStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ProcessorStats {
            claimed: get(&self.claimed),
            claims_lost: get(&self.claims_lost),
            succeeded: get(&self.succeeded),
            failed: get(&self.failed),
            timed_out: get(&self.timed_out),
            replayed: get(&self.replayed),
            requeued: get(&self.requeued),
            abandoned: get(&self.abandoned),
            channel_failures: get(&self.channel_failures),
        }
    }
}

/// State shared by the poll loop, request workers and the sweeper.
pub(crate) struct Shared {
    pub(crate) store: Arc<Mutex<Box<dyn Store>>>,
    interrupter: Option<Arc<dyn Interrupt>>,
    /// Request currently holding the store, for targeted interrupts.
    active: StdMutex<Option<String>>,
    pub(crate) requests: Arc<dyn Mailbox>,
    pub(crate) responses: Arc<dyn Mailbox>,
    hook: Option<Arc<dyn NotificationHook>>,
    pub(crate) config: ProcessorConfig,
    permits: Semaphore,
    in_flight: StdMutex<HashSet<String>>,
    pub(crate) events: broadcast::Sender<ProcessorEvent>,
    pub(crate) counters: Counters,
    /// Periodic and on-demand sweeps never overlap.
    pub(crate) sweep_lock: Mutex<()>,
}

impl Shared {
    pub(crate) fn emit(&self, event: ProcessorEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn is_in_flight(&self, id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    fn in_flight_len(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn set_active(&self, id: Option<String>) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = id;
    }

    fn interrupt_if_active(&self, id: &str) {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.as_deref() == Some(id) {
            if let Some(interrupter) = &self.interrupter {
                interrupter.interrupt();
            }
        }
    }

    /// Publishes `response`. A response already present for the id is kept.
    pub(crate) async fn publish_response(self: &Arc<Self>, response: &Response) -> Result<(), ProcessorError> {
        let mailbox = Arc::clone(&self.responses);
        let id = response.request_id.clone();
        let body = response.encode();
        let published = blocking(move || mailbox.publish(&id, &body)).await?;
        match published {
            Ok(()) => Ok(()),
            Err(ChannelError::DuplicateIdentifier(id)) => {
                warn!(request_id = %id, "response already published, keeping the existing one");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub(crate) async fn ack(self: &Arc<Self>, claim: Claim) -> Result<(), ProcessorError> {
        let mailbox = Arc::clone(&self.requests);
        blocking(move || mailbox.ack(claim)).await??;
        Ok(())
    }

    /// Logs a failed mutation in the store's execution log.
    pub(crate) async fn record_failure(self: &Arc<Self>, request: Arc<Request>, reason: String) {
        let mut store = Arc::clone(&self.store).lock_owned().await;
        let recorded = blocking(move || store.record_failure(request.info(), &reason)).await;
        match recorded {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "could not record failure in execution log"),
            Err(err) => warn!(error = %err, "could not record failure in execution log"),
        }
    }
}

/// Removes the id from the in-flight set when the worker finishes, even on panic.
struct InFlightGuard {
    shared: Arc<Shared>,
    id: String,
}

impl InFlightGuard {
    fn track(shared: &Arc<Shared>, id: &str) -> Option<Self> {
        let inserted = shared
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string());
        inserted.then(|| Self {
            shared: Arc::clone(shared),
            id: id.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.shared
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

pub(crate) async fn blocking<T, F>(f: F) -> Result<T, ProcessorError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ProcessorError::Join(e.to_string()))
}

enum Command {
    SweepNow {
        resp: oneshot::Sender<Result<sweep::SweepReport, ProcessorError>>,
    },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RunState {
    Running,
    Stopped { error: Option<String> },
}

/// Single reader of the request mailbox.
pub struct Processor {
    store: Box<dyn Store>,
    requests: Arc<dyn Mailbox>,
    responses: Arc<dyn Mailbox>,
    hook: Option<Arc<dyn NotificationHook>>,
    config: ProcessorConfig,
}

impl Processor {
    pub fn new(
        store: Box<dyn Store>,
        requests: Arc<dyn Mailbox>,
        responses: Arc<dyn Mailbox>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            store,
            requests,
            responses,
            hook: None,
            config,
        }
    }

    /// Runs `hook` after each committed mutation.
    pub fn with_hook(mut self, hook: Arc<dyn NotificationHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Starts the poll loop and the retention sweeper on the current runtime.
    ///
    /// Fails without starting anything when the configuration is unusable.
    pub fn spawn(self) -> Result<ProcessorHandle, ProcessorError> {
        self.config.validate()?;
        let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(16);
        let (events_tx, _) = broadcast::channel::<ProcessorEvent>(1024);
        let (state_tx, state_rx) = watch::channel(RunState::Running);

        let shared = Arc::new(Shared {
            interrupter: self.store.interrupt_handle(),
            store: Arc::new(Mutex::new(self.store)),
            active: StdMutex::new(None),
            requests: self.requests,
            responses: self.responses,
            hook: self.hook,
            permits: Semaphore::new(self.config.max_concurrent_requests),
            in_flight: StdMutex::new(HashSet::new()),
            events: events_tx,
            counters: Counters::default(),
            sweep_lock: Mutex::new(()),
            config: self.config,
        });

        let task = tokio::spawn(run_loop(Arc::clone(&shared), cmd_rx, state_tx));
        Ok(ProcessorHandle {
            cmd_tx,
            shared,
            state_rx,
            task,
        })
    }
}

/// Control surface of a running processor.
pub struct ProcessorHandle {
    cmd_tx: mpsc::Sender<Command>,
    shared: Arc<Shared>,
    state_rx: watch::Receiver<RunState>,
    task: JoinHandle<()>,
}

impl ProcessorHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<ProcessorEvent> {
        self.shared.events.subscribe()
    }

    pub fn stats(&self) -> ProcessorStats {
        self.shared.counters.snapshot()
    }

    /// Number of claimed requests not yet answered.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight_len()
    }

    /// Runs one retention and stuck-claim sweep now.
    pub async fn sweep_now(&self) -> Result<sweep::SweepReport, ProcessorError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::SweepNow { resp: tx })
            .await
            .map_err(|_| ProcessorError::ChannelClosed)?;
        rx.await.map_err(|_| ProcessorError::ChannelClosed)?
    }

    /// Resolves once the poll loop has exited. Returns the fatal error, if any.
    pub async fn stopped(&self) -> Option<String> {
        let mut rx = self.state_rx.clone();
        match rx
            .wait_for(|state| matches!(state, RunState::Stopped { .. }))
            .await
        {
            Ok(state) => match &*state {
                RunState::Stopped { error } => error.clone(),
                RunState::Running => None,
            },
            Err(_) => Some("processor task ended unexpectedly".to_string()),
        }
    }

    /// Stops claiming, waits for claimed requests to finish, then stops the sweeper.
    pub async fn shutdown(self) -> Result<(), ProcessorError> {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
        self.task
            .await
            .map_err(|e| ProcessorError::Join(e.to_string()))?;
        match &*self.state_rx.borrow() {
            RunState::Stopped { error: Some(err) } => Err(ProcessorError::ChannelFailed(err.clone())),
            _ => Ok(()),
        }
    }
}

async fn run_loop(
    shared: Arc<Shared>,
    mut cmd_rx: mpsc::Receiver<Command>,
    state_tx: watch::Sender<RunState>,
) {
    let mut ticker = tokio::time::interval(shared.config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut workers = JoinSet::new();
    let (sweep_stop_tx, sweep_stop_rx) = watch::channel(false);
    let sweeper = tokio::spawn(sweep::run_periodic(Arc::clone(&shared), sweep_stop_rx));
    let mut failures = 0u32;
    let mut fatal = None;

    info!(
        max_concurrent = shared.config.max_concurrent_requests,
        max_queued = shared.config.max_queued_requests,
        "processor started"
    );

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::SweepNow { resp }) => {
                    let _ = resp.send(sweep::sweep_once(&shared).await);
                }
                Some(Command::Shutdown) | None => break,
            },
            _ = ticker.tick() => {
                match poll_once(&shared, &mut workers).await {
                    Ok(()) => failures = 0,
                    Err(err) => {
                        failures += 1;
                        Counters::bump(&shared.counters.channel_failures);
                        shared.emit(ProcessorEvent::ChannelFailure { message: err.to_string() });
                        if failures >= shared.config.max_channel_failures.max(1) {
                            error!(error = %err, failures, "request mailbox unusable, stopping processor");
                            fatal = Some(err.to_string());
                            break;
                        }
                        warn!(error = %err, failures, "request poll failed");
                    }
                }
            }
            Some(joined) = workers.join_next(), if !workers.is_empty() => {
                if let Err(err) = joined {
                    error!(error = %err, "request worker panicked");
                }
            }
        }
    }

    // Claimed requests are always answered before the loop reports itself stopped.
    while let Some(joined) = workers.join_next().await {
        if let Err(err) = joined {
            error!(error = %err, "request worker panicked");
        }
    }
    let _ = sweep_stop_tx.send(true);
    if let Err(err) = sweeper.await {
        error!(error = %err, "retention sweeper panicked");
    }

    info!(error = ?fatal, "processor stopped");
    shared.emit(ProcessorEvent::Stopped {
        error: fatal.clone(),
    });
    state_tx.send_replace(RunState::Stopped { error: fatal });
}

/// Claims up to the free admission capacity and spawns one worker per claim.
async fn poll_once(shared: &Arc<Shared>, workers: &mut JoinSet<()>) -> Result<(), ProcessorError> {
    let limit = shared.config.max_concurrent_requests.max(1) + shared.config.max_queued_requests;
    let capacity = limit.saturating_sub(shared.in_flight_len());
    if capacity == 0 {
        return Ok(());
    }

    let s = Arc::clone(shared);
    let (claimed, failure) = blocking(move || claim_batch(&s, capacity)).await?;
    for (claim, guard) in claimed {
        workers.spawn(process(Arc::clone(shared), claim, guard));
    }
    match failure {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

fn claim_batch(
    shared: &Arc<Shared>,
    capacity: usize,
) -> (Vec<(Claim, InFlightGuard)>, Option<ChannelError>) {
    let entries = match shared.requests.poll() {
        Ok(entries) => entries,
        Err(err) => return (Vec::new(), Some(err)),
    };
    let mut claimed = Vec::new();
    for entry in entries {
        if claimed.len() >= capacity {
            break;
        }
        let Some(guard) = InFlightGuard::track(shared, &entry.id) else {
            continue;
        };
        match shared.requests.claim(&entry) {
            Ok(ClaimOutcome::Claimed(claim)) => {
                debug!(request_id = %claim.id, attempt = claim.attempt, "claimed");
                Counters::bump(&shared.counters.claimed);
                shared.emit(ProcessorEvent::Claimed {
                    request_id: claim.id.clone(),
                    attempt: claim.attempt,
                });
                claimed.push((claim, guard));
            }
            Ok(ClaimOutcome::Lost) => {
                Counters::bump(&shared.counters.claims_lost);
                shared.emit(ProcessorEvent::ClaimLost {
                    request_id: entry.id,
                });
            }
            Err(err) => return (claimed, Some(err)),
        }
    }
    (claimed, None)
}

async fn process(shared: Arc<Shared>, claim: Claim, _guard: InFlightGuard) {
    let id = claim.id.clone();
    if let Err(err) = handle_claim(&shared, claim).await {
        Counters::bump(&shared.counters.channel_failures);
        shared.emit(ProcessorEvent::ChannelFailure {
            message: err.to_string(),
        });
        warn!(request_id = %id, error = %err, "request left claimed for the sweeper");
    }
}

async fn handle_claim(shared: &Arc<Shared>, claim: Claim) -> Result<(), ProcessorError> {
    let mailbox = Arc::clone(&shared.requests);
    let to_read = claim.clone();
    let body = blocking(move || mailbox.read(&to_read)).await??;

    let request = match decode_request(&body) {
        Ok(request) if request.request_id == claim.id => Arc::new(request),
        Ok(request) => {
            let err = ValidationError::IdMismatch {
                expected: claim.id.clone(),
                found: request.request_id.clone(),
            };
            return reject(shared, claim, request.client_id, &err).await;
        }
        Err(rejection) => {
            let client_id = rejection.client_id.unwrap_or_default();
            return reject(shared, claim, client_id, &rejection.error).await;
        }
    };

    let outcome = {
        let _permit = shared
            .permits
            .acquire()
            .await
            .map_err(|_| ProcessorError::ChannelClosed)?;
        execute(shared, &request).await?
    };

    let mut notify = None;
    let response = match outcome {
        Ok(execution) => {
            let data = execution.to_data(request.kind());
            if execution.replayed() {
                Counters::bump(&shared.counters.replayed);
                info!(request_id = %request.request_id, "request already committed, replaying logged result");
            } else if request.is_mutation() {
                notify = Some(data.clone());
            }
            Counters::bump(&shared.counters.succeeded);
            Response::success(&request.request_id, &request.client_id, data)
        }
        Err(err) => {
            if matches!(err, StoreError::Timeout) {
                Counters::bump(&shared.counters.timed_out);
            }
            Counters::bump(&shared.counters.failed);
            warn!(request_id = %request.request_id, error = %err, "request failed");
            if request.is_mutation() {
                shared.record_failure(Arc::clone(&request), err.to_string()).await;
            }
            Response::failure(&request.request_id, &request.client_id, err.to_response_error())
        }
    };

    shared.publish_response(&response).await?;
    shared.ack(claim).await?;
    info!(
        request_id = %request.request_id,
        kind = request.kind().as_str(),
        success = response.success,
        "request completed"
    );
    shared.emit(ProcessorEvent::Completed {
        request_id: request.request_id.clone(),
        success: response.success,
        error: response.error_kind(),
    });

    if let Some(data) = notify {
        run_hook(shared, request, data).await;
    }
    Ok(())
}

/// Runs the request on the store under the configured time budget.
///
/// The budget starts once the store is acquired. When it elapses the running
/// statement is interrupted and the job awaited; a commit that wins the race
/// is reported as a success.
async fn execute(
    shared: &Arc<Shared>,
    request: &Arc<Request>,
) -> Result<Result<Execution, StoreError>, ProcessorError> {
    let budget = shared.config.request_timeout;
    let mut store = Arc::clone(&shared.store).lock_owned().await;
    let deadline = Deadline::after(budget);
    let s = Arc::clone(shared);
    let req = Arc::clone(request);
    let mut job = tokio::task::spawn_blocking(move || {
        s.set_active(Some(req.request_id.clone()));
        let out = execute_request(&mut **store, &req, deadline);
        s.set_active(None);
        out
    });

    let joined = match tokio::time::timeout(budget, &mut job).await {
        Ok(joined) => joined,
        Err(_) => {
            debug!(request_id = %request.request_id, "execution budget elapsed, interrupting");
            shared.interrupt_if_active(&request.request_id);
            job.await
        }
    };
    joined.map_err(|e| ProcessorError::Join(e.to_string()))
}

async fn reject(
    shared: &Arc<Shared>,
    claim: Claim,
    client_id: String,
    err: &ValidationError,
) -> Result<(), ProcessorError> {
    warn!(request_id = %claim.id, error = %err, "rejected invalid request");
    Counters::bump(&shared.counters.failed);
    let response = Response::failure(&claim.id, client_id, ResponseError::from(err));
    shared.publish_response(&response).await?;
    let request_id = claim.id.clone();
    shared.ack(claim).await?;
    shared.emit(ProcessorEvent::Completed {
        request_id,
        success: false,
        error: Some(ErrorKind::Validation),
    });
    Ok(())
}

async fn run_hook(shared: &Arc<Shared>, request: Arc<Request>, data: Value) {
    let Some(hook) = shared.hook.clone() else {
        return;
    };
    let id = request.request_id.clone();
    let outcome = blocking(move || {
        if hook.should_notify(&request) {
            hook.on_commit(&request, &data)
        } else {
            Ok(())
        }
    })
    .await;
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(request_id = %id, error = %err, "notification hook failed"),
        Err(err) => warn!(request_id = %id, error = %err, "notification hook panicked"),
    }
}
