//! The single-flight job loop.
//!
//! Jobs are queued by id in submission order and run one at a time on a
//! dedicated worker. Each job body runs as its own tokio task so it can be
//! aborted mid-await:
//!
//! - cancelling the running job aborts its task and every side task it
//!   registered, right away, and the loop reports it once the task winds down
//! - cancelling a queued job only flags it; the flag is honored when the id
//!   reaches the front of the queue, so the queue is never rewritten
//!
//! The scheduler publishes the terminal event for every job. Job bodies
//! publish `start` and `progress` through their [`JobScope`].

use cadenza_config::SchedulerConfig;
use cadenza_core::{Error, Event, EventBus, JobError, ProcessError};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::job::{JobId, JobState, JobType};
use crate::process::ProcessManager;

/// A job's bound unit of work.
pub type JobFuture = Pin<Box<dyn Future<Output = cadenza_core::Result<()>> + Send>>;

struct Pending {
    job_type: JobType,
    token: CancellationToken,
    work: JobFuture,
}

struct Running {
    id: JobId,
    task: AbortHandle,
    token: CancellationToken,
    side_tasks: Vec<AbortHandle>,
}

#[derive(Default)]
struct State {
    pending: HashMap<JobId, Pending>,
    /// Queued jobs to drop on dequeue, with the cancel reason
    skips: HashMap<JobId, Option<String>>,
    running: Option<Running>,
    /// Running jobs aborted by `cancel_job` that the loop has not reported yet
    aborted: HashMap<JobId, Option<String>>,
}

struct Shared {
    state: Mutex<State>,
    bus: Arc<EventBus>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn cancelled_event(job_type: JobType, id: &JobId, reason: Option<String>) -> Event {
    let err = JobError::Cancelled {
        job_id: id.to_string(),
        reason,
    };
    Event::error(job_type.as_str(), id.as_str(), err.kind(), err.to_string())
}

/// What a job body sees of the scheduler.
#[derive(Clone)]
pub struct JobScope {
    id: JobId,
    job_type: JobType,
    token: CancellationToken,
    shared: Arc<Shared>,
}

impl JobScope {
    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    /// Cancelled when the job is cancelled. Streams that can stop early
    /// should watch it.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn start(&self, payload: serde_json::Value) {
        self.shared
            .bus
            .broadcast(Event::start(self.job_type.as_str(), self.id.as_str(), payload));
    }

    pub fn progress(&self, payload: serde_json::Value) {
        self.shared
            .bus
            .broadcast(Event::progress(self.job_type.as_str(), self.id.as_str(), payload));
    }

    /// Spawn a task owned by this job. It is aborted when the job is
    /// cancelled or finishes.
    pub fn spawn_side_task<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut state = self.shared.state();
        match state.running.as_mut().filter(|running| running.id == self.id) {
            Some(running) => running.side_tasks.push(handle.abort_handle()),
            None => {
                debug!(job_id = %self.id, "Job is no longer running, dropping side task");
                handle.abort();
            }
        }
        handle
    }
}

pub struct JobScheduler {
    shared: Arc<Shared>,
    queue_tx: mpsc::UnboundedSender<JobId>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<JobId>>>,
    processes: Arc<ProcessManager>,
    error_backoff: Duration,
}

impl JobScheduler {
    pub fn new(bus: Arc<EventBus>, processes: Arc<ProcessManager>, config: &SchedulerConfig) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                bus,
            }),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            processes,
            error_backoff: Duration::from_millis(config.error_backoff_ms),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.shared.bus
    }

    /// Queue a job and return its id without waiting for it.
    ///
    /// `body` is called right away to bind the work; the future it returns
    /// is not polled until the job reaches the front of the queue.
    pub fn submit<F, Fut>(&self, job_type: JobType, body: F) -> JobId
    where
        F: FnOnce(JobScope) -> Fut,
        Fut: Future<Output = cadenza_core::Result<()>> + Send + 'static,
    {
        let id = JobId::new();
        let token = CancellationToken::new();
        let scope = JobScope {
            id: id.clone(),
            job_type,
            token: token.clone(),
            shared: Arc::clone(&self.shared),
        };
        let work: JobFuture = Box::pin(body(scope));

        self.shared.state().pending.insert(
            id.clone(),
            Pending {
                job_type,
                token,
                work,
            },
        );
        if self.queue_tx.send(id.clone()).is_err() {
            warn!(job_id = %id, job_type = %job_type, "Job loop has stopped, dropping job");
            self.abandon(&id, "job loop has stopped");
        } else {
            debug!(job_id = %id, job_type = %job_type, "Job queued");
        }
        id
    }

    /// Cancel a job.
    ///
    /// The running job is aborted on the spot together with its side tasks.
    /// A queued job is flagged and skipped when dequeued.
    pub fn cancel_job(&self, id: &JobId, reason: Option<&str>) -> Result<(), JobError> {
        let reason = reason.map(str::to_string);
        let mut state = self.shared.state();

        if let Some(running) = state.running.take_if(|running| running.id == *id) {
            match &reason {
                Some(reason) => info!(job_id = %id, "Setting job {id} to cancel because {reason}"),
                None => info!(job_id = %id, "Setting job {id} to cancel"),
            }
            running.token.cancel();
            for side_task in &running.side_tasks {
                side_task.abort();
            }
            running.task.abort();
            state.aborted.insert(id.clone(), reason);
            return Ok(());
        }

        if state.pending.contains_key(id) {
            info!(job_id = %id, "Setting queued job {id} to be skipped");
            state.skips.insert(id.clone(), reason);
            return Ok(());
        }

        Err(JobError::NotFound(id.to_string()))
    }

    pub fn job_state(&self, id: &JobId) -> Option<JobState> {
        let state = self.shared.state();
        if state.running.as_ref().is_some_and(|running| running.id == *id) {
            Some(JobState::Running)
        } else if state.skips.contains_key(id) {
            Some(JobState::SkipRequested)
        } else if state.pending.contains_key(id) {
            Some(JobState::Queued)
        } else {
            None
        }
    }

    pub fn current_job(&self) -> Option<JobId> {
        self.shared.state().running.as_ref().map(|running| running.id.clone())
    }

    pub fn queued_count(&self) -> usize {
        self.shared.state().pending.len()
    }

    /// Drive the queue until `shutdown` fires.
    ///
    /// Only one loop runs per scheduler; a second call returns immediately.
    /// Jobs still queued at shutdown are reported as cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let queue = self
            .queue_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(mut queue) = queue else {
            warn!("Job loop is already running");
            return;
        };
        info!("Job loop started");

        loop {
            if let Err(e) = self.housekeeping().await {
                error!(error = %e, backoff_ms = self.error_backoff.as_millis() as u64, "Job loop error, backing off");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.error_backoff) => continue,
                }
            }

            let id = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = queue.recv() => match next {
                    Some(id) => id,
                    None => break,
                },
            };
            self.run_job(id).await;
        }

        queue.close();
        while let Ok(id) = queue.try_recv() {
            self.abandon(&id, "job loop has stopped");
        }
        info!("Job loop stopped");
    }

    async fn housekeeping(&self) -> Result<(), ProcessError> {
        self.processes.reload().await?;
        self.processes.unload().await
    }

    async fn run_job(&self, id: JobId) {
        let started = Instant::now();
        let (job_type, handle) = {
            let mut state = self.shared.state();
            let Some(pending) = state.pending.remove(&id) else {
                debug!(job_id = %id, "Dequeued job is no longer pending");
                return;
            };
            let skipped = state.skips.remove(&id);
            if let Some(reason) = skipped {
                drop(state);
                info!(job_id = %id, job_type = %pending.job_type, "Skipping cancelled job");
                self.shared
                    .bus
                    .broadcast(cancelled_event(pending.job_type, &id, reason));
                return;
            }

            // Spawned under the lock so `cancel_job` never sees a gap
            // between pending and running.
            let handle = tokio::spawn(pending.work);
            state.running = Some(Running {
                id: id.clone(),
                task: handle.abort_handle(),
                token: pending.token,
                side_tasks: Vec::new(),
            });
            (pending.job_type, handle)
        };
        info!(job_id = %id, job_type = %job_type, "Running job");

        let outcome = handle.await;

        let (aborted, side_tasks) = {
            let mut state = self.shared.state();
            let side_tasks = state
                .running
                .take_if(|running| running.id == id)
                .map(|running| running.side_tasks)
                .unwrap_or_default();
            (state.aborted.remove(&id), side_tasks)
        };
        for side_task in side_tasks {
            side_task.abort();
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let topic = job_type.as_str();
        let event = match (aborted, outcome) {
            (Some(reason), _) => {
                info!(job_id = %id, job_type = %job_type, elapsed_ms, "Job cancelled");
                cancelled_event(job_type, &id, reason)
            }
            (None, Ok(Ok(()))) => {
                info!(job_id = %id, job_type = %job_type, elapsed_ms, "Job succeeded");
                Event::success(topic, id.as_str())
            }
            (None, Ok(Err(e))) => {
                warn!(job_id = %id, job_type = %job_type, kind = e.kind(), error = %e, "Job failed");
                Event::error(topic, id.as_str(), e.kind(), e.to_string())
            }
            (None, Err(join_error)) if join_error.is_cancelled() => {
                cancelled_event(job_type, &id, None)
            }
            (None, Err(join_error)) => {
                error!(job_id = %id, job_type = %job_type, error = %join_error, "Job task panicked");
                let err = Error::Internal(join_error.to_string());
                Event::error(topic, id.as_str(), err.kind(), err.to_string())
            }
        };
        self.shared.bus.broadcast(event);
    }

    fn abandon(&self, id: &JobId, reason: &str) {
        let pending = {
            let mut state = self.shared.state();
            state.skips.remove(id);
            state.pending.remove(id)
        };
        if let Some(pending) = pending {
            self.shared
                .bus
                .broadcast(cancelled_event(pending.job_type, id, Some(reason.to_string())));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ManagedProcess;
    use async_trait::async_trait;
    use cadenza_core::{EventPhase, OpRole, OperationError};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::{Notify, oneshot};

    struct Harness {
        scheduler: Arc<JobScheduler>,
        events: mpsc::UnboundedReceiver<Arc<Event>>,
        shutdown: CancellationToken,
    }

    fn harness_with(processes: Arc<ProcessManager>, backoff_ms: u64) -> Harness {
        let bus = Arc::new(EventBus::new());
        let (_, events) = bus.subscribe_channel();
        let scheduler = Arc::new(JobScheduler::new(
            bus,
            processes,
            &SchedulerConfig {
                error_backoff_ms: backoff_ms,
            },
        ));
        let shutdown = CancellationToken::new();
        let worker = Arc::clone(&scheduler);
        let token = shutdown.clone();
        tokio::spawn(async move { worker.run(token).await });
        Harness {
            scheduler,
            events,
            shutdown,
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(ProcessManager::new()), 10)
    }

    impl Harness {
        /// Collect terminal events until `count` have arrived.
        async fn terminals(&mut self, count: usize) -> Vec<Arc<Event>> {
            let mut seen = Vec::new();
            while seen.len() < count {
                let event = tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                    .await
                    .expect("timed out waiting for events")
                    .expect("bus closed");
                if event.is_terminal() {
                    seen.push(event);
                }
            }
            seen
        }
    }

    fn error_kind(event: &Event) -> Option<&str> {
        match &event.phase {
            EventPhase::Error { kind, .. } => Some(kind),
            _ => None,
        }
    }

    #[tokio::test]
    async fn jobs_run_in_order_one_at_a_time() {
        let mut h = harness();
        let order = Arc::new(Mutex::new(Vec::new()));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut ids = Vec::new();
        for i in 0..5 {
            let (order, active, peak) = (order.clone(), active.clone(), peak.clone());
            ids.push(h.scheduler.submit(JobType::ContextClear, move |_| async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                order.lock().unwrap().push(i);
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<(), Error>(())
            }));
        }

        let done = h.terminals(5).await;
        let finished: Vec<_> = done.iter().map(|e| JobId(e.job_id.clone())).collect();
        assert_eq!(finished, ids);
        assert!(done.iter().all(|e| e.phase == EventPhase::Success));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_queued_job_never_runs() {
        let mut h = harness();
        let gate = Arc::new(Notify::new());
        let ran = Arc::new(AtomicBool::new(false));

        let blocker_gate = gate.clone();
        let blocker = h.scheduler.submit(JobType::Response, move |_| async move {
            blocker_gate.notified().await;
            Ok::<(), Error>(())
        });
        let flag = ran.clone();
        let skipped = h.scheduler.submit(JobType::ContextClear, move |scope| async move {
            scope.start(serde_json::json!({}));
            flag.store(true, Ordering::SeqCst);
            Ok::<(), Error>(())
        });

        h.scheduler.cancel_job(&skipped, Some("changed my mind")).unwrap();
        assert_eq!(h.scheduler.job_state(&skipped), Some(JobState::SkipRequested));
        gate.notify_one();

        let done = h.terminals(2).await;
        assert_eq!(done[0].job_id, blocker.as_str());
        assert_eq!(done[1].job_id, skipped.as_str());
        assert_eq!(error_kind(&done[1]), Some("job_cancelled"));
        assert!(!ran.load(Ordering::SeqCst));
        assert!(matches!(
            h.scheduler.cancel_job(&skipped, None),
            Err(JobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn cancelling_running_job_aborts_it_and_its_side_tasks() {
        let mut h = harness();
        let (started_tx, started_rx) = oneshot::channel();
        let (side_alive_tx, side_alive_rx) = oneshot::channel::<()>();

        let id = h.scheduler.submit(JobType::Response, move |scope| async move {
            scope.spawn_side_task(async move {
                let _alive = side_alive_tx;
                std::future::pending::<()>().await;
            });
            let _ = started_tx.send(());
            std::future::pending::<()>().await;
            Ok::<(), Error>(())
        });

        started_rx.await.unwrap();
        assert_eq!(h.scheduler.current_job(), Some(id.clone()));
        h.scheduler.cancel_job(&id, Some("user asked")).unwrap();
        assert_eq!(h.scheduler.current_job(), None);

        // The side task's sender drops when it is aborted.
        assert!(side_alive_rx.await.is_err());

        let done = h.terminals(1).await;
        assert_eq!(error_kind(&done[0]), Some("job_cancelled"));
        match &done[0].phase {
            EventPhase::Error { reason, .. } => assert!(reason.contains("user asked")),
            other => panic!("unexpected phase {other:?}"),
        }

        let next = h.scheduler.submit(JobType::ContextClear, |_| async { Ok::<(), Error>(()) });
        let done = h.terminals(1).await;
        assert_eq!(done[0].job_id, next.as_str());
        assert_eq!(done[0].phase, EventPhase::Success);
    }

    #[tokio::test]
    async fn job_errors_are_classified() {
        let mut h = harness();
        h.scheduler.submit(JobType::OperationUse, |_| async {
            Err::<(), Error>(
                OperationError::Unloaded {
                    role: OpRole::T2t,
                    id: None,
                }
                .into(),
            )
        });
        let done = h.terminals(1).await;
        assert_eq!(error_kind(&done[0]), Some("operation_unloaded"));
        assert_eq!(done[0].topic, "operation_use");
    }

    #[tokio::test]
    async fn unknown_job_cannot_be_cancelled() {
        let h = harness();
        assert!(matches!(
            h.scheduler.cancel_job(&JobId::from("nope"), None),
            Err(JobError::NotFound(_))
        ));
    }

    struct Flaky {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl ManagedProcess for Flaky {
        fn id(&self) -> &str {
            "flaky"
        }
        async fn reload(&self) -> Result<(), ProcessError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(ProcessError::Failed {
                process: "flaky".into(),
                reason: "port in use".into(),
            })
        }
        async fn unload(&self) -> Result<(), ProcessError> {
            Ok(())
        }
        fn is_running(&self) -> bool {
            false
        }
    }

    #[tokio::test(start_paused = true)]
    async fn loop_survives_housekeeping_failure() {
        let processes = Arc::new(ProcessManager::new());
        let flaky = Arc::new(Flaky {
            attempts: AtomicUsize::new(0),
        });
        processes.register(flaky.clone());
        processes.signal_reload("flaky").unwrap();

        let mut h = harness_with(processes, 1000);
        h.scheduler.submit(JobType::ContextClear, |_| async { Ok::<(), Error>(()) });

        let done = h.terminals(1).await;
        assert_eq!(done[0].phase, EventPhase::Success);
        assert_eq!(flaky.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn queued_jobs_are_cancelled_at_shutdown() {
        let mut h = harness();
        let gate = Arc::new(Notify::new());
        let blocker_gate = gate.clone();
        h.scheduler.submit(JobType::Response, move |_| async move {
            blocker_gate.notified().await;
            Ok::<(), Error>(())
        });
        let stranded = h.scheduler.submit(JobType::ContextClear, |_| async { Ok::<(), Error>(()) });

        h.shutdown.cancel();
        gate.notify_one();

        let done = h.terminals(2).await;
        assert_eq!(done[1].job_id, stranded.as_str());
        assert_eq!(error_kind(&done[1]), Some("job_cancelled"));
    }
}
