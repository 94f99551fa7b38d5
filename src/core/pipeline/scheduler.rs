use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use dashmap::DashMap;
use tokio::{
    sync::{Semaphore, oneshot},
    task::JoinHandle,
    time::{Instant, timeout},
};
use tokio_util::sync::CancellationToken;

use crate::{
    constants::FINISHED_STATE_RETENTION,
    core::{
        domain::{Outcome, SubmissionId, SubmissionRequest, SubmissionState, Verdict},
        errors::Rejected,
        events::{JudgeEvent, Stage},
        pipeline::{health::CircuitBreaker, judging::Judge},
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub max_concurrent_workers: usize,
    pub queue_capacity: usize,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workers: 4,
            queue_capacity: 64,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown: Duration::from_secs(30),
        }
    }
}

type Reply = oneshot::Sender<Result<Verdict, Rejected>>;

#[derive(Debug)]
struct Queued {
    request: SubmissionRequest,
    reply: Reply,
    cancel: CancellationToken,
    enqueued_at: Instant,
}

#[derive(Debug)]
struct Shared {
    judge: Judge,
    queue: Mutex<VecDeque<Queued>>,
    /// One permit per queued submission; closed on shutdown.
    items: Semaphore,
    capacity: usize,
    accepting: AtomicBool,
    states: DashMap<SubmissionId, SubmissionState>,
    /// Oldest first; bounds how many terminal states `states` keeps.
    finished: Mutex<VecDeque<SubmissionId>>,
    running: DashMap<SubmissionId, CancellationToken>,
    /// Parent of every per-submission token; cancelled to force-abort.
    abort: CancellationToken,
    breaker: CircuitBreaker,
}

/// Bounded FIFO queue in front of a fixed pool of workers, each judging
/// one submission at a time end-to-end.
#[derive(Debug)]
pub struct Scheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Resolves to the verdict of one submission, or to the reason it never ran.
#[derive(Debug)]
pub struct SubmissionHandle {
    id: SubmissionId,
    rx: oneshot::Receiver<Result<Verdict, Rejected>>,
    shared: Arc<Shared>,
}

impl SubmissionHandle {
    pub fn id(&self) -> SubmissionId {
        self.id
    }

    /// Removes the submission from the queue, or kills it if already running.
    pub fn cancel(&self) -> bool {
        self.shared.cancel(self.id)
    }
}

impl Future for SubmissionHandle {
    type Output = Result<Verdict, Rejected>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|reply| reply.unwrap_or(Err(Rejected::ShuttingDown)))
    }
}

impl Scheduler {
    /// Spawns the worker pool on the current tokio runtime.
    pub fn new(judge: Judge, config: SchedulerConfig) -> Self {
        let shared = Arc::new(Shared {
            judge,
            queue: Mutex::new(VecDeque::with_capacity(config.queue_capacity)),
            items: Semaphore::new(0),
            capacity: config.queue_capacity,
            accepting: AtomicBool::new(true),
            states: DashMap::new(),
            finished: Mutex::new(VecDeque::with_capacity(FINISHED_STATE_RETENTION)),
            running: DashMap::new(),
            abort: CancellationToken::new(),
            breaker: CircuitBreaker::new(
                config.circuit_breaker_threshold,
                config.circuit_breaker_cooldown,
            ),
        });

        let workers = (0..config.max_concurrent_workers.max(1))
            .map(|worker| tokio::spawn(work(shared.clone(), worker)))
            .collect();

        tracing::info!(
            workers = config.max_concurrent_workers,
            queue_capacity = config.queue_capacity,
            "Scheduler started"
        );

        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Enqueues a submission. Never waits for a free worker: a full queue
    /// fails fast with `Rejected::Overloaded`.
    pub fn submit(&self, request: SubmissionRequest) -> Result<SubmissionHandle, Rejected> {
        let id = request.id;
        let shared = &self.shared;

        let admitted = shared.admit(request);
        if let Err(reason) = &admitted {
            tracing::warn!(submission_id = %id, "Submission rejected: {}", reason);
            shared.finish(id, SubmissionState::Rejected);
            shared.emit(JudgeEvent::new(id, Stage::Rejected, Duration::ZERO));
        }
        let rx = admitted?;

        shared.items.add_permits(1);
        shared.emit(JudgeEvent::new(id, Stage::Queued, Duration::ZERO));

        Ok(SubmissionHandle {
            id,
            rx,
            shared: shared.clone(),
        })
    }

    pub fn cancel(&self, id: SubmissionId) -> bool {
        self.shared.cancel(id)
    }

    /// Current state of a submission. Terminal states are kept for the most
    /// recent submissions only.
    pub fn state(&self, id: SubmissionId) -> Option<SubmissionState> {
        self.shared.states.get(&id).map(|state| *state)
    }

    pub fn queued(&self) -> usize {
        self.shared.lock_queue().len()
    }

    /// Stops admissions, lets workers drain for up to `drain_timeout`, then
    /// aborts whatever is still queued or running. Every sandbox has been
    /// released when this returns.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self, drain_timeout: Duration) {
        {
            let _queue = self.shared.lock_queue();
            self.shared.accepting.store(false, Ordering::SeqCst);
        }
        self.shared.items.close();

        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let mut joined = Box::pin(futures::future::join_all(workers));

        if timeout(drain_timeout, joined.as_mut()).await.is_err() {
            tracing::warn!("Drain timeout elapsed, aborting in-flight submissions");
            self.shared.abort.cancel();

            let leftovers: Vec<Queued> = self.shared.lock_queue().drain(..).collect();
            for queued in leftovers {
                self.shared.reject(queued, Rejected::ShuttingDown);
            }
            joined.await;
        }

        tracing::info!("Scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shared.accepting.store(false, Ordering::SeqCst);
        self.shared.items.close();
        self.shared.abort.cancel();
    }
}

impl Shared {
    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Queued>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: JudgeEvent) {
        self.judge.events().emit(event);
    }

    fn admit(
        &self,
        request: SubmissionRequest,
    ) -> Result<oneshot::Receiver<Result<Verdict, Rejected>>, Rejected> {
        if self.breaker.is_open() {
            return Err(Rejected::Unhealthy);
        }
        request.limits.validate()?;
        self.judge.registry().resolve(request.language)?;

        let (reply, rx) = oneshot::channel();
        let mut queue = self.lock_queue();
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(Rejected::ShuttingDown);
        }
        if queue.len() >= self.capacity {
            return Err(Rejected::Overloaded);
        }

        self.states.insert(request.id, SubmissionState::Queued);
        queue.push_back(Queued {
            request,
            reply,
            cancel: self.abort.child_token(),
            enqueued_at: Instant::now(),
        });
        Ok(rx)
    }

    /// Pops the oldest submission and marks it running in one step, so a
    /// concurrent cancel always finds it in exactly one place.
    fn next(&self) -> Option<Queued> {
        let mut queue = self.lock_queue();
        let queued = queue.pop_front()?;
        self.running
            .insert(queued.request.id, queued.cancel.clone());
        self.states
            .insert(queued.request.id, SubmissionState::Admitted);
        Some(queued)
    }

    fn cancel(&self, id: SubmissionId) -> bool {
        let removed = {
            let mut queue = self.lock_queue();
            queue
                .iter()
                .position(|queued| queued.request.id == id)
                .and_then(|idx| queue.remove(idx))
        };

        if let Some(queued) = removed {
            if let Ok(permit) = self.items.try_acquire() {
                permit.forget();
            }
            tracing::info!(submission_id = %id, "Queued submission cancelled");
            self.reject(queued, Rejected::Cancelled);
            return true;
        }

        match self.running.get(&id) {
            Some(token) => {
                tracing::info!(submission_id = %id, "Running submission cancelled");
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn finish(&self, id: SubmissionId, state: SubmissionState) {
        self.states.insert(id, state);
        let mut finished = self.finished.lock().unwrap_or_else(PoisonError::into_inner);
        finished.push_back(id);
        while finished.len() > FINISHED_STATE_RETENTION {
            if let Some(evicted) = finished.pop_front() {
                self.states
                    .remove_if(&evicted, |_, state| state.is_terminal());
            }
        }
    }

    fn reject(&self, queued: Queued, reason: Rejected) {
        let id = queued.request.id;
        self.finish(id, SubmissionState::Rejected);
        self.emit(JudgeEvent::new(id, Stage::Rejected, queued.enqueued_at.elapsed()));
        let _ = queued.reply.send(Err(reason));
    }

    async fn run(&self, queued: Queued) {
        let Queued {
            request,
            reply,
            cancel,
            enqueued_at,
        } = queued;
        let id = request.id;

        self.emit(JudgeEvent::new(id, Stage::Admitted, enqueued_at.elapsed()));
        self.states.insert(id, SubmissionState::Running);

        let started = Instant::now();
        let verdict = self.judge.judge(&request, &cancel).await;

        self.running.remove(&id);
        self.breaker.record(&verdict);

        let (stage, state) = if verdict.outcome == Outcome::Aborted {
            (Stage::Aborted, SubmissionState::Aborted)
        } else {
            (Stage::Completed, SubmissionState::Completed)
        };
        self.finish(id, state);
        self.emit(JudgeEvent::new(id, stage, started.elapsed()).with_outcome(verdict.outcome));

        if reply.send(Ok(verdict)).is_err() {
            tracing::debug!(submission_id = %id, "Submitter is gone, dropping verdict");
        }
    }
}

async fn work(shared: Arc<Shared>, worker: usize) {
    tracing::debug!(worker, "Worker started");
    loop {
        if let Ok(permit) = shared.items.acquire().await {
            permit.forget();
        }

        let Some(queued) = shared.next() else {
            if shared.items.is_closed() {
                break;
            }
            continue;
        };

        if shared.abort.is_cancelled() {
            shared.running.remove(&queued.request.id);
            shared.reject(queued, Rejected::ShuttingDown);
            continue;
        }

        shared.run(queued).await;
    }
    tracing::debug!(worker, "Worker stopped");
}
