//! Actor scheduler with separate CPU-bound and I/O-bound worker pools.
//!
//! Actors are cooperative: every job runs to completion on the actor's own
//! task, one at a time, and an actor "suspends" only by returning from a job
//! after registering a continuation. Many actors share the bounded pools.

use crate::actor::future::{ActorFuture, FutureError};
use slog::{debug, info, Logger};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Jobs executed between yields to the pool
const JOBS_PER_YIELD: usize = 64;

/// A unit of sequential, non-reentrant execution
pub trait Actor: Sized + Send + 'static {
    /// Name used in logs
    fn name(&self) -> String;

    /// Invoked on the actor's context before any submitted job
    fn on_started(&mut self, _control: &ActorControl<Self>) {}

    /// Invoked on the actor's context when the actor is closed
    fn on_closing(&mut self, _control: &ActorControl<Self>) {}
}

/// Which worker pool an actor runs on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolKind {
    Cpu,
    Io,
}

/// Worker pool sizing
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub cpu_threads: usize,
    pub io_threads: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cpu_threads: 2,
            io_threads: 2,
        }
    }
}

type Job<A> = Box<dyn FnOnce(&mut A, &ActorControl<A>) + Send>;

struct Completion<R: Clone + Send + 'static>(ActorFuture<R>);

impl<R: Clone + Send + 'static> Completion<R> {
    fn complete(self, value: R) {
        self.0.complete(value);
    }
}

impl<R: Clone + Send + 'static> Drop for Completion<R> {
    fn drop(&mut self) {
        self.0.fail(FutureError::ActorClosed);
    }
}

/// Handle to a running actor, used to submit work onto its context
pub struct ActorControl<A> {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Job<A>>,
    closed: Arc<AtomicBool>,
    stopped: ActorFuture<()>,
    handle: Handle,
}

impl<A> Clone for ActorControl<A> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tx: self.tx.clone(),
            closed: self.closed.clone(),
            stopped: self.stopped.clone(),
            handle: self.handle.clone(),
        }
    }
}

/// A delayed or periodic job; cancelled explicitly or when the actor closes
pub struct ScheduledTimer {
    task: JoinHandle<()>,
}

impl ScheduledTimer {
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl<A: Actor> ActorControl<A> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Submit a job to run on the actor's context
    pub fn submit<F>(&self, job: F) -> Result<(), FutureError>
    where
        F: FnOnce(&mut A, &ActorControl<A>) + Send + 'static,
    {
        if self.is_closed() {
            return Err(FutureError::ActorClosed);
        }
        self.tx
            .send(Box::new(job))
            .map_err(|_| FutureError::ActorClosed)
    }

    /// Run `f` on the actor's context and return its result as a future
    pub fn call<R, F>(&self, f: F) -> ActorFuture<R>
    where
        R: Clone + Send + 'static,
        F: FnOnce(&mut A, &ActorControl<A>) -> R + Send + 'static,
    {
        let future = ActorFuture::new();
        let completion = Completion(future.clone());
        // A job dropped unexecuted (closed mailbox) fails its future through the guard
        let _ = self.submit(move |actor, control| {
            completion.complete(f(actor, control));
        });
        future
    }

    /// Run a job on the actor's context after `delay`
    pub fn run_delayed<F>(&self, delay: Duration, job: F) -> ScheduledTimer
    where
        F: FnOnce(&mut A, &ActorControl<A>) + Send + 'static,
    {
        let control = self.clone();
        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = control.submit(job);
        });
        ScheduledTimer { task }
    }

    /// Run a job on the actor's context every `period`, until cancelled or closed
    pub fn run_at_fixed_rate<F>(&self, period: Duration, job: F) -> ScheduledTimer
    where
        F: Fn(&mut A, &ActorControl<A>) + Send + Sync + 'static,
    {
        let control = self.clone();
        let job = Arc::new(job);
        let task = self.handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of an interval completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let job = job.clone();
                if control.submit(move |actor, c| job(actor, c)).is_err() {
                    break;
                }
            }
        });
        ScheduledTimer { task }
    }

    /// Continue on the actor's context once `future` is done
    pub fn run_on_completion<T, F>(&self, future: &ActorFuture<T>, callback: F)
    where
        T: Clone + Send + 'static,
        F: FnOnce(&mut A, &ActorControl<A>, Result<T, FutureError>) + Send + 'static,
    {
        let control = self.clone();
        future.on_complete(move |result| {
            let result = result.clone();
            let _ = control.submit(move |actor, c| callback(actor, c, result));
        });
    }

    /// Close the actor. `on_closing` runs on its context, then the mailbox
    /// stops. Resolves once the actor itself has been dropped.
    pub fn close(&self) -> ActorFuture<()> {
        // Already closed actors only wait for the drop
        let _ = self.submit(|actor, control| {
            actor.on_closing(control);
            control.closed.store(true, Ordering::Release);
        });
        self.stopped.clone()
    }

    /// Spawn an async task on the pool this actor runs on
    pub fn spawn<F>(&self, task: F) -> JoinHandle<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(task)
    }
}

enum Pool {
    Owned(Runtime),
    Shared(Handle),
}

impl Pool {
    fn handle(&self) -> Handle {
        match self {
            Pool::Owned(runtime) => runtime.handle().clone(),
            Pool::Shared(handle) => handle.clone(),
        }
    }
}

/// Runs actors on a CPU pool and an I/O pool
pub struct ActorScheduler {
    cpu: Option<Pool>,
    io: Option<Pool>,
    logger: Logger,
}

impl ActorScheduler {
    /// Start dedicated worker pools
    pub fn new(config: SchedulerConfig, logger: Logger) -> std::io::Result<Self> {
        let cpu = Builder::new_multi_thread()
            .worker_threads(config.cpu_threads.max(1))
            .thread_name("raftstream-cpu")
            .enable_all()
            .build()?;
        let io = Builder::new_multi_thread()
            .worker_threads(config.io_threads.max(1))
            .thread_name("raftstream-io")
            .enable_all()
            .build()?;

        info!(logger, "Actor scheduler started";
            "cpu_threads" => config.cpu_threads, "io_threads" => config.io_threads);

        Ok(Self {
            cpu: Some(Pool::Owned(cpu)),
            io: Some(Pool::Owned(io)),
            logger,
        })
    }

    /// Share the current tokio runtime for both pools (tests, embedding)
    pub fn for_current_runtime(logger: Logger) -> Self {
        let handle = Handle::current();
        Self {
            cpu: Some(Pool::Shared(handle.clone())),
            io: Some(Pool::Shared(handle)),
            logger,
        }
    }

    pub fn handle(&self, pool: PoolKind) -> Handle {
        let pool = match pool {
            PoolKind::Cpu => self.cpu.as_ref(),
            PoolKind::Io => self.io.as_ref(),
        };
        pool.map(Pool::handle).unwrap_or_else(Handle::current)
    }

    pub fn spawn_cpu<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle(PoolKind::Cpu).spawn(task)
    }

    /// Blocking file or disk work goes here, never on the CPU pool
    pub fn spawn_io<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle(PoolKind::Io).spawn(task)
    }

    /// Start an actor on the given pool and return its control handle
    pub fn submit_actor<A: Actor>(&self, actor: A, pool: PoolKind) -> ActorControl<A> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.handle(pool);
        let name: Arc<str> = Arc::from(actor.name());
        let control = ActorControl {
            name: name.clone(),
            tx,
            closed: Arc::new(AtomicBool::new(false)),
            stopped: ActorFuture::new(),
            handle: handle.clone(),
        };

        debug!(self.logger, "Starting actor"; "actor" => &*name, "pool" => format!("{:?}", pool));
        handle.spawn(run_actor(actor, control.clone(), rx, self.logger.clone()));
        control
    }
}

impl Drop for ActorScheduler {
    fn drop(&mut self) {
        for pool in [self.cpu.take(), self.io.take()].into_iter().flatten() {
            if let Pool::Owned(runtime) = pool {
                runtime.shutdown_background();
            }
        }
    }
}

async fn run_actor<A: Actor>(
    mut actor: A,
    control: ActorControl<A>,
    mut rx: mpsc::UnboundedReceiver<Job<A>>,
    logger: Logger,
) {
    actor.on_started(&control);

    let mut since_yield = 0;
    while let Some(job) = rx.recv().await {
        job(&mut actor, &control);
        if control.is_closed() {
            break;
        }

        since_yield += 1;
        if since_yield >= JOBS_PER_YIELD {
            since_yield = 0;
            tokio::task::yield_now().await;
        }
    }

    control.closed.store(true, Ordering::Release);
    // Jobs still queued fail their futures as they are dropped
    drop(rx);
    drop(actor);
    control.stopped.complete(());
    debug!(logger, "Actor stopped"; "actor" => control.name());
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::Drain;

    fn create_logger() -> Logger {
        let decorator = slog_term::PlainDecorator::new(std::io::stdout());
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        Logger::root(drain, slog::o!())
    }

    #[derive(Default)]
    struct Counter {
        value: u64,
        closed: bool,
        started: bool,
    }

    impl Actor for Counter {
        fn name(&self) -> String {
            "counter".to_string()
        }

        fn on_started(&mut self, _control: &ActorControl<Self>) {
            self.started = true;
        }

        fn on_closing(&mut self, _control: &ActorControl<Self>) {
            self.closed = true;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_jobs_run_sequentially() {
        let scheduler = ActorScheduler::for_current_runtime(create_logger());
        let control = scheduler.submit_actor(Counter::default(), PoolKind::Cpu);

        for _ in 0..100 {
            control.submit(|counter, _| counter.value += 1).unwrap();
        }
        let value = control.call(|counter, _| (counter.started, counter.value)).await.unwrap();
        assert_eq!(value, (true, 100));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_delayed() {
        let scheduler = ActorScheduler::for_current_runtime(create_logger());
        let control = scheduler.submit_actor(Counter::default(), PoolKind::Cpu);

        control.run_delayed(Duration::from_millis(20), |counter, _| counter.value = 42);
        assert_eq!(control.call(|c, _| c.value).await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(control.call(|c, _| c.value).await.unwrap(), 42);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_at_fixed_rate_until_cancelled() {
        let scheduler = ActorScheduler::for_current_runtime(create_logger());
        let control = scheduler.submit_actor(Counter::default(), PoolKind::Io);

        let timer = control.run_at_fixed_rate(Duration::from_millis(5), |c, _| c.value += 1);
        tokio::time::sleep(Duration::from_millis(60)).await;
        timer.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let first = control.call(|c, _| c.value).await.unwrap();
        assert!(first >= 3, "expected several ticks, got {}", first);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(control.call(|c, _| c.value).await.unwrap(), first);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_on_completion_reenters_actor() {
        let scheduler = ActorScheduler::for_current_runtime(create_logger());
        let control = scheduler.submit_actor(Counter::default(), PoolKind::Cpu);

        let external = ActorFuture::new();
        control.run_on_completion(&external, |counter, _, result: Result<u64, FutureError>| {
            counter.value = result.unwrap();
        });

        let producer = external.clone();
        std::thread::spawn(move || {
            producer.complete(17);
        })
        .join()
        .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(control.call(|c, _| c.value).await.unwrap(), 17);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_runs_on_closing_and_rejects_jobs() {
        let scheduler = ActorScheduler::for_current_runtime(create_logger());
        let control = scheduler.submit_actor(Counter::default(), PoolKind::Cpu);

        control.close().await.unwrap();
        assert!(control.is_closed());
        assert!(matches!(control.submit(|_, _| {}), Err(FutureError::ActorClosed)));
        assert!(matches!(
            control.call(|c, _| c.value).await,
            Err(FutureError::ActorClosed)
        ));
        // Closing twice is fine
        control.close().await.unwrap();
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Actor for DropFlag {
        fn name(&self) -> String {
            "drop-flag".to_string()
        }
    }

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_resolves_after_actor_is_dropped() {
        let scheduler = ActorScheduler::for_current_runtime(create_logger());
        let dropped = Arc::new(AtomicBool::new(false));
        let control = scheduler.submit_actor(DropFlag(dropped.clone()), PoolKind::Io);

        let queued = control.call(|_, _| 1u8);
        control.close().await.unwrap();
        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(queued.await.unwrap(), 1);
    }
}
