//! Retry strategies built on the actor runtime.
//!
//! Every attempt is submitted as a job onto the owning actor's mailbox, so a
//! retry loop never blocks a worker thread and other jobs of the same actor
//! interleave with it. The returned future resolves to `true` when the
//! operation succeeded and `false` when the termination predicate stopped it.

mod backoff;

pub use backoff::BackoffSchedule;

use crate::actor::{Actor, ActorControl, ActorFuture, FutureError};
use crate::metrics::PartitionMetrics;
use serde::{Deserialize, Serialize};
use slog::{debug, warn, Logger};
use std::sync::Arc;
use std::time::Duration;

/// Classifies errors as transient (worth retrying) or fatal
pub trait Recoverable {
    fn is_recoverable(&self) -> bool;
}

/// Exponential backoff bounds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(with = "crate::config::duration_ms")]
    pub initial: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(8),
        }
    }
}

/// Retry policy variants
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Retry immediately until success or abort; any error fails the future
    Abortable,

    /// Retry recoverable errors after a fixed delay; fatal errors fail the future
    Recoverable { delay: Duration },

    /// Retry immediately on every error, logging each one
    Endless,

    /// Retry with doubling delays capped at a maximum; fatal errors fail the future
    Backoff(BackoffConfig),
}

/// Runs an operation on an actor until it succeeds or is terminated
#[derive(Clone)]
pub struct RetryStrategy {
    policy: RetryPolicy,
    logger: Logger,
    metrics: Option<Arc<PartitionMetrics>>,
}

impl RetryStrategy {
    pub fn new(policy: RetryPolicy, logger: Logger) -> Self {
        Self {
            policy,
            logger,
            metrics: None,
        }
    }

    pub fn abortable(logger: Logger) -> Self {
        Self::new(RetryPolicy::Abortable, logger)
    }

    pub fn endless(logger: Logger) -> Self {
        Self::new(RetryPolicy::Endless, logger)
    }

    pub fn recoverable(delay: Duration, logger: Logger) -> Self {
        Self::new(RetryPolicy::Recoverable { delay }, logger)
    }

    pub fn backoff(config: BackoffConfig, logger: Logger) -> Self {
        Self::new(RetryPolicy::Backoff(config), logger)
    }

    /// Count every retried attempt into `metrics`
    pub fn with_metrics(mut self, metrics: Arc<PartitionMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` on the actor until it returns `Ok(true)`.
    ///
    /// `Ok(false)` means "not done yet" and is retried under every policy.
    /// `terminate` is checked before every attempt and after every error.
    pub fn run_with_retry<A, E, Op, Term>(
        &self,
        control: &ActorControl<A>,
        operation: Op,
        terminate: Term,
    ) -> ActorFuture<bool>
    where
        A: Actor,
        E: std::error::Error + Recoverable + Send + Sync + 'static,
        Op: FnMut(&mut A) -> Result<bool, E> + Send + 'static,
        Term: FnMut(&A) -> bool + Send + 'static,
    {
        let future = ActorFuture::new();
        let backoff = match &self.policy {
            RetryPolicy::Backoff(config) => Some(BackoffSchedule::new(config.initial, config.max)),
            _ => None,
        };
        let attempt = Box::new(Attempt {
            operation,
            terminate,
            policy: self.policy.clone(),
            backoff,
            future: future.clone(),
            logger: self.logger.clone(),
            metrics: self.metrics.clone(),
            attempts: 0,
            _error: std::marker::PhantomData,
        });
        attempt.schedule(control, None);
        future
    }
}

struct Attempt<E, Op, Term> {
    operation: Op,
    terminate: Term,
    policy: RetryPolicy,
    backoff: Option<BackoffSchedule>,
    future: ActorFuture<bool>,
    logger: Logger,
    metrics: Option<Arc<PartitionMetrics>>,
    attempts: u64,
    _error: std::marker::PhantomData<fn() -> E>,
}

impl<E, Op, Term> Attempt<E, Op, Term>
where
    E: std::error::Error + Recoverable + Send + Sync + 'static,
{
    fn schedule<A>(self: Box<Self>, control: &ActorControl<A>, delay: Option<Duration>)
    where
        A: Actor,
        Op: FnMut(&mut A) -> Result<bool, E> + Send + 'static,
        Term: FnMut(&A) -> bool + Send + 'static,
    {
        let future = self.future.clone();
        let job = move |actor: &mut A, control: &ActorControl<A>| self.run(actor, control);
        match delay {
            Some(delay) => {
                control.run_delayed(delay, job);
            }
            None => {
                if let Err(error) = control.submit(job) {
                    future.fail(error);
                }
            }
        }
    }

    fn run<A>(mut self: Box<Self>, actor: &mut A, control: &ActorControl<A>)
    where
        A: Actor,
        Op: FnMut(&mut A) -> Result<bool, E> + Send + 'static,
        Term: FnMut(&A) -> bool + Send + 'static,
    {
        if (self.terminate)(&*actor) {
            debug!(self.logger, "Retry terminated"; "attempts" => self.attempts);
            self.future.complete(false);
            return;
        }

        self.attempts += 1;
        match (self.operation)(actor) {
            Ok(true) => {
                self.future.complete(true);
            }
            Ok(false) => {
                self.record_retry();
                let delay = self.next_delay();
                self.schedule(control, delay);
            }
            Err(error) => self.on_error(actor, control, error),
        }
    }

    fn on_error<A>(mut self: Box<Self>, actor: &mut A, control: &ActorControl<A>, error: E)
    where
        A: Actor,
        Op: FnMut(&mut A) -> Result<bool, E> + Send + 'static,
        Term: FnMut(&A) -> bool + Send + 'static,
    {
        let recoverable = error.is_recoverable();
        let retry = match self.policy {
            RetryPolicy::Abortable => false,
            RetryPolicy::Endless => true,
            RetryPolicy::Recoverable { .. } | RetryPolicy::Backoff(_) => recoverable,
        };

        if !retry {
            warn!(self.logger, "Operation failed, not retrying";
                "error" => %error, "recoverable" => recoverable, "attempts" => self.attempts);
            self.future.fail(FutureError::failed(error));
            return;
        }

        if (self.terminate)(&*actor) {
            self.future.complete(false);
            return;
        }

        warn!(self.logger, "Operation failed, retrying";
            "error" => %error, "recoverable" => recoverable, "attempts" => self.attempts,
            "policy" => format!("{:?}", self.policy));
        self.record_retry();
        let delay = self.next_delay();
        self.schedule(control, delay);
    }

    fn next_delay(&mut self) -> Option<Duration> {
        match &self.policy {
            RetryPolicy::Abortable | RetryPolicy::Endless => None,
            RetryPolicy::Recoverable { delay } => Some(*delay),
            RetryPolicy::Backoff(_) => self.backoff.as_mut().and_then(Iterator::next),
        }
    }

    fn record_retry(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.record_retry();
        }
    }
}
