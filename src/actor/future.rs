//! Completion-callback futures used between actors.
//!
//! An `ActorFuture` is completed exactly once, either with a value or with a
//! `FutureError`. Callbacks registered through `on_complete` run on the thread
//! that completes the future; actors that need the result on their own
//! execution context go through `ActorControl::run_on_completion`.

use std::error::Error;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll, Waker};

/// Errors carried by a failed `ActorFuture`
#[derive(Debug, Clone)]
pub enum FutureError {
    /// The producing side failed with the wrapped error
    Failed(Arc<dyn Error + Send + Sync>),

    /// The actor that should complete the future is closed
    ActorClosed,

    /// The producing side was dropped without completing the future
    Abandoned,

    /// One or more futures of a `collect` failed
    Aggregated { errors: Vec<FutureError>, total: usize },
}

impl FutureError {
    /// Wrap any error as a failure cause
    pub fn failed<E>(error: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        FutureError::Failed(Arc::new(error))
    }

    /// Failure with a plain message
    pub fn message(message: impl Into<String>) -> Self {
        FutureError::Failed(Arc::new(Message(message.into())))
    }

    /// All individual errors of an aggregate, or the error itself
    pub fn causes(&self) -> Vec<&FutureError> {
        match self {
            FutureError::Aggregated { errors, .. } => errors.iter().collect(),
            other => vec![other],
        }
    }

    /// Downcast the wrapped failure cause
    pub fn downcast_ref<E: Error + 'static>(&self) -> Option<&E> {
        match self {
            FutureError::Failed(cause) => cause.downcast_ref::<E>(),
            _ => None,
        }
    }
}

impl fmt::Display for FutureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FutureError::Failed(cause) => write!(f, "{}", cause),
            FutureError::ActorClosed => write!(f, "actor is closed"),
            FutureError::Abandoned => write!(f, "future was abandoned before completion"),
            FutureError::Aggregated { errors, total } => {
                write!(f, "{} of {} futures failed", errors.len(), total)?;
                for error in errors {
                    write!(f, "; {}", error)?;
                }
                Ok(())
            }
        }
    }
}

impl Error for FutureError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            FutureError::Failed(cause) => Some(cause.as_ref()),
            FutureError::Aggregated { errors, .. } => {
                errors.first().map(|e| e as &(dyn Error + 'static))
            }
            _ => None,
        }
    }
}

#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Error for Message {}

type Callback<T> = Box<dyn FnOnce(&Result<T, FutureError>) + Send>;

struct Inner<T> {
    result: Option<Result<T, FutureError>>,
    callbacks: Vec<Callback<T>>,
    wakers: Vec<Waker>,
}

/// A value that becomes available later, completed by exactly one producer
pub struct ActorFuture<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for ActorFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for ActorFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let done = self.lock().result.is_some();
        f.debug_struct("ActorFuture").field("done", &done).finish()
    }
}

impl<T: Clone + Send + 'static> Default for ActorFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ActorFuture<T> {
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone + Send + 'static> ActorFuture<T> {
    /// Create a pending future
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                result: None,
                callbacks: Vec::new(),
                wakers: Vec::new(),
            })),
        }
    }

    /// Create a future that is already completed with `value`
    pub fn completed(value: T) -> Self {
        let future = Self::new();
        future.complete(value);
        future
    }

    /// Create a future that is already failed with `error`
    pub fn failed(error: FutureError) -> Self {
        let future = Self::new();
        future.fail(error);
        future
    }

    /// Complete with a value. Returns false if the future was already done.
    pub fn complete(&self, value: T) -> bool {
        self.finish(Ok(value))
    }

    /// Complete with an error. Returns false if the future was already done.
    pub fn fail(&self, error: FutureError) -> bool {
        self.finish(Err(error))
    }

    /// Complete with either outcome
    pub fn finish(&self, result: Result<T, FutureError>) -> bool {
        let (callbacks, wakers) = {
            let mut inner = self.lock();
            if inner.result.is_some() {
                return false;
            }
            inner.result = Some(result.clone());
            (
                std::mem::take(&mut inner.callbacks),
                std::mem::take(&mut inner.wakers),
            )
        };

        for callback in callbacks {
            callback(&result);
        }
        for waker in wakers {
            waker.wake();
        }
        true
    }

    pub fn is_done(&self) -> bool {
        self.lock().result.is_some()
    }

    /// The outcome, if the future is done
    pub fn try_result(&self) -> Option<Result<T, FutureError>> {
        self.lock().result.clone()
    }

    /// Register a callback invoked once the future is done.
    ///
    /// Runs immediately on the caller's thread when already done.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&Result<T, FutureError>) + Send + 'static,
    {
        let done = {
            let mut inner = self.lock();
            match &inner.result {
                Some(result) => Some(result.clone()),
                None => {
                    inner.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };

        if let Some(result) = done {
            callback(&result);
        }
    }

    /// Transform the value once available
    pub fn map<U, F>(&self, f: F) -> ActorFuture<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let mapped = ActorFuture::new();
        let target = mapped.clone();
        self.on_complete(move |result| {
            target.finish(result.clone().map(f));
        });
        mapped
    }

    /// Chain another asynchronous step once the value is available
    pub fn then<U, F>(&self, f: F) -> ActorFuture<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> ActorFuture<U> + Send + 'static,
    {
        let chained = ActorFuture::new();
        let target = chained.clone();
        self.on_complete(move |result| match result {
            Ok(value) => {
                let next = f(value.clone());
                next.on_complete(move |inner| {
                    target.finish(inner.clone());
                });
            }
            Err(error) => {
                target.fail(error.clone());
            }
        });
        chained
    }
}

impl<T: Clone + Send + 'static> Future for ActorFuture<T> {
    type Output = Result<T, FutureError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.lock();
        match &inner.result {
            Some(result) => Poll::Ready(result.clone()),
            None => {
                if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    inner.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

struct Collector<T> {
    values: Vec<Option<T>>,
    errors: Vec<(usize, FutureError)>,
    remaining: usize,
}

/// Aggregate futures into one that yields all values in input order.
///
/// If any future fails, the aggregate fails with every individual error
/// attached once all inputs are done. Inputs are never cancelled.
pub fn collect<T>(futures: Vec<ActorFuture<T>>) -> ActorFuture<Vec<T>>
where
    T: Clone + Send + 'static,
{
    let aggregate = ActorFuture::new();
    let total = futures.len();
    if total == 0 {
        aggregate.complete(Vec::new());
        return aggregate;
    }

    let collector = Arc::new(Mutex::new(Collector {
        values: vec![None; total],
        errors: Vec::new(),
        remaining: total,
    }));

    for (position, future) in futures.into_iter().enumerate() {
        let collector = collector.clone();
        let aggregate = aggregate.clone();
        future.on_complete(move |result| {
            let finished = {
                let mut state = collector.lock().unwrap_or_else(PoisonError::into_inner);
                match result {
                    Ok(value) => state.values[position] = Some(value.clone()),
                    Err(error) => state.errors.push((position, error.clone())),
                }
                state.remaining -= 1;
                if state.remaining == 0 {
                    Some((
                        std::mem::take(&mut state.values),
                        std::mem::take(&mut state.errors),
                    ))
                } else {
                    None
                }
            };

            if let Some((values, mut errors)) = finished {
                if errors.is_empty() {
                    aggregate.complete(values.into_iter().flatten().collect());
                } else {
                    errors.sort_by_key(|(position, _)| *position);
                    aggregate.fail(FutureError::Aggregated {
                        errors: errors.into_iter().map(|(_, e)| e).collect(),
                        total,
                    });
                }
            }
        });
    }

    aggregate
}
