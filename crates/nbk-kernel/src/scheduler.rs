//! Single-flight operation scheduler shared by a kernel tree.
//!
//! At most one operation runs at a time. An operation submitted while the scheduler is
//! idle starts right away unless the trampoline predicate flags it; everything else is
//! queued and drained in FIFO order by a background task.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{Notify, oneshot};
use tracing::debug;

use crate::error::KernelError;
use crate::lock;

type Executor<T> = Box<dyn FnOnce(T) -> BoxFuture<'static, Result<(), KernelError>> + Send>;
type Completion = oneshot::Sender<Result<(), KernelError>>;
type TrampolinePredicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

struct Operation<T> {
    id: u64,
    value: T,
    executor: Executor<T>,
    completion: Completion,
}

struct InFlight {
    id: u64,
    completion: Option<Completion>,
}

struct State<T> {
    queue: VecDeque<Operation<T>>,
    in_flight: Option<InFlight>,
    draining: bool,
    must_trampoline: Option<TrampolinePredicate<T>>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    settled: Notify,
    next_id: AtomicU64,
}

pub struct KernelScheduler<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for KernelScheduler<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Default for KernelScheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

enum Next<T> {
    Run(u64, T, Executor<T>),
    Wait,
    Done,
}

impl<T: Send + 'static> KernelScheduler<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    in_flight: None,
                    draining: false,
                    must_trampoline: None,
                }),
                settled: Notify::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Values matching `predicate` always go through the queue, even when idle.
    pub fn set_must_trampoline(&self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) {
        lock(&self.inner.state).must_trampoline = Some(Arc::new(predicate));
    }

    /// Submits an operation. Scheduling happens before this returns; the returned
    /// future only waits for the operation to settle and may be dropped.
    pub fn run_async<F, Fut>(
        &self,
        value: T,
        executor: F,
    ) -> BoxFuture<'static, Result<(), KernelError>>
    where
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), KernelError>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let executor: Executor<T> = Box::new(move |value| executor(value).boxed());

        let mut state = lock(&self.inner.state);
        let trampoline = state
            .must_trampoline
            .as_ref()
            .is_some_and(|predicate| predicate(&value));
        if state.in_flight.is_none() && state.queue.is_empty() && !trampoline {
            state.in_flight = Some(InFlight {
                id,
                completion: Some(tx),
            });
            drop(state);
            debug!(operation = id, "running operation immediately");
            let inner = self.inner.clone();
            tokio::spawn(run_operation(inner, id, executor(value)));
        } else {
            state.queue.push_back(Operation {
                id,
                value,
                executor,
                completion: tx,
            });
            debug!(operation = id, queued = state.queue.len(), "queued operation");
            if !state.draining {
                state.draining = true;
                drop(state);
                tokio::spawn(drain(self.inner.clone()));
            }
        }

        async move { rx.await.unwrap_or(Err(KernelError::OperationDropped)) }.boxed()
    }

    /// Settles the in-flight operation's completion with [`KernelError::Cancelled`].
    /// The executor keeps running; the next queued operation still waits for it.
    pub fn cancel_current_operation(&self) {
        let completion = lock(&self.inner.state)
            .in_flight
            .as_mut()
            .and_then(|in_flight| in_flight.completion.take());
        if let Some(completion) = completion {
            let _ = completion.send(Err(KernelError::Cancelled));
        }
    }

    /// Operations waiting behind the in-flight one.
    pub fn queue_len(&self) -> usize {
        lock(&self.inner.state).queue.len()
    }

    pub fn is_idle(&self) -> bool {
        let state = lock(&self.inner.state);
        state.in_flight.is_none() && state.queue.is_empty()
    }

    /// Waits until nothing is running or queued.
    pub async fn wait_idle(&self) {
        loop {
            let settled = self.inner.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();
            if self.is_idle() {
                return;
            }
            settled.await;
        }
    }
}

async fn run_operation<T>(
    inner: Arc<Inner<T>>,
    id: u64,
    operation: BoxFuture<'static, Result<(), KernelError>>,
) {
    let result = AssertUnwindSafe(operation)
        .catch_unwind()
        .await
        .unwrap_or(Err(KernelError::ExecutorPanicked));
    let completion = {
        let mut state = lock(&inner.state);
        match state.in_flight.take() {
            Some(in_flight) if in_flight.id == id => in_flight.completion,
            other => {
                state.in_flight = other;
                None
            }
        }
    };
    inner.settled.notify_waiters();
    if let Some(completion) = completion {
        let _ = completion.send(result);
    }
}

async fn drain<T: Send + 'static>(inner: Arc<Inner<T>>) {
    tokio::task::yield_now().await;
    loop {
        let settled = inner.settled.notified();
        tokio::pin!(settled);
        settled.as_mut().enable();

        let next = {
            let mut state = lock(&inner.state);
            if state.in_flight.is_some() {
                Next::Wait
            } else if let Some(operation) = state.queue.pop_front() {
                state.in_flight = Some(InFlight {
                    id: operation.id,
                    completion: Some(operation.completion),
                });
                Next::Run(operation.id, operation.value, operation.executor)
            } else {
                state.draining = false;
                Next::Done
            }
        };

        match next {
            Next::Wait => settled.await,
            Next::Done => {
                inner.settled.notify_waiters();
                return;
            }
            Next::Run(id, value, executor) => {
                debug!(operation = id, "running queued operation");
                run_operation(inner.clone(), id, executor(value)).await;
                tokio::task::yield_now().await;
            }
        }
    }
}
