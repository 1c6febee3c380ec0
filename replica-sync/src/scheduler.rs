//! Strict FIFO task queue.
//!
//! Every replication step that touches a store or a transport is funneled
//! through a `Scheduler`. Tasks run one at a time on a single tokio worker,
//! in submission order, and the next task starts only after the current one
//! reports completion.
//!
//! ```text
//! add / add_ok / add_async
//!          │
//!          ▼
//!   mpsc (unbounded) ──► worker ──► task ──► done ──► next task
//! ```
//!
//! There is no priority and no cancellation of queued work. A task that
//! holds on to its [`Done`] token forever stalls its queue.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

enum Task {
    /// Completes when the task calls (or drops) its `Done` token.
    Callback(Box<dyn FnOnce(Done) + Send>),
    /// Completes when the future resolves.
    Future(BoxFuture),
}

/// Completion token handed to tasks queued with [`Scheduler::add`].
///
/// Calling [`Done::done`] advances the queue. Dropping the token without
/// calling it advances the queue as well.
#[derive(Debug)]
pub struct Done(oneshot::Sender<()>);

impl Done {
    /// Signal that the task has finished.
    pub fn done(self) {
        let _ = self.0.send(());
    }
}

/// Handle to a FIFO task queue. Clones share the same queue.
#[derive(Clone)]
pub struct Scheduler {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Task>,
    /// Number of queued-or-running tasks.
    pending: Arc<watch::Sender<usize>>,
}

impl Scheduler {
    /// Create a new queue and spawn its worker on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(name: impl Into<String>) -> Self {
        let name: Arc<str> = Arc::from(name.into());
        let (tx, rx) = mpsc::unbounded_channel();
        let (pending, _) = watch::channel(0usize);
        let pending = Arc::new(pending);

        tokio::spawn(Self::run(name.clone(), rx, pending.clone()));

        Self { name, tx, pending }
    }

    /// Queue a task that finishes when it calls [`Done::done`].
    pub fn add<F>(&self, task: F)
    where
        F: FnOnce(Done) + Send + 'static,
    {
        self.submit(Task::Callback(Box::new(task)));
    }

    /// Queue a synchronous task; the queue advances as soon as it returns.
    pub fn add_ok<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.add(move |done| {
            task();
            done.done();
        });
    }

    /// Queue an asynchronous task; the queue advances when the future resolves.
    pub fn add_async<Fut>(&self, task: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.submit(Task::Future(Box::pin(task)));
    }

    /// Resolves once every task submitted before this call has finished.
    pub async fn barrier(&self) {
        let (tx, rx) = oneshot::channel();
        self.add_ok(move || {
            let _ = tx.send(());
        });
        let _ = rx.await;
    }

    /// Resolves once the queue is empty, including tasks queued by tasks.
    pub async fn wait_idle(&self) {
        let mut rx = self.pending.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Number of tasks queued or running.
    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    /// Queue name, used in log output.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self, task: Task) {
        self.pending.send_modify(|n| *n += 1);
        if self.tx.send(task).is_err() {
            self.pending.send_modify(|n| *n = n.saturating_sub(1));
            log::warn!("Scheduler {} has stopped; task dropped", self.name);
        }
    }

    async fn run(
        name: Arc<str>,
        mut rx: mpsc::UnboundedReceiver<Task>,
        pending: Arc<watch::Sender<usize>>,
    ) {
        while let Some(task) = rx.recv().await {
            match task {
                Task::Callback(task) => {
                    let (tx, done) = oneshot::channel();
                    task(Done(tx));
                    if done.await.is_err() {
                        log::trace!("Scheduler {name}: task dropped its completion token");
                    }
                }
                Task::Future(task) => task.await,
            }
            pending.send_modify(|n| *n = n.saturating_sub(1));
        }
        log::trace!("Scheduler {name} closed");
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("pending", &self.pending())
            .finish()
    }
}
