use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, TryRecvError};

/// Why a task produced no value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("task panicked: {0}")]
    Panicked(String),
    #[error("task cancelled before it started")]
    Cancelled,
    #[error("task result channel closed")]
    Lost,
}

/// Completion handle for a submitted job.
pub struct TaskHandle<T> {
    rx: Receiver<Result<T, TaskError>>,
    cancelled: Arc<AtomicBool>,
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("cancelled", &self.cancelled.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T> TaskHandle<T> {
    /// The result, if the job has finished. Never blocks.
    pub fn try_take(&self) -> Option<Result<T, TaskError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(TaskError::Lost)),
        }
    }

    /// Block until the job finishes.
    pub fn wait(self) -> Result<T, TaskError> {
        self.rx.recv().unwrap_or(Err(TaskError::Lost))
    }

    /// Ask the job not to start. A job already running completes normally.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Runs generation and meshing jobs off the scheduler thread.
///
/// Jobs own their inputs; results come back through per-job channels. A
/// panic is caught and reported as [`TaskError::Panicked`] for that job only.
pub struct WorkerPool {
    pool: Option<rayon::ThreadPool>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.threads())
            .finish()
    }
}

impl WorkerPool {
    /// Thread pool with `threads` workers; 0 picks from available cores.
    pub fn new(threads: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("voxel-worker-{i}"))
            .build()?;
        tracing::debug!(threads = pool.current_num_threads(), "worker pool started");
        Ok(Self { pool: Some(pool) })
    }

    /// Run every job synchronously on the submitting thread.
    pub fn inline() -> Self {
        Self { pool: None }
    }

    pub fn is_inline(&self) -> bool {
        self.pool.is_none()
    }

    /// Worker thread count; 0 in inline mode.
    pub fn threads(&self) -> usize {
        self.pool.as_ref().map_or(0, rayon::ThreadPool::current_num_threads)
    }

    pub fn submit<T, F>(&self, job: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let run = move || {
            if flag.load(Ordering::Relaxed) {
                let _ = tx.send(Err(TaskError::Cancelled));
                return;
            }
            let result = catch_unwind(AssertUnwindSafe(job))
                .map_err(|payload| TaskError::Panicked(panic_message(payload.as_ref())));
            let _ = tx.send(result);
        };
        match &self.pool {
            Some(pool) => pool.spawn(run),
            None => run(),
        }
        TaskHandle { rx, cancelled }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
