//! Worker scheduling for block fetches and part uploads.
//!
//! Handles default to a shared, process-global runtime whose blocking pool is
//! bounded by `OMNIPATH_MAX_WORKERS`. Passing an explicit worker count opts a
//! handle into a private pool that is torn down on close.
use crate::config::config;
use std::{future::Future, sync::OnceLock};
use tokio::{
    runtime::{Builder, Handle, Runtime},
    task::JoinHandle,
};

fn global_runtime() -> &'static Runtime {
    static RUNTIME: OnceLock<Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| {
        Builder::new_multi_thread()
            .worker_threads(2)
            .max_blocking_threads(config().max_workers)
            .thread_name("omnipath-worker")
            .enable_all()
            .build()
            .expect("failed to start the shared worker runtime")
    })
}

/// Drive a future to completion from synchronous code.
///
/// Safe from plain threads and from blocking-pool workers, which is where
/// every internal caller lives; the runtime's core threads keep driving IO
/// while this thread parks. Calling the synchronous API from inside an async
/// task is not supported and panics with tokio's standard message.
pub(crate) fn block_on<F: Future>(fut: F) -> F::Output {
    match Handle::try_current() {
        Ok(handle) => handle.block_on(fut),
        Err(_) => global_runtime().handle().block_on(fut),
    }
}

pub(crate) struct TaskPool {
    // None means the shared global runtime
    private: Option<Runtime>,
}

impl TaskPool {
    pub fn global() -> Self {
        TaskPool { private: None }
    }

    pub fn with_workers(workers: usize) -> Self {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(workers.max(1))
            .thread_name("omnipath-private-worker")
            .enable_all()
            .build()
            .expect("failed to start a private worker runtime");
        TaskPool {
            private: Some(runtime),
        }
    }

    pub fn from_max_workers(max_workers: Option<usize>) -> Self {
        match max_workers {
            Some(workers) => Self::with_workers(workers),
            None => Self::global(),
        }
    }

    pub fn is_private(&self) -> bool {
        self.private.is_some()
    }

    pub fn spawn_blocking<T>(&self, work: impl FnOnce() -> T + Send + 'static) -> JoinHandle<T>
    where
        T: Send + 'static,
    {
        match &self.private {
            Some(runtime) => runtime.handle().spawn_blocking(work),
            None => global_runtime().handle().spawn_blocking(work),
        }
    }

    /// Tear down a private pool without waiting for queued work. No-op for
    /// the shared pool.
    pub fn shutdown(&mut self) {
        if let Some(runtime) = self.private.take() {
            runtime.shutdown_background();
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn global_pool_runs_blocking_work() {
        let pool = TaskPool::global();
        let handle = pool.spawn_blocking(|| 21 * 2);
        assert_eq!(block_on(handle).unwrap(), 42);
    }

    #[test]
    fn private_pool_survives_shutdown_of_siblings() {
        let mut first = TaskPool::with_workers(1);
        let second = TaskPool::with_workers(1);
        first.shutdown();

        let handle = second.spawn_blocking(|| "still alive");
        assert_eq!(block_on(handle).unwrap(), "still alive");
    }
}
