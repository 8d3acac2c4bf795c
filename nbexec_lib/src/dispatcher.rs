use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex as StdMutex, PoisonError},
};

use nbexec_shared::ExecutionResult;
use thiserror::Error;
use tokio::{
    sync::{AcquireError, Mutex, OwnedMutexGuard, Semaphore},
    task::JoinError,
};
use tracing::{error, info, instrument};

use crate::{
    job::StagedJob,
    stager::Stager,
    strategy::{Strategies, StrategyKind},
};

pub const DEFAULT_POOL_SIZE: usize = 16;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("worker pool closed")]
    Closed(#[from] AcquireError),
    #[error("worker task failed: {0}")]
    Task(#[from] JoinError),
}

/// Fixed number of slots jobs run in, excess work waits for a free slot.
#[derive(Clone, Debug)]
pub struct WorkerPool {
    size: usize,
    slots: Arc<Semaphore>,
}

impl WorkerPool {
    /// a size of zero is raised to one
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            slots: Arc::new(Semaphore::new(size)),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// number of currently free slots
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// waits for a free slot, then runs the future on its own task
    /// the slot is held until the future completes, even if the caller stops waiting
    pub async fn run<F, T>(&self, work: F) -> Result<T, PoolError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self.slots.clone().acquire_owned().await?;
        let handle = tokio::spawn(async move {
            let _permit = permit;
            work.await
        });
        Ok(handle.await?)
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE)
    }
}

type LockMap = HashMap<String, Arc<Mutex<()>>>;

/// Serializes executions of the same job id, they would share one workspace.
#[derive(Clone, Debug, Default)]
pub struct JobLocks {
    inflight: Arc<StdMutex<LockMap>>,
}

impl JobLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// waits until no other execution of `job_id` is in flight
    pub async fn lock(&self, job_id: &str) -> JobLockGuard {
        let lock = {
            let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            inflight
                .entry(job_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let guard = lock.lock_owned().await;
        JobLockGuard {
            job_id: job_id.to_string(),
            guard: Some(guard),
            inflight: self.inflight.clone(),
        }
    }

    /// number of job ids with an execution in flight or waiting
    pub fn len(&self) -> usize {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub struct JobLockGuard {
    job_id: String,
    guard: Option<OwnedMutexGuard<()>>,
    inflight: Arc<StdMutex<LockMap>>,
}

impl Drop for JobLockGuard {
    fn drop(&mut self) {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        drop(self.guard.take());
        // only the map still references the lock: nobody holds or waits for it
        let unused = inflight
            .get(&self.job_id)
            .map(|lock| Arc::strong_count(lock) == 1)
            .unwrap_or(false);
        if unused {
            inflight.remove(&self.job_id);
        }
    }
}

/// Stages jobs, picks their execution strategy and runs them on the worker pool.
pub struct Dispatcher {
    stager: Stager,
    strategies: Strategies,
    pool: WorkerPool,
    locks: JobLocks,
}

impl Dispatcher {
    pub fn new(stager: Stager, strategies: Strategies, pool: WorkerPool) -> Self {
        Self {
            stager,
            strategies,
            pool,
            locks: JobLocks::new(),
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn locks(&self) -> &JobLocks {
        &self.locks
    }

    /// executes a job from scratch and returns its result
    /// never fails, every fault ends up as an internal error result
    #[instrument(skip(self))]
    pub async fn execute(&self, job_id: &str) -> ExecutionResult {
        let inflight = self.locks.lock(job_id).await;
        info!("try to execute job");
        let StagedJob { context, workspace } = match self.stager.stage(job_id).await {
            Ok(staged) => staged,
            Err(err) => {
                error!("staging failed: {}", err);
                return ExecutionResult::internal_error(err);
            }
        };

        let kind = StrategyKind::for_entry(context.entry_script());
        if let StrategyKind::Unsupported(_) = kind {
            return self.strategies.execute(kind, &context, workspace).await;
        }

        let strategies = self.strategies.clone();
        // the job id stays locked until the work finishes, even if our caller goes away
        let work = async move {
            let _inflight = inflight;
            strategies.execute(kind, &context, workspace).await
        };
        match self.pool.run(work).await {
            Ok(result) => result,
            Err(err) => {
                // a panicking strategy drops its workspace guard, which removes the directory
                error!("execution failed: {}", err);
                ExecutionResult::internal_error(err)
            }
        }
    }
}
