use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::{FlowError, FlowResult};
use crate::flow_error;
use crate::workers::base::WorkerType;

/// Owns the tasks of every worker of a pipeline.
///
/// Workers may be spawned while the pool is being waited on, e.g. lanes of workflows added
/// by a configuration reload; [`WorkerPool::wait_all`] also waits for those.
#[derive(Debug, Clone, Default)]
pub struct WorkerPool {
    workers: Arc<Mutex<Vec<(WorkerType, JoinHandle<FlowResult<()>>)>>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn spawn<F>(&self, worker_type: WorkerType, future: F)
    where
        F: Future<Output = FlowResult<()>> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        debug!(worker = %worker_type, "spawned worker");

        self.workers.lock().await.push((worker_type, handle));
    }

    /// Number of workers spawned and not yet awaited.
    pub async fn len(&self) -> usize {
        self.workers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workers.lock().await.is_empty()
    }

    /// Waits for every worker to finish and aggregates their errors.
    ///
    /// A panicking worker is reported with the panic kind of its [`WorkerType`].
    pub async fn wait_all(&self) -> FlowResult<()> {
        let mut errors: Vec<FlowError> = Vec::new();

        loop {
            let workers = std::mem::take(&mut *self.workers.lock().await);
            if workers.is_empty() {
                break;
            }

            for (worker_type, handle) in workers {
                match handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        error!(worker = %worker_type, error = %err, "worker failed");
                        errors.push(err);
                    }
                    Err(err) => {
                        error!(worker = %worker_type, error = %err, "worker panicked");
                        errors.push(flow_error!(
                            worker_type.panic_kind(),
                            "Worker panicked",
                            format!("{worker_type}: {err}")
                        ));
                    }
                }
            }
        }

        if errors.is_empty() {
            return Ok(());
        }

        Err(errors.into())
    }
}
