use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use futures::future::BoxFuture;
use std::future::Future;
use tokio::sync::{mpsc, oneshot};

type Job = BoxFuture<'static, ()>;

/// The one execution context allowed to touch live targets.
///
/// Jobs run strictly one after another, in submission order, on a single
/// task. Cloning shares that task.
#[derive(Debug, Clone)]
pub struct TargetExecutor {
    jobs: mpsc::UnboundedSender<Job>,
}

impl TargetExecutor {
    /// Starts the executor task on the current runtime. It ends once every
    /// clone has been dropped.
    pub fn spawn() -> Self {
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
            tracing::debug!("target executor stopped");
        });
        Self { jobs }
    }

    /// Runs `work` on the executor and waits for its result.
    pub async fn run<F, T>(&self, work: F) -> Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            _ = tx.send(work.await);
        });
        if self.jobs.send(job).is_err() {
            exn::bail!(ErrorKind::Executor);
        }
        rx.await.or_raise(|| ErrorKind::Executor)
    }
}
