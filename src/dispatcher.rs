use crate::error::EvalError;
use crate::job::{JobRequest, JobRunner};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

const RETRY_DELAY: Duration = Duration::from_millis(200);

/// Queue-backed background execution of evaluation jobs.
///
/// Submission (the HTTP request) only enqueues; a fixed pool of workers
/// pulls requests and drives them through the [`JobRunner`]. At-most-once
/// concurrent execution per evaluation id comes from the store's
/// compare-and-set claim: a worker whose claim fails skips the job.
pub struct TaskDispatcher {
    tx: mpsc::Sender<JobRequest>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskDispatcher {
    /// Spawn `workers` background workers sharing one bounded queue
    pub fn start(runner: Arc<JobRunner>, workers: usize, queue_depth: usize) -> Self {
        let (tx, rx) = mpsc::channel::<JobRequest>(queue_depth.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..workers.max(1))
            .map(|worker_id| {
                let rx = rx.clone();
                let runner = runner.clone();
                tokio::spawn(async move {
                    loop {
                        let request = rx.lock().await.recv().await;
                        match request {
                            Some(request) => process(&runner, &request).await,
                            None => break,
                        }
                    }
                    debug!(worker_id, "dispatcher worker exiting");
                })
            })
            .collect();

        Self { tx, workers }
    }

    /// Schedule a job for background execution. Applies backpressure when
    /// the queue is full; fails only when the dispatcher has shut down.
    pub async fn enqueue(&self, request: JobRequest) -> Result<(), EvalError> {
        self.tx
            .send(request)
            .await
            .map_err(|_| EvalError::Dispatch("dispatcher queue is closed".to_string()))
    }

    /// Close the queue and wait for workers to drain in-flight jobs
    pub async fn shutdown(self) {
        drop(self.tx);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

/// One worker's handling of one request: claim with bounded retries, run,
/// and on an unrecoverable fault record the failure on the record
async fn process(runner: &JobRunner, request: &JobRequest) {
    let id = request.evaluation_id;

    let mut attempt = 0u32;
    let claimed = loop {
        match runner.claim(id).await {
            Ok(claimed) => break claimed,
            Err(e) if e.is_retriable() && attempt < request.rate_limit.max_dispatch_retries => {
                attempt += 1;
                warn!(evaluation_id = %id, attempt, "claim failed, retrying: {e}");
                sleep(RETRY_DELAY).await;
            }
            Err(e) => {
                runner.record_failure(id, &e).await;
                return;
            }
        }
    };

    if !claimed {
        debug!(evaluation_id = %id, "not claimable, skipping");
        return;
    }

    let mut attempt = 0u32;
    loop {
        match runner.run_claimed(request).await {
            Ok(()) => return,
            Err(e) if e.is_retriable() && attempt < request.rate_limit.max_dispatch_retries => {
                attempt += 1;
                warn!(evaluation_id = %id, attempt, "job run failed, retrying: {e}");
                sleep(RETRY_DELAY).await;
            }
            Err(e) => {
                runner.record_failure(id, &e).await;
                return;
            }
        }
    }
}
