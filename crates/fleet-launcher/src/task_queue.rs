//! Serialized, rate-limited provider API dispatcher.
//!
//! Every call a provider makes against its upstream API goes through one
//! queue per provider. A single worker task dispatches queued tasks in FIFO
//! order, one at a time, spacing dispatch starts at least `interval` apart.
//! Each submitter awaits only its own task's result.
//!
//! ```text
//! submit() ──► mpsc ──► worker: wait(rate) ─► spawn(task) ─► await ─► next
//!    ▲                                              │
//!    └──────────────── oneshot result ◄─────────────┘
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::error::{LauncherError, LauncherResult};
use crate::rate_limit::RateLimiter;

type Job = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

struct QueuedTask {
    name: String,
    job: Job,
}

enum Message {
    Run(QueuedTask),
    Stop,
}

pub struct ProviderTaskQueue {
    name: String,
    interval: Duration,
    tx: mpsc::UnboundedSender<Message>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    running: Arc<AtomicBool>,
    queued: Arc<AtomicUsize>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ProviderTaskQueue {
    pub fn new(name: &str, interval: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name: name.to_string(),
            interval,
            tx,
            rx: Mutex::new(Some(rx)),
            running: Arc::new(AtomicBool::new(true)),
            queued: Arc::new(AtomicUsize::new(0)),
            worker: Mutex::new(None),
        }
    }

    /// Queue allowing `rate` dispatches per second.
    pub fn from_rate(name: &str, rate: f64) -> Self {
        Self::new(name, RateLimiter::from_rate(rate).interval())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tasks submitted but not yet dispatched.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the worker. Must be called inside a tokio runtime; later calls
    /// are no-ops.
    pub fn start(&self) {
        let Some(rx) = self.rx.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return;
        };
        let worker = tokio::spawn(run_worker(
            self.name.clone(),
            self.interval,
            rx,
            Arc::clone(&self.running),
            Arc::clone(&self.queued),
        ));
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(worker);
        info!(queue = %self.name, interval_ms = self.interval.as_millis() as u64, "provider task queue started");
    }

    /// Run `task` on the worker and wait for its result.
    pub async fn submit<T, F, Fut>(&self, name: &str, task: F) -> LauncherResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        if !self.is_running() {
            return Err(LauncherError::QueueStopped(self.name.clone()));
        }

        let (result_tx, result_rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            Box::pin(async move {
                let _ = result_tx.send(task().await);
            })
        });

        self.queued.fetch_add(1, Ordering::SeqCst);
        let message = Message::Run(QueuedTask {
            name: name.to_string(),
            job,
        });
        if self.tx.send(message).is_err() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(LauncherError::QueueStopped(self.name.clone()));
        }

        match result_rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(LauncherError::Provider(e)),
            Err(_) => Err(LauncherError::TaskAborted(name.to_string())),
        }
    }

    /// Stop accepting tasks. The task in flight finishes; queued tasks are
    /// aborted.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        // Never started: dropping the receiver aborts whatever is queued.
        if let Some(rx) = self.rx.lock().unwrap_or_else(PoisonError::into_inner).take() {
            drain(&self.name, rx, &self.queued);
        }
        let _ = self.tx.send(Message::Stop);
        info!(queue = %self.name, "provider task queue stopping");
    }

    /// Wait for the worker to exit.
    pub async fn join(&self) {
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!(queue = %self.name, error = %e, "provider task queue worker failed");
            }
        }
    }
}

impl std::fmt::Debug for ProviderTaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderTaskQueue")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .field("queued", &self.queued())
            .finish()
    }
}

async fn run_worker(
    name: String,
    interval: Duration,
    mut rx: mpsc::UnboundedReceiver<Message>,
    running: Arc<AtomicBool>,
    queued: Arc<AtomicUsize>,
) {
    let mut limiter = RateLimiter::new(interval);
    while let Some(message) = rx.recv().await {
        let task = match message {
            Message::Run(task) => task,
            Message::Stop => break,
        };

        let delay = limiter.wait().await;
        queued.fetch_sub(1, Ordering::SeqCst);
        if !running.load(Ordering::SeqCst) {
            debug!(queue = %name, task = %task.name, "aborting queued task");
            continue;
        }

        limiter.mark();
        let started = Instant::now();
        // Spawned so a panicking task cannot take the worker down.
        if let Err(e) = tokio::spawn((task.job)()).await {
            error!(queue = %name, task = %task.name, error = %e, "provider task panicked");
        }
        debug!(
            queue = %name,
            task = %task.name,
            delay_ms = delay.as_millis() as u64,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "provider task finished"
        );
    }
    drain(&name, rx, &queued);
    info!(queue = %name, "provider task queue stopped");
}

fn drain(name: &str, mut rx: mpsc::UnboundedReceiver<Message>, queued: &AtomicUsize) {
    rx.close();
    while let Ok(message) = rx.try_recv() {
        if let Message::Run(task) = message {
            queued.fetch_sub(1, Ordering::SeqCst);
            debug!(queue = %name, task = %task.name, "aborting queued task");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn dispatches_are_spaced_by_interval() {
        let queue = Arc::new(ProviderTaskQueue::new("cloud", Duration::from_secs(1)));
        queue.start();

        let mut handles = Vec::new();
        for i in 0..4 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                queue
                    .submit(&format!("task-{i}"), || async { Ok(Instant::now()) })
                    .await
                    .unwrap()
            }));
        }
        let mut starts = Vec::new();
        for handle in handles {
            starts.push(handle.await.unwrap());
        }
        starts.sort();
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tasks_do_not_wait_extra() {
        let queue = Arc::new(ProviderTaskQueue::new("cloud", Duration::from_secs(1)));
        queue.start();
        let begin = Instant::now();
        for _ in 0..2 {
            queue
                .submit("slow", || async {
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    Ok(())
                })
                .await
                .unwrap();
        }
        assert_eq!(begin.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test]
    async fn errors_reach_only_their_caller() {
        let queue = ProviderTaskQueue::new("cloud", Duration::ZERO);
        queue.start();
        let failed = queue
            .submit("bad", || async { Err::<(), _>(anyhow::anyhow!("quota exceeded")) })
            .await;
        assert!(matches!(failed, Err(LauncherError::Provider(e)) if e.to_string() == "quota exceeded"));

        let ok = queue.submit("good", || async { Ok(7) }).await.unwrap();
        assert_eq!(ok, 7);
    }

    #[tokio::test]
    async fn panicking_task_does_not_stop_worker() {
        let queue = ProviderTaskQueue::new("cloud", Duration::ZERO);
        queue.start();
        let result = queue
            .submit("boom", || async {
                if true {
                    panic!("provider exploded");
                }
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(LauncherError::TaskAborted(_))));
        assert_eq!(queue.submit("after", || async { Ok(1) }).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stop_finishes_in_flight_and_aborts_queued() {
        let queue = Arc::new(ProviderTaskQueue::new("cloud", Duration::ZERO));
        queue.start();

        let (started_tx, started_rx) = oneshot::channel();
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let in_flight = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue
                    .submit("in-flight", move || async move {
                        let _ = started_tx.send(());
                        let _ = gate_rx.await;
                        Ok("done")
                    })
                    .await
            })
        };
        started_rx.await.unwrap();

        let pending = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.submit("pending", || async { Ok("ran") }).await })
        };
        while queue.queued() != 1 {
            tokio::task::yield_now().await;
        }

        queue.stop();
        gate_tx.send(()).unwrap();

        assert_eq!(in_flight.await.unwrap().unwrap(), "done");
        assert!(matches!(
            pending.await.unwrap(),
            Err(LauncherError::TaskAborted(name)) if name == "pending"
        ));
        queue.join().await;
        assert_eq!(queue.queued(), 0);
    }

    #[tokio::test]
    async fn submit_after_stop_fails() {
        let queue = ProviderTaskQueue::new("cloud", Duration::ZERO);
        queue.start();
        queue.stop();
        queue.join().await;
        assert!(matches!(
            queue.submit("late", || async { Ok(()) }).await,
            Err(LauncherError::QueueStopped(_))
        ));
    }
}
