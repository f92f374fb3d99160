use std::future::Future;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Stop/done pair for a long-running task.
///
/// Stop is a tell, the join is the ack; owners always wait for the ack after
/// telling. The crash bit distinguishes a graceful exit from a panicked or
/// aborted task. Every spawned loop in the agent takes its stop receiver
/// explicitly; there is no global cancellation.
pub struct TaskHandle {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    /// Spawns `f` with a fresh stop receiver. The task should exit promptly
    /// once the receiver observes `true`.
    pub fn spawn<F, Fut>(f: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(f(stop_rx));
        Self { stop, handle }
    }

    /// Tells the task to stop without waiting for it.
    pub fn signal(&self) {
        let _ = self.stop.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the task to exit. Returns `true` if it crashed.
    pub async fn wait(self) -> bool {
        self.handle.await.is_err()
    }

    /// Tell + wait. Returns `true` if the task crashed.
    pub async fn stop(self) -> bool {
        self.signal();
        self.wait().await
    }

    /// Aborts without waiting for a graceful exit. Last resort on shutdown
    /// deadlines.
    pub fn abort(&self) {
        self.handle.abort();
    }
}
