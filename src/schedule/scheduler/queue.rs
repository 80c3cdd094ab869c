use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::JobError;

/// Unbounded FIFO of job ids shared by all workers.
///
/// Submission never blocks. Workers take turns on the receiver, so each id
/// is handed to exactly one of them. Closing the queue stops both
/// submission and delivery; ids still buffered are never handed out.
pub struct JobQueue {
    tx: StdMutex<Option<mpsc::UnboundedSender<String>>>,
    rx: Mutex<mpsc::UnboundedReceiver<String>>,
    depth: AtomicUsize,
    closed: CancellationToken,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: StdMutex::new(Some(tx)),
            rx: Mutex::new(rx),
            depth: AtomicUsize::new(0),
            closed: CancellationToken::new(),
        }
    }

    pub fn enqueue(&self, job_id: String) -> Result<(), JobError> {
        let tx = self.tx.lock().map_err(|_| JobError::QueueClosed)?;
        let sender = tx.as_ref().ok_or(JobError::QueueClosed)?;
        sender.send(job_id).map_err(|_| JobError::QueueClosed)?;
        self.depth.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Waits for the next job id. `None` once the queue is closed, even if
    /// ids are still buffered.
    pub async fn dequeue(&self) -> Option<String> {
        if self.closed.is_cancelled() {
            return None;
        }
        let mut rx = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return None,
            rx = self.rx.lock() => rx,
        };
        let job_id = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return None,
            job_id = rx.recv() => job_id?,
        };
        self.depth.fetch_sub(1, Ordering::SeqCst);
        Some(job_id)
    }

    /// Stops accepting and handing out jobs. Undelivered ids stay in storage
    /// as pending.
    pub fn close(&self) {
        self.closed.cancel();
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}
