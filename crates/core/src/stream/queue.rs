//! Bounded per-reader work queue.
//!
//! Every reader binding gets its own queue of delivery closures, drained
//! by a dedicated worker thread. A full queue drops the newest item rather
//! than blocking the publisher — one slow reader must never stall another,
//! let alone the publisher's ingress loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread::JoinHandle;

use crate::logging::RateLimiter;

/// One unit of delivery work: invoking a reader's callback with its unit.
/// Boxed so the queue can carry heterogeneous readers without generics
/// leaking into [`super::Stream`].
pub type DeliveryJob = Box<dyn FnOnce() -> Result<(), String> + Send>;

const DEFAULT_DEPTH: usize = 512;

/// A reader's bounded queue plus the worker thread draining it.
pub struct ReaderQueue {
    sender: SyncSender<DeliveryJob>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    overflow_logger: RateLimiter,
}

impl ReaderQueue {
    pub fn new(reader_label: String) -> Self {
        Self::with_depth(reader_label, DEFAULT_DEPTH)
    }

    pub fn with_depth(reader_label: String, depth: usize) -> Self {
        let (sender, receiver): (SyncSender<DeliveryJob>, Receiver<DeliveryJob>) =
            mpsc::sync_channel(depth);
        let running = Arc::new(AtomicBool::new(true));
        let worker_running = running.clone();
        let worker = std::thread::spawn(move || run_worker(receiver, worker_running, reader_label));

        Self {
            sender,
            running,
            worker: Some(worker),
            overflow_logger: RateLimiter::new(std::time::Duration::from_secs(1)),
        }
    }

    /// Non-blocking push. Returns `false` and
    /// logs a rate-limited warning if the queue was full.
    pub fn push(&self, job: DeliveryJob) -> bool {
        match self.sender.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.overflow_logger
                    .run(|| tracing::warn!("write queue full, dropping unit"));
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

fn run_worker(receiver: Receiver<DeliveryJob>, running: Arc<AtomicBool>, reader_label: String) {
    while let Ok(job) = receiver.recv() {
        if let Err(err) = job() {
            tracing::warn!(reader = %reader_label, error = %err, "reader callback returned error, terminating worker");
            break;
        }
    }
    running.store(false, Ordering::Release);
}

impl Drop for ReaderQueue {
    fn drop(&mut self) {
        // Dropping `sender` closes the channel; the worker's `recv` then
        // returns Err and the thread exits on its own.
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn delivers_jobs_in_order() {
        let (tx, rx) = channel::<u32>();
        let queue = ReaderQueue::new("test".to_string());
        for i in 0..5 {
            let tx = tx.clone();
            queue.push(Box::new(move || {
                tx.send(i).unwrap();
                Ok(())
            }));
        }
        drop(tx);
        let mut received = Vec::new();
        while let Ok(v) = rx.recv_timeout(std::time::Duration::from_secs(1)) {
            received.push(v);
        }
        assert_eq!(received, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn full_queue_drops_item() {
        let queue = ReaderQueue::with_depth("test".to_string(), 1);
        // Block the worker so the queue actually fills.
        let (block_tx, block_rx) = channel::<()>();
        queue.push(Box::new(move || {
            block_rx.recv().unwrap();
            Ok(())
        }));
        let accepted = queue.push(Box::new(|| Ok(())));
        let dropped = queue.push(Box::new(|| Ok(())));
        block_tx.send(()).unwrap();
        assert!(accepted);
        assert!(!dropped);
    }

    #[test]
    fn error_terminates_worker() {
        let queue = ReaderQueue::new("test".to_string());
        queue.push(Box::new(|| Err("boom".to_string())));
        // give the worker a moment to process and exit
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!queue.is_running());
    }
}
