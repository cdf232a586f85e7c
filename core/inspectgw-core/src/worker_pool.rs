//! Bounded worker pool (C2). `poolsize` permanent executors drain a bounded
//! queue; `schedule` is non-blocking while capacity remains and blocking
//! once the queue is full, keeping the readiness loop, scheduler loop and
//! fan-out loop from ever stalling on error-path teardown, heartbeat
//! writes or completion delivery.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    sender: SyncSender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(poolsize: usize, queue_capacity: usize) -> WorkerPool {
        let (sender, receiver) = sync_channel::<Job>(queue_capacity);
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..poolsize)
            .map(|_| {
                let receiver: Arc<Mutex<Receiver<Job>>> = Arc::clone(&receiver);
                thread::spawn(move || loop {
                    let job = {
                        let receiver = receiver.lock().unwrap();
                        receiver.recv()
                    };
                    match job {
                        Ok(job) => job(),
                        Err(_) => return, // Sender dropped, pool shutting down.
                    }
                })
            })
            .collect();

        WorkerPool { sender, workers }
    }

    /// Enqueues `job`. Non-blocking while the queue has free capacity,
    /// blocking once it's full — never drops work.
    pub fn schedule<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // A full queue legitimately blocks the caller (§4.2); the only
        // failure mode is every worker having panicked and the pool being
        // torn down, which we treat as "nothing left to do".
        let _ = self.sender.send(Box::new(job));
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::channel;
    use std::time::Duration;

    #[test]
    fn runs_every_scheduled_job() {
        let pool = WorkerPool::new(4, 16);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..50 {
            let counter = Arc::clone(&counter);
            pool.schedule(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        // Give the pool a moment to drain; dropping it joins all workers.
        drop(pool);
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn jobs_run_off_the_caller_thread() {
        let pool = WorkerPool::new(1, 1);
        let (tx, rx) = channel();
        let caller = thread::current().id();

        pool.schedule(move || {
            let _ = tx.send(thread::current().id());
        });

        let worker_id = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_ne!(worker_id, caller);
    }
}
