//! Time-ordered task scheduler (C1). A single `BTreeMap<i64, Task>` keyed by
//! absolute nanosecond timestamp, driving heartbeats, per-item inspection
//! timeouts and deferred reconnect/relogin attempts. Grounded on
//! `original_source/timetree.go`'s red-black tree + single timer design.

use inspectgw_common::time::timestamp_nanos;
use std::collections::BTreeMap;
use std::panic;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// What a fired task represents. `Deferred` carries an arbitrary thunk —
/// used for reconnect/relogin callbacks, matching the Go source's
/// `Function` task type wrapping a closure.
pub enum Task {
    Heartbeat(usize),
    InspectTimeout(u64),
    Deferred(Box<dyn FnOnce() + Send>),
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Task::Heartbeat(index) => write!(f, "Heartbeat({})", index),
            Task::InspectTimeout(asset) => write!(f, "InspectTimeout({})", asset),
            Task::Deferred(_) => write!(f, "Deferred(..)"),
        }
    }
}

struct Inner {
    tasks: BTreeMap<i64, Task>,
    stopped: bool,
}

/// Handle to the running scheduler loop. Dropping this does not stop the
/// loop — call `stop()` explicitly, matching the teacher's graceful-stop
/// pattern elsewhere (the endpoint's poll loops are long-lived by design).
pub struct Scheduler {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

struct Shared {
    inner: Mutex<Inner>,
    cv: Condvar,
}

impl Scheduler {
    /// Spawns the scheduler loop on a dedicated thread. `on_fire` is called
    /// for every task whose timestamp has elapsed, along with the
    /// nanosecond key it fired at (heartbeats compare this against
    /// `HeartbeatMap` to detect a stale, superseded firing); it must be
    /// re-entrant with respect to `insert`/`remove`, since heartbeats
    /// reschedule themselves from inside the callback (§4.1).
    pub fn spawn<F>(on_fire: F) -> Scheduler
    where
        F: Fn(i64, Task) + Send + Sync + 'static,
    {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                tasks: BTreeMap::new(),
                stopped: false,
            }),
            cv: Condvar::new(),
        });

        let loop_shared = Arc::clone(&shared);
        let worker = thread::spawn(move || run_loop(loop_shared, on_fire));

        Scheduler {
            shared,
            worker: Some(worker),
        }
    }

    /// Inserts a task at `time_ns`, bumping the timestamp by 1ns on
    /// collision until a free slot is found (§4.1, §3's Scheduler Task
    /// invariant: all live tasks have distinct firing times). Returns the
    /// timestamp the task actually landed on, which the caller must use as
    /// the cancellation key (heartbeats track this in `HeartbeatMap`).
    pub fn insert(&self, mut time_ns: i64, task: Task) -> i64 {
        let mut guard = self.shared.inner.lock().unwrap();
        while guard.tasks.contains_key(&time_ns) {
            time_ns += 1;
        }
        guard.tasks.insert(time_ns, task);
        drop(guard);
        self.shared.cv.notify_all();
        time_ns
    }

    /// Removes the task scheduled at `time_ns`, if any. No-op if absent —
    /// the task may have already fired.
    pub fn remove(&self, time_ns: i64) -> bool {
        let mut guard = self.shared.inner.lock().unwrap();
        let removed = guard.tasks.remove(&time_ns).is_some();
        drop(guard);
        if removed {
            self.shared.cv.notify_all();
        }
        removed
    }

    /// Stops the loop without firing pending tasks (§4.1's graceful stop).
    pub fn stop(&mut self) {
        {
            let mut guard = self.shared.inner.lock().unwrap();
            guard.stopped = true;
        }
        self.shared.cv.notify_all();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
        }
    }
}

fn run_loop<F>(shared: Arc<Shared>, on_fire: F)
where
    F: Fn(i64, Task),
{
    loop {
        let mut guard = shared.inner.lock().unwrap();

        loop {
            if guard.stopped {
                return;
            }

            match guard.tasks.keys().next().copied() {
                None => {
                    guard = shared.cv.wait(guard).unwrap();
                    continue;
                }
                Some(next_time) => {
                    let now = timestamp_nanos();
                    if next_time > now {
                        let wait_for = Duration::from_nanos((next_time - now) as u64);
                        let (g, _timeout) = shared.cv.wait_timeout(guard, wait_for).unwrap();
                        guard = g;
                        continue;
                    }

                    // Fire this task. Release the lock across the callback
                    // so it may itself call insert()/remove() (heartbeats
                    // reschedule themselves) without self-deadlocking.
                    let task = guard.tasks.remove(&next_time).unwrap();
                    drop(guard);

                    // A panicking callback must not poison the scheduler or
                    // stop the loop from advancing past the fired task.
                    let _ = panic::catch_unwind(panic::AssertUnwindSafe(|| on_fire(next_time, task)));

                    guard = shared.inner.lock().unwrap();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration as StdDuration;

    #[test]
    fn fires_deferred_task_after_its_time() {
        let (tx, rx) = mpsc::channel();
        let sched = Scheduler::spawn(move |_fired_at, task| {
            if let Task::Deferred(thunk) = task {
                thunk();
            }
        });

        let now = timestamp_nanos();
        sched.insert(
            now + StdDuration::from_millis(20).as_nanos() as i64,
            Task::Deferred(Box::new(move || {
                let _ = tx.send(());
            })),
        );

        rx.recv_timeout(StdDuration::from_secs(2))
            .expect("task should fire");
    }

    #[test]
    fn colliding_timestamps_are_bumped_to_stay_unique() {
        let sched = Scheduler::spawn(|_fired_at, _task| {});
        let now = timestamp_nanos() + StdDuration::from_secs(10).as_nanos() as i64;

        let t1 = sched.insert(now, Task::Heartbeat(0));
        let t2 = sched.insert(now, Task::Heartbeat(1));
        assert_ne!(t1, t2);
        assert_eq!(t2, t1 + 1);
    }

    #[test]
    fn remove_is_a_noop_when_absent() {
        let sched = Scheduler::spawn(|_fired_at, _task| {});
        assert!(!sched.remove(123456789));
    }

    #[test]
    fn reentrant_reschedule_from_callback_does_not_deadlock() {
        let (tx, rx) = mpsc::channel();
        let sched = Arc::new(Mutex::new(None::<Scheduler>));
        let sched_for_cb = Arc::clone(&sched);
        let fired = Arc::new(Mutex::new(0u32));
        let fired_cb = Arc::clone(&fired);

        let inner = Scheduler::spawn(move |_fired_at, _task| {
            let mut count = fired_cb.lock().unwrap();
            *count += 1;
            if *count < 3 {
                if let Some(s) = sched_for_cb.lock().unwrap().as_ref() {
                    s.insert(timestamp_nanos(), Task::Heartbeat(0));
                }
            } else {
                let _ = tx.send(());
            }
        });
        *sched.lock().unwrap() = Some(inner);

        sched
            .lock()
            .unwrap()
            .as_ref()
            .unwrap()
            .insert(timestamp_nanos(), Task::Heartbeat(0));

        rx.recv_timeout(StdDuration::from_secs(2))
            .expect("reentrant reschedule should keep firing");
    }

    #[test]
    fn panicking_callback_does_not_stop_subsequent_tasks() {
        let (tx, rx) = mpsc::channel();
        let sched = Scheduler::spawn(move |_fired_at, task| match task {
            Task::Heartbeat(0) => panic!("boom"),
            Task::Heartbeat(1) => {
                let _ = tx.send(());
            }
            _ => {}
        });

        let now = timestamp_nanos();
        sched.insert(now, Task::Heartbeat(0));
        sched.insert(now + 1, Task::Heartbeat(1));

        rx.recv_timeout(StdDuration::from_secs(2))
            .expect("loop should survive a panicking callback");
    }
}
