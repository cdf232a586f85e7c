//! Inspect dispatcher (C7). Grounded on `original_source/inspect.go` and
//! `inspect_handler.go`'s admission/fan-out/correlation/timeout split.

use crate::model::{InspectTask, Item, Request};
use crate::scheduler::{Scheduler, Task};
use inspectgw_common::time::timestamp_nanos;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const PER_BOT_RATE_LIMIT: Duration = Duration::from_millis(1100);
const INSPECT_TIMEOUT: Duration = Duration::from_secs(2);

/// The narrow view the dispatcher needs of the bot fleet: whether a bot can
/// currently take an inspection and how to attempt handing it one. The
/// session layer implements this over the real `Fleet`; tests implement it
/// over an in-memory fake.
pub trait FleetSink: Send + Sync {
    fn len(&self) -> usize;
    fn can_inspect(&self, index: usize) -> bool;
    fn last_inspect(&self, index: usize) -> Option<Instant>;
    fn mark_inspect_sent(&self, index: usize, when: Instant);

    /// Attempts to write the inspection request for `items` to bot
    /// `index`. `Err(())` means the send failed; the dispatcher rolls back
    /// its correlation entry, hands the bot to the error path, and tries
    /// the next candidate for the same item.
    fn send_inspect(&self, index: usize, items: &[Item]) -> Result<(), ()>;

    /// Routes `index` to the error path (§4.5), off the fan-out thread.
    fn schedule_error(&self, index: usize);
}

struct Admission {
    inflight: u32,
    cap: u32,
}

pub struct Dispatcher {
    admission: Mutex<Admission>,
    correlation: Mutex<HashMap<u64, Arc<InspectTask>>>,
    cursor: AtomicUsize,
    batch_tx: SyncSender<Arc<InspectTask>>,
    fleet: Arc<dyn FleetSink>,
    scheduler: Arc<Scheduler>,
}

impl Dispatcher {
    /// `cap` bounds total in-flight items. `scheduler` must be the same
    /// scheduler whose `on_fire` routes `Task::InspectTimeout` back to
    /// `Dispatcher::on_timeout`.
    pub fn new(cap: u32, fleet: Arc<dyn FleetSink>, scheduler: Arc<Scheduler>) -> Arc<Dispatcher> {
        let (batch_tx, batch_rx) = sync_channel(cap as usize);
        let dispatcher = Arc::new(Dispatcher {
            admission: Mutex::new(Admission { inflight: 0, cap }),
            correlation: Mutex::new(HashMap::new()),
            cursor: AtomicUsize::new(0),
            batch_tx,
            fleet,
            scheduler,
        });

        let worker = Arc::clone(&dispatcher);
        thread::spawn(move || worker.fan_out_loop(batch_rx));

        dispatcher
    }

    /// Admits as much of `request` as remaining capacity allows. Returns
    /// the accepted item count and, if any items were accepted, the task
    /// handle plus its one-shot completion receiver.
    pub fn inspect(&self, mut request: Request) -> (u32, Option<(Arc<InspectTask>, Receiver<()>)>) {
        let mut admission = self.admission.lock().unwrap();
        let space = admission.cap.saturating_sub(admission.inflight);
        if space == 0 {
            return (0, None);
        }

        let accepted = (request.items.len() as u32).min(space);
        request.items.truncate(accepted as usize);
        admission.inflight += accepted;
        drop(admission);

        let (task, rx) = InspectTask::new(request.items, request.inventory_id);
        let task = Arc::new(task);
        let _ = self.batch_tx.send(Arc::clone(&task));
        (accepted, Some((task, rx)))
    }

    fn fan_out_loop(&self, batch_rx: Receiver<Arc<InspectTask>>) {
        while let Ok(task) = batch_rx.recv() {
            let item_count = task.snapshot_items().len();
            for item_index in 0..item_count {
                self.dispatch_one_item(&task, item_index);
                let mut admission = self.admission.lock().unwrap();
                admission.inflight = admission.inflight.saturating_sub(1);
            }
        }
    }

    /// Tries up to `len(fleet)` bots, round-robin from the shared cursor,
    /// for the item at `item_index` in `task`.
    fn dispatch_one_item(&self, task: &Arc<InspectTask>, item_index: usize) {
        let fleet_len = self.fleet.len();
        if fleet_len == 0 {
            self.abandon_item(task);
            return;
        }

        let asset = {
            let items = task.snapshot_items();
            items[item_index].asset
        };

        for _ in 0..fleet_len {
            let bot_index = self.cursor.fetch_add(1, Ordering::Relaxed) % fleet_len;

            if !self.fleet.can_inspect(bot_index) {
                continue;
            }

            if let Some(last) = self.fleet.last_inspect(bot_index) {
                let due = last + PER_BOT_RATE_LIMIT;
                let now = Instant::now();
                if due > now {
                    thread::sleep(due - now);
                }
                if !self.fleet.can_inspect(bot_index) {
                    continue;
                }
            }

            let now = Instant::now();
            task.with_item_mut(asset, |item| item.dispatched_at = Some(now));
            self.fleet.mark_inspect_sent(bot_index, now);

            if !self.insert_correlation(asset, task) {
                // Another batch already owns this asset id; this item is
                // not ours to dispatch.
                self.finish_item(task);
                return;
            }

            let single_item = vec![task.snapshot_items()[item_index].clone()];
            match self.fleet.send_inspect(bot_index, &single_item) {
                Ok(()) => {
                    self.schedule_timeout(asset);
                    return;
                }
                Err(()) => {
                    self.remove_correlation(asset);
                    self.fleet.schedule_error(bot_index);
                    continue;
                }
            }
        }

        // Every candidate bot was tried and failed (or none were eligible).
        self.abandon_item(task);
    }

    fn schedule_timeout(&self, asset: u64) {
        let fire_at = timestamp_nanos() + INSPECT_TIMEOUT.as_nanos() as i64;
        self.scheduler.insert(fire_at, Task::InspectTimeout(asset));
    }

    fn insert_correlation(&self, asset: u64, task: &Arc<InspectTask>) -> bool {
        let mut table = self.correlation.lock().unwrap();
        if table.contains_key(&asset) {
            return false;
        }
        table.insert(asset, Arc::clone(task));
        true
    }

    fn remove_correlation(&self, asset: u64) -> Option<Arc<InspectTask>> {
        self.correlation.lock().unwrap().remove(&asset)
    }

    fn abandon_item(&self, task: &Arc<InspectTask>) {
        self.finish_item(task);
    }

    fn finish_item(&self, task: &Arc<InspectTask>) {
        if task.decrement() {
            task.notify_complete();
        }
    }

    /// Called by the session handler (C6) when an inspection response for
    /// `asset` arrives. A missing entry means the item already timed out;
    /// the late response is discarded.
    pub fn on_response(
        &self,
        asset: u64,
        wear: Option<f32>,
        seed: Option<u16>,
        stickers: Vec<crate::model::Sticker>,
        keychain: Option<crate::model::Keychain>,
    ) {
        let task = match self.remove_correlation(asset) {
            Some(task) => task,
            None => return,
        };

        task.with_item_mut(asset, |item| {
            item.wear = wear;
            item.seed = seed;
            item.stickers = stickers;
            item.keychain = keychain;
        });

        self.finish_item(&task);
    }

    /// Called by the scheduler when an `InspectTimeout(asset)` task fires.
    pub fn on_timeout(&self, asset: u64) {
        if let Some(task) = self.remove_correlation(asset) {
            self.finish_item(&task);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Item;
    use std::sync::Mutex as StdMutex;

    struct FakeFleet {
        statuses: Vec<Mutex<bool>>,
        sent: StdMutex<Vec<(usize, u64)>>,
        fail_once: StdMutex<bool>,
    }

    impl FakeFleet {
        fn new(n: usize) -> FakeFleet {
            FakeFleet {
                statuses: (0..n).map(|_| Mutex::new(true)).collect(),
                sent: StdMutex::new(Vec::new()),
                fail_once: StdMutex::new(false),
            }
        }
    }

    impl FleetSink for FakeFleet {
        fn len(&self) -> usize {
            self.statuses.len()
        }
        fn can_inspect(&self, index: usize) -> bool {
            *self.statuses[index].lock().unwrap()
        }
        fn last_inspect(&self, _index: usize) -> Option<Instant> {
            None
        }
        fn mark_inspect_sent(&self, _index: usize, _when: Instant) {}
        fn send_inspect(&self, index: usize, items: &[Item]) -> Result<(), ()> {
            let mut fail_once = self.fail_once.lock().unwrap();
            if *fail_once {
                *fail_once = false;
                return Err(());
            }
            self.sent.lock().unwrap().push((index, items[0].asset));
            Ok(())
        }
        fn schedule_error(&self, _index: usize) {}
    }

    fn test_scheduler() -> Arc<Scheduler> {
        Arc::new(Scheduler::spawn(|_fired_at, _task| {}))
    }

    #[test]
    fn admission_refuses_once_capacity_is_exhausted() {
        let fleet = Arc::new(FakeFleet::new(1));
        let dispatcher = Dispatcher::new(1, fleet, test_scheduler());

        let items = vec![Item::new(0, 1, 0, 0), Item::new(0, 2, 0, 0)];
        let (accepted, handle) = dispatcher.inspect(Request {
            items,
            inventory_id: None,
        });
        assert_eq!(accepted, 1);
        assert!(handle.is_some());
    }

    #[test]
    fn full_queue_returns_zero_and_no_handle() {
        let fleet = Arc::new(FakeFleet::new(1));
        let dispatcher = Dispatcher::new(0, fleet, test_scheduler());

        let (accepted, handle) = dispatcher.inspect(Request {
            items: vec![Item::new(0, 1, 0, 0)],
            inventory_id: None,
        });
        assert_eq!(accepted, 0);
        assert!(handle.is_none());
    }

    #[test]
    fn completion_fires_once_last_item_resolves() {
        let fleet = Arc::new(FakeFleet::new(2));
        let dispatcher = Dispatcher::new(4, fleet, test_scheduler());

        let (accepted, handle) = dispatcher.inspect(Request {
            items: vec![Item::new(0, 42, 0, 0)],
            inventory_id: None,
        });
        assert_eq!(accepted, 1);
        let (_task, rx) = handle.unwrap();

        // Give the fan-out thread a moment to dispatch and correlate.
        thread::sleep(Duration::from_millis(50));
        dispatcher.on_response(42, Some(0.1), Some(7), vec![], None);

        rx.recv_timeout(Duration::from_secs(1))
            .expect("completion should fire once the only item resolves");
    }

    #[test]
    fn timeout_completes_batch_when_response_never_arrives() {
        let fleet = Arc::new(FakeFleet::new(1));
        let dispatcher = Dispatcher::new(4, fleet, test_scheduler());

        let (_accepted, handle) = dispatcher.inspect(Request {
            items: vec![Item::new(0, 99, 0, 0)],
            inventory_id: None,
        });
        let (_task, rx) = handle.unwrap();

        thread::sleep(Duration::from_millis(50));
        dispatcher.on_timeout(99);

        rx.recv_timeout(Duration::from_secs(1))
            .expect("completion should fire on timeout");
    }

    #[test]
    fn late_response_after_timeout_is_discarded_without_panicking() {
        let fleet = Arc::new(FakeFleet::new(1));
        let dispatcher = Dispatcher::new(4, fleet, test_scheduler());

        let (_accepted, handle) = dispatcher.inspect(Request {
            items: vec![Item::new(0, 7, 0, 0)],
            inventory_id: None,
        });
        let (_task, rx) = handle.unwrap();

        thread::sleep(Duration::from_millis(50));
        dispatcher.on_timeout(7);
        rx.recv_timeout(Duration::from_secs(1)).unwrap();

        // The late response shows up after the batch is already complete.
        dispatcher.on_response(7, Some(0.2), None, vec![], None);
    }
}
