//! Entity shapes (C9): the per-item lookup key/result pair and the batch
//! that groups items sharing one completion signal. Grounded on
//! `original_source/types/msg.go` and `types/attachments.go`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{mpsc, Mutex};
use std::time::Instant;

/// A single applied sticker slot on an inspected item.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Sticker {
    pub id: u32,
    pub wear: Option<f32>,
    pub x: Option<f32>,
    pub y: Option<f32>,
}

/// The (at most one) applied keychain on an inspected item. All fields are
/// required when a keychain is present at all (§6).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keychain {
    pub id: u32,
    pub pattern: u32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// One item lookup, keyed by (scope, asset, owner, moniker). `asset` is the
/// correlation key and must be unique among concurrently in-flight items
/// (§3's Item invariant).
#[derive(Debug, Clone)]
pub struct Item {
    pub scope: u64,
    pub asset: u64,
    pub owner: u64,
    pub moniker: u64,

    pub wear: Option<f32>,
    pub seed: Option<u16>,
    pub stickers: Vec<Sticker>,
    pub keychain: Option<Keychain>,

    /// Timestamp the inspection was dispatched, used for per-item timeout
    /// and for the metrics sink's latency measurement.
    pub dispatched_at: Option<Instant>,
}

impl Item {
    pub fn new(scope: u64, asset: u64, owner: u64, moniker: u64) -> Item {
        Item {
            scope,
            asset,
            owner,
            moniker,
            wear: None,
            seed: None,
            stickers: Vec::new(),
            keychain: None,
            dispatched_at: None,
        }
    }

    /// True once at least one response field has been filled in. Callers
    /// use this (rather than a sentinel) to detect unresolved items per
    /// §7's propagation policy.
    pub fn is_resolved(&self) -> bool {
        self.dispatched_at.is_some() && (self.wear.is_some() || self.seed.is_some())
    }
}

/// A client request: either a whole-inventory lookup (all items share
/// `inventory_id`) or a set of independently scoped items.
pub struct Request {
    pub items: Vec<Item>,
    pub inventory_id: Option<u64>,
}

/// One client request in flight, shared between the caller, the fan-out
/// loop, the correlator and the timeout handler (hence `Arc<InspectTask>`
/// at every call site). `remaining` is the sole coordination point for
/// completion — see §3's invariant: it only ever decreases, and exactly
/// one send on `completion` happens when it reaches zero.
pub struct InspectTask {
    pub inventory_id: Option<u64>,
    items: Mutex<Vec<Item>>,
    remaining: AtomicU32,
    completion_tx: Mutex<Option<mpsc::SyncSender<()>>>,
}

impl InspectTask {
    pub fn new(items: Vec<Item>, inventory_id: Option<u64>) -> (InspectTask, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::sync_channel(1);
        let remaining = items.len() as u32;
        (
            InspectTask {
                inventory_id,
                items: Mutex::new(items),
                remaining: AtomicU32::new(remaining),
                completion_tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Decrements `remaining` by one. Returns true if this call brought it
    /// to zero, in which case the caller must fire the completion signal
    /// exactly once.
    #[must_use]
    pub fn decrement(&self) -> bool {
        // Wrapping-sub semantics mirror the Go source's
        // `atomic.AddUint32(&remaining, ^uint32(0))`; remaining never
        // underflows in practice because every decrement corresponds to an
        // item that was counted exactly once at construction time.
        self.remaining.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn remaining(&self) -> u32 {
        self.remaining.load(Ordering::Acquire)
    }

    /// Sends the one-shot completion notification. A no-op (and logged as a
    /// bug, not a panic) if called more than once.
    pub fn notify_complete(&self) {
        if let Some(tx) = self.completion_tx.lock().unwrap().take() {
            // The receiver may already have given up waiting (its own
            // deadline elapsed) — that's fine, the batch is abandoned
            // either way.
            let _ = tx.try_send(());
        }
    }

    /// Looks up an item by asset id assuming `items` is sorted ascending by
    /// asset id (the caller-maintained invariant for inventory-mode
    /// batches, §4.7), applying `f` to it in place. Falls back to a linear
    /// scan if the binary search misses, e.g. for non-inventory batches
    /// where the ordering invariant doesn't hold. Returns `false` if the
    /// asset isn't part of this batch at all.
    pub fn with_item_mut<F: FnOnce(&mut Item)>(&self, asset: u64, f: F) -> bool {
        let mut items = self.items.lock().unwrap();
        let index = match items.binary_search_by_key(&asset, |item| item.asset) {
            Ok(index) => Some(index),
            Err(_) => items.iter().position(|item| item.asset == asset),
        };
        match index {
            Some(index) => {
                f(&mut items[index]);
                true
            }
            None => false,
        }
    }

    /// A snapshot of the batch's items, for the caller to inspect after the
    /// completion signal fires.
    pub fn snapshot_items(&self) -> Vec<Item> {
        self.items.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decrement_fires_only_on_last_call() {
        let (task, _rx) = InspectTask::new(
            vec![Item::new(0, 1, 0, 0), Item::new(0, 2, 0, 0)],
            None,
        );
        assert!(!task.decrement());
        assert!(task.decrement());
    }

    #[test]
    fn notify_complete_is_idempotent() {
        let (task, rx) = InspectTask::new(vec![Item::new(0, 1, 0, 0)], None);
        task.notify_complete();
        task.notify_complete();
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn with_item_mut_binary_searches_sorted_batches() {
        let (task, _rx) = InspectTask::new(
            vec![Item::new(0, 10, 0, 0), Item::new(0, 20, 0, 0), Item::new(0, 30, 0, 0)],
            None,
        );
        let mut seen_wear = None;
        assert!(task.with_item_mut(20, |item| {
            item.wear = Some(0.5);
            seen_wear = item.wear;
        }));
        assert_eq!(seen_wear, Some(0.5));
        assert!(!task.with_item_mut(999, |_| {}));
    }
}
