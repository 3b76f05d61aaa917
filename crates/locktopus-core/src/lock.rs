// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Handles returned to lock-group owners.

use std::sync::{Arc, Mutex};

use tokio::sync::{oneshot, watch};

/// Signals the engine to release a group and waits for it to happen.
///
/// An unlocker is bound to exactly one group. Calling [`Unlocker::unlock`]
/// twice is a programmer fault and panics; dropping every clone without
/// unlocking abandons the group for good.
#[derive(Clone)]
pub struct Unlocker {
    shared: Arc<UnlockerShared>,
}

struct UnlockerShared {
    trigger: Mutex<Option<oneshot::Sender<oneshot::Sender<()>>>>,
    waiter: Mutex<Option<oneshot::Receiver<oneshot::Sender<()>>>>,
}

impl Default for Unlocker {
    fn default() -> Self {
        Self::new()
    }
}

impl Unlocker {
    pub fn new() -> Self {
        let (trigger, waiter) = oneshot::channel();

        Self {
            shared: Arc::new(UnlockerShared {
                trigger: Mutex::new(Some(trigger)),
                waiter: Mutex::new(Some(waiter)),
            }),
        }
    }

    /// Releases the whole group. Returns once every node of the group has
    /// been unlocked, so a follow-up request observes the release.
    pub async fn unlock(&self) {
        let trigger = self
            .shared
            .trigger
            .lock()
            .unwrap()
            .take()
            .expect("unlock called twice on the same group; fix your logic");

        let (done_tx, done_rx) = oneshot::channel();

        trigger
            .send(done_tx)
            .unwrap_or_else(|_| panic!("unlocker is not bound to any lock group; fix your logic"));

        let _ = done_rx.await;
    }

    /// Hands the engine the receiving end of the unlock trigger. Each
    /// unlocker can be bound once.
    pub(crate) fn bind(&self) -> oneshot::Receiver<oneshot::Sender<()>> {
        self.shared
            .waiter
            .lock()
            .unwrap()
            .take()
            .expect("unlocker is already bound to a lock group; fix your logic")
    }
}

impl PartialEq for Unlocker {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Unlocker {}

/// Handle of an enqueued lock group.
///
/// The group starts its lifecycle inside the coordinator's lock call; this
/// handle only observes readiness and hands out the unlocker.
pub struct Lock {
    id: u64,
    ready: watch::Receiver<bool>,
    unlocker: Unlocker,
}

/// Sender half used by the coordinator to fire the readiness signal exactly
/// once.
pub(crate) struct ReadySignal {
    tx: watch::Sender<bool>,
}

impl ReadySignal {
    pub(crate) fn fire(self) {
        let _ = self.tx.send(true);
    }
}

impl Lock {
    pub(crate) fn new(id: u64, unlocker: Unlocker) -> (Self, ReadySignal) {
        let (tx, ready) = watch::channel(false);

        (
            Self {
                id,
                ready,
                unlocker,
            },
            ReadySignal { tx },
        )
    }

    /// Unique incremental id of the group within its engine.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether every node of the group has already been acquired.
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Completes once the whole group is acquired. Fires exactly once per
    /// group; awaiting it again returns immediately.
    pub async fn ready(&self) {
        let mut ready = self.ready.clone();
        ready
            .wait_for(|acquired| *acquired)
            .await
            .expect("group waiter dropped before signalling readiness");
    }

    /// Waits for the group to be acquired and returns its unlocker. May be
    /// called any number of times; every call returns the same unlocker.
    pub async fn acquire(&self) -> Unlocker {
        self.ready().await;
        self.unlocker.clone()
    }
}
