// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The multilocker: atomic acquisition of a whole group of resource locks.
//!
//! A group names an ordered list of (mode, path) pairs. Submitting it wires
//! one DAG node per effective pair behind every conflicting predecessor on
//! the *lock surface* — a map from path-prefix key to the ordered stack of
//! outstanding references at that prefix. The group is acquired once every
//! node's gate opens; unlocking releases all nodes together and hands the
//! touched prefixes to a background collector that prunes the surface.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::lock::{Lock, Unlocker};
use crate::node::{LockMode, Node};
use crate::token::{concat_tokens, PathKey, Token, TokenTable};

const GARBAGE_BUFFER_SIZE: usize = 100;
const ROOT_SEGMENT: &str = "";

/// One (mode, path) pair of a lock group. The empty path denotes the root
/// of the hierarchy and conflicts with every deeper path of an incompatible
/// mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLock {
    pub mode: LockMode,
    pub path: Vec<String>,
}

impl ResourceLock {
    pub fn new(mode: LockMode, path: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            mode,
            path: path.into_iter().map(Into::into).collect(),
        }
    }
}

/// Role of a surface reference: the path either terminates at this prefix
/// (`Head`) or passes through on the way to a deeper head (`Tail`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefKind {
    Tail,
    Head,
}

struct LockRef {
    kind: RefKind,
    node: Node,
}

/// Point-in-time state of a [`MultiLocker`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MultiLockerStats {
    /// Sequence number of the last group, starting from 1.
    #[serde(rename = "LastGroupID")]
    pub last_group_id: u64,
    /// Groups still waiting to acquire some of their resources.
    pub groups_pending: i64,
    /// Groups currently holding all of their resources.
    pub groups_acquired: i64,
    /// Individual resource locks still waiting.
    pub locks_pending: i64,
    /// Individual resource locks currently held.
    pub locks_acquired: i64,
    /// References stored across all surface stacks.
    pub lockref_count: i64,
    /// Outstanding segment references in the token table.
    pub tokens_total: i64,
    /// Distinct interned segments.
    pub tokens_unique: i64,
    /// Number of path prefixes with a surface stack.
    pub path_count: i64,
}

#[derive(Default)]
struct Counters {
    groups_pending: AtomicI64,
    groups_acquired: AtomicI64,
    locks_pending: AtomicI64,
    locks_acquired: AtomicI64,
    lockref_count: AtomicI64,
}

struct Core {
    tokens: TokenTable,
    surface: FxHashMap<PathKey, Vec<LockRef>>,
    last_lock_id: u64,
}

struct Engine {
    core: Mutex<Core>,
    counters: Counters,
    root: Token,
    closed: AtomicBool,
    garbage_tx: Mutex<Option<mpsc::Sender<Vec<Vec<Token>>>>>,
    active_tx: Mutex<Option<mpsc::Sender<()>>>,
    active_rx: Mutex<Option<mpsc::Receiver<()>>>,
    cleaned_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

/// Arbitrates shared/exclusive access to hierarchical resources. Cloning
/// yields another handle to the same engine.
///
/// Create with [`MultiLocker::new`] (inside a tokio runtime) and finish with
/// [`MultiLocker::close`]. Submitting to a closed engine and closing twice
/// are programmer faults and panic.
#[derive(Clone)]
pub struct MultiLocker {
    engine: Arc<Engine>,
}

impl Default for MultiLocker {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiLocker {
    /// Creates an engine and spawns its garbage-collector task.
    pub fn new() -> Self {
        let (garbage_tx, garbage_rx) = mpsc::channel(GARBAGE_BUFFER_SIZE);
        let (active_tx, active_rx) = mpsc::channel(1);
        let (cleaned_tx, cleaned_rx) = oneshot::channel();

        let mut tokens = TokenTable::new();
        let root = tokens.store(ROOT_SEGMENT);

        let engine = Arc::new(Engine {
            core: Mutex::new(Core {
                tokens,
                surface: FxHashMap::default(),
                last_lock_id: 0,
            }),
            counters: Counters::default(),
            root,
            closed: AtomicBool::new(false),
            garbage_tx: Mutex::new(Some(garbage_tx)),
            active_tx: Mutex::new(Some(active_tx)),
            active_rx: Mutex::new(Some(active_rx)),
            cleaned_rx: Mutex::new(Some(cleaned_rx)),
        });

        tokio::spawn(clean_paths(
            Arc::downgrade(&engine),
            garbage_rx,
            cleaned_tx,
        ));

        Self { engine }
    }

    /// Atomically enqueues a group of resource locks.
    ///
    /// The group acquires as soon as no earlier group holds an interfering
    /// lock on an overlapping path. When `unlocker` is `None` one is made
    /// internally; in either case the returned [`Lock`] hands it back from
    /// [`Lock::acquire`], which is the preferred way to make sure a group is
    /// not unlocked before it acquires.
    pub fn lock(&self, resources: Vec<ResourceLock>, unlocker: Option<Unlocker>) -> Lock {
        let engine = &self.engine;

        if engine.closed.load(Ordering::SeqCst) {
            panic!("multilocker is closed; fix your logic");
        }

        let active_guard = engine
            .active_tx
            .lock()
            .unwrap()
            .as_ref()
            .expect("multilocker is closed; fix your logic")
            .clone();
        let garbage_tx = engine
            .garbage_tx
            .lock()
            .unwrap()
            .as_ref()
            .expect("multilocker is closed; fix your logic")
            .clone();

        let unlocker = unlocker.unwrap_or_else(Unlocker::new);
        let trigger = unlocker.bind();

        let mut core = engine.core.lock().unwrap();

        core.last_lock_id += 1;
        let lock_id = core.last_lock_id;

        engine.counters.groups_pending.fetch_add(1, Ordering::Relaxed);

        // Every path is keyed with the implicit root prefix in front.
        let root = engine.root;
        let token_groups: Vec<Vec<Token>> = resources
            .iter()
            .map(|resource| {
                let mut tokens = Vec::with_capacity(resource.path.len() + 1);
                tokens.push(root);
                for segment in &resource.path {
                    tokens.push(core.tokens.store(segment));
                }
                tokens
            })
            .collect();

        let mut group_nodes: Vec<Node> = Vec::new();
        let mut group_keys: FxHashSet<usize> = FxHashSet::default();

        for (resource, tokens) in resources.iter().zip(&token_groups) {
            let mode = resource.mode;
            let node = Node::new(mode);
            let mut added = false;

            // Horizontal walk over the path's prefixes, shallow to deep.
            'prefixes: for depth in 1..=tokens.len() {
                let key = concat_tokens(&tokens[..depth]);
                let is_head = depth == tokens.len();
                let kind = if is_head { RefKind::Head } else { RefKind::Tail };

                if !core.surface.contains_key(&key) {
                    if !added {
                        group_keys.insert(node.key());
                        group_nodes.push(node.clone());
                        added = true;
                    }
                    core.surface.insert(
                        key,
                        vec![LockRef {
                            kind,
                            node: node.clone(),
                        }],
                    );
                    engine.counters.lockref_count.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                let stack = core.surface.get_mut(&key).unwrap();

                let mut replace_all = is_head && mode == LockMode::Write;
                let mut prevent_append = false;

                // Vertical walk over the existing references, newest first.
                for idx in (0..stack.len()).rev() {
                    let existing_node = stack[idx].node.clone();
                    let existing_is_head = stack[idx].kind == RefKind::Head;
                    let existing_in_group = group_keys.contains(&existing_node.key());
                    let existing_is_write = existing_node.mode() == LockMode::Write;
                    let mut replace_current = false;

                    // A same-group head of equal or stronger mode shadows
                    // this pair entirely.
                    if existing_in_group && existing_is_head && existing_node.mode() >= mode {
                        break 'prefixes;
                    }

                    if !existing_in_group && (existing_is_head || is_head) {
                        existing_node.add_child(&node);

                        if !added {
                            group_keys.insert(node.key());
                            group_nodes.push(node.clone());
                            added = true;
                        }
                    }

                    if replace_all && !existing_in_group {
                        replace_all = false;
                    }

                    if existing_in_group {
                        match (existing_is_head, existing_is_write) {
                            (true, true) => prevent_append = true,
                            (true, false) => {
                                if is_head && mode == LockMode::Write {
                                    replace_current = true;
                                }
                            }
                            (false, true) => {
                                if is_head && mode == LockMode::Write {
                                    replace_current = true;
                                }
                                if !is_head {
                                    prevent_append = true;
                                }
                            }
                            (false, false) => {
                                if mode == LockMode::Write || is_head {
                                    replace_current = true;
                                }
                            }
                        }
                    }

                    if replace_current {
                        stack[idx] = LockRef {
                            kind,
                            node: node.clone(),
                        };
                        prevent_append = true;

                        if !added {
                            group_keys.insert(node.key());
                            group_nodes.push(node.clone());
                            added = true;
                        }
                    }
                }

                // A write head with no surviving same-group refs below it
                // serializes everything at this prefix: the old stack is no
                // longer needed for wiring.
                if replace_all {
                    let removed = stack.len() as i64;
                    *stack = vec![LockRef {
                        kind,
                        node: node.clone(),
                    }];
                    engine
                        .counters
                        .lockref_count
                        .fetch_add(1 - removed, Ordering::Relaxed);

                    if !added {
                        group_keys.insert(node.key());
                        group_nodes.push(node.clone());
                    }
                    break 'prefixes;
                }

                if prevent_append {
                    continue 'prefixes;
                }

                engine.counters.lockref_count.fetch_add(1, Ordering::Relaxed);
                stack.push(LockRef {
                    kind,
                    node: node.clone(),
                });

                if !added {
                    group_keys.insert(node.key());
                    group_nodes.push(node.clone());
                    added = true;
                }
            }
        }

        drop(core);

        let (lock, ready) = Lock::new(lock_id, unlocker);

        tokio::spawn(handle_unlocker(
            Arc::clone(engine),
            trigger,
            group_nodes.clone(),
            resources,
            token_groups,
            garbage_tx,
            active_guard,
        ));

        engine
            .counters
            .locks_pending
            .fetch_add(group_nodes.len() as i64, Ordering::Relaxed);

        let mut pending_from = None;

        for (idx, node) in group_nodes.iter().enumerate() {
            if node.try_lock() {
                engine.counters.locks_pending.fetch_sub(1, Ordering::Relaxed);
                engine.counters.locks_acquired.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            pending_from = Some(idx);
            break;
        }

        match pending_from {
            // Some node would block: finish locking in the background, in
            // creation order, and hand back a pending lock.
            Some(idx) => {
                let engine = Arc::clone(engine);

                tokio::spawn(async move {
                    group_nodes[idx].wait_lock().await;
                    engine.counters.locks_pending.fetch_sub(1, Ordering::Relaxed);
                    engine.counters.locks_acquired.fetch_add(1, Ordering::Relaxed);

                    for node in &group_nodes[idx + 1..] {
                        node.lock().await;
                        engine.counters.locks_pending.fetch_sub(1, Ordering::Relaxed);
                        engine.counters.locks_acquired.fetch_add(1, Ordering::Relaxed);
                    }

                    engine.counters.groups_pending.fetch_sub(1, Ordering::Relaxed);
                    engine.counters.groups_acquired.fetch_add(1, Ordering::Relaxed);

                    ready.fire();
                });
            }
            None => {
                ready.fire();

                engine.counters.groups_pending.fetch_sub(1, Ordering::Relaxed);
                engine.counters.groups_acquired.fetch_add(1, Ordering::Relaxed);
            }
        }

        lock
    }

    /// Consistent snapshot of the engine state.
    pub fn statistics(&self) -> MultiLockerStats {
        let core = self.engine.core.lock().unwrap();

        MultiLockerStats {
            last_group_id: core.last_lock_id,
            groups_pending: self.engine.counters.groups_pending.load(Ordering::Relaxed),
            groups_acquired: self.engine.counters.groups_acquired.load(Ordering::Relaxed),
            locks_pending: self.engine.counters.locks_pending.load(Ordering::Relaxed),
            locks_acquired: self.engine.counters.locks_acquired.load(Ordering::Relaxed),
            lockref_count: self.engine.counters.lockref_count.load(Ordering::Relaxed),
            tokens_total: core.tokens.sum(),
            tokens_unique: core.tokens.count(),
            path_count: core.surface.len() as i64,
        }
    }

    /// Forbids new groups, waits for outstanding ones to unlock, then waits
    /// for the collector to finish with the remaining garbage.
    pub async fn close(&self) {
        let engine = &self.engine;

        if engine.closed.swap(true, Ordering::SeqCst) {
            panic!("multilocker is already closed; fix your logic");
        }

        drop(engine.active_tx.lock().unwrap().take());
        let mut active_rx = engine
            .active_rx
            .lock()
            .unwrap()
            .take()
            .expect("close raced another close call");
        // Resolves once the last in-flight group drops its guard.
        let _ = active_rx.recv().await;

        drop(engine.garbage_tx.lock().unwrap().take());
        let cleaned = engine
            .cleaned_rx
            .lock()
            .unwrap()
            .take()
            .expect("close raced another close call");
        let _ = cleaned.await;

        // Nothing can reference the root token anymore; a closed engine
        // reports zero interned tokens.
        engine.core.lock().unwrap().tokens.release(ROOT_SEGMENT);
    }
}

async fn handle_unlocker(
    engine: Arc<Engine>,
    trigger: oneshot::Receiver<oneshot::Sender<()>>,
    nodes: Vec<Node>,
    resources: Vec<ResourceLock>,
    token_groups: Vec<Vec<Token>>,
    garbage_tx: mpsc::Sender<Vec<Vec<Token>>>,
    active_guard: mpsc::Sender<()>,
) {
    // Every unlocker clone was dropped without unlocking: the group is
    // abandoned and its nodes stay locked.
    let Ok(done) = trigger.await else { return };

    let fence = Node::new(LockMode::Write);

    {
        let mut core = engine.core.lock().unwrap();

        let mut in_use = Vec::new();
        for node in &nodes {
            node.unlock();

            if !node.useless() {
                in_use.push(node.clone());
            }
        }

        engine
            .counters
            .locks_acquired
            .fetch_sub(nodes.len() as i64, Ordering::Relaxed);
        engine.counters.groups_acquired.fetch_sub(1, Ordering::Relaxed);

        let _ = done.send(());

        for resource in &resources {
            for segment in &resource.path {
                core.tokens.release(segment);
            }
        }

        // Read nodes may still have parents. The fence acquires only after
        // they all release, so pruning never races an acquire that still
        // needs them as predecessors.
        for node in &in_use {
            node.add_child(&fence);
        }
    }

    fence.lock().await;
    fence.unlock();

    // A full garbage channel blocks here, back-pressuring unlocks until the
    // collector drains.
    let _ = garbage_tx.send(token_groups).await;

    drop(active_guard);
}

/// Background collector: prunes fully released reference stacks from the
/// surface, batching whatever is queued at wake-up.
async fn clean_paths(
    engine: Weak<Engine>,
    mut garbage_rx: mpsc::Receiver<Vec<Vec<Token>>>,
    cleaned_tx: oneshot::Sender<()>,
) {
    while let Some(first) = garbage_rx.recv().await {
        let mut batch = vec![first];
        while let Ok(more) = garbage_rx.try_recv() {
            batch.push(more);
        }

        let Some(engine) = engine.upgrade() else { return };

        let mut touched: FxHashSet<PathKey> = FxHashSet::default();
        for group in &batch {
            for tokens in group {
                for depth in 1..=tokens.len() {
                    touched.insert(concat_tokens(&tokens[..depth]));
                }
            }
        }

        let mut core = engine.core.lock().unwrap();

        for key in &touched {
            let keep_from;
            let stack_len;
            {
                let Some(stack) = core.surface.get(key) else {
                    continue;
                };

                let mut useless_prefix = 0;
                for (idx, lock_ref) in stack.iter().enumerate() {
                    if !lock_ref.node.useless() {
                        break;
                    }
                    useless_prefix = idx + 1;
                }

                keep_from = useless_prefix;
                stack_len = stack.len();
            }

            if keep_from == 0 {
                continue;
            }

            engine
                .counters
                .lockref_count
                .fetch_sub(keep_from as i64, Ordering::Relaxed);

            if keep_from == stack_len {
                core.surface.remove(key);
            } else {
                core.surface.get_mut(key).unwrap().drain(..keep_from);
            }
        }
    }

    let _ = cleaned_tx.send(());
}
