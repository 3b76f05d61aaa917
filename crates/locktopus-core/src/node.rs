// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! One-shot DAG synchronizer.
//!
//! A [`Node`] represents one client's claim on one resource slot. Nodes are
//! wired into a DAG of "may acquire after" edges; a node's gate opens once
//! every parent has released, and the coordinator's waiter blocks on that
//! gate. Structural misuse (self-append, binding a node that already has
//! children, double lock, unlock before lock) is a programmer fault and
//! panics: the coordinator owns every node operation, so none of these are
//! reachable from user input.

use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tokio::sync::Semaphore;

/// Access mode of one resource slot. `Write` is the stronger mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    Read,
    Write,
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockMode::Read => f.write_str("read"),
            LockMode::Write => f.write_str("write"),
        }
    }
}

/// Node lifecycle: `Created -> LockedByParents -> Released -> LockedByClient
/// -> Unlocked`. Nodes without parents skip straight to `Released`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeState {
    #[default]
    Created,
    LockedByParents,
    Released,
    LockedByClient,
    Unlocked,
}

/// Identity-keyed set of nodes.
#[derive(Default)]
struct NodeSet(FxHashMap<usize, Node>);

impl NodeSet {
    fn insert(&mut self, node: &Node) {
        self.0.insert(node.key(), node.clone());
    }

    fn remove(&mut self, node: &Node) {
        self.0.remove(&node.key());
    }

    fn len(&self) -> usize {
        self.0.len()
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn clear(&mut self) {
        self.0.clear();
    }

    fn nodes(&self) -> Vec<Node> {
        self.0.values().cloned().collect()
    }

    fn take_all(&mut self) -> Vec<Node> {
        self.0.drain().map(|(_, node)| node).collect()
    }
}

#[derive(Default)]
struct Inner {
    state: NodeState,
    called_lock: bool,
    parents: NodeSet,
    released_parents: NodeSet,
    children: NodeSet,
}

impl Inner {
    fn all_parents_released(&self) -> bool {
        self.released_parents.len() == self.parents.len()
    }

    fn useless(&self) -> bool {
        self.state == NodeState::Unlocked && self.parents.is_empty()
    }
}

struct Shared {
    mode: LockMode,
    gate: Semaphore,
    inner: Mutex<Inner>,
}

/// A one-shot mutex with typed parents and children. Cloning yields another
/// handle to the same node.
///
/// The gate is a binary semaphore: one permit means open. A freshly created
/// node holds its permit; attaching the first parent takes it, releasing the
/// last parent returns it, and the client's lock takes it for good.
#[derive(Clone)]
pub struct Node {
    shared: Arc<Shared>,
}

impl Node {
    pub fn new(mode: LockMode) -> Self {
        Self {
            shared: Arc::new(Shared {
                mode,
                gate: Semaphore::new(1),
                inner: Mutex::new(Inner::default()),
            }),
        }
    }

    /// Stable identity of the node, valid while any handle is alive.
    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.shared) as usize
    }

    pub fn mode(&self) -> LockMode {
        self.shared.mode
    }

    pub fn state(&self) -> NodeState {
        self.shared.inner.lock().unwrap().state
    }

    pub fn has_children(&self) -> bool {
        !self.shared.inner.lock().unwrap().children.is_empty()
    }

    pub fn has_parents(&self) -> bool {
        !self.shared.inner.lock().unwrap().parents.is_empty()
    }

    /// A node is useless once it is unlocked and the last parent has
    /// unlinked itself: attaching children to it is a no-op.
    pub fn useless(&self) -> bool {
        self.shared.inner.lock().unwrap().useless()
    }

    /// Wires `child` to acquire only after `self` has released.
    ///
    /// Attaching a read child to an already-released read parent leaves the
    /// child's gate open, which is what lets consecutive readers acquire
    /// concurrently.
    pub fn add_child(&self, child: &Node) {
        if Arc::ptr_eq(&self.shared, &child.shared) {
            panic!("cannot bind a node to itself; fix your logic");
        }

        let mut inner = self.shared.inner.lock().unwrap();

        if child.has_children() {
            panic!("cannot bind a node that already has children: this may introduce a deadlock; fix your logic");
        }

        if inner.useless() {
            return;
        }

        let mut child_inner = child.shared.inner.lock().unwrap();

        if child_inner.state > NodeState::LockedByParents {
            panic!("cannot bind a released child; fix your logic");
        }

        if inner.parents.is_empty() && inner.state < NodeState::Released {
            inner.state = NodeState::Released;
        }

        child_inner.parents.insert(self);
        inner.children.insert(child);

        // Read-read pass-through: a read child of a parent that has already
        // released keeps its gate open.
        if inner.state > NodeState::LockedByParents
            && child.mode() == LockMode::Read
            && self.mode() == LockMode::Read
        {
            return;
        }

        if child_inner.state == NodeState::Created {
            child
                .shared
                .gate
                .try_acquire()
                .expect("one-shot gate of a fresh node is taken")
                .forget();
            child_inner.state = NodeState::LockedByParents;
        }
    }

    /// Non-blocking first phase of a client lock. On `false`, the caller
    /// must finish with [`Node::wait_lock`]; calling either lock entry twice
    /// panics.
    pub fn try_lock(&self) -> bool {
        let mut inner = self.shared.inner.lock().unwrap();

        if inner.called_lock {
            panic!("node has already been locked; fix your logic");
        }
        inner.called_lock = true;

        match self.shared.gate.try_acquire() {
            Ok(permit) => {
                permit.forget();
                inner.state = NodeState::LockedByClient;
                true
            }
            Err(_) => false,
        }
    }

    /// Second phase after a failed [`Node::try_lock`]: parks until every
    /// parent has released.
    pub async fn wait_lock(&self) {
        debug_assert!(self.shared.inner.lock().unwrap().called_lock);

        self.shared
            .gate
            .acquire()
            .await
            .expect("node gate is never closed")
            .forget();

        self.shared.inner.lock().unwrap().state = NodeState::LockedByClient;
    }

    /// Blocks until every parent has released, then takes the gate.
    pub async fn lock(&self) {
        if !self.try_lock() {
            self.wait_lock().await;
        }
    }

    /// Opens the gate permanently and propagates the release downstream.
    pub fn unlock(&self) {
        {
            let mut inner = self.shared.inner.lock().unwrap();

            if inner.state != NodeState::LockedByClient {
                panic!(
                    "unlock called before lock was acquired (state = {:?}); fix your logic",
                    inner.state
                );
            }

            self.shared.gate.add_permits(1);
            inner.state = NodeState::Unlocked;
        }

        self.refresh_state();
    }

    fn release_read_parent(&self, parent: &Node) {
        self.shared
            .inner
            .lock()
            .unwrap()
            .released_parents
            .insert(parent);
    }

    fn unbind_parent(&self, parent: &Node) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.released_parents.remove(parent);
        inner.parents.remove(parent);
    }

    // Inner mutexes are always taken in ancestor-before-descendant order
    // (here and in add_child); the graph is acyclic, so the cascade cannot
    // deadlock.
    fn refresh_state(&self) {
        let mut inner = self.shared.inner.lock().unwrap();

        if inner.parents.is_empty() && inner.state == NodeState::Unlocked {
            let children = inner.children.take_all();
            inner.released_parents.clear();

            for child in &children {
                child.unbind_parent(self);
                child.refresh_state();
            }
        }

        if inner.all_parents_released() && inner.state == NodeState::LockedByParents {
            self.shared.gate.add_permits(1);
            inner.state = NodeState::Released;

            if self.mode() == LockMode::Write {
                return;
            }

            let children = inner.children.nodes();
            for child in children {
                if child.mode() == LockMode::Read {
                    child.release_read_parent(self);
                    child.refresh_state();
                }
            }
        }
    }
}
