// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! locktopus-core: in-memory engine arbitrating shared/exclusive access to
//! hierarchical resources.
//!
//! A client submits a *group* — an ordered list of (mode, path) pairs — and
//! is handed a [`Lock`] that resolves once the whole group has been granted
//! atomically. Conflicting groups are served in FIFO order per path;
//! compatible groups (readers, disjoint subtrees) run concurrently.
//!
//! Key modules:
//! - `node`: the one-shot DAG synchronizer a group's slots are made of.
//! - `multilocker`: the coordinator owning the lock surface, the token
//!   table and the background garbage collector.
//! - `lock`: the `Lock`/`Unlocker` handles returned to callers.
//!
//! The engine spawns tokio tasks, so [`MultiLocker::new`] must be called
//! within a runtime. Structural misuse (double unlock, submitting to a
//! closed engine, ...) panics: those paths are reachable only from buggy
//! calling code, never from remote input.

pub mod lock;
pub mod multilocker;
pub mod node;
mod token;

pub use lock::{Lock, Unlocker};
pub use multilocker::{MultiLocker, MultiLockerStats, ResourceLock};
pub use node::{LockMode, Node, NodeState};
