// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Registry of named multilocker engines. Namespaces are independent: each
//! owns its own engine, and fairness is never coordinated across them.

use std::collections::HashMap;
use std::sync::Mutex;

use futures_util::future::join_all;
use locktopus_core::{MultiLocker, MultiLockerStats};

#[derive(Default)]
pub struct NamespaceRegistry {
    inner: Mutex<HashMap<String, MultiLocker>>,
}

impl NamespaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the engine for `name`, creating it on first use. The second
    /// value reports whether the namespace was just created.
    pub fn get_or_create(&self, name: &str) -> (MultiLocker, bool) {
        let mut namespaces = self.inner.lock().unwrap();

        if let Some(engine) = namespaces.get(name) {
            return (engine.clone(), false);
        }

        let engine = MultiLocker::new();
        namespaces.insert(name.to_owned(), engine.clone());

        (engine, true)
    }

    /// Snapshot of one namespace, or `None` if it has never been opened.
    pub fn statistics(&self, name: &str) -> Option<MultiLockerStats> {
        let namespaces = self.inner.lock().unwrap();
        namespaces.get(name).map(|engine| engine.statistics())
    }

    /// Snapshots of every open namespace.
    pub fn snapshot_all(&self) -> Vec<(String, MultiLockerStats)> {
        let namespaces = self.inner.lock().unwrap();
        namespaces
            .iter()
            .map(|(name, engine)| (name.clone(), engine.statistics()))
            .collect()
    }

    /// Closes every namespace, waiting for outstanding groups to drain.
    pub async fn close_all(&self) {
        let engines: Vec<MultiLocker> = {
            let namespaces = self.inner.lock().unwrap();
            namespaces.values().cloned().collect()
        };

        join_all(engines.iter().map(|engine| engine.close())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use locktopus_core::{LockMode, ResourceLock};

    #[tokio::test]
    async fn namespaces_are_created_on_first_use() {
        let registry = NamespaceRegistry::new();

        let (first, created) = registry.get_or_create("ci");
        assert!(created);

        let (second, created) = registry.get_or_create("ci");
        assert!(!created);

        // Both handles reach the same engine.
        first
            .lock(vec![ResourceLock::new(LockMode::Read, ["x"])], None)
            .acquire()
            .await;
        assert_eq!(second.statistics().last_group_id, 1);
    }

    #[tokio::test]
    async fn statistics_do_not_create_namespaces() {
        let registry = NamespaceRegistry::new();

        assert!(registry.statistics("ghost").is_none());
        assert!(registry.snapshot_all().is_empty());

        registry.get_or_create("real");
        assert!(registry.statistics("real").is_some());
    }
}
