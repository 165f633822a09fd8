//! Keyspace/table/UDT/function/aggregate metadata cache and the
//! partition-token ring (spec.md §3 "Metadata", §4.4.2).
//!
//! Keyed copy-on-write the same way as [`crate::host_map::HostMap`]: a
//! schema refresh replaces one keyspace's entry rather than mutating it in
//! place, so a reader mid-iteration never observes a half-updated
//! keyspace.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

/// A table, view, UDT, function, or aggregate name scoped to a keyspace.
/// The core only needs identity for cache invalidation (spec.md §4.4.2);
/// column/type definitions are the row/type codec collaborator's concern.
#[derive(Debug, Clone, Default)]
pub struct ObjectCache {
    pub tables: HashMap<String, ()>,
    pub views: HashMap<String, ()>,
    pub udts: HashMap<String, ()>,
    pub functions: HashMap<String, ()>,
    pub aggregates: HashMap<String, ()>,
}

impl ObjectCache {
    fn invalidate(&mut self, target: &str, name: &str) {
        match target {
            "TABLE" => self.tables.remove(name),
            "VIEW" => self.views.remove(name),
            "TYPE" => self.udts.remove(name),
            "FUNCTION" => self.functions.remove(name),
            "AGGREGATE" => self.aggregates.remove(name),
            _ => None,
        };
    }
}

/// One keyspace's replication strategy and cached schema objects (spec.md
/// §3 "Metadata").
#[derive(Debug, Clone, Default)]
pub struct KeyspaceMetadata {
    pub strategy: Option<String>,
    pub strategy_options: HashMap<String, String>,
    pub objects: ObjectCache,
}

type KeyspaceSnapshot = Arc<HashMap<String, KeyspaceMetadata>>;

/// Cluster-wide schema + token-ring metadata, refreshed by the Control
/// Connection (spec.md §3 "Metadata").
pub struct Metadata {
    keyspaces: RwLock<KeyspaceSnapshot>,
    /// Opaque token -> replica-endpoint-strings mapping, rebuilt whenever
    /// the partition-token ring changes (spec.md §3: "Rebuilt on
    /// partition-token ring changes"). The concrete replication placement
    /// algorithm is out of scope (spec.md §1): the core only stores
    /// whatever the token-aware load-balancing policy handed it.
    token_to_replica: RwLock<Arc<HashMap<String, Vec<String>>>>,
}

impl Default for Metadata {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Metadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metadata").finish_non_exhaustive()
    }
}

impl Metadata {
    pub fn new() -> Self {
        Self {
            keyspaces: RwLock::new(Arc::new(HashMap::new())),
            token_to_replica: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    pub async fn keyspace(&self, name: &str) -> Option<KeyspaceMetadata> {
        self.keyspaces.read().await.get(name).cloned()
    }

    pub async fn keyspace_names(&self) -> Vec<String> {
        self.keyspaces.read().await.keys().cloned().collect()
    }

    /// Installs (or replaces) one keyspace's full metadata, e.g. after a
    /// targeted `CREATED`/`UPDATED` schema-change refresh (spec.md §4.4.2).
    pub async fn set_keyspace(&self, name: impl Into<String>, metadata: KeyspaceMetadata) {
        let mut guard = self.keyspaces.write().await;
        let mut next = (**guard).clone();
        next.insert(name.into(), metadata);
        *guard = Arc::new(next);
    }

    /// Purges a keyspace entirely, e.g. on a `DROPPED` schema-change event
    /// (spec.md §4.4.2 "Keyspace drops purge directly").
    pub async fn drop_keyspace(&self, name: &str) {
        let mut guard = self.keyspaces.write().await;
        if !guard.contains_key(name) {
            return;
        }
        let mut next = (**guard).clone();
        next.remove(name);
        *guard = Arc::new(next);
    }

    /// Invalidates one targeted sub-cache entry without dropping the whole
    /// keyspace (spec.md §4.4.2: "table/UDT/function/aggregate events
    /// invalidate the targeted sub-cache").
    pub async fn invalidate_object(&self, keyspace: &str, target: &str, name: &str) {
        let mut guard = self.keyspaces.write().await;
        if let Some(ks) = guard.get(keyspace) {
            let mut next = (**guard).clone();
            if let Some(entry) = next.get_mut(keyspace) {
                entry.objects.invalidate(target, name);
            }
            let _ = ks;
            *guard = Arc::new(next);
        }
    }

    /// Replaces the whole token ring (spec.md §3: "Rebuilt on
    /// partition-token ring changes").
    pub async fn rebuild_token_ring(&self, token_to_replica: HashMap<String, Vec<String>>) {
        *self.token_to_replica.write().await = Arc::new(token_to_replica);
    }

    pub async fn replicas_for_token(&self, token: &str) -> Vec<String> {
        self.token_to_replica
            .read()
            .await
            .get(token)
            .cloned()
            .unwrap_or_default()
    }

    /// Drops every cached keyspace and the token ring, e.g. on full
    /// reinitialization alongside [`crate::host_map::HostMap::reset`].
    pub async fn reset(&self) {
        *self.keyspaces.write().await = Arc::new(HashMap::new());
        *self.token_to_replica.write().await = Arc::new(HashMap::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_and_fetch_keyspace_round_trips() {
        let metadata = Metadata::new();
        metadata
            .set_keyspace(
                "ks1",
                KeyspaceMetadata {
                    strategy: Some("SimpleStrategy".into()),
                    ..Default::default()
                },
            )
            .await;
        let fetched = metadata.keyspace("ks1").await.unwrap();
        assert_eq!(fetched.strategy.as_deref(), Some("SimpleStrategy"));
    }

    #[tokio::test]
    async fn drop_keyspace_removes_it() {
        let metadata = Metadata::new();
        metadata.set_keyspace("ks1", KeyspaceMetadata::default()).await;
        metadata.drop_keyspace("ks1").await;
        assert!(metadata.keyspace("ks1").await.is_none());
    }

    #[tokio::test]
    async fn invalidate_object_removes_only_the_targeted_entry() {
        let metadata = Metadata::new();
        let mut ks = KeyspaceMetadata::default();
        ks.objects.tables.insert("t1".into(), ());
        ks.objects.tables.insert("t2".into(), ());
        metadata.set_keyspace("ks1", ks).await;
        metadata.invalidate_object("ks1", "TABLE", "t1").await;
        let fetched = metadata.keyspace("ks1").await.unwrap();
        assert!(!fetched.objects.tables.contains_key("t1"));
        assert!(fetched.objects.tables.contains_key("t2"));
    }
}
