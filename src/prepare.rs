//! Cluster-wide prepared-statement cache and the Prepare Handler (spec.md
//! §3 "Prepared Cache", §4.7).
//!
//! The cache maps `(keyspace, query text)` to the last-known `PreparedInfo`
//! and is last-writer-wins (spec.md §5): two concurrent prepares of the
//! same key race harmlessly since a `PREPARE` of the same query text always
//! yields an equivalent id. Per-connection single-flight collapsing of the
//! wire round trip itself lives on [`crate::conn::Connection`]
//! (`prepare_once`); this cache is the cluster-visible layer on top.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::conn::PreparedInfo;
use crate::error::DriverResult;
use crate::host::{Distance, Host};
use crate::host_map::HostMap;
use crate::policies::load_balancing::LoadBalancingPolicy;

type CacheKey = (Option<String>, String);

/// LRU-bounded `(keyspace, query) -> PreparedInfo` cache (spec.md §3
/// "Prepared Cache"), shared cluster-wide by the [`PrepareHandler`] and
/// invalidated piecemeal by schema-event handlers on DDL.
#[derive(Debug)]
pub struct PreparedCache {
    max_entries: usize,
    // `Vec` to double as an LRU order tracker; `max_prepared` is modest
    // (default 500, spec.md §6) so linear reordering on hit is cheap and
    // avoids pulling in an LRU crate purely for this one cache.
    entries: Mutex<Vec<(CacheKey, PreparedInfo)>>,
}

impl PreparedCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub async fn get(&self, keyspace: Option<&str>, query: &str) -> Option<PreparedInfo> {
        let key = (keyspace.map(String::from), query.to_string());
        let mut guard = self.entries.lock().await;
        let pos = guard.iter().position(|(k, _)| *k == key)?;
        let (k, v) = guard.remove(pos);
        let result = v.clone();
        guard.push((k, v));
        Some(result)
    }

    pub async fn insert(&self, keyspace: Option<&str>, query: &str, info: PreparedInfo) {
        let key = (keyspace.map(String::from), query.to_string());
        let mut guard = self.entries.lock().await;
        guard.retain(|(k, _)| *k != key);
        guard.push((key, info));
        while guard.len() > self.max_entries {
            guard.remove(0);
        }
    }

    /// Every cached `(keyspace, query)` pair, used to re-prepare on a host
    /// that just came up (spec.md §4.3 "Re-prepare on up", §4.7
    /// `prepareAllQueries`).
    pub async fn snapshot_queries(&self) -> Vec<(Option<String>, String)> {
        self.entries.lock().await.iter().map(|(k, _)| k.clone()).collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Invalidates every cached entry scoped to a dropped keyspace
    /// (mirrors [`crate::metadata::Metadata::drop_keyspace`]: a keyspace
    /// drop should also stop serving stale prepared ids for it).
    pub async fn drop_keyspace(&self, keyspace: &str) {
        self.entries
            .lock()
            .await
            .retain(|((ks, _), _)| ks.as_deref() != Some(keyspace));
    }
}

/// First-time prepare-on-one-host, optional fan-out to the rest of the
/// cluster, and re-preparation on host-up (spec.md §4.7).
pub struct PrepareHandler {
    cache: Arc<PreparedCache>,
    prepare_on_all_hosts: bool,
    re_prepare_on_up: bool,
    read_timeout: Duration,
    /// Bounds the concurrency of a host-up re-prepare sweep (spec.md §9
    /// Open Questions: "apply an implementation-chosen concurrency cap").
    re_prepare_concurrency: usize,
}

impl std::fmt::Debug for PrepareHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrepareHandler").finish_non_exhaustive()
    }
}

impl PrepareHandler {
    pub fn new(
        cache: Arc<PreparedCache>,
        prepare_on_all_hosts: bool,
        re_prepare_on_up: bool,
        read_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            prepare_on_all_hosts,
            re_prepare_on_up,
            read_timeout,
            re_prepare_concurrency: 8,
        }
    }

    pub fn cache(&self) -> &Arc<PreparedCache> {
        &self.cache
    }

    pub fn re_prepare_on_up(&self) -> bool {
        self.re_prepare_on_up
    }

    /// spec.md §4.7 `prepare`: cache hit short-circuits; a miss picks one
    /// host from the load-balancing plan, prepares there, caches the
    /// result, and (if configured) fans out to the rest of the up hosts
    /// in the background, ignoring their failures.
    pub async fn prepare(
        &self,
        query: &str,
        keyspace: Option<&str>,
        hosts: &HostMap,
        load_balancing: &dyn LoadBalancingPolicy,
    ) -> DriverResult<PreparedInfo> {
        if let Some(cached) = self.cache.get(keyspace, query).await {
            return Ok(cached);
        }

        let plan = load_balancing.new_query_plan(hosts).await;
        let mut last_err = None;
        let mut prepared_on: Option<Arc<Host>> = None;
        let mut info = None;
        for host in &plan {
            match host.pool().borrow_connection(keyspace, None).await {
                Ok(conn) => match conn.prepare_once(query, keyspace, self.read_timeout).await {
                    Ok(prepared) => {
                        info = Some(prepared);
                        prepared_on = Some(Arc::clone(host));
                        break;
                    }
                    Err(e) => last_err = Some(e),
                },
                Err(e) => last_err = Some(e),
            }
        }

        let info = match info {
            Some(info) => info,
            None => {
                return Err(last_err.unwrap_or(crate::error::DriverError::NoHostAvailable(
                    crate::error::NoHostAvailableError::new(),
                )))
            }
        };
        self.cache.insert(keyspace, query, info.clone()).await;

        if self.prepare_on_all_hosts {
            let query = query.to_string();
            let keyspace = keyspace.map(String::from);
            let read_timeout = self.read_timeout;
            let others: Vec<Arc<Host>> = plan
                .into_iter()
                .filter(|h| prepared_on.as_ref().map(|p| !Arc::ptr_eq(p, h)).unwrap_or(true))
                .collect();
            tokio::spawn(async move {
                for host in others {
                    if !host.is_up() || matches!(host.distance().await, Distance::Ignored) {
                        continue;
                    }
                    if let Ok(conn) = host.pool().borrow_connection(keyspace.as_deref(), None).await {
                        if let Err(e) = conn
                            .prepare_once(&query, keyspace.as_deref(), read_timeout)
                            .await
                        {
                            log::warn!(
                                "background prepare fan-out to {} failed: {e}",
                                host.endpoint()
                            );
                        }
                    }
                }
            });
        }

        Ok(info)
    }

    /// spec.md §4.7 `prepareAllQueries`: re-issues PREPARE for every
    /// cached entry on a host that just came up, bounded concurrency,
    /// errors logged and never raised (spec.md §4.3 "Re-prepare on up").
    pub async fn prepare_all_queries(&self, host: &Arc<Host>) {
        if !self.re_prepare_on_up {
            return;
        }
        let queries = self.cache.snapshot_queries().await;
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.re_prepare_concurrency));
        let mut tasks = Vec::with_capacity(queries.len());
        for (keyspace, query) in queries {
            let host = Arc::clone(host);
            let semaphore = Arc::clone(&semaphore);
            let read_timeout = self.read_timeout;
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closed");
                match host.pool().borrow_connection(keyspace.as_deref(), None).await {
                    Ok(conn) => {
                        if let Err(e) = conn
                            .prepare_once(&query, keyspace.as_deref(), read_timeout)
                            .await
                        {
                            log::warn!("re-prepare on up failed for {}: {e}", host.endpoint());
                        }
                    }
                    Err(e) => {
                        log::warn!("re-prepare on up: could not borrow a connection to {}: {e}", host.endpoint());
                    }
                }
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: u8) -> PreparedInfo {
        PreparedInfo {
            id: vec![id],
            result_metadata_id: None,
            raw_metadata: Vec::new(),
        }
    }

    #[tokio::test]
    async fn cache_evicts_least_recently_used_past_capacity() {
        let cache = PreparedCache::new(2);
        cache.insert(None, "q1", info(1)).await;
        cache.insert(None, "q2", info(2)).await;
        cache.insert(None, "q3", info(3)).await;
        assert_eq!(cache.len().await, 2);
        assert!(cache.get(None, "q1").await.is_none());
        assert!(cache.get(None, "q3").await.is_some());
    }

    #[tokio::test]
    async fn get_refreshes_recency() {
        let cache = PreparedCache::new(2);
        cache.insert(None, "q1", info(1)).await;
        cache.insert(None, "q2", info(2)).await;
        cache.get(None, "q1").await;
        cache.insert(None, "q3", info(3)).await;
        assert!(cache.get(None, "q2").await.is_none());
        assert!(cache.get(None, "q1").await.is_some());
    }

    #[tokio::test]
    async fn drop_keyspace_purges_scoped_entries_only() {
        let cache = PreparedCache::new(10);
        cache.insert(Some("ks1"), "q1", info(1)).await;
        cache.insert(Some("ks2"), "q2", info(2)).await;
        cache.drop_keyspace("ks1").await;
        assert!(cache.get(Some("ks1"), "q1").await.is_none());
        assert!(cache.get(Some("ks2"), "q2").await.is_some());
    }
}
