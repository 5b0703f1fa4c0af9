// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Expiring address tables for admission control.
//!
//! Two tables are built on the same generic core:
//!
//! - [`BanList`]: source IPs quarantined by the auth-log watcher. Consulted
//!   on every accepted socket, written about once a minute.
//! - [`BackoffList`]: handshake peers (`ip:port`) penalized after a failed
//!   public key check. Consulted and written on the authentication path.
//!
//! Both are read-mostly: lookups take the read half of an async `RwLock`
//! so concurrent admission checks never serialize against each other.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

/// How long a failed handshake keeps a peer out.
pub const BACKOFF_DURATION: Duration = Duration::from_secs(30);

/// Generic map from key to an absolute deadline.
///
/// An entry whose deadline is not strictly in the future is logically
/// absent: `contains` returns `false` for it and [`sweep`](Self::sweep)
/// may drop it at any time without observable effect.
///
/// # Type Parameters
///
/// * `K` - The key type identifying an entry (an IP string, a peer
///   address, ...). Must implement `Hash`, `Eq`, `Clone`, and
///   `Send + Sync`.
///
/// # Thread Safety
///
/// Cloning is cheap and all clones share the same table, so a single map
/// can be handed to the accept loop, the watcher, and every connection
/// handler.
#[derive(Debug)]
pub struct DeadlineMap<K>
where
    K: Hash + Eq + Clone + Send + Sync,
{
    entries: Arc<RwLock<HashMap<K, Instant>>>,
}

impl<K> DeadlineMap<K>
where
    K: Hash + Eq + Clone + Send + Sync,
{
    /// Create an empty map.
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Check whether a non-expired entry exists for `key`.
    ///
    /// A deadline equal to the current instant counts as expired.
    pub async fn contains(&self, key: &K) -> bool {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(deadline) => Instant::now() < *deadline,
            None => false,
        }
    }

    /// Insert or refresh an entry expiring `ttl` from now.
    ///
    /// Overwrites any existing deadline, so re-inserting extends the
    /// penalty. Inserting with the same clock reading is idempotent.
    pub async fn insert(&self, key: K, ttl: Duration) {
        let deadline = Instant::now() + ttl;
        let mut entries = self.entries.write().await;
        entries.insert(key, deadline);
    }

    /// Remove every expired entry.
    ///
    /// Idempotent: a second sweep with no newly expired entries is a
    /// no-op.
    pub async fn sweep(&self) {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_key, deadline| now < *deadline);
    }

    /// Number of entries currently stored, including expired ones that
    /// have not been swept yet.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the table holds no entries at all.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl<K> Default for DeadlineMap<K>
where
    K: Hash + Eq + Clone + Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Clone for DeadlineMap<K>
where
    K: Hash + Eq + Clone + Send + Sync,
{
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

/// Quarantine table keyed by textual source IP.
///
/// Written by the log watcher when an address crosses the failure
/// threshold, read by the accept loop before any protocol bytes are
/// exchanged.
#[derive(Debug, Clone, Default)]
pub struct BanList {
    inner: DeadlineMap<String>,
}

impl BanList {
    pub fn new() -> Self {
        Self {
            inner: DeadlineMap::new(),
        }
    }

    /// True iff `ip` has a non-expired ban.
    pub async fn is_banned(&self, ip: &str) -> bool {
        self.inner.contains(&ip.to_string()).await
    }

    /// Ban `ip` for `duration` from now, extending any existing ban.
    pub async fn ban(&self, ip: &str, duration: Duration) {
        tracing::info!(ip = %ip, duration_secs = duration.as_secs(), "banning address");
        self.inner.insert(ip.to_string(), duration).await;
    }

    /// Drop expired bans.
    pub async fn sweep(&self) {
        self.inner.sweep().await;
    }

    /// Number of tracked addresses (possibly including expired entries).
    pub async fn len(&self) -> usize {
        self.inner.len().await
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.is_empty().await
    }
}

/// Short-term penalty table keyed by the handshake peer (`ip:port`).
///
/// Populated by rejected public key checks, consulted before the next
/// credential is even looked at. Independent lifetime from [`BanList`]:
/// tens of seconds rather than minutes.
#[derive(Debug, Clone, Default)]
pub struct BackoffList {
    inner: DeadlineMap<String>,
}

impl BackoffList {
    pub fn new() -> Self {
        Self {
            inner: DeadlineMap::new(),
        }
    }

    /// True iff `peer` is still penalized from an earlier failure.
    pub async fn is_penalized(&self, peer: &str) -> bool {
        self.inner.contains(&peer.to_string()).await
    }

    /// Penalize `peer` for [`BACKOFF_DURATION`], refreshing any existing
    /// entry.
    pub async fn penalize(&self, peer: &str) {
        tracing::debug!(peer = %peer, "backing off peer after auth failure");
        self.inner.insert(peer.to_string(), BACKOFF_DURATION).await;
    }

    /// Drop expired penalties.
    pub async fn sweep(&self) {
        self.inner.sweep().await;
    }
}
