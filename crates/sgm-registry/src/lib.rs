//! Process-wide mapping from receiver serial number to a mutable status
//! record (`ActiveSg`). Entries are never removed; once created, a
//! record's `Arc` is stable and may be retained indefinitely by any
//! consumer.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use sgm_protocol::{Serno, Timestamp};
use serde::Serialize;
use tokio::sync::{Mutex, OnceCell, RwLock};

/// Values used to populate a brand-new [`ActiveSg`] record.
#[derive(Debug, Clone, Copy)]
pub struct ActiveSgInit {
    pub ts_conn: Timestamp,
    pub ts_last_sync: Timestamp,
    pub tunnel_port: u16,
    pub connected: bool,
}

struct Mutable {
    ts_conn: Timestamp,
    ts_last_sync: Timestamp,
    ts_next_sync: Timestamp,
    connected: bool,
}

/// A receiver's live status. `serno` and `tunnel_port` are immutable once
/// the record is created; every other field is guarded by an internal
/// mutex — callers must go through the accessor methods rather than
/// reaching in directly.
pub struct ActiveSg {
    pub serno: Serno,
    pub tunnel_port: u16,
    inner: Mutex<Mutable>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveSgSnapshot {
    #[serde(rename = "Serno")]
    pub serno: String,
    #[serde(rename = "TsConn")]
    pub ts_conn: f64,
    #[serde(rename = "TsLastSync")]
    pub ts_last_sync: f64,
    #[serde(rename = "TsNextSync")]
    pub ts_next_sync: f64,
    #[serde(rename = "TunnelPort")]
    pub tunnel_port: u16,
    #[serde(rename = "Connected")]
    pub connected: bool,
}

impl ActiveSg {
    fn new(serno: Serno, init: ActiveSgInit) -> Self {
        ActiveSg {
            serno,
            tunnel_port: init.tunnel_port,
            inner: Mutex::new(Mutable {
                ts_conn: init.ts_conn,
                ts_last_sync: init.ts_last_sync,
                ts_next_sync: Timestamp::ZERO,
                connected: init.connected,
            }),
        }
    }

    pub async fn connected(&self) -> bool {
        self.inner.lock().await.connected
    }

    pub async fn set_connected(&self, connected: bool) {
        self.inner.lock().await.connected = connected;
    }

    pub async fn ts_conn(&self) -> Timestamp {
        self.inner.lock().await.ts_conn
    }

    pub async fn set_ts_conn(&self, ts: Timestamp) {
        self.inner.lock().await.ts_conn = ts;
    }

    pub async fn ts_last_sync(&self) -> Timestamp {
        self.inner.lock().await.ts_last_sync
    }

    pub async fn set_ts_last_sync(&self, ts: Timestamp) {
        self.inner.lock().await.ts_last_sync = ts;
    }

    pub async fn ts_next_sync(&self) -> Timestamp {
        self.inner.lock().await.ts_next_sync
    }

    pub async fn set_ts_next_sync(&self, ts: Timestamp) {
        self.inner.lock().await.ts_next_sync = ts;
    }

    /// Applies a connect/disconnect/sync-launched/sync-pending transition
    /// under a single lock acquisition.
    pub async fn apply_connect(&self, ts: Timestamp) {
        let mut g = self.inner.lock().await;
        g.ts_conn = ts;
        g.connected = true;
    }

    pub async fn apply_disconnect(&self) {
        self.inner.lock().await.connected = false;
    }

    pub async fn snapshot(&self) -> ActiveSgSnapshot {
        let g = self.inner.lock().await;
        ActiveSgSnapshot {
            serno: self.serno.to_string(),
            ts_conn: g.ts_conn.as_secs_f64(),
            ts_last_sync: g.ts_last_sync.as_secs_f64(),
            ts_next_sync: g.ts_next_sync.as_secs_f64(),
            tunnel_port: self.tunnel_port,
            connected: g.connected,
        }
    }
}

/// The registry itself: `Serno -> Arc<ActiveSg>`.
///
/// Each map slot is a `OnceCell`, not the record directly, so the
/// registry-wide lock is only ever held for the in-memory map mutation
/// (reserving or looking up a slot) — never across `init`'s awaited I/O.
/// The `OnceCell` itself serializes concurrent callers for the same
/// serno without blocking callers working with any other serno.
#[derive(Default)]
pub struct Registry {
    entries: RwLock<HashMap<Serno, Arc<OnceCell<Arc<ActiveSg>>>>>,
}

impl Registry {
    pub fn new() -> Arc<Registry> {
        Arc::new(Registry {
            entries: RwLock::new(HashMap::new()),
        })
    }

    /// Returns the existing record for `serno`, or atomically creates one
    /// using `init`. `init` may perform its own I/O (e.g. store reads);
    /// concurrent callers for the same serno are serialized by the
    /// slot's `OnceCell` so exactly one `init` runs, but the registry-wide
    /// lock is released before `init` is awaited — a slow bootstrap for
    /// one receiver never stalls lookups for any other.
    pub async fn load_or_create<F, Fut>(&self, serno: &Serno, init: F) -> Arc<ActiveSg>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ActiveSgInit>,
    {
        let cell = match self.entries.read().await.get(serno) {
            Some(cell) => cell.clone(),
            None => {
                let mut entries = self.entries.write().await;
                entries
                    .entry(serno.clone())
                    .or_insert_with(|| Arc::new(OnceCell::new()))
                    .clone()
            }
        };
        let serno = serno.clone();
        cell.get_or_init(|| async move {
            let values = init().await;
            Arc::new(ActiveSg::new(serno, values))
        })
        .await
        .clone()
    }

    pub async fn get(&self, serno: &Serno) -> Option<Arc<ActiveSg>> {
        let cell = self.entries.read().await.get(serno).cloned()?;
        cell.get().cloned()
    }

    /// Returns a snapshot of every fully-initialized record. Entries whose
    /// `init` is still in flight are omitted until it completes — the
    /// same window during which, pre-`OnceCell`, the record simply didn't
    /// exist in the map yet. Callers must take each record's own lock (via
    /// the async accessor methods) before touching mutable fields; no
    /// registry-wide lock is held once this call returns.
    pub async fn snapshot(&self) -> Vec<Arc<ActiveSg>> {
        let cells: Vec<_> = self.entries.read().await.values().cloned().collect();
        cells.iter().filter_map(|cell| cell.get().cloned()).collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serno() -> Serno {
        Serno::parse("SG-0000000000AA").unwrap()
    }

    fn default_init() -> ActiveSgInit {
        ActiveSgInit {
            ts_conn: Timestamp::now(),
            ts_last_sync: Timestamp::ZERO,
            tunnel_port: 20001,
            connected: true,
        }
    }

    #[tokio::test]
    async fn load_or_create_returns_the_same_pointer_across_calls() {
        let registry = Registry::new();
        let sn = serno();
        let a = registry.load_or_create(&sn, || async { default_init() }).await;
        let b = registry.load_or_create(&sn, || async { panic!("init must not run twice") }).await;
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn concurrent_load_or_create_runs_init_exactly_once() {
        let registry = Registry::new();
        let sn = serno();
        let init_calls = Arc::new(std::sync::atomic::AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let registry = registry.clone();
            let sn = sn.clone();
            let init_calls = init_calls.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .load_or_create(&sn, || async move {
                        init_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        default_init()
                    })
                    .await
            }));
        }
        let mut records = Vec::new();
        for h in handles {
            records.push(h.await.unwrap());
        }
        assert_eq!(init_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        for r in &records[1..] {
            assert!(Arc::ptr_eq(&records[0], r));
        }
    }

    #[tokio::test]
    async fn entries_are_never_removed_and_tunnel_port_is_immutable() {
        let registry = Registry::new();
        let sn = serno();
        let record = registry.load_or_create(&sn, || async { default_init() }).await;
        record.apply_disconnect().await;
        assert_eq!(registry.len().await, 1);
        assert_eq!(record.tunnel_port, 20001);
        assert!(registry.get(&sn).await.is_some());
    }

    #[tokio::test]
    async fn a_slow_init_for_one_serno_does_not_block_lookups_for_another() {
        let registry = Registry::new();
        let slow = serno();
        let fast = Serno::parse("SG-1111111111BB").unwrap();
        let gate = Arc::new(tokio::sync::Notify::new());

        let registry_for_slow = registry.clone();
        let slow_sn = slow.clone();
        let gate_for_slow = gate.clone();
        let slow_handle = tokio::spawn(async move {
            registry_for_slow
                .load_or_create(&slow_sn, || async move {
                    gate_for_slow.notified().await;
                    default_init()
                })
                .await
        });

        // Give the slow init a chance to start (and, pre-fix, to be
        // holding the registry's write lock) before racing the fast path.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let fast_result = tokio::time::timeout(
            std::time::Duration::from_millis(500),
            registry.load_or_create(&fast, || async { default_init() }),
        )
        .await;
        assert!(
            fast_result.is_ok(),
            "a concurrent, unrelated load_or_create must not wait on another serno's init"
        );

        gate.notify_one();
        let _ = slow_handle.await;
    }

    #[tokio::test]
    async fn snapshot_reflects_topic_specific_updates() {
        let registry = Registry::new();
        let sn = serno();
        let record = registry.load_or_create(&sn, || async { default_init() }).await;
        let launch_ts = Timestamp::from_secs_f64(123.0);
        record.set_ts_last_sync(launch_ts).await;
        let snap = record.snapshot().await;
        assert_eq!(snap.ts_last_sync, 123.0);
        assert!(snap.connected);
    }
}
