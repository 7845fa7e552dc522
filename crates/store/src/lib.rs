//! pod-index store: the UID-keyed pod index and the ingest loop that feeds it.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use parking_lot::RwLock;
use podindex_core::{Delivery, PodEvent, PodRecord, Uid};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Concurrency-safe map from pod UID to its latest record, plus the one-way `synced` flag.
///
/// Writers (the ingest loop) take the lock exclusively; lookups share it. Records are
/// handed out as `Arc`s, so a reader keeps a consistent record even if it is replaced
/// right after the lookup.
pub struct PodIndex {
    pods: RwLock<FxHashMap<Uid, Arc<PodRecord>>>,
    synced: watch::Sender<bool>,
}

impl Default for PodIndex {
    fn default() -> Self { Self::new() }
}

impl PodIndex {
    pub fn new() -> Self {
        let (synced, _) = watch::channel(false);
        Self { pods: RwLock::new(FxHashMap::default()), synced }
    }

    pub fn apply_add(&self, rec: PodRecord) { self.apply(PodEvent::Add(rec)); }

    pub fn apply_update(&self, rec: PodRecord) { self.apply(PodEvent::Update { prev: None, curr: rec }); }

    /// Remove the record for `uid`. Unknown uids are a no-op; returns whether a record was removed.
    pub fn apply_delete(&self, uid: &str) -> bool { self.apply(PodEvent::Delete(Uid::from(uid))) }

    /// Apply one decoded watch event. Returns whether the index changed.
    pub fn apply(&self, ev: PodEvent) -> bool {
        let kind = ev.kind();
        let (changed, len) = match ev {
            PodEvent::Add(rec) | PodEvent::Update { curr: rec, .. } => {
                debug!(uid = %rec.uid, key = %rec.key(), kind, "pod upserted");
                let mut pods = self.pods.write();
                pods.insert(rec.uid.clone(), Arc::new(rec));
                (true, pods.len())
            }
            PodEvent::Delete(uid) | PodEvent::DeleteTombstone { uid: Some(uid), .. } => {
                let mut pods = self.pods.write();
                let removed = pods.remove(uid.as_str()).is_some();
                debug!(uid = %uid, kind, removed, "pod deleted");
                (removed, pods.len())
            }
            PodEvent::DeleteTombstone { key, uid: None } => {
                // Nothing to key the delete on; the next relist will not resurrect it either.
                warn!(key = %key, "tombstone without recoverable uid; dropped");
                counter!("pod_index_tombstones_dropped_total", 1u64);
                return false;
            }
        };
        counter!("pod_index_events_total", 1u64, "kind" => kind);
        gauge!("pod_index_entries", len as f64);
        changed
    }

    pub fn get(&self, uid: &str) -> Option<Arc<PodRecord>> { self.pods.read().get(uid).cloned() }

    pub fn count(&self) -> usize { self.pods.read().len() }

    /// Flip `synced` to true. Later calls are no-ops.
    pub fn mark_synced(&self) {
        let flipped = self.synced.send_if_modified(|v| {
            if *v { false } else { *v = true; true }
        });
        if flipped {
            info!(pods = self.count(), "pod index marked synced");
        }
    }

    pub fn is_synced(&self) -> bool { *self.synced.borrow() }
}

/// Handle on a running ingest loop.
pub struct IngestHandle {
    bootstrapped: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl IngestHandle {
    /// True once every event of the initial listing has been applied to the index.
    pub fn has_completed_initial_sync(&self) -> bool { *self.bootstrapped.borrow() }

    /// Wait until the initial listing has been applied, or `timeout` elapses.
    ///
    /// Returns false on timeout or if the ingest loop stopped before the listing completed.
    pub async fn wait_for_initial_sync(&self, timeout: Duration) -> bool {
        let mut rx = self.bootstrapped.clone();
        let done = matches!(tokio::time::timeout(timeout, rx.wait_for(|done| *done)).await, Ok(Ok(_)));
        done
    }

    pub fn abort(&self) { self.task.abort() }
}

/// Spawn the single consumer that applies deliveries to `index` in order.
/// Returns the sender the watch source writes into and a handle for the bootstrap signal.
pub fn spawn_ingest(index: Arc<PodIndex>, cap: usize) -> (mpsc::Sender<Delivery>, IngestHandle) {
    let (tx, mut rx) = mpsc::channel::<Delivery>(cap.max(1));
    let (boot_tx, boot_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut applied = 0u64;
        while let Some(d) = rx.recv().await {
            match d {
                Delivery::Event(ev) => {
                    index.apply(ev);
                    applied += 1;
                }
                Delivery::InitialListDone => {
                    if !*boot_tx.borrow() {
                        info!(applied, pods = index.count(), "initial listing applied");
                    }
                    boot_tx.send_replace(true);
                }
            }
        }
        debug!("delivery channel closed; exiting ingest loop");
        info!(applied, "ingest loop stopped");
    });

    (tx, IngestHandle { bootstrapped: boot_rx, task })
}

#[cfg(test)]
mod tests {
    use super::*;
    use podindex_core::PodPhase;
    use std::collections::BTreeMap;

    fn rec(uid: &str, name: &str, phase: &str) -> PodRecord {
        PodRecord {
            uid: Uid::from(uid),
            name: name.to_string(),
            namespace: "default".to_string(),
            node_name: "node-a".to_string(),
            phase: PodPhase::from(phase),
            pod_ip: String::new(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            created_at: None,
        }
    }

    #[test]
    fn add_then_get() {
        let idx = PodIndex::new();
        idx.apply_add(rec("u1", "p1", "Running"));
        let got = idx.get("u1").expect("u1 present");
        assert_eq!(got.name, "p1");
        assert_eq!(got.phase, PodPhase::Running);
        assert!(idx.get("u2").is_none());
    }

    #[test]
    fn repeated_upserts_keep_one_entry() {
        let idx = PodIndex::new();
        idx.apply_add(rec("u1", "p1", "Pending"));
        idx.apply_add(rec("u1", "p1", "Pending"));
        idx.apply_update(rec("u1", "p1", "Running"));
        idx.apply_update(rec("u1", "p1", "Succeeded"));
        assert_eq!(idx.count(), 1);
    }

    #[test]
    fn last_write_wins() {
        let idx = PodIndex::new();
        idx.apply_add(rec("u1", "a", "Pending"));
        idx.apply_update(rec("u1", "b", "Running"));
        let got = idx.get("u1").unwrap();
        assert_eq!(got.name, "b");
        assert_eq!(got.phase, PodPhase::Running);
    }

    #[test]
    fn delete_is_idempotent() {
        let idx = PodIndex::new();
        assert!(!idx.apply_delete("never-seen"));
        idx.apply_add(rec("u1", "p1", "Running"));
        assert!(idx.apply_delete("u1"));
        assert!(!idx.apply_delete("u1"));
        assert_eq!(idx.count(), 0);
    }

    #[test]
    fn held_record_is_not_affected_by_replacement() {
        let idx = PodIndex::new();
        idx.apply_add(rec("u1", "old", "Pending"));
        let held = idx.get("u1").unwrap();
        idx.apply_update(rec("u1", "new", "Running"));
        idx.apply_delete("u1");
        assert_eq!(held.name, "old");
        assert_eq!(held.phase, PodPhase::Pending);
    }

    #[test]
    fn tombstones() {
        let idx = PodIndex::new();
        idx.apply(PodEvent::Add(rec("u1", "p1", "Running")));
        idx.apply(PodEvent::Add(rec("u2", "p2", "Running")));

        assert!(idx.apply(PodEvent::DeleteTombstone { key: "default/p1".into(), uid: Some(Uid::from("u1")) }));
        assert!(idx.get("u1").is_none());
        assert!(!idx.apply(PodEvent::DeleteTombstone { key: "default/p1".into(), uid: Some(Uid::from("u1")) }));

        // Unrecoverable uid: nothing changes.
        assert!(!idx.apply(PodEvent::DeleteTombstone { key: "default/p2".into(), uid: None }));
        assert_eq!(idx.count(), 1);
        assert!(idx.get("u2").is_some());
    }

    #[test]
    fn update_event_uses_current_record() {
        let idx = PodIndex::new();
        idx.apply(PodEvent::Update { prev: Some(rec("u1", "p1", "Pending")), curr: rec("u1", "p1", "Failed") });
        assert_eq!(idx.get("u1").unwrap().phase, PodPhase::Failed);
    }

    #[test]
    fn synced_is_monotonic() {
        let idx = PodIndex::new();
        assert!(!idx.is_synced());
        idx.apply_add(rec("u1", "p1", "Running"));
        assert!(!idx.is_synced());
        idx.mark_synced();
        assert!(idx.is_synced());
        idx.apply_delete("u1");
        idx.apply_add(rec("u2", "p2", "Running"));
        idx.mark_synced();
        assert!(idx.is_synced());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ingest_flags_bootstrap_after_listing() {
        let idx = Arc::new(PodIndex::new());
        let (tx, handle) = spawn_ingest(Arc::clone(&idx), 16);
        assert!(!handle.has_completed_initial_sync());
        tx.send(Delivery::Event(PodEvent::Add(rec("u1", "p1", "Running")))).await.unwrap();
        tx.send(Delivery::Event(PodEvent::Add(rec("u2", "p2", "Pending")))).await.unwrap();
        tx.send(Delivery::InitialListDone).await.unwrap();
        assert!(handle.wait_for_initial_sync(Duration::from_secs(2)).await);
        assert!(handle.has_completed_initial_sync());
        // The marker trails the listing in the same queue, so both pods are already in.
        assert_eq!(idx.count(), 2);
        // Bootstrap from the source does not flip the index flag by itself.
        assert!(!idx.is_synced());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ingest_wait_times_out_without_listing() {
        let idx = Arc::new(PodIndex::new());
        let (tx, handle) = spawn_ingest(idx, 4);
        assert!(!handle.wait_for_initial_sync(Duration::from_millis(50)).await);
        drop(tx);
        assert!(!handle.wait_for_initial_sync(Duration::from_millis(50)).await);
    }
}
