//! pod-index query façade.
//!
//! Frontends (the HTTP layer) depend on the [`PodApi`] trait only. The in-process
//! implementation reads straight from a shared [`PodIndex`].

#![forbid(unsafe_code)]

use std::sync::Arc;

use metrics::counter;
use podindex_core::PodRecord;
use podindex_store::PodIndex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Query errors. Both are normal request outcomes, not faults.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ApiError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    NotFound(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Health {
    Healthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Readiness {
    Ready { pod_count: usize },
    NotReady,
}

/// Runtime view of the index for logs and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Stats {
    pub pod_count: usize,
    pub synced: bool,
}

/// Read-only query surface over the pod index.
pub trait PodApi: Send + Sync {
    /// Look up a pod by uid. An empty uid is rejected before the index is consulted.
    fn lookup_by_id(&self, uid: &str) -> ApiResult<Arc<PodRecord>>;

    /// Process liveness; independent of sync state.
    fn liveness(&self) -> Health;

    /// `Ready` once the initial sync completed. No side effects.
    fn readiness(&self) -> Readiness;

    fn stats(&self) -> Stats;
}

/// In-process implementation backed by a shared index.
#[derive(Clone)]
pub struct InProcApi {
    index: Arc<PodIndex>,
}

impl InProcApi {
    pub fn new(index: Arc<PodIndex>) -> Self { Self { index } }
}

impl PodApi for InProcApi {
    fn lookup_by_id(&self, uid: &str) -> ApiResult<Arc<PodRecord>> {
        if uid.is_empty() {
            return Err(ApiError::InvalidArgument("uid parameter is required".into()));
        }
        match self.index.get(uid) {
            Some(rec) => {
                counter!("pod_lookups_total", 1u64, "outcome" => "hit");
                Ok(rec)
            }
            None => {
                debug!(uid = %uid, "pod lookup miss");
                counter!("pod_lookups_total", 1u64, "outcome" => "miss");
                Err(ApiError::NotFound(format!("pod with UID {} not found", uid)))
            }
        }
    }

    fn liveness(&self) -> Health { Health::Healthy }

    fn readiness(&self) -> Readiness {
        if self.index.is_synced() {
            Readiness::Ready { pod_count: self.index.count() }
        } else {
            Readiness::NotReady
        }
    }

    fn stats(&self) -> Stats { Stats { pod_count: self.index.count(), synced: self.index.is_synced() } }
}
