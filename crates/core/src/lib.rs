//! pod-index core types: the compact pod projection and the events that mutate the index.

#![forbid(unsafe_code)]

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque pod identifier (`metadata.uid`). Any non-empty string is a valid lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(String);

impl Uid {
    pub fn as_str(&self) -> &str { &self.0 }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl Borrow<str> for Uid {
    fn borrow(&self) -> &str { &self.0 }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for Uid {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

impl From<String> for Uid {
    fn from(s: String) -> Self { Self(s) }
}

/// Pod lifecycle phase as last reported upstream.
///
/// The upstream set is open: values this build does not know about are kept
/// verbatim in `Other` and serialize back to the same string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
    /// Upstream did not report a phase yet.
    #[default]
    Unset,
    Other(String),
}

impl PodPhase {
    pub fn as_str(&self) -> &str {
        match self {
            PodPhase::Pending => "Pending",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
            PodPhase::Unknown => "Unknown",
            PodPhase::Unset => "",
            PodPhase::Other(s) => s,
        }
    }
}

impl From<&str> for PodPhase {
    fn from(s: &str) -> Self {
        match s {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            "Unknown" => PodPhase::Unknown,
            "" => PodPhase::Unset,
            other => PodPhase::Other(other.to_string()),
        }
    }
}

impl From<String> for PodPhase {
    fn from(s: String) -> Self { PodPhase::from(s.as_str()) }
}

impl From<PodPhase> for String {
    fn from(p: PodPhase) -> Self {
        match p {
            PodPhase::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Compact projection of one pod at the time of its last event.
///
/// Records are never mutated after construction; an update replaces the whole record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodRecord {
    pub uid: Uid,
    pub name: String,
    pub namespace: String,
    /// Node the pod is scheduled on; empty while unscheduled.
    pub node_name: String,
    pub phase: PodPhase,
    #[serde(rename = "podIP")]
    pub pod_ip: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Upstream `metadata.creationTimestamp`, not the time the record entered the index.
    pub created_at: Option<DateTime<Utc>>,
}

impl PodRecord {
    /// `namespace/name` key, the same shape the API server uses for object keys.
    pub fn key(&self) -> String {
        if self.namespace.is_empty() { self.name.clone() } else { format!("{}/{}", self.namespace, self.name) }
    }
}

/// A watch event decoded once at the boundary; the index switches on the tag only.
#[derive(Debug, Clone, PartialEq)]
pub enum PodEvent {
    Add(PodRecord),
    Update {
        /// Previous projection if the source still knew it.
        prev: Option<PodRecord>,
        curr: PodRecord,
    },
    Delete(Uid),
    /// Deleted with unknown final state. `uid` is `None` when it could not be recovered.
    DeleteTombstone { key: String, uid: Option<Uid> },
}

impl PodEvent {
    /// Short label used for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            PodEvent::Add(_) => "add",
            PodEvent::Update { .. } => "update",
            PodEvent::Delete(_) => "delete",
            PodEvent::DeleteTombstone { .. } => "tombstone",
        }
    }
}

/// Message carried from the watch source to the ingest loop, in delivery order.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Event(PodEvent),
    /// Every event of the initial full listing has been sent ahead of this marker.
    InitialListDone,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(uid: &str, phase: PodPhase) -> PodRecord {
        PodRecord {
            uid: Uid::from(uid),
            name: "p1".into(),
            namespace: "default".into(),
            node_name: String::new(),
            phase,
            pod_ip: String::new(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            created_at: None,
        }
    }

    #[test]
    fn phase_open_set() {
        assert_eq!(PodPhase::from("Running"), PodPhase::Running);
        assert_eq!(PodPhase::from(""), PodPhase::Unset);
        let odd = PodPhase::from("Evicted");
        assert_eq!(odd, PodPhase::Other("Evicted".into()));
        assert_eq!(String::from(odd), "Evicted");
    }

    #[test]
    fn record_json_shape() {
        let mut r = record("u1", PodPhase::Running);
        r.pod_ip = "10.0.0.7".into();
        r.created_at = Some(DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z").unwrap().with_timezone(&Utc));
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["uid"], "u1");
        assert_eq!(v["phase"], "Running");
        assert_eq!(v["podIP"], "10.0.0.7");
        assert_eq!(v["nodeName"], "");
        assert_eq!(v["createdAt"], "2024-05-01T10:00:00Z");
        assert!(v.get("labels").is_none(), "empty labels are omitted");

        r.labels.insert("app".into(), "web".into());
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["labels"]["app"], "web");
    }

    #[test]
    fn unknown_phase_survives_json() {
        let r = record("u2", PodPhase::from("SomethingNew"));
        let s = serde_json::to_string(&r).unwrap();
        let back: PodRecord = serde_json::from_str(&s).unwrap();
        assert_eq!(back.phase.as_str(), "SomethingNew");
        let missing_maps: PodRecord = serde_json::from_str(
            r#"{"uid":"u3","name":"n","namespace":"","nodeName":"","phase":"","podIP":"","createdAt":null}"#,
        ).unwrap();
        assert!(missing_maps.labels.is_empty());
        assert_eq!(missing_maps.phase, PodPhase::Unset);
    }

    #[test]
    fn event_kinds_and_keys() {
        let ev = PodEvent::Update { prev: None, curr: record("u4", PodPhase::Pending) };
        assert_eq!(ev.kind(), "update");
        let ts = PodEvent::DeleteTombstone { key: "default/p1".into(), uid: None };
        assert_eq!(ts.kind(), "tombstone");
        assert_eq!(record("u5", PodPhase::Unset).key(), "default/p1");
        let mut bare = record("u6", PodPhase::Unset);
        bare.namespace.clear();
        assert_eq!(bare.key(), "p1");
    }
}
