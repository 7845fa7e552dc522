//! pod-index kubehub: pod list+watch wiring, projection and boundary decoding.
//!
//! The watcher turns kube-runtime events into raw [`WatchNotification`]s (diffing each
//! relist against what it has seen), [`decode`] projects them once into typed
//! [`PodEvent`]s, and the result is sent in order to the ingest loop.

#![forbid(unsafe_code)]

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::Api,
    runtime::{watcher::{self, Event}, WatchStreamExt},
    Client,
};
use metrics::counter;
use podindex_core::{Delivery, PodEvent, PodPhase, PodRecord, Uid};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Raw notification as delivered by the watch source, before projection.
#[derive(Debug, Clone)]
pub enum WatchNotification {
    Add(Pod),
    Update { prev: Pod, curr: Pod },
    Delete(Pod),
    /// The pod disappeared while the watch was not looking; only its last known state is left.
    DeleteTombstone { key: String, last_known: Option<Pod> },
}

/// Build a client from in-cluster config, falling back to the local kubeconfig.
pub async fn client() -> Result<Client> {
    Client::try_default().await.context("building kube client (in-cluster config or kubeconfig)")
}

/// Pod API scoped to one namespace, or cluster-wide when `namespace` is `None`.
pub fn pod_api(client: Client, namespace: Option<&str>) -> Api<Pod> {
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Project a pod into its compact record. Missing fields become empty values.
pub fn project_pod(pod: &Pod) -> PodRecord {
    let meta = &pod.metadata;
    let spec = pod.spec.as_ref();
    let status = pod.status.as_ref();
    PodRecord {
        uid: Uid::from(meta.uid.clone().unwrap_or_default()),
        name: meta.name.clone().unwrap_or_default(),
        namespace: meta.namespace.clone().unwrap_or_default(),
        node_name: spec.and_then(|s| s.node_name.clone()).unwrap_or_default(),
        phase: status.and_then(|s| s.phase.as_deref()).map(PodPhase::from).unwrap_or_default(),
        pod_ip: status.and_then(|s| s.pod_ip.clone()).unwrap_or_default(),
        labels: meta.labels.clone().unwrap_or_default(),
        annotations: meta.annotations.clone().unwrap_or_default(),
        created_at: meta.creation_timestamp.as_ref().map(|t| t.0),
    }
}

fn pod_uid(pod: &Pod) -> Option<&str> { pod.metadata.uid.as_deref().filter(|u| !u.is_empty()) }

fn object_key(pod: &Pod) -> String {
    let name = pod.metadata.name.as_deref().unwrap_or("");
    match pod.metadata.namespace.as_deref() {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
        _ => name.to_string(),
    }
}

fn keyed(pod: &Pod, kind: &'static str) -> Option<PodRecord> {
    if pod_uid(pod).is_none() {
        warn!(kind, key = %object_key(pod), "pod without metadata.uid; event dropped");
        counter!("watch_events_dropped_total", 1u64, "kind" => kind);
        return None;
    }
    Some(project_pod(pod))
}

/// Decode one raw notification into the typed event the index consumes.
///
/// Returns `None` when the event cannot be keyed (no uid). A tombstone always decodes;
/// its uid is `None` if the last known state is missing or carries no uid.
pub fn decode(n: &WatchNotification) -> Option<PodEvent> {
    match n {
        WatchNotification::Add(pod) => keyed(pod, "add").map(PodEvent::Add),
        WatchNotification::Update { prev, curr } => keyed(curr, "update").map(|curr| PodEvent::Update {
            prev: pod_uid(prev).map(|_| project_pod(prev)),
            curr,
        }),
        WatchNotification::Delete(pod) => match pod_uid(pod) {
            Some(uid) => Some(PodEvent::Delete(Uid::from(uid))),
            None => {
                keyed(pod, "delete");
                None
            }
        },
        WatchNotification::DeleteTombstone { key, last_known } => Some(PodEvent::DeleteTombstone {
            key: key.clone(),
            uid: last_known.as_ref().and_then(pod_uid).map(Uid::from),
        }),
    }
}

/// Turns kube-runtime watcher events into ordered deliveries.
///
/// Remembers the last pod seen per uid so that updates carry their previous state and a
/// relist can report pods that vanished in between as tombstones.
#[derive(Default)]
pub struct Translator {
    known: HashMap<String, Pod>,
    bootstrapped: bool,
}

impl Translator {
    pub fn new() -> Self { Self::default() }

    pub fn known(&self) -> usize { self.known.len() }

    fn applied(&mut self, pod: Pod) -> WatchNotification {
        let prev = match pod_uid(&pod) {
            Some(uid) => self.known.insert(uid.to_string(), pod.clone()),
            None => None,
        };
        match prev {
            Some(prev) => WatchNotification::Update { prev, curr: pod },
            None => WatchNotification::Add(pod),
        }
    }

    fn notifications(&mut self, ev: Event<Pod>) -> Vec<WatchNotification> {
        match ev {
            Event::Applied(pod) => vec![self.applied(pod)],
            Event::Deleted(pod) => {
                if let Some(uid) = pod_uid(&pod) {
                    self.known.remove(uid);
                }
                vec![WatchNotification::Delete(pod)]
            }
            Event::Restarted(list) => {
                counter!("watch_restarts_total", 1u64);
                debug!(count = list.len(), "watch restart");
                let mut stale = std::mem::take(&mut self.known);
                let mut out = Vec::with_capacity(list.len());
                for pod in list {
                    let prev = pod_uid(&pod).and_then(|uid| stale.remove(uid));
                    if let Some(uid) = pod_uid(&pod) {
                        self.known.insert(uid.to_string(), pod.clone());
                    }
                    out.push(match prev {
                        Some(prev) => WatchNotification::Update { prev, curr: pod },
                        None => WatchNotification::Add(pod),
                    });
                }
                for (_, last) in stale.drain() {
                    out.push(WatchNotification::DeleteTombstone { key: object_key(&last), last_known: Some(last) });
                }
                out
            }
        }
    }

    /// Translate one watcher event. The first relist is followed by `InitialListDone`.
    pub fn translate(&mut self, ev: Event<Pod>) -> Vec<Delivery> {
        let initial = matches!(ev, Event::Restarted(_)) && !self.bootstrapped;
        let mut out: Vec<Delivery> = self
            .notifications(ev)
            .iter()
            .filter_map(decode)
            .map(Delivery::Event)
            .collect();
        if initial {
            self.bootstrapped = true;
            info!(pods = self.known.len(), "initial pod listing delivered");
            out.push(Delivery::InitialListDone);
        }
        out
    }
}

/// Drive a watcher event stream into the ingest channel.
///
/// Stream errors are logged and skipped (the backoff wrapper paces retries). Returns `Ok`
/// when the ingest side hangs up and an error if the stream itself ends.
pub async fn pump<S>(stream: S, tx: mpsc::Sender<Delivery>) -> Result<()>
where
    S: Stream<Item = Result<Event<Pod>, watcher::Error>>,
{
    futures::pin_mut!(stream);
    let mut translator = Translator::new();
    while let Some(item) = stream.next().await {
        match item {
            Ok(ev) => {
                for d in translator.translate(ev) {
                    if tx.send(d).await.is_err() {
                        info!("ingest channel closed; stopping pod watcher");
                        return Ok(());
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "pod watch error; backing off");
                counter!("watch_errors_total", 1u64);
            }
        }
    }
    warn!(known = translator.known(), "pod watcher stream ended");
    Err(anyhow!("pod watch stream ended"))
}

/// Start list+watch for pods and send ordered deliveries into `tx`.
pub async fn start_watcher(api: Api<Pod>, tx: mpsc::Sender<Delivery>) -> Result<()> {
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    info!("pod watcher started");
    pump(stream, tx).await
}
