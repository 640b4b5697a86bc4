//! Pod watch with a local cache.
//!
//! kube's watcher only reports the current state of an object. The router
//! needs the previous one as well to detect label transitions, so every event
//! is compared against the reflector store before the store is updated.

use std::{collections::HashSet, sync::Arc};

use futures_util::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    runtime::{
        reflector::{self, store::Writer, ObjectRef, Store},
        watcher, WatchStreamExt,
    },
    Api,
};
use stopper::Stopper;

/// A change observed on a watched pod.
#[derive(Clone, Debug)]
pub enum PodEvent {
    Added(Arc<Pod>),
    Updated { old: Arc<Pod>, new: Arc<Pod> },
    Deleted(Arc<Pod>),
}

pub struct Informer {
    store: Store<Pod>,
    writer: Writer<Pod>,
    /// Objects seen since the last `Init`, while a (re-)list is in progress
    relisted: Option<HashSet<ObjectRef<Pod>>>,
}

impl Default for Informer {
    fn default() -> Self {
        Self::new()
    }
}

impl Informer {
    pub fn new() -> Self {
        let (store, writer) = reflector::store();
        Self {
            store,
            writer,
            relisted: None,
        }
    }

    /// Read-only handle on the cache. Becomes ready after the first full listing.
    pub fn store(&self) -> Store<Pod> {
        self.store.clone()
    }

    /// Apply one watcher event to the cache and translate it into pod events.
    pub fn apply(&mut self, event: watcher::Event<Pod>) -> Vec<PodEvent> {
        let mut events = Vec::new();
        match &event {
            watcher::Event::Apply(pod) => events.push(self.applied(pod)),
            watcher::Event::Delete(pod) => events.push(PodEvent::Deleted(Arc::new(pod.clone()))),
            watcher::Event::Init => {
                self.relisted = Some(HashSet::new());
            }
            watcher::Event::InitApply(pod) => {
                if let Some(seen) = self.relisted.as_mut() {
                    seen.insert(ObjectRef::from_obj(pod));
                }
                events.push(self.applied(pod));
            }
            watcher::Event::InitDone => {
                // Whatever the listing did not return was deleted while the watch was down
                let seen = self.relisted.take().unwrap_or_default();
                events.extend(
                    self.store
                        .state()
                        .into_iter()
                        .filter(|pod| !seen.contains(&ObjectRef::<Pod>::from_obj(pod)))
                        .map(PodEvent::Deleted),
                );
            }
        }
        self.writer.apply_watcher_event(&event);
        events
    }

    fn applied(&self, pod: &Pod) -> PodEvent {
        let new = Arc::new(pod.clone());
        match self.store.get(&ObjectRef::from_obj(pod)) {
            Some(old) => PodEvent::Updated { old, new },
            None => PodEvent::Added(new),
        }
    }

    /// Watch `api` until `stopper` fires, handing every pod event to `handler`.
    ///
    /// Watch errors are retried with backoff and never end the loop.
    pub async fn run<F>(mut self, api: Api<Pod>, config: watcher::Config, stopper: Stopper, mut handler: F)
    where
        F: FnMut(PodEvent),
    {
        let stream = watcher(api, config).default_backoff();
        futures_util::pin_mut!(stream);

        while let Some(Some(item)) = stopper.stop_future(stream.next()).await {
            match item {
                Ok(event) => {
                    for pod_event in self.apply(event) {
                        handler(pod_event);
                    }
                }
                Err(error) => {
                    tracing::warn!(%error, "pod watch failed, retrying");
                }
            }
        }
        tracing::info!("pod watch stopped");
    }
}
