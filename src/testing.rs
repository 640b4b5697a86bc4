//! Fixtures shared by unit tests.

use std::sync::{Arc, Mutex};

use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::ObjectMeta,
    core::ErrorResponse,
    runtime::{
        reflector::{self, Store},
        watcher,
    },
};
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    informer::{Informer, PodEvent},
    reconcile::PodUpdater,
};

pub fn pod(namespace: &str, name: &str, labels: &[(&str, &str)]) -> Pod {
    Pod {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            resource_version: Some("1".to_string()),
            labels: (!labels.is_empty()).then(|| {
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect()
            }),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Reflector store that has completed its initial listing with `pods`.
pub fn synced_store(pods: impl IntoIterator<Item = Pod>) -> (Store<Pod>, reflector::store::Writer<Pod>) {
    let (store, mut writer) = reflector::store();
    writer.apply_watcher_event(&watcher::Event::Init);
    for pod in pods {
        writer.apply_watcher_event(&watcher::Event::InitApply(pod));
    }
    writer.apply_watcher_event(&watcher::Event::InitDone);
    (store, writer)
}

/// Feed a complete listing of `pods` through the informer.
pub fn list(informer: &mut Informer, pods: Vec<Pod>) -> Vec<PodEvent> {
    let mut events = informer.apply(watcher::Event::Init);
    for pod in pods {
        events.extend(informer.apply(watcher::Event::InitApply(pod)));
    }
    events.extend(informer.apply(watcher::Event::InitDone));
    events
}

pub fn conflict() -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: "the object has been modified; please apply your changes to the latest version and try again".to_string(),
        reason: "Conflict".to_string(),
        code: 409,
    })
}

#[derive(Default)]
struct FakeApiServer {
    writes: Vec<Pod>,
    failures_left: usize,
    resource_version: u64,
}

/// In-memory write API. Successful writes get a fresh resource version and,
/// when an echo channel is set, are sent back the way a watch would deliver them.
#[derive(Clone, Default)]
pub struct FakeUpdater {
    server: Arc<Mutex<FakeApiServer>>,
    echo: Option<UnboundedSender<Pod>>,
}

impl FakeUpdater {
    pub fn echoing(echo: UnboundedSender<Pod>) -> Self {
        Self {
            echo: Some(echo),
            ..Default::default()
        }
    }

    /// Answer the next `n` writes with a conflict.
    pub fn fail_next(&self, n: usize) {
        self.server.lock().unwrap().failures_left = n;
    }

    pub fn writes(&self) -> Vec<Pod> {
        self.server.lock().unwrap().writes.clone()
    }
}

impl PodUpdater for FakeUpdater {
    async fn replace(&self, pod: &Pod) -> Result<Pod, kube::Error> {
        let mut server = self.server.lock().unwrap();
        if server.failures_left > 0 {
            server.failures_left -= 1;
            return Err(conflict());
        }
        server.resource_version += 1;
        let mut stored = pod.clone();
        stored.metadata.resource_version = Some(format!("{}", 100 + server.resource_version));
        server.writes.push(stored.clone());
        if let Some(echo) = &self.echo {
            let _ = echo.send(stored.clone());
        }
        Ok(stored)
    }
}
