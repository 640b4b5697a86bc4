use k8s_openapi::api::core::v1::Pod;

use crate::{informer::PodEvent, labels::LabelRules, queue::WorkQueue, types::ObjectKey};

/// Turns pod events into queued keys.
///
/// Handlers never block: they only look at the snapshots they are given and
/// enqueue. Pods are queued when they show up with the target label, or
/// when the target label appears or disappears on an update.
#[derive(Clone)]
pub struct EventRouter {
    queue: WorkQueue<ObjectKey>,
    rules: LabelRules,
}

impl EventRouter {
    pub fn new(queue: WorkQueue<ObjectKey>, rules: LabelRules) -> Self {
        Self { queue, rules }
    }

    /// Returns the key that was queued, if any.
    pub fn handle(&self, event: &PodEvent) -> Option<ObjectKey> {
        match event {
            PodEvent::Added(pod) => self.on_add(pod),
            PodEvent::Updated { old, new } => self.on_update(old, new),
            PodEvent::Deleted(pod) => {
                self.on_delete(pod);
                None
            }
        }
    }

    pub fn on_add(&self, pod: &Pod) -> Option<ObjectKey> {
        if pod.metadata.deletion_timestamp.is_some() {
            self.on_delete(pod);
            return None;
        }

        let key = pod_key(pod)?;
        if !self.rules.is_target(pod) {
            tracing::debug!(%key, "not a target pod");
            return None;
        }

        self.queue.add(key.clone());
        tracing::info!(%key, "queued added pod");
        Some(key)
    }

    pub fn on_update(&self, old: &Pod, new: &Pod) -> Option<ObjectKey> {
        if new.metadata.deletion_timestamp.is_some() {
            self.on_delete(new);
            return None;
        }

        let key = pod_key(new)?;
        let was_target = self.rules.is_target(old);
        let is_target = self.rules.is_target(new);
        if was_target == is_target {
            tracing::debug!(%key, "target label unchanged");
            return None;
        }

        self.queue.add(key.clone());
        tracing::info!(%key, was_target, is_target, "queued updated pod");
        Some(key)
    }

    pub fn on_delete(&self, pod: &Pod) {
        if let Some(key) = pod_key(pod) {
            tracing::info!(%key, "pod deleted");
        }
    }
}

fn pod_key(pod: &Pod) -> Option<ObjectKey> {
    match ObjectKey::for_object(pod) {
        Ok(key) => Some(key),
        Err(error) => {
            tracing::error!(%error, "failed to get key for pod event");
            None
        }
    }
}
