use std::{future::Future, sync::Arc};

use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::PostParams,
    runtime::reflector::{ObjectRef, Store},
    Api, ResourceExt,
};
use thiserror::Error;

use crate::{
    labels::{LabelChange, LabelRules},
    types::ObjectKey,
};

/// Errors can be raised within reconciler
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid pod key {0:?}: either namespace or name is missing")]
    InvalidKey(String),
    #[error("pod {0} not found in cache")]
    NotFound(ObjectKey),
    #[error("update pod {key} conflicted: {source}")]
    UpdateConflict {
        key: ObjectKey,
        #[source]
        source: kube::Error,
    },
    #[error("update pod {key} failed: {source}")]
    Update {
        key: ObjectKey,
        #[source]
        source: kube::Error,
    },
}

impl Error {
    fn update(key: &ObjectKey, source: kube::Error) -> Self {
        match &source {
            kube::Error::Api(response) if response.code == 409 => Self::UpdateConflict {
                key: key.clone(),
                source,
            },
            _ => Self::Update {
                key: key.clone(),
                source,
            },
        }
    }

    /// Whether the key should go back to the queue. Missing or malformed
    /// objects will not fix themselves by waiting.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpdateConflict { .. } | Self::Update { .. })
    }
}

/// Read-only view over the locally cached pods.
pub trait PodLister {
    fn get_pod(&self, key: &ObjectKey) -> Option<Arc<Pod>>;
}

impl PodLister for Store<Pod> {
    fn get_pod(&self, key: &ObjectKey) -> Option<Arc<Pod>> {
        self.get(&ObjectRef::new(&key.name).within(&key.namespace))
    }
}

/// Write access to the authoritative pod store.
pub trait PodUpdater {
    /// Replace the pod. The object's resource version is sent along, so a
    /// concurrent modification surfaces as a conflict instead of being overwritten.
    fn replace(&self, pod: &Pod) -> impl Future<Output = Result<Pod, kube::Error>> + Send;
}

#[derive(Clone)]
pub struct KubePodUpdater {
    client: kube::Client,
    field_manager: String,
}

impl KubePodUpdater {
    pub fn new(client: kube::Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }
}

impl PodUpdater for KubePodUpdater {
    async fn replace(&self, pod: &Pod) -> Result<Pod, kube::Error> {
        let namespace = pod.namespace().unwrap_or_default();
        let api = Api::<Pod>::namespaced(self.client.clone(), &namespace);
        let params = PostParams {
            dry_run: false,
            field_manager: Some(self.field_manager.clone()),
        };
        api.replace(&pod.name_any(), &params, pod).await
    }
}

pub struct Reconciler<L, U> {
    lister: L,
    updater: U,
    rules: LabelRules,
}

impl<L, U> Reconciler<L, U>
where
    L: PodLister,
    U: PodUpdater,
{
    pub fn new(lister: L, updater: U, rules: LabelRules) -> Self {
        Self {
            lister,
            updater,
            rules,
        }
    }

    pub fn rules(&self) -> &LabelRules {
        &self.rules
    }

    /// Bring the result label of the pod at `key` in line with its target label.
    ///
    /// Returns the change that was written, `LabelChange::None` when the pod
    /// was already consistent.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<LabelChange, Error> {
        if !key.is_complete() {
            return Err(Error::InvalidKey(key.to_string()));
        }

        let shared_pod = self
            .lister
            .get_pod(key)
            .ok_or_else(|| Error::NotFound(key.clone()))?;

        let change = self.rules.desired_change(shared_pod.labels());
        match change {
            LabelChange::None => {
                tracing::debug!(%key, "labels already consistent");
                return Ok(change);
            }
            LabelChange::Add => {
                tracing::info!(%key, label = %self.rules.result, "adding label");
            }
            LabelChange::Remove => {
                tracing::info!(%key, label = %self.rules.result, "removing label");
            }
        }

        // The cached object is shared with every other reader of the store
        let mut pod = (*shared_pod).clone();
        self.rules.apply(change, pod.labels_mut());

        self.updater
            .replace(&pod)
            .await
            .map_err(|source| Error::update(key, source))?;
        tracing::info!(%key, "updated pod");

        Ok(change)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use kube::runtime::watcher;

    use super::*;
    use crate::testing::{pod, synced_store, FakeUpdater};

    fn label_map(pod: &Pod) -> BTreeMap<String, String> {
        pod.labels().clone()
    }

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_adds_result_label_to_target_pod() {
        let (store, _writer) = synced_store([pod(
            "default",
            "web",
            &[("app", "web"), ("mycontroller", "mycontroller")],
        )]);
        let updater = FakeUpdater::default();
        let reconciler = Reconciler::new(store.clone(), updater.clone(), LabelRules::default());

        let change = reconciler
            .reconcile(&ObjectKey::new("default", "web"))
            .await
            .unwrap();
        assert_eq!(change, LabelChange::Add);

        let writes = updater.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(
            label_map(&writes[0]),
            map(&[
                ("app", "web"),
                ("mycontroller", "mycontroller"),
                ("processed", "processed"),
            ])
        );

        // The cached copy is untouched
        let cached = store.get_pod(&ObjectKey::new("default", "web")).unwrap();
        assert_eq!(
            label_map(&cached),
            map(&[("app", "web"), ("mycontroller", "mycontroller")])
        );
    }

    #[tokio::test]
    async fn test_removes_result_label_from_untargeted_pod() {
        let (store, _writer) = synced_store([pod(
            "default",
            "web",
            &[("app", "web"), ("processed", "processed")],
        )]);
        let updater = FakeUpdater::default();
        let reconciler = Reconciler::new(store, updater.clone(), LabelRules::default());

        let change = reconciler
            .reconcile(&ObjectKey::new("default", "web"))
            .await
            .unwrap();
        assert_eq!(change, LabelChange::Remove);
        assert_eq!(label_map(&updater.writes()[0]), map(&[("app", "web")]));
    }

    #[tokio::test]
    async fn test_consistent_pods_are_not_written() {
        let (store, _writer) = synced_store([
            pod(
                "default",
                "both",
                &[("mycontroller", "mycontroller"), ("processed", "processed")],
            ),
            pod("default", "neither", &[("app", "web")]),
            pod("default", "unlabeled", &[]),
        ]);
        let updater = FakeUpdater::default();
        let reconciler = Reconciler::new(store, updater.clone(), LabelRules::default());

        for name in ["both", "neither", "unlabeled"] {
            let change = reconciler
                .reconcile(&ObjectKey::new("default", name))
                .await
                .unwrap();
            assert_eq!(change, LabelChange::None);
        }
        assert!(updater.writes().is_empty());
    }

    #[tokio::test]
    async fn test_second_reconcile_is_noop() {
        let (store, mut writer) = synced_store([pod(
            "default",
            "web",
            &[("mycontroller", "mycontroller")],
        )]);
        let updater = FakeUpdater::default();
        let reconciler = Reconciler::new(store, updater.clone(), LabelRules::default());
        let key = ObjectKey::new("default", "web");

        reconciler.reconcile(&key).await.unwrap();
        // The watch delivers our own write back into the cache
        writer.apply_watcher_event(&watcher::Event::Apply(updater.writes()[0].clone()));

        assert_eq!(reconciler.reconcile(&key).await.unwrap(), LabelChange::None);
        assert_eq!(updater.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_and_missing_keys() {
        let (store, _writer) = synced_store([]);
        let reconciler = Reconciler::new(store, FakeUpdater::default(), LabelRules::default());

        let error = reconciler
            .reconcile(&ObjectKey::new("", "web"))
            .await
            .unwrap_err();
        assert!(matches!(error, Error::InvalidKey(_)));
        assert!(!error.is_retryable());

        let error = reconciler
            .reconcile(&ObjectKey::new("default", "gone"))
            .await
            .unwrap_err();
        assert!(matches!(error, Error::NotFound(_)));
        assert!(!error.is_retryable());
    }

    #[tokio::test]
    async fn test_write_failure_is_retryable() {
        let (store, _writer) = synced_store([pod(
            "default",
            "web",
            &[("mycontroller", "mycontroller")],
        )]);
        let updater = FakeUpdater::default();
        updater.fail_next(1);
        let reconciler = Reconciler::new(store, updater.clone(), LabelRules::default());
        let key = ObjectKey::new("default", "web");

        let error = reconciler.reconcile(&key).await.unwrap_err();
        assert!(matches!(error, Error::UpdateConflict { .. }));
        assert!(error.is_retryable());
        assert!(updater.writes().is_empty());

        assert_eq!(reconciler.reconcile(&key).await.unwrap(), LabelChange::Add);
        assert_eq!(updater.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_custom_rules() {
        let (store, _writer) = synced_store([pod("team", "api", &[("owner", "payments")])]);
        let updater = FakeUpdater::default();
        let rules = LabelRules::new(
            "owner=payments".parse().unwrap(),
            "billing.example.com/tracked=true".parse().unwrap(),
        );
        let reconciler = Reconciler::new(store, updater.clone(), rules);

        reconciler
            .reconcile(&ObjectKey::new("team", "api"))
            .await
            .unwrap();
        assert_eq!(
            label_map(&updater.writes()[0]),
            map(&[
                ("billing.example.com/tracked", "true"),
                ("owner", "payments"),
            ])
        );
    }
}
