//! Lease based leader election, for running several replicas of the controller.
//!
//! Only one replica holds the lease at a time. The holder renews it in the
//! background and clears the holder on release, so a successor does not have
//! to wait for expiry after a clean shutdown. A holder that can not renew for
//! a whole lease term, or finds the lease taken over, reports it through
//! [`Lease::lost`].

use std::{future::Future, time::Duration};

use chrono::{DateTime, Utc};
use k8s_openapi::{
    api::coordination::v1::{Lease as KubeLease, LeaseSpec as KubeLeaseSpec},
    apimachinery::pkg::apis::meta::v1::MicroTime,
};
use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams, PostParams},
    Client,
};
use tokio::{
    sync::{oneshot::Sender, watch},
    task::JoinHandle,
    time::Instant,
};

const LEASE_DURATION_SECONDS: i32 = 15;
const FIELD_MANAGER: &str = "mycontroller";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes error: {0}")]
    Kubernetes(#[from] kube::Error),
    #[error("lease renewal task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub struct Lease {
    join_handle: JoinHandle<()>,
    sender: Sender<()>,
    lost: watch::Receiver<bool>,
}

impl Lease {
    /// Block until `identity` holds the lease `namespace/name`, creating it if needed.
    pub async fn acquire_or_create(
        client: Client,
        namespace: &str,
        name: &str,
        identity: &str,
    ) -> Result<Lease, Error> {
        let lease_api: Api<KubeLease> = Api::namespaced(client, namespace);

        let lease = loop {
            match lease_api.get_opt(name).await? {
                Some(mut lease) => {
                    let now = Utc::now();
                    if !lease_expired(&lease, now) && !held_by(&lease, identity) {
                        let wait = lease_duration(lease.spec.as_ref());
                        tracing::debug!(lease = name, ?wait, "lease is held by another replica");
                        tokio::time::sleep(wait).await;
                        continue;
                    }

                    // resourceVersion is kept, so a replica racing us for
                    // the same expired lease makes one of the two patches fail
                    lease.metadata.managed_fields = None;
                    lease.spec = Some(acquired_spec(lease.spec.as_ref(), identity, now));
                    match lease_api
                        .patch(
                            name,
                            &PatchParams::apply(FIELD_MANAGER).force(),
                            &Patch::Apply(&lease),
                        )
                        .await
                    {
                        Ok(lease) => break lease,
                        Err(kube::Error::Api(response)) if response.code == 409 => continue,
                        Err(error) => return Err(error.into()),
                    }
                }
                None => {
                    let lease = KubeLease {
                        metadata: ObjectMeta {
                            namespace: Some(namespace.to_string()),
                            name: Some(name.to_string()),
                            ..Default::default()
                        },
                        spec: Some(acquired_spec(None, identity, Utc::now())),
                    };
                    match lease_api.create(&PostParams::default(), &lease).await {
                        Ok(lease) => break lease,
                        // Somebody else created it first
                        Err(kube::Error::Api(response)) if response.code == 409 => continue,
                        Err(error) => return Err(error.into()),
                    }
                }
            }
        };
        tracing::info!(lease = name, identity, "acquired lease");

        let (sender, mut recv) = tokio::sync::oneshot::channel();
        let (lost_tx, lost) = watch::channel(false);
        let duration = lease_duration(lease.spec.as_ref());
        let name = name.to_string();
        let identity = identity.to_string();

        let join_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(duration / 3);
            let patch_params = PatchParams::apply(FIELD_MANAGER);
            let mut last_renewed = Instant::now();

            loop {
                tokio::select! {
                    _ = interval.tick() => (),
                    _ = &mut recv => break,
                }

                let patch = serde_json::json!({
                    "spec": {
                        "renewTime": MicroTime(Utc::now()),
                    }
                });
                match lease_api
                    .patch(&name, &patch_params, &Patch::Merge(patch))
                    .await
                {
                    Ok(renewed) if held_by(&renewed, &identity) => last_renewed = Instant::now(),
                    Ok(_) => {
                        tracing::error!(lease = %name, "lease was taken over by another replica");
                        lost_tx.send_replace(true);
                        return;
                    }
                    Err(error) => {
                        tracing::error!(%error, "failed to renew lease");
                        if renewal_lapsed(last_renewed.elapsed(), duration) {
                            tracing::error!(lease = %name, "lease expired before it could be renewed");
                            lost_tx.send_replace(true);
                            return;
                        }
                    }
                }
            }

            let patch = serde_json::json!({
                "spec": {
                    "renewTime": Option::<()>::None,
                    "acquireTime": Option::<()>::None,
                    "holderIdentity": Option::<()>::None
                }
            });
            match lease_api
                .patch(&name, &patch_params, &Patch::Merge(patch))
                .await
            {
                Ok(_) => tracing::info!(lease = %name, "released lease"),
                Err(error) => tracing::error!(%error, "failed to release lease"),
            }
        });

        Ok(Lease {
            join_handle,
            sender,
            lost,
        })
    }

    /// Resolves with `true` once this replica stopped holding the lease
    /// without releasing it, `false` once the lease was released.
    pub fn lost(&self) -> impl Future<Output = bool> + Send + 'static {
        let mut rx = self.lost.clone();
        async move {
            let lost = rx.wait_for(|lost| *lost).await.is_ok();
            lost
        }
    }

    pub fn is_lost(&self) -> bool {
        *self.lost.borrow()
    }

    /// Stop renewing and give the lease up.
    pub async fn release(self) -> Result<(), Error> {
        // Fails when the lease was already lost, there is nothing left to release then
        let _ = self.sender.send(());
        self.join_handle.await?;
        Ok(())
    }
}

fn lease_duration(spec: Option<&KubeLeaseSpec>) -> Duration {
    let seconds = spec
        .and_then(|spec| spec.lease_duration_seconds)
        .filter(|seconds| *seconds > 0)
        .unwrap_or(LEASE_DURATION_SECONDS);
    Duration::from_secs(seconds as u64)
}

/// Renewals have failed for a whole lease term, so another replica may own it by now.
fn renewal_lapsed(since_last_renewal: Duration, lease_duration: Duration) -> bool {
    since_last_renewal >= lease_duration
}

fn held_by(lease: &KubeLease, identity: &str) -> bool {
    lease
        .spec
        .as_ref()
        .and_then(|spec| spec.holder_identity.as_deref())
        == Some(identity)
}

/// Spec of a lease just taken over by `identity`.
fn acquired_spec(previous: Option<&KubeLeaseSpec>, identity: &str, now: DateTime<Utc>) -> KubeLeaseSpec {
    let transitions = previous
        .and_then(|spec| spec.lease_transitions)
        .unwrap_or(0);
    KubeLeaseSpec {
        acquire_time: Some(MicroTime(now)),
        renew_time: None,
        lease_duration_seconds: Some(LEASE_DURATION_SECONDS),
        holder_identity: Some(identity.to_string()),
        lease_transitions: Some(transitions + 1),
        ..Default::default()
    }
}

fn lease_expired(lease: &KubeLease, now: DateTime<Utc>) -> bool {
    let Some(spec) = lease.spec.as_ref() else {
        return true;
    };
    if spec.holder_identity.is_none() {
        return true;
    }

    let last_seen = spec.renew_time.as_ref().or(spec.acquire_time.as_ref());
    match last_seen {
        Some(MicroTime(time)) => {
            let duration = chrono::Duration::seconds(lease_duration(Some(spec)).as_secs() as i64);
            time.checked_add_signed(duration)
                .map_or(true, |expiry| now > expiry)
        }
        None => true,
    }
}
