use anyhow::{anyhow, Context, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::{api::Api, runtime::watcher};
use stopper::Stopper;
use tokio::sync::broadcast;

use mycontroller::{
    config::{ConnectionConfig, ControllerConfig},
    controller::Controller,
    informer::Informer,
    leader_election::Lease,
    reconcile::KubePodUpdater,
};

/// Fans a shutdown request out to the controller and the pod watch.
#[derive(Clone)]
struct Shutdown {
    broadcast_tx: broadcast::Sender<()>,
    stopper: Stopper,
}

impl Shutdown {
    fn trigger(&self) {
        let _ = self.broadcast_tx.send(());
        self.stopper.stop();
    }
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn termination_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = terminate.recv() => {},
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = ControllerConfig::try_from_env().context("failed to read controller config")?;
    let connection =
        ConnectionConfig::try_from_env().context("failed to read connection config")?;
    let kube_config = connection.kube_config().await?;
    let default_namespace = kube_config.default_namespace.clone();
    let client: kube::Client = kube_config.try_into()?;

    let stopper = Stopper::new();
    let (broadcast_tx, mut controller_shutdown_rx) = broadcast::channel::<()>(1);
    let mut lease_shutdown_rx = broadcast_tx.subscribe();
    let shutdown = Shutdown {
        broadcast_tx,
        stopper: stopper.clone(),
    };
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match termination_signal().await {
                Ok(()) => {
                    tracing::info!("terminate signal received");
                    shutdown.trigger();
                }
                Err(error) => tracing::error!(%error, "failed to install signal handlers"),
            }
        }
    });

    let lease = if config.leader_election {
        tracing::info!("attempting to acquire leader lease...");
        let hostname = hostname::get()?;
        let identity = hostname.to_string_lossy();
        let lease_namespace = config
            .lease_namespace
            .clone()
            .unwrap_or(default_namespace);
        let lease_fut =
            Lease::acquire_or_create(client.clone(), &lease_namespace, &config.lease_name, &identity);
        tokio::select! {
            lease = lease_fut => Some(lease?),
            _ = lease_shutdown_rx.recv() => {
                // Early exit when shutdown signal is received
                return Ok(());
            }
        }
    } else {
        None
    };
    if let Some(lease) = &lease {
        let lost = lease.lost();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if lost.await {
                tracing::error!("leader lease lost, stopping pod controller");
                shutdown.trigger();
            }
        });
    }

    let pod_api: Api<Pod> = match &config.namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    };
    let informer = Informer::new();
    let store = informer.store();
    let controller = Controller::new(
        store.clone(),
        KubePodUpdater::new(client, &config.field_manager),
        &config,
    );

    let watch = informer.run(
        pod_api,
        watcher::Config::default(),
        stopper.clone(),
        |event| controller.handle(&event),
    );
    let run = async {
        let res = controller
            .run(store.wait_until_ready(), async move {
                let _ = controller_shutdown_rx.recv().await;
            })
            .await;
        // Nothing left to feed once the workers are gone
        stopper.stop();
        res
    };
    let ((), res) = tokio::join!(watch, run);
    tracing::info!("controller terminated");

    let lease_lost = lease.as_ref().is_some_and(Lease::is_lost);
    if let Some(lease) = lease {
        tracing::info!("releasing lease...");
        lease.release().await?;
    }

    res.context("pod controller failed")?;
    if lease_lost {
        return Err(anyhow!("leader lease was lost while the controller was running"));
    }

    Ok(())
}
