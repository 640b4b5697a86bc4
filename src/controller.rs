use std::{fmt::Display, future::Future, time::Duration};

use futures_util::future::join_all;
use tokio::sync::watch;

use crate::{
    config::ControllerConfig,
    informer::PodEvent,
    queue::WorkQueue,
    reconcile::{self, PodLister, PodUpdater, Reconciler},
    router::EventRouter,
    types::ObjectKey,
};

/// Lifecycle of a [`Controller::run`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Queue and handlers wired, nothing running yet
    Created,
    WaitingForSync,
    Running,
    ShuttingDown,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("pod cache did not sync before the controller was stopped")]
    SyncTimeout,
    #[error("pod cache failed to sync: {0}")]
    CacheSync(String),
}

pub struct Controller<L, U> {
    queue: WorkQueue<ObjectKey>,
    router: EventRouter,
    reconciler: Reconciler<L, U>,
    workers: usize,
    sync_timeout: Option<Duration>,
    state: watch::Sender<State>,
}

impl<L, U> Controller<L, U>
where
    L: PodLister,
    U: PodUpdater,
{
    pub fn new(lister: L, updater: U, config: &ControllerConfig) -> Self {
        let queue = WorkQueue::new(config.backoff());
        let rules = config.label_rules();
        let (state, _) = watch::channel(State::Created);
        Self {
            router: EventRouter::new(queue.clone(), rules.clone()),
            reconciler: Reconciler::new(lister, updater, rules),
            queue,
            workers: config.workers.max(1),
            sync_timeout: config.sync_timeout(),
            state,
        }
    }

    pub fn queue(&self) -> &WorkQueue<ObjectKey> {
        &self.queue
    }

    pub fn state(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }

    fn set_state(&self, state: State) {
        tracing::debug!(?state, "controller state changed");
        self.state.send_replace(state);
    }

    /// Event handler entry point for the informer. Never blocks.
    pub fn handle(&self, event: &PodEvent) {
        self.router.handle(event);
    }

    /// Wait for `synced`, then process keys until `shutdown` resolves.
    ///
    /// Reconciles in flight when `shutdown` resolves are allowed to finish.
    pub async fn run<S, E, F>(&self, synced: S, shutdown: F) -> Result<(), Error>
    where
        S: Future<Output = Result<(), E>>,
        E: Display,
        F: Future<Output = ()>,
    {
        tracing::info!(workers = self.workers, "starting pod controller");
        let res = self.run_until_shutdown(synced, shutdown).await;
        self.queue.shutdown();
        self.set_state(State::Stopped);
        tracing::info!("pod controller stopped");
        res
    }

    async fn run_until_shutdown<S, E, F>(&self, synced: S, shutdown: F) -> Result<(), Error>
    where
        S: Future<Output = Result<(), E>>,
        E: Display,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        self.set_state(State::WaitingForSync);
        let sync_timeout = async {
            match self.sync_timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            res = synced => {
                res.map_err(|error| Error::CacheSync(error.to_string()))?;
            }
            _ = sync_timeout => {
                tracing::error!("timed out waiting for pod cache to sync");
                return Err(Error::SyncTimeout);
            }
            _ = shutdown.as_mut() => {
                tracing::info!("stopped before pod cache synced");
                return Err(Error::SyncTimeout);
            }
        }
        tracing::info!("pod cache synced");

        self.set_state(State::Running);
        // Workers are polled by this task and overlap while waiting on the API
        let workers = join_all((0..self.workers).map(|id| self.worker(id)));
        let stop = async {
            shutdown.await;
            tracing::info!("shutting down pod controller");
            self.set_state(State::ShuttingDown);
            self.queue.shutdown();
        };
        tokio::join!(workers, stop);

        Ok(())
    }

    async fn worker(&self, id: usize) {
        tracing::debug!(worker = id, "worker started");
        while self.process_next_item().await {}
        tracing::debug!(worker = id, "worker stopped");
    }

    /// Reconcile one key from the queue. Returns `false` once the queue is shut down.
    pub async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        match self.reconciler.reconcile(&key).await {
            Ok(change) => {
                tracing::debug!(%key, ?change, "reconciled");
                self.queue.forget(&key);
            }
            Err(error) => self.error_policy(&key, &error),
        }
        self.queue.done(&key);

        true
    }

    /// Retry write failures with backoff, drop keys that can not succeed.
    fn error_policy(&self, key: &ObjectKey, error: &reconcile::Error) {
        if error.is_retryable() {
            tracing::error!(
                %key,
                %error,
                failures = self.queue.num_requeues(key) + 1,
                "reconcile failed, retrying"
            );
            self.queue.add_rate_limited(key.clone());
        } else {
            tracing::warn!(%key, %error, "dropping pod");
            self.queue.forget(key);
        }
    }
}
