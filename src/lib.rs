pub mod config;
pub mod controller;
pub mod informer;
pub mod labels;
pub mod leader_election;
pub mod queue;
pub mod reconcile;
pub mod router;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;
