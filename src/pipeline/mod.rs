//! The two-stage producer/consumer pipeline.
//!
//! Data flows one way: the site-discovery loop publishes [`SiteMsg`]s onto
//! the sites channel, retrieval workers turn them into [`JobMsg`]s on the
//! jobs channel, and execution workers run the jobs. Both handoffs are
//! blocking sends on capacity-1 channels, so a slow execution pool throttles
//! retrieval, which throttles discovery.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::source::{Job, Site};

pub mod discovery;
pub mod execution;
pub mod retrieval;

pub use discovery::{DisabledBackoff, SiteDiscoveryLoop};
pub use execution::EventExecutionPool;
pub use retrieval::EventRetrievalPool;

/// Seconds a retrieval worker pauses between sites to bound the request
/// rate against any one worker's target set.
pub const GET_EVENTS_BREAK_SECS: u64 = 1;

/// Pacing gate applied after every executed job, epoch-aligned.
pub const RUN_EVENTS_PACING_SECS: u64 = 10;

/// Message on the sites channel. `Drain` is an explicit control message so
/// shutdown can never be confused with a legitimately empty site record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SiteMsg {
    Site(Site),
    Drain,
}

/// Message on the jobs channel; see [`SiteMsg`] for the `Drain` contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobMsg {
    Job(Job),
    Drain,
}

/// Receiver half shared by all workers of a pool. Locking the receiver is
/// how a single queued item reaches exactly one worker.
pub type SharedReceiver<T> = Arc<Mutex<mpsc::Receiver<T>>>;

/// Capacity-1 channel: an in-flight item plus one queued slot, everything
/// else backs up into the producer.
pub fn channel<T>() -> (mpsc::Sender<T>, SharedReceiver<T>) {
    let (tx, rx) = mpsc::channel(1);
    (tx, Arc::new(Mutex::new(rx)))
}
