pub mod config;
pub mod context;
pub mod epoch;
pub mod error;
pub mod heartbeat;
pub mod metrics;
pub mod pipeline;
pub mod remote;
pub mod shutdown;
pub mod source;
