pub mod checkpoint;
pub mod config;
pub mod error;
pub mod leader;
pub mod metrics;
pub mod publisher;
pub mod sink;
pub mod source;

pub mod kafka;
pub mod postgres;

pub use config::Config;
pub use error::{Error, FaultKind, Result};
pub use publisher::{Publisher, PublisherState, TickOutcome};
