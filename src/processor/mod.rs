//! Admission-controlled request processor.

pub mod events;
pub mod handle;
pub mod sweep;

pub use events::ProcessorEvent;
pub use handle::{Processor, ProcessorHandle, ProcessorStats};
pub use sweep::SweepReport;

use thiserror::Error;

use crate::{channel::ChannelError, config::ConfigError, store::StoreError};

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("worker task failed: {0}")]
    Join(String),
    #[error("too many consecutive channel failures: {0}")]
    ChannelFailed(String),
    #[error("processor loop is no longer running")]
    ChannelClosed,
}
