//! Processor event stream payloads.

use crate::request::ErrorKind;

/// Events emitted by the processor loop and its workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorEvent {
    /// A request file was claimed.
    Claimed {
        request_id: String,
        /// Requeue count before this claim.
        attempt: u32,
    },
    /// Another reader took the request first.
    ClaimLost { request_id: String },
    /// A response was published.
    Completed {
        request_id: String,
        success: bool,
        error: Option<ErrorKind>,
    },
    /// A stuck claim went back to the ready set.
    Requeued { request_id: String },
    /// A stuck claim that had already been requeued was failed.
    Abandoned { request_id: String },
    /// Retention sweep finished.
    Swept {
        requests_removed: usize,
        responses_removed: usize,
    },
    /// A mailbox operation failed after its retries.
    ChannelFailure { message: String },
    /// The poll loop exited.
    Stopped {
        /// Set when the loop stopped on a fatal error.
        error: Option<String>,
    },
}
