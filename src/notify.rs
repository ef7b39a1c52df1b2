//! Post-commit notification seam.

use serde_json::Value;

use crate::request::Request;

pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Side effect run after a mutation request commits.
///
/// Hooks run off the executor, after the response has been published. A
/// failing hook is logged and never changes the request outcome.
pub trait NotificationHook: Send + Sync {
    /// Filter applied before [`on_commit`](Self::on_commit). Defaults to every request.
    fn should_notify(&self, _request: &Request) -> bool {
        true
    }

    /// Called once per committed request with the response `data`.
    fn on_commit(&self, request: &Request, data: &Value) -> Result<(), HookError>;
}
