//! Retention sweep and stuck-claim recovery.
//!
//! Runs on its own timer, independent of the poll loop. A claim older than
//! `request_timeout` that this process is not working on belongs to a dead
//! owner: it is requeued once, and failed with `TIMEOUT_ERROR` the next time.
//! Response claims left behind by crashed clients are dropped after the
//! retention age.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use tokio::{sync::watch, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{
    channel::{ChannelError, Claim},
    request::{ErrorKind, Response, ResponseError, decode_request},
    store::Execution,
};

use super::{
    ProcessorError,
    events::ProcessorEvent,
    handle::{Counters, Shared, blocking},
};

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub requests_removed: usize,
    pub responses_removed: usize,
    pub requeued: usize,
    pub abandoned: usize,
}

pub(crate) async fn run_periodic(shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(shared.config.cleanup_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = sweep_once(&shared).await {
                    warn!(error = %err, "sweep failed");
                }
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }
    debug!("sweeper stopped");
}

pub(crate) async fn sweep_once(shared: &Arc<Shared>) -> Result<SweepReport, ProcessorError> {
    let _serial = shared.sweep_lock.lock().await;
    let s = Arc::clone(shared);
    let (requests_removed, responses_removed, stuck) = blocking(move || -> Result<_, ChannelError> {
        let cutoff = before_now(s.config.retention);
        let requests_removed = s.requests.sweep(cutoff)?;
        // A client that died mid-consumption leaves its response claimed forever.
        let responses_removed = s.responses.sweep(cutoff)? + s.responses.sweep_claims(cutoff)?;
        let stale = before_now(s.config.request_timeout);
        let stuck: Vec<Claim> = s
            .requests
            .claims()?
            .into_iter()
            .filter(|c| c.claimed_at < stale && !s.is_in_flight(&c.id))
            .collect();
        Ok((requests_removed, responses_removed, stuck))
    })
    .await??;

    let mut report = SweepReport {
        requests_removed,
        responses_removed,
        ..SweepReport::default()
    };
    for claim in stuck {
        let id = claim.id.clone();
        let resolved = if claim.attempt == 0 {
            requeue(shared, claim).await.map(|()| report.requeued += 1)
        } else {
            abandon(shared, claim).await.map(|()| report.abandoned += 1)
        };
        if let Err(err) = resolved {
            warn!(request_id = %id, error = %err, "could not resolve stuck claim");
        }
    }

    if report != SweepReport::default() {
        info!(
            requests_removed = report.requests_removed,
            responses_removed = report.responses_removed,
            requeued = report.requeued,
            abandoned = report.abandoned,
            "sweep finished"
        );
    }
    shared.emit(ProcessorEvent::Swept {
        requests_removed: report.requests_removed,
        responses_removed: report.responses_removed,
    });
    Ok(report)
}

fn before_now(age: std::time::Duration) -> SystemTime {
    SystemTime::now().checked_sub(age).unwrap_or(UNIX_EPOCH)
}

async fn requeue(shared: &Arc<Shared>, claim: Claim) -> Result<(), ProcessorError> {
    let mailbox = Arc::clone(&shared.requests);
    let id = claim.id.clone();
    blocking(move || mailbox.requeue(claim)).await??;
    warn!(request_id = %id, "requeued stuck claim");
    Counters::bump(&shared.counters.requeued);
    shared.emit(ProcessorEvent::Requeued { request_id: id });
    Ok(())
}

/// Answers a claim that was already retried once.
///
/// A request whose commit is on record is answered with its logged result,
/// anything else fails with `TIMEOUT_ERROR`.
async fn abandon(shared: &Arc<Shared>, claim: Claim) -> Result<(), ProcessorError> {
    let mailbox = Arc::clone(&shared.requests);
    let to_read = claim.clone();
    let request = match blocking(move || mailbox.read(&to_read)).await? {
        Ok(body) => decode_request(&body).ok().map(Arc::new),
        Err(err) => {
            debug!(request_id = %claim.id, error = %err, "stuck claim unreadable");
            None
        }
    };

    let committed = match &request {
        Some(request) if request.is_mutation() => {
            let mut store = Arc::clone(&shared.store).lock_owned().await;
            let id = request.request_id.clone();
            blocking(move || store.committed(&id)).await??
        }
        _ => None,
    };

    let client_id = request
        .as_ref()
        .map(|r| r.client_id.clone())
        .unwrap_or_default();
    let response = match (&request, committed) {
        (Some(request), Some(applied)) => {
            let data = Execution::Applied(applied).to_data(request.kind());
            Response::success(&claim.id, client_id, data)
        }
        _ => {
            let message = format!("request abandoned after {} attempts", claim.attempt + 1);
            if let Some(request) = request.as_ref().filter(|r| r.is_mutation()) {
                shared.record_failure(Arc::clone(request), message.clone()).await;
            }
            Response::failure(
                &claim.id,
                client_id,
                ResponseError {
                    kind: ErrorKind::Timeout,
                    message,
                    operation_index: None,
                },
            )
        }
    };

    shared.publish_response(&response).await?;
    let id = claim.id.clone();
    shared.ack(claim).await?;
    warn!(request_id = %id, success = response.success, "abandoned stuck claim");
    Counters::bump(&shared.counters.abandoned);
    shared.emit(ProcessorEvent::Abandoned { request_id: id });
    Ok(())
}
