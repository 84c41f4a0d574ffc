//! Writes update intents back to the store.
//!
//! Writes are conditional on the version token captured in the snapshot. A conflict means the
//! object changed underneath the pass, so the write is abandoned and the next pass re-derives the
//! intent from fresh state. Everything else is retried with backoff up to a bound.
use tracing::{debug, info, instrument, warn};

use crate::{
    decision::{Change, UpdateIntent},
    error::Error,
    store::{ObjectKey, ScaleStore, StoreError},
    utils::retry::{RetryConfig, retry_with_backoff},
};

/// The result of applying a single intent.
#[derive(Debug)]
pub struct ApplyOutcome {
    pub cron_scale: ObjectKey,
    /// Number of attempts on success.
    pub result: Result<u32, Error>,
}

/// Applies one intent. Returns the number of attempts it took.
#[instrument(
    skip_all,
    fields(cron_scale = %intent.cron_scale, object = %intent.object(), kind = %intent.kind())
)]
pub async fn apply<S>(store: &S, intent: &UpdateIntent, retry: &RetryConfig) -> Result<u32, Error>
where
    S: ScaleStore + ?Sized,
{
    let operation_name = format!("update {}", intent.object());
    let (result, attempts) =
        retry_with_backoff(retry, &operation_name, is_retryable, || async move {
            match &intent.change {
                Change::Autoscaler(autoscaler) => store.update_autoscaler(autoscaler).await,
                Change::Workload(workload) => store.update_workload(workload).await,
            }
        })
        .await;

    match result {
        Ok(()) => {
            info!(
                deltas = %intent
                    .deltas
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
                attempts,
                "applied update"
            );
            Ok(attempts)
        }
        Err(source) if !is_retryable(&source) => {
            debug!(
                resource_version = intent.resource_version(),
                "target changed since the snapshot, abandoning write until the next pass"
            );
            Err(Error::Abandoned {
                target: intent.object(),
                source,
            })
        }
        Err(source) => Err(Error::Write {
            target: intent.object(),
            attempts,
            source,
        }),
    }
}

/// Applies all intents one after another. A failing intent never prevents the others from being
/// applied.
pub async fn apply_all<S>(
    store: &S,
    intents: &[UpdateIntent],
    retry: &RetryConfig,
) -> Vec<ApplyOutcome>
where
    S: ScaleStore + ?Sized,
{
    let mut outcomes = Vec::with_capacity(intents.len());

    for intent in intents {
        let result = apply(store, intent, retry).await;
        if let Err(error) = &result {
            warn!(
                cron_scale = %intent.cron_scale,
                kind = %error.kind(),
                error = error as &dyn std::error::Error,
                "failed to apply update"
            );
        }

        outcomes.push(ApplyOutcome {
            cron_scale: intent.cron_scale.clone(),
            result,
        });
    }

    outcomes
}

/// Conflicts and vanished objects are never retried within a pass.
fn is_retryable(error: &StoreError) -> bool {
    !matches!(
        error,
        StoreError::VersionConflict { .. } | StoreError::NotFound { .. }
    )
}
