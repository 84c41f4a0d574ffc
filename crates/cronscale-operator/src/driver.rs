//! Runs reconciliation passes for one scope, forever, until shutdown.
//!
//! Every pass moves through `Idle -> Snapshotting -> Reconciling -> Applying -> Idle`. Between
//! passes the loop sleeps until the next tick or the next window transition, whichever comes
//! first. Loops for different scopes share nothing except the store.
use std::{collections::BTreeMap, pin::pin, sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use serde::Serialize;
use snafu::{ResultExt, Snafu};
use tokio::{sync::watch, task::JoinSet};
use tracing::{Instrument, error, info, info_span};

use crate::{
    apply::{self, ApplyOutcome},
    decision::{self, Decisions, OverlapPolicy},
    error::{Error, ErrorKind, OverlapWarning},
    namespace::WatchNamespace,
    snapshot,
    store::ScaleStore,
    utils::{retry::RetryConfig, signal::SignalWatcher},
};

/// The loop never sleeps shorter than this between two passes.
pub const MIN_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Snafu)]
pub enum PassError {
    #[snafu(display("store is unavailable, no CronScales could be listed"))]
    StoreUnavailable { source: snapshot::Error },
}

#[derive(Clone, Debug, PartialEq)]
pub struct LoopConfig {
    pub tick_interval: Duration,
    pub max_jitter: Duration,
    pub max_failure_backoff: Duration,
    pub overlap_policy: OverlapPolicy,
    pub retry: RetryConfig,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            max_jitter: Duration::from_secs(5),
            max_failure_backoff: Duration::from_secs(5 * 60),
            overlap_policy: OverlapPolicy::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl LoopConfig {
    /// How long to wait after a successful pass, before jitter.
    pub fn delay_after_pass(
        &self,
        now: DateTime<Utc>,
        next_transition: Option<DateTime<Utc>>,
    ) -> Duration {
        // A transition that already passed wakes the loop as soon as allowed.
        let until_transition = next_transition
            .map(|transition| (transition - now).to_std().unwrap_or_default())
            .unwrap_or(self.tick_interval);

        self.tick_interval.min(until_transition).max(MIN_DELAY)
    }

    /// How long to wait after the given number of consecutive aborted passes, before jitter.
    pub fn failure_backoff(&self, consecutive_failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(consecutive_failures.saturating_sub(1));
        self.tick_interval
            .saturating_mul(factor)
            .min(self.max_failure_backoff)
            .max(MIN_DELAY)
    }

    fn jitter(&self) -> Duration {
        if self.max_jitter.is_zero() {
            return Duration::ZERO;
        }
        rand::rng().random_range(Duration::ZERO..=self.max_jitter)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, strum::Display)]
pub enum LoopState {
    #[default]
    Idle,
    Snapshotting,
    Reconciling,
    Applying,

    /// Shutdown was requested, no further passes will run.
    Stopped,
}

/// Aggregated result of one pass. This is the only externally visible outcome of a pass.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassSummary {
    pub started_at: DateTime<Utc>,
    pub evaluated: usize,
    pub intents: usize,
    pub writes: usize,
    pub errors: BTreeMap<ErrorKind, usize>,
    pub next_transition: Option<DateTime<Utc>>,
    pub next_wake: Option<DateTime<Utc>>,

    /// Set when the pass was aborted before any decision was made.
    pub aborted: Option<String>,
}

impl PassSummary {
    fn new(started_at: DateTime<Utc>, decisions: &Decisions, outcomes: &[ApplyOutcome]) -> Self {
        let mut errors: BTreeMap<ErrorKind, usize> = BTreeMap::new();
        for kind in decisions
            .errors()
            .map(Error::kind)
            .chain(decisions.warnings.iter().map(OverlapWarning::kind))
        {
            *errors.entry(kind).or_default() += 1;
        }

        let mut writes = 0;
        for outcome in outcomes {
            match &outcome.result {
                Ok(_) => writes += 1,
                Err(error) => *errors.entry(error.kind()).or_default() += 1,
            }
        }

        Self {
            started_at,
            evaluated: decisions.evaluations.len(),
            intents: decisions.intents.len(),
            writes,
            errors,
            next_transition: decisions.next_transition,
            next_wake: None,
            aborted: None,
        }
    }

    fn aborted(started_at: DateTime<Utc>, error: &PassError) -> Self {
        Self {
            started_at,
            aborted: Some(snafu::Report::from_error(error).to_string()),
            ..Self::default()
        }
    }

    pub fn error_count(&self, kind: ErrorKind) -> usize {
        self.errors.get(&kind).copied().unwrap_or_default()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.is_some()
    }
}

/// What a loop publishes about itself.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopStatus {
    pub scope: String,
    pub state: LoopState,

    /// `true` once a pass completed without being aborted.
    pub ready: bool,
    pub consecutive_failures: u32,
    pub last_pass: Option<PassSummary>,
}

pub struct ControlLoop<S: ?Sized> {
    store: Arc<S>,
    scope: WatchNamespace,
    config: LoopConfig,
    status_tx: watch::Sender<LoopStatus>,
}

impl<S> ControlLoop<S>
where
    S: ScaleStore + ?Sized + 'static,
{
    pub fn new(store: Arc<S>, scope: WatchNamespace, config: LoopConfig) -> Self {
        let (status_tx, _) = watch::channel(LoopStatus {
            scope: scope.to_string(),
            ..LoopStatus::default()
        });

        Self {
            store,
            scope,
            config,
            status_tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<LoopStatus> {
        self.status_tx.subscribe()
    }

    fn set_state(&self, state: LoopState) {
        self.status_tx.send_modify(|status| status.state = state);
    }

    /// Runs a single pass as of `now`: snapshot, decide, apply.
    ///
    /// Per-resource failures end up in the summary. Only failing to list any CronScale aborts the
    /// pass.
    pub async fn run_pass(&self, now: DateTime<Utc>) -> Result<PassSummary, PassError> {
        let span = info_span!("reconciliation_pass", scope = %self.scope, %now);

        async {
            self.set_state(LoopState::Snapshotting);
            let snapshot = snapshot::take(&*self.store, &self.scope).await;
            let snapshot = match snapshot.context(StoreUnavailableSnafu) {
                Ok(snapshot) => snapshot,
                Err(error) => {
                    self.set_state(LoopState::Idle);
                    return Err(error);
                }
            };

            self.set_state(LoopState::Reconciling);
            let decisions = decision::decide(&snapshot, now, self.config.overlap_policy);

            self.set_state(LoopState::Applying);
            let outcomes =
                apply::apply_all(&*self.store, &decisions.intents, &self.config.retry).await;
            self.set_state(LoopState::Idle);

            let summary = PassSummary::new(now, &decisions, &outcomes);
            info!(
                evaluated = summary.evaluated,
                intents = summary.intents,
                writes = summary.writes,
                errors = ?summary.errors,
                next_transition = ?summary.next_transition,
                "reconciliation pass finished"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    /// Runs passes until `shutdown` fires. A pass that already started is always finished.
    pub async fn run(self, shutdown: SignalWatcher) {
        let mut shutdown_handle = pin!(shutdown.handle());
        let mut consecutive_failures = 0u32;

        info!(scope = %self.scope, "starting control loop");

        while !shutdown.is_triggered() {
            let now = Utc::now();
            let (summary, delay) = match self.run_pass(now).await {
                Ok(summary) => {
                    consecutive_failures = 0;
                    let delay = self.config.delay_after_pass(now, summary.next_transition);
                    (summary, delay)
                }
                Err(error) => {
                    consecutive_failures += 1;
                    error!(
                        scope = %self.scope,
                        consecutive_failures,
                        error = &error as &dyn std::error::Error,
                        "reconciliation pass aborted"
                    );
                    let delay = self.config.failure_backoff(consecutive_failures);
                    (PassSummary::aborted(now, &error), delay)
                }
            };

            let delay = delay + self.config.jitter();
            let next_wake = TimeDelta::from_std(delay).ok().map(|delay| Utc::now() + delay);
            self.status_tx.send_modify(|status| {
                status.ready |= !summary.is_aborted();
                status.consecutive_failures = consecutive_failures;
                status.last_pass = Some(PassSummary {
                    next_wake,
                    ..summary
                });
            });

            tokio::select! {
                () = &mut shutdown_handle => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(LoopState::Stopped);
        info!(scope = %self.scope, "control loop stopped");
    }
}

/// Starts one [`ControlLoop`] per scope on the current runtime.
///
/// Returns the running tasks together with a status receiver per loop.
pub fn spawn_loops<S>(
    store: &Arc<S>,
    scopes: Vec<WatchNamespace>,
    config: &LoopConfig,
    shutdown: &SignalWatcher,
) -> (JoinSet<()>, Vec<watch::Receiver<LoopStatus>>)
where
    S: ScaleStore + ?Sized + 'static,
{
    let mut tasks = JoinSet::new();
    let mut statuses = Vec::with_capacity(scopes.len());

    for scope in scopes {
        let control_loop = ControlLoop::new(Arc::clone(store), scope, config.clone());
        statuses.push(control_loop.subscribe());
        tasks.spawn(control_loop.run(shutdown.clone()));
    }

    (tasks, statuses)
}
