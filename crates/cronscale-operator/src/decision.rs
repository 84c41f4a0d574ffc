//! The in-memory part of a pass: turns a [`Snapshot`] into one verdict per CronScale and the
//! update intents needed to converge.
//!
//! Nothing in here suspends or talks to the store. Every intent carries the version token that
//! was read into the snapshot, so the applier never writes a value that was not read in the same
//! pass.
use std::{cmp::Ordering, collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use serde::Serialize;
use snafu::ResultExt;
use tracing::{debug, warn};

use crate::{
    crd::{CronScale, ScaleBounds, TargetKind},
    error::{
        Error, InvalidBoundsSnafu, InvalidScheduleSnafu, OverlapWarning,
        TargetNotObservedSnafu, UnsupportedTargetKindSnafu,
    },
    snapshot::{Observed, Snapshot},
    store::{AutoscalerTarget, ObjectKey, TargetKey, WorkloadTarget},
};

/// Decides which CronScale wins when several active ones govern the same target.
///
/// Remaining ties are broken by name, the lexicographically smallest one wins.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    PartialEq,
    Serialize,
    clap::ValueEnum,
    strum::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum OverlapPolicy {
    /// The CronScale whose window opened most recently wins.
    #[default]
    MostRecentStart,

    /// The CronScale with the highest maxReplicas, then minReplicas, wins.
    HighestReplicas,
}

impl OverlapPolicy {
    /// Orders two contenders so that the preferred one compares greater.
    fn compare(self, a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
        let preference = match self {
            Self::MostRecentStart => a.started.cmp(&b.started),
            Self::HighestReplicas => (a.bounds.max_replicas(), a.bounds.min_replicas())
                .cmp(&(b.bounds.max_replicas(), b.bounds.min_replicas())),
        };

        preference.then_with(|| b.cron_scale.cmp(&a.cron_scale))
    }
}

/// What should hold for a CronScale's target right now.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DesiredState {
    /// Outside of the window, or unusable. The target is left alone.
    NoOverride,
    Override(ScaleBounds),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, strum::Display)]
pub enum Field {
    #[strum(serialize = "minReplicas")]
    MinReplicas,
    #[strum(serialize = "maxReplicas")]
    MaxReplicas,
    #[strum(serialize = "targetCPUUtilizationPercentage")]
    TargetCpuUtilizationPercentage,
    #[strum(serialize = "replicas")]
    Replicas,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct FieldDelta {
    pub field: Field,
    pub from: Option<i32>,
    pub to: i32,
}

impl std::fmt::Display for FieldDelta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.from {
            Some(from) => write!(f, "{}: {from} -> {}", self.field, self.to),
            None => write!(f, "{}: unset -> {}", self.field, self.to),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, strum::Display)]
pub enum IntentKind {
    Autoscaler,
    Workload,
}

/// The full desired object, still carrying the version token of the snapshot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Change {
    Autoscaler(AutoscalerTarget),
    Workload(WorkloadTarget),
}

/// A write the applier has to perform.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UpdateIntent {
    /// The CronScale whose desired state this is.
    pub cron_scale: ObjectKey,

    /// The target as referenced by the CronScale.
    pub target_ref: TargetKey,

    /// Only the fields that differ from what was read.
    pub deltas: Vec<FieldDelta>,

    pub change: Change,
}

impl UpdateIntent {
    pub fn kind(&self) -> IntentKind {
        match self.change {
            Change::Autoscaler(_) => IntentKind::Autoscaler,
            Change::Workload(_) => IntentKind::Workload,
        }
    }

    /// The object that is actually written, which differs from `target_ref` when a workload is
    /// governed through its autoscaler or the other way around.
    pub fn object(&self) -> TargetKey {
        match &self.change {
            Change::Autoscaler(autoscaler) => autoscaler_key(autoscaler),
            Change::Workload(workload) => workload.key(),
        }
    }

    pub fn resource_version(&self) -> &str {
        match &self.change {
            Change::Autoscaler(autoscaler) => &autoscaler.resource_version,
            Change::Workload(workload) => &workload.resource_version,
        }
    }
}

#[derive(Debug)]
pub enum Verdict {
    /// Outside of the window.
    NoOverride,

    /// Active and the target already matches.
    InSync { target: TargetKey },

    /// Active and an [`UpdateIntent`] was emitted.
    Update { target: TargetKey },

    /// Active, but another CronScale governing the same target won the tie-break.
    Superseded { target: TargetKey, winner: ObjectKey },

    Rejected(Error),
}

#[derive(Debug)]
pub struct Evaluation {
    pub cron_scale: ObjectKey,
    pub desired: DesiredState,
    pub verdict: Verdict,
}

/// The outcome of deciding over one snapshot.
#[derive(Debug, Default)]
pub struct Decisions {
    /// Exactly one entry per listed CronScale, ordered by namespace and name.
    pub evaluations: Vec<Evaluation>,

    /// At most one intent per written object.
    pub intents: Vec<UpdateIntent>,

    pub warnings: Vec<OverlapWarning>,

    /// Namespaces whose CronScales could not be listed.
    pub list_errors: Vec<Error>,

    /// The earliest instant at which any valid window opens or closes.
    pub next_transition: Option<DateTime<Utc>>,
}

impl Decisions {
    /// All per-resource errors, including listing failures.
    pub fn errors(&self) -> impl Iterator<Item = &Error> {
        self.evaluations
            .iter()
            .filter_map(|evaluation| match &evaluation.verdict {
                Verdict::Rejected(error) => Some(error),
                _ => None,
            })
            .chain(&self.list_errors)
    }
}

#[derive(Clone, Copy, Debug)]
enum Current<'a> {
    Autoscaler(&'a AutoscalerTarget),
    Workload(&'a WorkloadTarget),
}

#[derive(Debug)]
struct Candidate<'a> {
    cron_scale: ObjectKey,
    target_ref: TargetKey,
    bounds: ScaleBounds,
    started: Option<DateTime<Utc>>,
    current: Current<'a>,
}

impl Candidate<'_> {
    fn object(&self) -> TargetKey {
        match self.current {
            Current::Autoscaler(autoscaler) => autoscaler_key(autoscaler),
            Current::Workload(workload) => workload.key(),
        }
    }

    fn intent(&self) -> Option<UpdateIntent> {
        let bounds = &self.bounds;
        let (deltas, change) = match self.current {
            Current::Autoscaler(autoscaler) => {
                let deltas = [
                    (
                        Field::MinReplicas,
                        Some(autoscaler.min_replicas),
                        bounds.min_replicas(),
                    ),
                    (
                        Field::MaxReplicas,
                        Some(autoscaler.max_replicas),
                        bounds.max_replicas(),
                    ),
                    (
                        Field::TargetCpuUtilizationPercentage,
                        autoscaler.target_cpu_utilization_percentage,
                        bounds.target_cpu_utilization_percentage(),
                    ),
                ]
                .into_iter()
                .filter(|(_, from, to)| *from != Some(*to))
                .map(|(field, from, to)| FieldDelta { field, from, to })
                .collect();

                let desired = AutoscalerTarget {
                    min_replicas: bounds.min_replicas(),
                    max_replicas: bounds.max_replicas(),
                    target_cpu_utilization_percentage: Some(
                        bounds.target_cpu_utilization_percentage(),
                    ),
                    ..autoscaler.clone()
                };
                (deltas, Change::Autoscaler(desired))
            }
            Current::Workload(workload) => {
                let replicas = bounds.clamp(workload.replicas);
                let deltas = if replicas == workload.replicas {
                    Vec::new()
                } else {
                    vec![FieldDelta {
                        field: Field::Replicas,
                        from: Some(workload.replicas),
                        to: replicas,
                    }]
                };

                let desired = WorkloadTarget {
                    replicas,
                    ..workload.clone()
                };
                (deltas, Change::Workload(desired))
            }
        };

        if deltas.is_empty() {
            return None;
        }

        Some(UpdateIntent {
            cron_scale: self.cron_scale.clone(),
            target_ref: self.target_ref.clone(),
            deltas,
            change,
        })
    }
}

fn autoscaler_key(autoscaler: &AutoscalerTarget) -> TargetKey {
    TargetKey::new(
        &autoscaler.namespace,
        TargetKind::HorizontalPodAutoscaler,
        &autoscaler.name,
    )
}

/// Computes the desired state of every CronScale in `snapshot` at `now` and diffs it against the
/// observed targets.
pub fn decide(snapshot: &Snapshot, now: DateTime<Utc>, policy: OverlapPolicy) -> Decisions {
    let mut decisions = Decisions::default();
    let mut evaluations = BTreeMap::new();
    let mut groups: BTreeMap<TargetKey, Vec<Candidate<'_>>> = BTreeMap::new();

    for listed in &snapshot.cron_scales {
        let cron_scale = match listed {
            Ok(cron_scale) => cron_scale,
            Err(malformed) => {
                evaluations.insert(
                    malformed.key.clone(),
                    rejected(
                        malformed.key.clone(),
                        Error::Malformed {
                            message: malformed.message.clone(),
                        },
                    ),
                );
                continue;
            }
        };

        let key = ObjectKey::new(
            cron_scale.namespace().unwrap_or_default(),
            cron_scale.name_any(),
        );
        match assess(
            &key,
            cron_scale,
            snapshot,
            now,
            &mut decisions.next_transition,
        ) {
            Ok(Some(candidate)) => groups.entry(candidate.object()).or_default().push(candidate),
            Ok(None) => {
                debug!(cron_scale = %key, "outside of window");
                evaluations.insert(
                    key.clone(),
                    Evaluation {
                        cron_scale: key,
                        desired: DesiredState::NoOverride,
                        verdict: Verdict::NoOverride,
                    },
                );
            }
            Err(error) => {
                evaluations.insert(key.clone(), rejected(key, error));
            }
        }
    }

    for (object, mut candidates) in groups {
        let Some(index) = candidates
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| policy.compare(a, b))
            .map(|(index, _)| index)
        else {
            continue;
        };
        let winner = candidates.swap_remove(index);

        if !candidates.is_empty() {
            let mut contenders: Vec<ObjectKey> = candidates
                .iter()
                .map(|candidate| candidate.cron_scale.clone())
                .chain([winner.cron_scale.clone()])
                .collect();
            contenders.sort();

            warn!(
                target = %object,
                winner = %winner.cron_scale,
                ?contenders,
                %policy,
                "overlapping CronScales govern the same target"
            );
            decisions.warnings.push(OverlapWarning {
                target: object.clone(),
                winner: winner.cron_scale.clone(),
                contenders,
            });

            for loser in candidates {
                evaluations.insert(
                    loser.cron_scale.clone(),
                    Evaluation {
                        cron_scale: loser.cron_scale,
                        desired: DesiredState::Override(loser.bounds),
                        verdict: Verdict::Superseded {
                            target: object.clone(),
                            winner: winner.cron_scale.clone(),
                        },
                    },
                );
            }
        }

        let verdict = match winner.intent() {
            Some(intent) => {
                debug!(
                    cron_scale = %winner.cron_scale,
                    target = %object,
                    deltas = ?intent.deltas,
                    "target needs an update"
                );
                decisions.intents.push(intent);
                Verdict::Update { target: object }
            }
            None => {
                debug!(cron_scale = %winner.cron_scale, target = %object, "target is in sync");
                Verdict::InSync { target: object }
            }
        };
        evaluations.insert(
            winner.cron_scale.clone(),
            Evaluation {
                cron_scale: winner.cron_scale,
                desired: DesiredState::Override(winner.bounds),
                verdict,
            },
        );
    }

    decisions.evaluations = evaluations.into_values().collect();
    decisions.list_errors = snapshot
        .failed_namespaces
        .iter()
        .map(|(namespace, error)| Error::ListCronScales {
            namespace: namespace.clone(),
            source: Arc::clone(error),
        })
        .collect();

    decisions
}

fn rejected(cron_scale: ObjectKey, error: Error) -> Evaluation {
    warn!(
        %cron_scale,
        kind = %error.kind(),
        error = &error as &dyn std::error::Error,
        "skipping CronScale"
    );
    Evaluation {
        cron_scale,
        desired: DesiredState::NoOverride,
        verdict: Verdict::Rejected(error),
    }
}

/// Validates one CronScale and, if its window is active, turns it into a candidate for its
/// target. Records the window's next transition even when the target is unusable.
fn assess<'a>(
    key: &ObjectKey,
    cron_scale: &CronScale,
    snapshot: &'a Snapshot,
    now: DateTime<Utc>,
    next_transition: &mut Option<DateTime<Utc>>,
) -> Result<Option<Candidate<'a>>, Error> {
    let spec = &cron_scale.spec;
    let window = spec.window().context(InvalidScheduleSnafu)?;
    let bounds = spec.bounds().context(InvalidBoundsSnafu)?;
    let target_ref = TargetKey::from_ref(&key.namespace, &spec.scale_target_ref).map_err(|_| {
        UnsupportedTargetKindSnafu {
            kind: spec.scale_target_ref.kind.clone(),
        }
        .build()
    })?;

    if let Some(transition) = window.next_transition(now) {
        *next_transition = Some(next_transition.map_or(transition, |next| next.min(transition)));
    }

    let current = match snapshot.target(&target_ref) {
        Some(Observed::Autoscaler(autoscaler)) => Current::Autoscaler(autoscaler),
        Some(Observed::Workload(workload)) => Current::Workload(workload),
        Some(Observed::Failed(error)) => {
            return Err(Error::TargetFetch {
                target: target_ref,
                source: Arc::clone(error),
            });
        }
        None => return TargetNotObservedSnafu { target: target_ref }.fail(),
    };

    if !window.matches(now) {
        return Ok(None);
    }

    Ok(Some(Candidate {
        cron_scale: key.clone(),
        target_ref,
        bounds,
        started: window.current_start(now),
        current,
    }))
}
