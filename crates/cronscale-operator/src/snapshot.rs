//! Reads everything a single pass looks at, before any decision is made.
//!
//! A [`Snapshot`] is only valid for the pass that took it. Failures to read an individual
//! target are recorded next to the successfully read ones instead of failing the snapshot.
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use snafu::{ResultExt, Snafu};
use tracing::{debug, instrument, warn};

use crate::{
    crd::WorkloadKind,
    namespace::WatchNamespace,
    store::{
        AutoscalerTarget, ListedCronScale, ObjectKey, ScaleStore, StoreError, TargetKey,
        WorkloadTarget,
    },
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to list namespaces"))]
    ListNamespaces { source: StoreError },

    #[snafu(display(
        "failed to list CronScales in all {failed} namespace(s), first failure in {namespace:?}"
    ))]
    ListCronScales {
        namespace: String,
        failed: usize,
        source: StoreError,
    },
}

/// Why a referenced target is missing from a [`Snapshot`].
#[derive(Debug, Snafu)]
pub enum TargetError {
    #[snafu(display("failed to read target"))]
    Fetch { source: StoreError },

    #[snafu(display(
        "autoscaler {autoscaler} is disabled and its target kind {kind:?} has no replicas to set"
    ))]
    UnsupportedScaleTarget { autoscaler: ObjectKey, kind: String },
}

/// The state of one referenced target, as seen by a snapshot.
#[derive(Clone, Copy, Debug)]
pub enum Observed<'a> {
    Autoscaler(&'a AutoscalerTarget),
    Workload(&'a WorkloadTarget),
    Failed(&'a Arc<TargetError>),
}

/// Point-in-time view of the CronScales in a scope and of every target they reference.
///
/// Targets are keyed by the `scaleTargetRef` they were resolved from. A reference to a workload
/// lands in `autoscalers` when an active HorizontalPodAutoscaler governs that workload, and in
/// `workloads` otherwise.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub cron_scales: Vec<ListedCronScale>,
    pub autoscalers: BTreeMap<TargetKey, AutoscalerTarget>,
    pub workloads: BTreeMap<TargetKey, WorkloadTarget>,
    pub failed_targets: BTreeMap<TargetKey, Arc<TargetError>>,

    /// Namespaces whose CronScales could not be listed, while others could.
    pub failed_namespaces: BTreeMap<String, Arc<StoreError>>,
}

impl Snapshot {
    pub fn target(&self, key: &TargetKey) -> Option<Observed<'_>> {
        if let Some(autoscaler) = self.autoscalers.get(key) {
            return Some(Observed::Autoscaler(autoscaler));
        }
        if let Some(workload) = self.workloads.get(key) {
            return Some(Observed::Workload(workload));
        }
        self.failed_targets.get(key).map(Observed::Failed)
    }

    /// Targets referenced by decodable CronScales with a supported kind, each listed once.
    fn referenced_targets(&self) -> BTreeSet<TargetKey> {
        self.cron_scales
            .iter()
            .filter_map(|listed| listed.as_ref().ok())
            .filter_map(|cron_scale| {
                let namespace = cron_scale.metadata.namespace.as_deref().unwrap_or_default();
                TargetKey::from_ref(namespace, &cron_scale.spec.scale_target_ref).ok()
            })
            .collect()
    }
}

enum Fetched {
    Autoscaler(AutoscalerTarget),
    Workload(WorkloadTarget),
}

/// Lists all CronScales in `scope` and reads each target they reference exactly once.
///
/// Only listing failures are returned as errors, and only if not a single namespace could be
/// listed.
#[instrument(skip(store), fields(%scope))]
pub async fn take<S>(store: &S, scope: &WatchNamespace) -> Result<Snapshot, Error>
where
    S: ScaleStore + ?Sized,
{
    let namespaces = match scope {
        WatchNamespace::All => store.list_namespaces().await.context(ListNamespacesSnafu)?,
        WatchNamespace::One(namespace) => vec![namespace.clone()],
    };

    let mut snapshot = Snapshot::default();
    let mut listed_any = false;
    let mut failures = Vec::new();

    for namespace in namespaces {
        match store.list_cron_scales(&namespace).await {
            Ok(items) => {
                debug!(namespace, count = items.len(), "listed CronScales");
                listed_any = true;
                snapshot.cron_scales.extend(items);
            }
            Err(error) => {
                warn!(
                    namespace,
                    error = &error as &dyn std::error::Error,
                    "failed to list CronScales"
                );
                failures.push((namespace, error));
            }
        }
    }

    if !listed_any && !failures.is_empty() {
        let failed = failures.len();
        let (namespace, source) = failures.swap_remove(0);
        return Err(Error::ListCronScales {
            namespace,
            failed,
            source,
        });
    }

    snapshot.failed_namespaces = failures
        .into_iter()
        .map(|(namespace, error)| (namespace, Arc::new(error)))
        .collect();

    for key in snapshot.referenced_targets() {
        match fetch_target(store, &key).await {
            Ok(Fetched::Autoscaler(autoscaler)) => {
                snapshot.autoscalers.insert(key, autoscaler);
            }
            Ok(Fetched::Workload(workload)) => {
                snapshot.workloads.insert(key, workload);
            }
            Err(error) => {
                warn!(
                    target = %key,
                    error = &error as &dyn std::error::Error,
                    "excluding target from this pass"
                );
                snapshot.failed_targets.insert(key, Arc::new(error));
            }
        }
    }

    Ok(snapshot)
}

async fn fetch_target<S>(store: &S, key: &TargetKey) -> Result<Fetched, TargetError>
where
    S: ScaleStore + ?Sized,
{
    if let Some(kind) = key.kind.workload() {
        match store
            .find_autoscaler(&key.namespace, kind, &key.name)
            .await
            .context(FetchSnafu)?
        {
            Some(autoscaler) if autoscaler.enabled => return Ok(Fetched::Autoscaler(autoscaler)),
            Some(autoscaler) => debug!(
                target = %key,
                autoscaler = %autoscaler.key(),
                "autoscaler is disabled, falling back to the workload"
            ),
            None => debug!(target = %key, "no autoscaler governs the workload"),
        }

        return store
            .get_workload(&key.namespace, kind, &key.name)
            .await
            .map(Fetched::Workload)
            .context(FetchSnafu);
    }

    let autoscaler = store
        .get_autoscaler(&key.namespace, &key.name)
        .await
        .context(FetchSnafu)?;
    if autoscaler.enabled {
        return Ok(Fetched::Autoscaler(autoscaler));
    }

    let kind: WorkloadKind = autoscaler.scale_target.kind.parse().map_err(|_| {
        UnsupportedScaleTargetSnafu {
            autoscaler: autoscaler.key(),
            kind: autoscaler.scale_target.kind.clone(),
        }
        .build()
    })?;
    debug!(
        target = %key,
        workload = %autoscaler.scale_target.name,
        "autoscaler is disabled, falling back to its scale target"
    );

    store
        .get_workload(&key.namespace, kind, &autoscaler.scale_target.name)
        .await
        .map(Fetched::Workload)
        .context(FetchSnafu)
}
