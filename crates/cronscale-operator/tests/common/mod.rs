//! An in-memory [`ScaleStore`] with version tokens and fault injection.
#![allow(dead_code)]

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use cronscale_operator::{
    crd::{CronScale, CronScaleSpec, ScaleTargetRef, TargetKind, WorkloadKind},
    driver::{ControlLoop, LoopConfig},
    namespace::WatchNamespace,
    store::{
        AutoscalerTarget, ListedCronScale, MalformedResource, ObjectKey, ScaleStore, StoreError,
        TargetKey, WorkloadTarget,
    },
    utils::retry::RetryConfig,
};

#[derive(Debug, snafu::Snafu)]
#[snafu(display("injected fault"))]
pub struct InjectedFault;

/// Faults the store should produce.
#[derive(Debug, Default)]
pub struct Faults {
    pub list_namespaces: bool,
    pub list_cron_scales: BTreeSet<String>,

    /// Objects (`namespace/name`) whose writes fail with a non-conflict error this many times
    /// before succeeding.
    pub transient_write_failures: BTreeMap<String, u32>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Write {
    Autoscaler(AutoscalerTarget),
    Workload(WorkloadTarget),
}

#[derive(Debug, Default)]
pub struct State {
    pub namespaces: BTreeSet<String>,
    pub cron_scales: BTreeMap<String, Vec<ListedCronScale>>,
    pub autoscalers: BTreeMap<ObjectKey, AutoscalerTarget>,
    pub workloads: BTreeMap<TargetKey, WorkloadTarget>,
    pub faults: Faults,

    /// Every write that was accepted, in order.
    pub writes: Vec<Write>,

    /// Number of write calls, accepted or not.
    pub write_calls: usize,

    version: u64,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn injected_failure(&mut self, object: &str) -> Option<StoreError> {
        let remaining = self.faults.transient_write_failures.get_mut(object)?;
        if *remaining == 0 {
            return None;
        }
        *remaining -= 1;

        Some(StoreError::Request {
            object: object.to_owned(),
            source: Box::new(InjectedFault),
        })
    }
}

#[derive(Debug, Default)]
pub struct FakeStore {
    state: Mutex<State>,
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("store lock is never poisoned")
    }

    pub fn add_cron_scale(&self, cron_scale: CronScale) {
        let namespace = cron_scale
            .metadata
            .namespace
            .clone()
            .expect("test CronScales are namespaced");
        let mut state = self.state();
        state.namespaces.insert(namespace.clone());
        state
            .cron_scales
            .entry(namespace)
            .or_default()
            .push(Ok(cron_scale));
    }

    pub fn add_malformed(&self, namespace: &str, name: &str) {
        let mut state = self.state();
        state.namespaces.insert(namespace.to_owned());
        state
            .cron_scales
            .entry(namespace.to_owned())
            .or_default()
            .push(Err(MalformedResource {
                key: ObjectKey::new(namespace, name),
                message: "missing field `cronSpec`".to_owned(),
            }));
    }

    pub fn add_autoscaler(&self, mut autoscaler: AutoscalerTarget) {
        let mut state = self.state();
        autoscaler.resource_version = state.next_version();
        state.namespaces.insert(autoscaler.namespace.clone());
        state.autoscalers.insert(autoscaler.key(), autoscaler);
    }

    pub fn add_workload(&self, mut workload: WorkloadTarget) {
        let mut state = self.state();
        workload.resource_version = state.next_version();
        state.namespaces.insert(workload.namespace.clone());
        state.workloads.insert(workload.key(), workload);
    }

    pub fn autoscaler(&self, namespace: &str, name: &str) -> AutoscalerTarget {
        self.state()
            .autoscalers
            .get(&ObjectKey::new(namespace, name))
            .cloned()
            .expect("autoscaler exists")
    }

    pub fn workload(&self, namespace: &str, kind: WorkloadKind, name: &str) -> WorkloadTarget {
        self.state()
            .workloads
            .get(&TargetKey::new(namespace, kind.into(), name))
            .cloned()
            .expect("workload exists")
    }

    /// Deletes an autoscaler the way another client would.
    pub fn remove_autoscaler(&self, namespace: &str, name: &str) {
        self.state()
            .autoscalers
            .remove(&ObjectKey::new(namespace, name));
    }

    /// Changes an autoscaler the way another client would, bumping its version.
    pub fn mutate_autoscaler(
        &self,
        namespace: &str,
        name: &str,
        mutate: impl FnOnce(&mut AutoscalerTarget),
    ) {
        let mut state = self.state();
        let version = state.next_version();
        let autoscaler = state
            .autoscalers
            .get_mut(&ObjectKey::new(namespace, name))
            .expect("autoscaler exists");
        mutate(autoscaler);
        autoscaler.resource_version = version;
    }
}

fn check_version(object: &str, stored: &str, expected: &str) -> Result<(), StoreError> {
    if stored == expected {
        Ok(())
    } else {
        Err(StoreError::VersionConflict {
            object: object.to_owned(),
            expected: expected.to_owned(),
        })
    }
}

#[async_trait]
impl ScaleStore for FakeStore {
    async fn list_namespaces(&self) -> Result<Vec<String>, StoreError> {
        let state = self.state();
        if state.faults.list_namespaces {
            return Err(StoreError::Request {
                object: "namespaces".to_owned(),
                source: Box::new(InjectedFault),
            });
        }

        Ok(state.namespaces.iter().cloned().collect())
    }

    async fn list_cron_scales(&self, namespace: &str) -> Result<Vec<ListedCronScale>, StoreError> {
        let state = self.state();
        if state.faults.list_cron_scales.contains(namespace) {
            return Err(StoreError::Request {
                object: format!("{namespace}/cronscales"),
                source: Box::new(InjectedFault),
            });
        }

        Ok(state.cron_scales.get(namespace).cloned().unwrap_or_default())
    }

    async fn get_workload(
        &self,
        namespace: &str,
        kind: WorkloadKind,
        name: &str,
    ) -> Result<WorkloadTarget, StoreError> {
        let key = TargetKey::new(namespace, kind.into(), name);
        self.state()
            .workloads
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                object: key.to_string(),
            })
    }

    async fn update_workload(&self, workload: &WorkloadTarget) -> Result<(), StoreError> {
        let mut state = self.state();
        state.write_calls += 1;

        let key = workload.key();
        let object = format!("{}/{}", workload.namespace, workload.name);
        if let Some(error) = state.injected_failure(&object) {
            return Err(error);
        }

        let stored_version = state
            .workloads
            .get(&key)
            .map(|stored| stored.resource_version.clone())
            .ok_or_else(|| StoreError::NotFound {
                object: key.to_string(),
            })?;
        check_version(&object, &stored_version, &workload.resource_version)?;

        let version = state.next_version();
        let stored = WorkloadTarget {
            resource_version: version,
            ..workload.clone()
        };
        state.workloads.insert(key, stored.clone());
        state.writes.push(Write::Workload(stored));
        Ok(())
    }

    async fn get_autoscaler(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<AutoscalerTarget, StoreError> {
        let key = ObjectKey::new(namespace, name);
        self.state()
            .autoscalers
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                object: key.to_string(),
            })
    }

    async fn find_autoscaler(
        &self,
        namespace: &str,
        kind: WorkloadKind,
        name: &str,
    ) -> Result<Option<AutoscalerTarget>, StoreError> {
        Ok(self
            .state()
            .autoscalers
            .values()
            .find(|autoscaler| {
                autoscaler.namespace == namespace
                    && autoscaler.scale_target.kind == kind.to_string()
                    && autoscaler.scale_target.name == name
            })
            .cloned())
    }

    async fn update_autoscaler(&self, autoscaler: &AutoscalerTarget) -> Result<(), StoreError> {
        let mut state = self.state();
        state.write_calls += 1;

        let key = autoscaler.key();
        let object = key.to_string();
        if let Some(error) = state.injected_failure(&object) {
            return Err(error);
        }

        let stored_version = state
            .autoscalers
            .get(&key)
            .map(|stored| stored.resource_version.clone())
            .ok_or_else(|| StoreError::NotFound {
                object: object.clone(),
            })?;
        check_version(&object, &stored_version, &autoscaler.resource_version)?;

        let version = state.next_version();
        let stored = AutoscalerTarget {
            resource_version: version,
            ..autoscaler.clone()
        };
        state.autoscalers.insert(key, stored.clone());
        state.writes.push(Write::Autoscaler(stored));
        Ok(())
    }
}

/// `2024-01-08` is a Monday.
pub fn monday(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 8, hour, minute, 0)
        .single()
        .expect("valid test timestamp")
}

pub fn cron_scale(
    namespace: &str,
    name: &str,
    cron_spec: &str,
    (min_replicas, max_replicas, cpu): (i32, i32, i32),
    target: (TargetKind, &str),
) -> CronScale {
    let mut cron_scale = CronScale::new(
        name,
        CronScaleSpec {
            cron_spec: cron_spec.to_owned(),
            min_replicas,
            max_replicas,
            target_cpu_utilization_percentage: cpu,
            scale_target_ref: ScaleTargetRef {
                kind: target.0.to_string(),
                name: target.1.to_owned(),
                api_version: None,
            },
        },
    );
    cron_scale.metadata.namespace = Some(namespace.to_owned());
    cron_scale
}

/// An active autoscaler named like the Deployment it scales.
pub fn autoscaler(
    namespace: &str,
    deployment: &str,
    (min, max, cpu): (i32, i32, i32),
) -> AutoscalerTarget {
    AutoscalerTarget {
        namespace: namespace.to_owned(),
        name: deployment.to_owned(),
        scale_target: ScaleTargetRef {
            kind: "Deployment".to_owned(),
            name: deployment.to_owned(),
            api_version: Some("apps/v1".to_owned()),
        },
        min_replicas: min,
        max_replicas: max,
        target_cpu_utilization_percentage: Some(cpu),
        enabled: true,
        resource_version: String::new(),
    }
}

pub fn workload(namespace: &str, kind: WorkloadKind, name: &str, replicas: i32) -> WorkloadTarget {
    WorkloadTarget {
        namespace: namespace.to_owned(),
        kind,
        name: name.to_owned(),
        replicas,
        resource_version: String::new(),
    }
}

/// Loop settings that keep retries fast and deterministic enough for tests.
pub fn fast_config() -> LoopConfig {
    LoopConfig {
        max_jitter: Duration::ZERO,
        retry: RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_multiplier: 2.0,
        },
        ..LoopConfig::default()
    }
}

pub fn control_loop(store: &Arc<FakeStore>, namespace: &str) -> ControlLoop<FakeStore> {
    ControlLoop::new(
        Arc::clone(store),
        WatchNamespace::One(namespace.to_owned()),
        fast_config(),
    )
}
