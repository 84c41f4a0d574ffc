//! The capability the reconciliation core needs from the cluster's object store.
//!
//! [`ScaleStore`] is implemented for Kubernetes by [`crate::client::Client`]. Everything in the
//! core is generic over it, which keeps loop instances independent of each other and lets tests
//! swap in an in-memory store.
use std::fmt::Display;

use async_trait::async_trait;
use serde::Serialize;
use snafu::Snafu;

use crate::crd::{CronScale, ScaleTargetRef, TargetKind, WorkloadKind};

pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StoreError {
    #[snafu(display("{object} was not found"))]
    NotFound { object: String },

    #[snafu(display(
        "{object} was modified concurrently, expected resource version {expected:?}"
    ))]
    VersionConflict { object: String, expected: String },

    #[snafu(display("request for {object} failed"))]
    Request { object: String, source: BoxedError },
}

/// Identity of a namespaced object.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Identity of the object a CronScale governs, as written in its `scaleTargetRef`.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct TargetKey {
    pub namespace: String,
    pub kind: TargetKind,
    pub name: String,
}

impl TargetKey {
    pub fn new(namespace: impl Into<String>, kind: TargetKind, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            kind,
            name: name.into(),
        }
    }

    /// Resolves a `scaleTargetRef`, failing on kinds that cannot be scaled.
    pub fn from_ref(
        namespace: &str,
        target_ref: &ScaleTargetRef,
    ) -> Result<Self, strum::ParseError> {
        Ok(Self::new(
            namespace,
            target_ref.kind.parse()?,
            target_ref.name.as_str(),
        ))
    }
}

impl Display for TargetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.kind, self.name)
    }
}

/// Point-in-time copy of a HorizontalPodAutoscaler.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AutoscalerTarget {
    pub namespace: String,
    pub name: String,

    /// The workload the autoscaler itself scales.
    pub scale_target: ScaleTargetRef,

    pub min_replicas: i32,
    pub max_replicas: i32,
    pub target_cpu_utilization_percentage: Option<i32>,

    /// `false` when the autoscaler reports that it is not actively scaling.
    pub enabled: bool,

    /// Opaque token for optimistic concurrency.
    pub resource_version: String,
}

impl AutoscalerTarget {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }
}

/// Point-in-time copy of a Deployment or StatefulSet.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorkloadTarget {
    pub namespace: String,
    pub kind: WorkloadKind,
    pub name: String,
    pub replicas: i32,

    /// Opaque token for optimistic concurrency.
    pub resource_version: String,
}

impl WorkloadTarget {
    pub fn key(&self) -> TargetKey {
        TargetKey::new(&self.namespace, self.kind.into(), &self.name)
    }
}

/// A CronScale that was listed but could not be decoded.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MalformedResource {
    pub key: ObjectKey,
    pub message: String,
}

/// One item of a CronScale listing. Decoding happens per item, so one broken object does not
/// hide the others.
pub type ListedCronScale = Result<CronScale, MalformedResource>;

#[async_trait]
pub trait ScaleStore: Send + Sync {
    async fn list_namespaces(&self) -> Result<Vec<String>, StoreError>;

    async fn list_cron_scales(&self, namespace: &str) -> Result<Vec<ListedCronScale>, StoreError>;

    async fn get_workload(
        &self,
        namespace: &str,
        kind: WorkloadKind,
        name: &str,
    ) -> Result<WorkloadTarget, StoreError>;

    /// Writes the replica count of `workload`, failing with [`StoreError::VersionConflict`] if
    /// the stored object no longer carries `workload.resource_version`.
    async fn update_workload(&self, workload: &WorkloadTarget) -> Result<(), StoreError>;

    async fn get_autoscaler(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<AutoscalerTarget, StoreError>;

    /// Looks up the autoscaler whose own scale target is the given workload.
    async fn find_autoscaler(
        &self,
        namespace: &str,
        kind: WorkloadKind,
        name: &str,
    ) -> Result<Option<AutoscalerTarget>, StoreError>;

    /// Writes bounds and CPU target of `autoscaler`, with the same conflict contract as
    /// [`ScaleStore::update_workload`].
    async fn update_autoscaler(&self, autoscaler: &AutoscalerTarget) -> Result<(), StoreError>;
}
