//! The `CronScale` custom resource and the validated values derived from it.
use std::fmt::Display;

use kube::{CustomResource, CustomResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu, ensure};

use crate::schedule::{self, ScheduleWindow};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to serialize the CronScale CustomResourceDefinition"))]
    SerializeCrd { source: serde_yaml::Error },
}

/// Declares replica bounds and a CPU target for a workload, active while `cronSpec` matches.
///
/// Outside of the window the CronScale has no effect; whatever the autoscaler is configured with
/// stays untouched.
#[derive(Clone, CustomResource, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "autoscaling.cronscale.dev",
    version = "v1",
    kind = "CronScale",
    plural = "cronscales",
    shortname = "cs",
    crates(
        kube_core = "kube::core",
        k8s_openapi = "k8s_openapi",
        schemars = "schemars"
    ),
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CronScaleSpec {
    /// The window during which the bounds apply, either `<days> <HH:MM>-<HH:MM> [timezone]`
    /// (for example `Mon-Fri 09:00-18:00 UTC`) or a 5-field cron expression optionally prefixed
    /// with `CRON_TZ=<timezone>`.
    pub cron_spec: String,

    /// Lower replica bound while the window is active.
    pub min_replicas: i32,

    /// Upper replica bound while the window is active.
    pub max_replicas: i32,

    /// Average CPU utilization the autoscaler should aim for, in percent.
    #[serde(rename = "targetCPUUtilizationPercentage")]
    pub target_cpu_utilization_percentage: i32,

    /// The workload or HorizontalPodAutoscaler governed by this CronScale.
    pub scale_target_ref: ScaleTargetRef,
}

#[derive(Clone, Debug, Deserialize, Eq, Hash, JsonSchema, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleTargetRef {
    /// One of `Deployment`, `StatefulSet` or `HorizontalPodAutoscaler`.
    pub kind: String,

    /// Name of the referenced object in the CronScale's namespace.
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
}

/// Kinds of objects a CronScale may point at.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(ascii_case_insensitive)]
pub enum TargetKind {
    Deployment,
    StatefulSet,
    HorizontalPodAutoscaler,
}

/// Kinds of workloads whose replica count can be set directly.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(ascii_case_insensitive)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
}

impl TargetKind {
    pub fn workload(self) -> Option<WorkloadKind> {
        match self {
            Self::Deployment => Some(WorkloadKind::Deployment),
            Self::StatefulSet => Some(WorkloadKind::StatefulSet),
            Self::HorizontalPodAutoscaler => None,
        }
    }
}

impl From<WorkloadKind> for TargetKind {
    fn from(kind: WorkloadKind) -> Self {
        match kind {
            WorkloadKind::Deployment => Self::Deployment,
            WorkloadKind::StatefulSet => Self::StatefulSet,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Snafu)]
pub enum BoundsError {
    #[snafu(display("{field} must not be negative, got {value}"))]
    NegativeReplicas { field: &'static str, value: i32 },

    #[snafu(display("minReplicas ({min}) must not exceed maxReplicas ({max})"))]
    MinAboveMax { min: i32, max: i32 },

    #[snafu(display(
        "targetCPUUtilizationPercentage must be within 1 and 100, got {value}"
    ))]
    CpuTargetOutOfRange { value: i32 },
}

/// Replica bounds and CPU target that satisfy `0 <= min <= max` and `0 < cpu <= 100`.
///
/// The fields are private so that the only way to obtain a value is through
/// [`ScaleBounds::new`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleBounds {
    min_replicas: i32,
    max_replicas: i32,
    target_cpu_utilization_percentage: i32,
}

impl ScaleBounds {
    pub fn new(
        min_replicas: i32,
        max_replicas: i32,
        target_cpu_utilization_percentage: i32,
    ) -> Result<Self, BoundsError> {
        ensure!(
            min_replicas >= 0,
            NegativeReplicasSnafu {
                field: "minReplicas",
                value: min_replicas
            }
        );
        ensure!(
            max_replicas >= 0,
            NegativeReplicasSnafu {
                field: "maxReplicas",
                value: max_replicas
            }
        );
        ensure!(
            min_replicas <= max_replicas,
            MinAboveMaxSnafu {
                min: min_replicas,
                max: max_replicas
            }
        );
        ensure!(
            (1..=100).contains(&target_cpu_utilization_percentage),
            CpuTargetOutOfRangeSnafu {
                value: target_cpu_utilization_percentage
            }
        );

        Ok(Self {
            min_replicas,
            max_replicas,
            target_cpu_utilization_percentage,
        })
    }

    pub fn min_replicas(&self) -> i32 {
        self.min_replicas
    }

    pub fn max_replicas(&self) -> i32 {
        self.max_replicas
    }

    pub fn target_cpu_utilization_percentage(&self) -> i32 {
        self.target_cpu_utilization_percentage
    }

    /// Moves `replicas` into the bounds.
    pub fn clamp(&self, replicas: i32) -> i32 {
        replicas.clamp(self.min_replicas, self.max_replicas)
    }
}

impl Display for ScaleBounds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}..={} replicas @ {}% CPU",
            self.min_replicas, self.max_replicas, self.target_cpu_utilization_percentage
        )
    }
}

impl CronScaleSpec {
    pub fn bounds(&self) -> Result<ScaleBounds, BoundsError> {
        ScaleBounds::new(
            self.min_replicas,
            self.max_replicas,
            self.target_cpu_utilization_percentage,
        )
    }

    pub fn window(&self) -> Result<ScheduleWindow, schedule::Error> {
        self.cron_spec.parse()
    }
}

/// Prints the CustomResourceDefinition of [`CronScale`] as a YAML document to stdout.
pub fn print_yaml_schema() -> Result<(), Error> {
    let yaml = serde_yaml::to_string(&CronScale::crd()).context(SerializeCrdSnafu)?;
    println!("---\n{yaml}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn deserialize_cron_scale() {
        let input = r#"
          apiVersion: autoscaling.cronscale.dev/v1
          kind: CronScale
          metadata:
            name: api-business-hours
            namespace: shop
          spec:
            cronSpec: Mon-Fri 09:00-18:00 UTC
            minReplicas: 3
            maxReplicas: 10
            targetCPUUtilizationPercentage: 60
            scaleTargetRef:
              kind: Deployment
              name: api
        "#;

        let cron_scale: CronScale =
            serde_yaml::from_str(input).expect("CronScale must deserialize");
        assert_eq!(cron_scale.spec.cron_spec, "Mon-Fri 09:00-18:00 UTC");
        assert_eq!(cron_scale.spec.target_cpu_utilization_percentage, 60);
        assert_eq!(
            cron_scale.spec.scale_target_ref.kind.parse::<TargetKind>(),
            Ok(TargetKind::Deployment)
        );
        assert_eq!(
            cron_scale.spec.bounds().map(|bounds| bounds.to_string()),
            Ok("3..=10 replicas @ 60% CPU".to_owned())
        );
    }

    #[rstest]
    #[case(0, 0, 1)]
    #[case(1, 1, 100)]
    #[case(3, 10, 60)]
    fn valid_bounds(#[case] min: i32, #[case] max: i32, #[case] cpu: i32) {
        assert!(ScaleBounds::new(min, max, cpu).is_ok());
    }

    #[rstest]
    #[case(-1, 5, 50, BoundsError::NegativeReplicas { field: "minReplicas", value: -1 })]
    #[case(0, -2, 50, BoundsError::NegativeReplicas { field: "maxReplicas", value: -2 })]
    #[case(6, 5, 50, BoundsError::MinAboveMax { min: 6, max: 5 })]
    #[case(1, 5, 0, BoundsError::CpuTargetOutOfRange { value: 0 })]
    #[case(1, 5, 101, BoundsError::CpuTargetOutOfRange { value: 101 })]
    fn invalid_bounds(
        #[case] min: i32,
        #[case] max: i32,
        #[case] cpu: i32,
        #[case] expected: BoundsError,
    ) {
        assert_eq!(ScaleBounds::new(min, max, cpu), Err(expected));
    }

    #[rstest]
    #[case(0, 3)]
    #[case(7, 7)]
    #[case(42, 10)]
    fn clamp_replicas(#[case] replicas: i32, #[case] expected: i32) {
        let bounds = ScaleBounds::new(3, 10, 60).expect("valid bounds");
        assert_eq!(bounds.clamp(replicas), expected);
    }

    #[rstest]
    #[case("Deployment", TargetKind::Deployment)]
    #[case("deployment", TargetKind::Deployment)]
    #[case("STATEFULSET", TargetKind::StatefulSet)]
    #[case("horizontalPodAutoscaler", TargetKind::HorizontalPodAutoscaler)]
    fn target_kinds_parse_ignoring_case(#[case] input: &str, #[case] expected: TargetKind) {
        assert_eq!(input.parse::<TargetKind>(), Ok(expected));
    }

    #[test]
    fn unsupported_target_kind() {
        assert!("ReplicaSet".parse::<TargetKind>().is_err());
        assert!("statefulset".parse::<WorkloadKind>().is_ok());
    }

    #[test]
    fn crd_is_namespaced() {
        let crd = CronScale::crd();
        assert_eq!(crd.spec.group, "autoscaling.cronscale.dev");
        assert_eq!(crd.spec.scope, "Namespaced");
    }
}
