//! Per-resource errors and the taxonomy they are summarized by.
//!
//! Nothing in here aborts a pass. Every [`Error`] belongs to a single CronScale (or, for
//! listing failures, a single namespace) and the pass carries on with the rest. Only failing to
//! list CronScales at all is fatal, see [`crate::driver::PassError`].
use std::sync::Arc;

use serde::Serialize;
use snafu::Snafu;

use crate::{
    crd::BoundsError,
    schedule,
    snapshot::TargetError,
    store::{ObjectKey, StoreError, TargetKey},
};

/// Coarse classification used for pass summaries and log fields.
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
)]
pub enum ErrorKind {
    /// The CronScale cannot be turned into a valid window, bounds or target.
    InvalidScheduleSpec,

    /// The listed object could not be decoded into a CronScale.
    MalformedResource,

    /// A namespace's CronScales could not be listed while others could.
    ListFailed,

    /// The referenced autoscaler or workload could not be read.
    TargetFetchFailed,

    /// The target changed between snapshot and write.
    VersionConflict,

    /// More than one active CronScale governs the same target.
    ConflictingSchedule,

    /// A write kept failing after all retries.
    WriteFailed,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("invalid cronSpec"))]
    InvalidSchedule { source: schedule::Error },

    #[snafu(display("invalid replica bounds"))]
    InvalidBounds { source: BoundsError },

    #[snafu(display(
        "unsupported scaleTargetRef kind {kind:?}, expected a workload or an autoscaler"
    ))]
    UnsupportedTargetKind { kind: String },

    #[snafu(display("failed to decode CronScale: {message}"))]
    Malformed { message: String },

    #[snafu(display("failed to list CronScales in namespace {namespace:?}"))]
    ListCronScales {
        namespace: String,
        source: Arc<StoreError>,
    },

    #[snafu(display("failed to fetch target {target}"))]
    TargetFetch {
        target: TargetKey,
        source: Arc<TargetError>,
    },

    #[snafu(display("target {target} was not part of the snapshot"))]
    TargetNotObserved { target: TargetKey },

    #[snafu(display("write to {target} was abandoned"))]
    Abandoned {
        target: TargetKey,
        source: StoreError,
    },

    #[snafu(display("write to {target} failed after {attempts} attempt(s)"))]
    Write {
        target: TargetKey,
        attempts: u32,
        source: StoreError,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidSchedule { .. }
            | Self::InvalidBounds { .. }
            | Self::UnsupportedTargetKind { .. } => ErrorKind::InvalidScheduleSpec,
            Self::Malformed { .. } => ErrorKind::MalformedResource,
            Self::ListCronScales { .. } => ErrorKind::ListFailed,
            Self::TargetFetch { .. } | Self::TargetNotObserved { .. } => {
                ErrorKind::TargetFetchFailed
            }
            Self::Abandoned { .. } => ErrorKind::VersionConflict,
            Self::Write { .. } => ErrorKind::WriteFailed,
        }
    }
}

/// Several active CronScales govern the same target. `winner` is the one that was applied.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct OverlapWarning {
    pub target: TargetKey,
    pub winner: ObjectKey,
    pub contenders: Vec<ObjectKey>,
}

impl OverlapWarning {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ConflictingSchedule
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::TargetKind;

    #[test]
    fn abandoned_writes_count_as_conflicts() {
        let target = TargetKey::new("shop", TargetKind::Deployment, "api");
        let error = Error::Abandoned {
            target: target.clone(),
            source: StoreError::NotFound {
                object: target.to_string(),
            },
        };
        assert_eq!(error.kind(), ErrorKind::VersionConflict);
        assert_eq!(error.to_string(), "write to shop/Deployment/api was abandoned");
    }

    #[test]
    fn configuration_errors_share_a_kind() {
        let errors = [
            Error::UnsupportedTargetKind {
                kind: "ReplicaSet".to_owned(),
            },
            Error::InvalidBounds {
                source: BoundsError::MinAboveMax { min: 4, max: 2 },
            },
            Error::InvalidSchedule {
                source: schedule::Error::Empty,
            },
        ];
        assert!(
            errors
                .iter()
                .all(|error| error.kind() == ErrorKind::InvalidScheduleSpec)
        );
    }
}
