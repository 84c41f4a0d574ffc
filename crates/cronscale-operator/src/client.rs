use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::{
    NamespaceResourceScope,
    api::{
        apps::v1::{Deployment, StatefulSet},
        autoscaling::v1::HorizontalPodAutoscaler,
        core::v1::Namespace,
    },
};
use kube::{
    Api, Resource, ResourceExt,
    api::{ApiResource, DynamicObject, ListParams, Patch, PatchParams},
    core::TypeMeta,
};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::json;
use tracing::{debug, warn};

use crate::{
    crd::{CronScale, ScaleTargetRef, WorkloadKind},
    store::{
        AutoscalerTarget, ListedCronScale, MalformedResource, ObjectKey, ScaleStore, StoreError,
        WorkloadTarget,
    },
};

/// Annotation under which `autoscaling/v1` HorizontalPodAutoscalers carry their conditions.
const HPA_CONDITIONS_ANNOTATION: &str = "autoscaling.alpha.kubernetes.io/conditions";

/// This `Client` can be used to access Kubernetes.
/// It wraps an underlying [kube::client::Client] and implements [`ScaleStore`] on top of it.
#[derive(Clone)]
pub struct Client {
    client: kube::Client,
    patch_params: PatchParams,
}

impl Client {
    pub fn new(client: kube::Client, field_manager: Option<String>) -> Self {
        Self {
            client,
            patch_params: PatchParams {
                field_manager,
                ..PatchParams::default()
            },
        }
    }

    /// Retrieves a single instance of the requested resource type with the given name.
    pub async fn get<T>(&self, resource_name: &str, namespace: &str) -> Result<T, kube::Error>
    where
        T: Clone
            + Debug
            + DeserializeOwned
            + Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        self.get_namespaced_api(namespace).get(resource_name).await
    }

    /// Retrieves all instances of the requested resource type in the given namespace.
    pub async fn list<T>(&self, namespace: &str) -> Result<Vec<T>, kube::Error>
    where
        T: Clone
            + Debug
            + DeserializeOwned
            + Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        Ok(self
            .get_namespaced_api(namespace)
            .list(&ListParams::default())
            .await?
            .items)
    }

    /// Patches a resource using the `MERGE` patch strategy.
    /// This will fail for objects that do not exist yet.
    ///
    /// A `metadata.resourceVersion` inside the patch turns it into a conditional update.
    pub async fn merge_patch<T>(
        &self,
        resource_name: &str,
        namespace: &str,
        patch: &serde_json::Value,
    ) -> Result<T, kube::Error>
    where
        T: Clone
            + Debug
            + DeserializeOwned
            + Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        self.get_namespaced_api(namespace)
            .patch(resource_name, &self.patch_params, &Patch::Merge(patch))
            .await
    }

    pub fn get_all_api<T>(&self) -> Api<T>
    where
        T: Resource<DynamicType = ()>,
    {
        Api::all(self.client.clone())
    }

    pub fn get_namespaced_api<T>(&self, namespace: &str) -> Api<T>
    where
        T: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn update_replicas<T>(&self, workload: &WorkloadTarget) -> Result<(), StoreError>
    where
        T: Clone
            + Debug
            + DeserializeOwned
            + Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        let patch = json!({
            "metadata": { "resourceVersion": workload.resource_version },
            "spec": { "replicas": workload.replicas },
        });

        self.merge_patch::<T>(&workload.name, &workload.namespace, &patch)
            .await
            .map(|_| ())
            .map_err(|error| {
                classify(
                    error,
                    workload.key().to_string(),
                    Some(&workload.resource_version),
                )
            })
    }
}

#[async_trait]
impl ScaleStore for Client {
    async fn list_namespaces(&self) -> Result<Vec<String>, StoreError> {
        debug!("listing namespaces");
        let namespaces = self
            .get_all_api::<Namespace>()
            .list(&ListParams::default())
            .await
            .map_err(|error| classify(error, "namespaces".to_owned(), None))?;

        Ok(namespaces.items.iter().map(ResourceExt::name_any).collect())
    }

    async fn list_cron_scales(&self, namespace: &str) -> Result<Vec<ListedCronScale>, StoreError> {
        debug!(namespace, "listing CronScales");
        let resource = ApiResource::erase::<CronScale>(&());
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &resource);

        let objects = api
            .list(&ListParams::default())
            .await
            .map_err(|error| classify(error, format!("{namespace}/cronscales"), None))?;

        Ok(objects.items.into_iter().map(decode_cron_scale).collect())
    }

    async fn get_workload(
        &self,
        namespace: &str,
        kind: WorkloadKind,
        name: &str,
    ) -> Result<WorkloadTarget, StoreError> {
        debug!(namespace, %kind, name, "getting workload");
        let object = format!("{namespace}/{kind}/{name}");

        let (replicas, resource_version) = match kind {
            WorkloadKind::Deployment => {
                let deployment: Deployment = self
                    .get(name, namespace)
                    .await
                    .map_err(|error| classify(error, object, None))?;
                let replicas = deployment.spec.as_ref().and_then(|spec| spec.replicas);
                (replicas, deployment.resource_version())
            }
            WorkloadKind::StatefulSet => {
                let stateful_set: StatefulSet = self
                    .get(name, namespace)
                    .await
                    .map_err(|error| classify(error, object, None))?;
                let replicas = stateful_set.spec.as_ref().and_then(|spec| spec.replicas);
                (replicas, stateful_set.resource_version())
            }
        };

        Ok(WorkloadTarget {
            namespace: namespace.to_owned(),
            kind,
            name: name.to_owned(),
            // Kubernetes defaults an unset replica count to one.
            replicas: replicas.unwrap_or(1),
            resource_version: resource_version.unwrap_or_default(),
        })
    }

    async fn update_workload(&self, workload: &WorkloadTarget) -> Result<(), StoreError> {
        debug!(workload = %workload.key(), replicas = workload.replicas, "updating workload");
        match workload.kind {
            WorkloadKind::Deployment => self.update_replicas::<Deployment>(workload).await,
            WorkloadKind::StatefulSet => self.update_replicas::<StatefulSet>(workload).await,
        }
    }

    async fn get_autoscaler(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<AutoscalerTarget, StoreError> {
        debug!(namespace, name, "getting HorizontalPodAutoscaler");
        let hpa: HorizontalPodAutoscaler = self.get(name, namespace).await.map_err(|error| {
            classify(
                error,
                format!("{namespace}/HorizontalPodAutoscaler/{name}"),
                None,
            )
        })?;

        Ok(autoscaler_target(hpa))
    }

    async fn find_autoscaler(
        &self,
        namespace: &str,
        kind: WorkloadKind,
        name: &str,
    ) -> Result<Option<AutoscalerTarget>, StoreError> {
        debug!(namespace, %kind, name, "looking up HorizontalPodAutoscaler for workload");
        let mut candidates: Vec<HorizontalPodAutoscaler> = self
            .list::<HorizontalPodAutoscaler>(namespace)
            .await
            .map_err(|error| {
                classify(
                    error,
                    format!("{namespace}/horizontalpodautoscalers"),
                    None,
                )
            })?
            .into_iter()
            .filter(|hpa| {
                hpa.spec.as_ref().is_some_and(|spec| {
                    spec.scale_target_ref.kind == kind.to_string()
                        && spec.scale_target_ref.name == name
                })
            })
            .collect();

        candidates.sort_by_key(ResourceExt::name_any);
        if candidates.len() > 1 {
            warn!(
                namespace,
                %kind,
                name,
                autoscalers = ?candidates.iter().map(ResourceExt::name_any).collect::<Vec<_>>(),
                "multiple HorizontalPodAutoscalers scale the same workload, using the first one"
            );
        }

        Ok(candidates.into_iter().next().map(autoscaler_target))
    }

    async fn update_autoscaler(&self, autoscaler: &AutoscalerTarget) -> Result<(), StoreError> {
        debug!(
            autoscaler = %autoscaler.key(),
            min_replicas = autoscaler.min_replicas,
            max_replicas = autoscaler.max_replicas,
            target_cpu_utilization_percentage = autoscaler.target_cpu_utilization_percentage,
            "updating HorizontalPodAutoscaler"
        );
        let patch = json!({
            "metadata": { "resourceVersion": autoscaler.resource_version },
            "spec": {
                "minReplicas": autoscaler.min_replicas,
                "maxReplicas": autoscaler.max_replicas,
                "targetCPUUtilizationPercentage": autoscaler.target_cpu_utilization_percentage,
            },
        });

        self.merge_patch::<HorizontalPodAutoscaler>(
            &autoscaler.name,
            &autoscaler.namespace,
            &patch,
        )
        .await
        .map(|_| ())
        .map_err(|error| {
            classify(
                error,
                format!(
                    "{}/HorizontalPodAutoscaler/{}",
                    autoscaler.namespace, autoscaler.name
                ),
                Some(&autoscaler.resource_version),
            )
        })
    }
}

/// Maps Kubernetes API errors onto the store's error contract.
fn classify(error: kube::Error, object: String, resource_version: Option<&str>) -> StoreError {
    let code = match &error {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    };

    match code {
        Some(404) => StoreError::NotFound { object },
        Some(409) => StoreError::VersionConflict {
            object,
            expected: resource_version.unwrap_or_default().to_owned(),
        },
        _ => StoreError::Request {
            object,
            source: Box::new(error),
        },
    }
}

fn decode_cron_scale(mut object: DynamicObject) -> ListedCronScale {
    let key = ObjectKey::new(object.namespace().unwrap_or_default(), object.name_any());

    // List items do not necessarily repeat their type information.
    object.types.get_or_insert_with(|| TypeMeta {
        api_version: CronScale::api_version(&()).into_owned(),
        kind: CronScale::kind(&()).into_owned(),
    });

    serde_json::to_value(&object)
        .and_then(serde_json::from_value::<CronScale>)
        .map_err(|error| MalformedResource {
            key,
            message: error.to_string(),
        })
}

fn autoscaler_target(hpa: HorizontalPodAutoscaler) -> AutoscalerTarget {
    let enabled = scaling_active(hpa.annotations().get(HPA_CONDITIONS_ANNOTATION));
    let namespace = hpa.namespace().unwrap_or_default();
    let name = hpa.name_any();
    let resource_version = hpa.resource_version().unwrap_or_default();
    let spec = hpa.spec.unwrap_or_default();

    AutoscalerTarget {
        namespace,
        name,
        scale_target: ScaleTargetRef {
            kind: spec.scale_target_ref.kind,
            name: spec.scale_target_ref.name,
            api_version: spec.scale_target_ref.api_version,
        },
        // Kubernetes defaults an unset minimum to one.
        min_replicas: spec.min_replicas.unwrap_or(1),
        max_replicas: spec.max_replicas,
        target_cpu_utilization_percentage: spec.target_cpu_utilization_percentage,
        enabled,
        resource_version,
    }
}

#[derive(Deserialize)]
struct AutoscalerCondition {
    #[serde(rename = "type")]
    type_: String,
    status: String,
}

/// An autoscaler is considered disabled when its `ScalingActive` condition is `False`.
/// Missing or unreadable conditions count as active.
fn scaling_active(conditions: Option<&String>) -> bool {
    let Some(conditions) = conditions else {
        return true;
    };

    match serde_json::from_str::<Vec<AutoscalerCondition>>(conditions) {
        Ok(conditions) => !conditions
            .iter()
            .any(|condition| condition.type_ == "ScalingActive" && condition.status == "False"),
        Err(error) => {
            warn!(%error, "ignoring unreadable HorizontalPodAutoscaler conditions");
            true
        }
    }
}
