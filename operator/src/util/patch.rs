use super::MANAGER_NAME;
use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, jiff::Timestamp};
use kube::{
    Api, Client, Error,
    api::{Patch, PatchParams, Resource},
    core::NamespaceResourceScope,
};
use serde::{Serialize, de::DeserializeOwned};
use std::{clone::Clone, fmt::Debug};

use kubetask_types::{
    Agent, AgentStatus, CronStatus, CronTask, CronWorkflow, Task, TaskStatus, WebhookTrigger,
    WebhookTriggerStatus, WorkflowRun, WorkflowRunStatus,
};

pub trait Object<S: Status> {
    /// Returns a mutable reference to the status object, initializing
    /// it with the default value if it does not exist.
    fn mut_status(&mut self) -> &mut S;
}

pub trait Status {
    /// Sets the last updated timestamp to the given value.
    fn set_last_updated(&mut self, last_updated: Time);
}

macro_rules! impl_object_status {
    ($resource:ty, $status:ty, $field:ident) => {
        impl Object<$status> for $resource {
            fn mut_status(&mut self) -> &mut $status {
                if self.$field.is_some() {
                    return self.$field.as_mut().unwrap();
                }
                self.$field = Some(Default::default());
                self.$field.as_mut().unwrap()
            }
        }
    };
}

impl_object_status!(Agent, AgentStatus, status);
impl_object_status!(Task, TaskStatus, status);
impl_object_status!(WorkflowRun, WorkflowRunStatus, status);
impl_object_status!(CronTask, CronStatus, status);
impl_object_status!(CronWorkflow, CronStatus, status);
impl_object_status!(WebhookTrigger, WebhookTriggerStatus, status);

impl Status for AgentStatus {
    fn set_last_updated(&mut self, last_updated: Time) {
        self.last_updated = Some(last_updated);
    }
}

impl Status for TaskStatus {
    fn set_last_updated(&mut self, last_updated: Time) {
        self.last_updated = Some(last_updated);
    }
}

impl Status for WorkflowRunStatus {
    fn set_last_updated(&mut self, _last_updated: Time) {
        // WorkflowRunStatus has no lastUpdated field; stage timestamps carry recency.
    }
}

impl Status for CronStatus {
    fn set_last_updated(&mut self, _last_updated: Time) {
        // CronStatus tracks recency via lastScheduleTime, set explicitly by callers.
    }
}

impl Status for WebhookTriggerStatus {
    fn set_last_updated(&mut self, _last_updated: Time) {
        // WebhookTriggerStatus tracks recency via lastTriggeredTime, set explicitly by callers.
    }
}

/// Patch the resource's status object with the provided function.
/// The function is passed a mutable reference to the status object,
/// which is to be mutated in-place. Move closures are supported.
pub async fn patch_status<S: Status, T>(
    client: Client,
    instance: &T,
    f: impl FnOnce(&mut S),
) -> Result<T, Error>
where
    <T as Resource>::DynamicType: Default,
    T: Clone
        + Resource
        + Object<S>
        + Serialize
        + DeserializeOwned
        + Debug
        + Resource<Scope = NamespaceResourceScope>,
{
    let patch = Patch::Json::<T>({
        let mut modified = instance.clone();
        let status = modified.mut_status();
        f(status);
        status.set_last_updated(Time::from(Timestamp::now()));
        json_patch::diff(
            &serde_json::to_value(instance).unwrap(),
            &serde_json::to_value(&modified).unwrap(),
        )
    });
    let name = instance.meta().name.as_deref().unwrap();
    let namespace = instance.meta().namespace.as_deref().unwrap();
    let api: Api<T> = Api::namespaced(client, namespace);
    api.patch_status(name, &PatchParams::apply(MANAGER_NAME), &patch)
        .await
}
