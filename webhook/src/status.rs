//! Status-patch helper for `WebhookTrigger`, mirroring the operator's
//! generic `patch_status` but narrowed to the one resource kind this binary
//! ever reconciles.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    Api, Client,
    api::{Patch, PatchParams, Resource},
};

use kubetask_types::{WebhookTrigger, WebhookTriggerStatus};

use crate::error::Error;

const MANAGER_NAME: &str = "kubetask-webhook";

pub async fn patch_status(
    client: Client,
    instance: &WebhookTrigger,
    f: impl FnOnce(&mut WebhookTriggerStatus),
) -> Result<WebhookTrigger, Error> {
    let mut modified = instance.clone();
    let status = modified.status.get_or_insert_with(Default::default);
    f(status);

    let patch = Patch::Json::<WebhookTrigger>(json_patch::diff(
        &serde_json::to_value(instance).unwrap(),
        &serde_json::to_value(&modified).unwrap(),
    ));

    let name = instance.meta().name.as_deref().unwrap();
    let namespace = instance.meta().namespace.as_deref().unwrap();
    let api: Api<WebhookTrigger> = Api::namespaced(client, namespace);
    Ok(api
        .patch_status(name, &PatchParams::apply(MANAGER_NAME), &patch)
        .await?)
}

pub fn rfc3339_now() -> Time {
    Time(k8s_openapi::jiff::Timestamp::now())
}
