//! Keeps the process-local trigger registry in sync with cluster state.
//! Unlike the operator's controllers this runs unconditionally on every
//! webhook replica (no leader election): each replica serves requests out of
//! its own in-memory registry, so each one needs its own live watch rather
//! than deferring to a single writer.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::StreamExt;
use kube::{
    Api, ResourceExt,
    api::{Patch, PatchParams},
    client::Client,
    runtime::{Controller, controller::Action},
};
use owo_colors::OwoColorize;

use kubetask_types::WebhookTrigger;

use crate::error::Error;
use crate::registry::Registry;

const REGISTRY_FINALIZER: &str = "kubetask.io/webhook-registry";

struct ContextData {
    client: Client,
    registry: Registry,
}

pub async fn run(client: Client, registry: Registry, watch_namespace: Option<&str>) -> Result<(), Error> {
    println!("{}", "⚙️ Starting WebhookTrigger registry sync...".green());
    let context = Arc::new(ContextData { client: client.clone(), registry });
    let api: Api<WebhookTrigger> = match watch_namespace {
        Some(namespace) => Api::namespaced(client, namespace),
        None => Api::all(client),
    };

    Controller::new(api, Default::default())
        .run(reconcile, on_error, context)
        .for_each(|_res| async move {})
        .await;

    Ok(())
}

async fn reconcile(instance: Arc<WebhookTrigger>, ctx: Arc<ContextData>) -> Result<Action, Error> {
    let namespace = instance
        .meta()
        .namespace
        .clone()
        .ok_or_else(|| Error::BadBody("WebhookTrigger is missing metadata.namespace".to_string()))?;
    let name = instance
        .meta()
        .name
        .clone()
        .ok_or_else(|| Error::BadBody("WebhookTrigger is missing metadata.name".to_string()))?;

    if instance.meta().deletion_timestamp.is_some() {
        ctx.registry.unregister(&namespace, &name).await;
        if instance.finalizers().iter().any(|f| f == REGISTRY_FINALIZER) {
            remove_finalizer(ctx.client.clone(), &instance, &namespace, &name).await?;
        }
        return Ok(Action::await_change());
    }

    if !instance.finalizers().iter().any(|f| f == REGISTRY_FINALIZER) {
        add_finalizer(ctx.client.clone(), &instance, &namespace, &name).await?;
    }

    ctx.registry.register(&namespace, &name, instance.spec.clone()).await;
    Ok(Action::requeue(Duration::from_secs(300)))
}

async fn add_finalizer(
    client: Client,
    instance: &WebhookTrigger,
    namespace: &str,
    name: &str,
) -> Result<(), Error> {
    let api: Api<WebhookTrigger> = Api::namespaced(client, namespace);
    let mut finalizers = instance.finalizers().to_vec();
    finalizers.push(REGISTRY_FINALIZER.to_string());
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)).await?;
    Ok(())
}

async fn remove_finalizer(
    client: Client,
    instance: &WebhookTrigger,
    namespace: &str,
    name: &str,
) -> Result<(), Error> {
    let api: Api<WebhookTrigger> = Api::namespaced(client, namespace);
    let finalizers: Vec<String> = instance
        .finalizers()
        .iter()
        .filter(|f| *f != REGISTRY_FINALIZER)
        .cloned()
        .collect();
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)).await?;
    Ok(())
}

fn on_error(_instance: Arc<WebhookTrigger>, err: &Error, _ctx: Arc<ContextData>) -> Action {
    eprintln!("{} {}", "⚠️ WebhookTrigger reconcile error:".yellow(), err);
    Action::requeue(Duration::from_secs(15))
}
