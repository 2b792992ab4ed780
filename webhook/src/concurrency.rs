//! Concurrency-policy enforcement over resources a trigger (or one of its
//! rules) previously materialized. Mirrors the cron reconciler's
//! Allow/Forbid/Replace vocabulary but counts Tasks *and* WorkflowRuns,
//! since a trigger's `resourceTemplate` can be either.

use kube::{Api, Client, ResourceExt, api::ListParams};

use kubetask_common::annotations;
use kubetask_types::{ConcurrencyPolicy, Task, WorkflowRun};

use crate::error::Error;

pub enum Decision {
    Proceed,
    Skip,
}

fn selector(trigger: &str, rule: Option<&str>) -> String {
    match rule {
        Some(rule) => format!(
            "{}={trigger},{}={rule}",
            annotations::WEBHOOK_TRIGGER,
            annotations::WEBHOOK_RULE
        ),
        None => format!("{}={trigger}", annotations::WEBHOOK_TRIGGER),
    }
}

async fn active_tasks(client: Client, namespace: &str, selector: &str) -> Result<Vec<Task>, Error> {
    let api: Api<Task> = Api::namespaced(client, namespace);
    let list = api.list(&ListParams::default().labels(selector)).await?;
    Ok(list
        .items
        .into_iter()
        .filter(|t| {
            !t.status
                .as_ref()
                .map(|s| s.phase.is_terminal())
                .unwrap_or(false)
        })
        .collect())
}

async fn active_workflow_runs(
    client: Client,
    namespace: &str,
    selector: &str,
) -> Result<Vec<WorkflowRun>, Error> {
    let api: Api<WorkflowRun> = Api::namespaced(client, namespace);
    let list = api.list(&ListParams::default().labels(selector)).await?;
    Ok(list
        .items
        .into_iter()
        .filter(|wr| {
            !wr.status
                .as_ref()
                .map(|s| s.phase.is_terminal())
                .unwrap_or(false)
        })
        .collect())
}

async fn stop_task(client: Client, task: &Task) -> Result<(), Error> {
    let api: Api<Task> = Api::namespaced(client, task.namespace().unwrap_or_default());
    let patch = serde_json::json!({
        "metadata": { "annotations": { annotations::STOP: "true" } }
    });
    api.patch(
        &task.name_any(),
        &kube::api::PatchParams::default(),
        &kube::api::Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

async fn stop_workflow_run(client: Client, run: &WorkflowRun) -> Result<(), Error> {
    let api: Api<WorkflowRun> = Api::namespaced(client, run.namespace().unwrap_or_default());
    let patch = serde_json::json!({
        "metadata": { "annotations": { annotations::STOP: "true" } }
    });
    api.patch(
        &run.name_any(),
        &kube::api::PatchParams::default(),
        &kube::api::Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

/// Applies `policy` against whatever Tasks/WorkflowRuns are already active for
/// this trigger (optionally scoped to one rule). Returns whether the caller
/// should proceed with materializing a new resource.
pub async fn apply(
    client: Client,
    namespace: &str,
    trigger: &str,
    rule: Option<&str>,
    policy: ConcurrencyPolicy,
) -> Result<Decision, Error> {
    let selector = selector(trigger, rule);
    let tasks = active_tasks(client.clone(), namespace, &selector).await?;
    let runs = active_workflow_runs(client.clone(), namespace, &selector).await?;

    match policy {
        ConcurrencyPolicy::Allow => Ok(Decision::Proceed),
        ConcurrencyPolicy::Forbid => {
            if tasks.is_empty() && runs.is_empty() {
                Ok(Decision::Proceed)
            } else {
                Ok(Decision::Skip)
            }
        }
        ConcurrencyPolicy::Replace => {
            for task in &tasks {
                stop_task(client.clone(), task).await?;
            }
            for run in &runs {
                stop_workflow_run(client.clone(), run).await?;
            }
            Ok(Decision::Proceed)
        }
    }
}
