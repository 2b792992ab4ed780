use kube::api::{ObjectMeta, Resource};
use kube::{Api, Client, ResourceExt};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kubetask_common::annotations;
use kubetask_types::{CronStatus, CronTask, CronWorkflow, Task, TaskPhase, TaskSpec, WorkflowRun, WorkflowRunPhase, WorkflowRunSpec};

use crate::util::{self, Error, patch::patch_status};

use super::planner::{ChildOutcome, ChildSummary};

fn instance_name<K: Resource>(instance: &K) -> Result<&str, Error> {
    instance
        .meta()
        .name
        .as_deref()
        .ok_or_else(|| Error::UserInput("resource is missing metadata.name".to_string()))
}

fn instance_namespace<K: Resource>(instance: &K) -> Result<&str, Error> {
    instance
        .meta()
        .namespace
        .as_deref()
        .ok_or_else(|| Error::UserInput("resource is missing metadata.namespace".to_string()))
}

pub async fn list_task_children(client: Client, namespace: &str, parent: &str) -> Result<Vec<ChildSummary>, Error> {
    let api: Api<Task> = Api::namespaced(client, namespace);
    let list = api
        .list(&kube::api::ListParams::default().labels(&format!("{}={}", annotations::CRONTASK, parent)))
        .await?;
    Ok(list
        .items
        .iter()
        .map(|t| ChildSummary {
            name: t.name_any(),
            created_at: creation_timestamp(t),
            outcome: match t.status.as_ref().map(|s| s.phase).unwrap_or_default() {
                TaskPhase::Completed => ChildOutcome::Successful,
                TaskPhase::Failed => ChildOutcome::Failed,
                _ => ChildOutcome::Active,
            },
        })
        .collect())
}

pub async fn list_workflow_run_children(
    client: Client,
    namespace: &str,
    parent: &str,
) -> Result<Vec<ChildSummary>, Error> {
    let api: Api<WorkflowRun> = Api::namespaced(client, namespace);
    let list = api
        .list(&kube::api::ListParams::default().labels(&format!("{}={}", annotations::CRONWORKFLOW, parent)))
        .await?;
    Ok(list
        .items
        .iter()
        .map(|w| ChildSummary {
            name: w.name_any(),
            created_at: creation_timestamp(w),
            outcome: match w.status.as_ref().map(|s| s.phase).unwrap_or_default() {
                WorkflowRunPhase::Completed => ChildOutcome::Successful,
                WorkflowRunPhase::Failed => ChildOutcome::Failed,
                _ => ChildOutcome::Active,
            },
        })
        .collect())
}

fn creation_timestamp<K: Resource>(obj: &K) -> chrono::DateTime<chrono::Utc> {
    obj.meta()
        .creation_timestamp
        .as_ref()
        .and_then(|t| from_jiff(t.0))
        .unwrap_or_else(chrono::Utc::now)
}

fn from_jiff(t: k8s_openapi::jiff::Timestamp) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::from_timestamp(t.as_second(), t.subsec_nanosecond().max(0) as u32)
}

pub async fn delete_task_children(client: Client, namespace: &str, names: &[String]) -> Result<(), Error> {
    let api: Api<Task> = Api::namespaced(client, namespace);
    for name in names {
        match api.delete(name, &Default::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

pub async fn delete_workflow_run_children(client: Client, namespace: &str, names: &[String]) -> Result<(), Error> {
    let api: Api<WorkflowRun> = Api::namespaced(client, namespace);
    for name in names {
        match api.delete(name, &Default::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

pub async fn create_task_child(
    client: Client,
    parent: &CronTask,
    child_name: String,
    scheduled_at: chrono::DateTime<chrono::Utc>,
    spec: TaskSpec,
) -> Result<(), Error> {
    let namespace = instance_namespace(parent)?;
    let mut labels = std::collections::BTreeMap::new();
    labels.insert(annotations::CRONTASK.to_string(), instance_name(parent)?.to_string());
    let mut anns = std::collections::BTreeMap::new();
    anns.insert(annotations::SCHEDULED_AT.to_string(), scheduled_at.to_rfc3339());

    let task = Task {
        metadata: ObjectMeta {
            name: Some(child_name),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            annotations: Some(anns),
            owner_references: Some(vec![parent.controller_owner_ref(&()).unwrap()]),
            ..Default::default()
        },
        spec,
        status: None,
    };
    let api: Api<Task> = Api::namespaced(client, namespace);
    match api.create(&Default::default(), &task).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub async fn create_workflow_run_child(
    client: Client,
    parent: &CronWorkflow,
    child_name: String,
    scheduled_at: chrono::DateTime<chrono::Utc>,
    spec: WorkflowRunSpec,
) -> Result<(), Error> {
    let namespace = instance_namespace(parent)?;
    let mut labels = std::collections::BTreeMap::new();
    labels.insert(annotations::CRONWORKFLOW.to_string(), instance_name(parent)?.to_string());
    let mut anns = std::collections::BTreeMap::new();
    anns.insert(annotations::SCHEDULED_AT.to_string(), scheduled_at.to_rfc3339());

    let run = WorkflowRun {
        metadata: ObjectMeta {
            name: Some(child_name),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            annotations: Some(anns),
            owner_references: Some(vec![parent.controller_owner_ref(&()).unwrap()]),
            ..Default::default()
        },
        spec,
        status: None,
    };
    let api: Api<WorkflowRun> = Api::namespaced(client, namespace);
    match api.create(&Default::default(), &run).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub async fn patch_crontask_status(
    client: Client,
    instance: &CronTask,
    active: Vec<String>,
    scheduled_at: Option<chrono::DateTime<chrono::Utc>>,
) -> Result<(), Error> {
    patch_status::<CronStatus, CronTask>(client, instance, |status: &mut CronStatus| {
        status.active = active.clone();
        if let Some(scheduled_at) = scheduled_at {
            status.last_schedule_time = Some(Time(to_jiff(scheduled_at)));
            util::conditions::set_condition(
                &mut status.conditions,
                "Scheduled",
                true,
                "Scheduled",
                &format!("scheduled at {}", scheduled_at.to_rfc3339()),
            );
        }
    })
    .await?;
    Ok(())
}

pub async fn patch_cronworkflow_status(
    client: Client,
    instance: &CronWorkflow,
    active: Vec<String>,
    scheduled_at: Option<chrono::DateTime<chrono::Utc>>,
) -> Result<(), Error> {
    patch_status::<CronStatus, CronWorkflow>(client, instance, |status: &mut CronStatus| {
        status.active = active.clone();
        if let Some(scheduled_at) = scheduled_at {
            status.last_schedule_time = Some(Time(to_jiff(scheduled_at)));
            util::conditions::set_condition(
                &mut status.conditions,
                "Scheduled",
                true,
                "Scheduled",
                &format!("scheduled at {}", scheduled_at.to_rfc3339()),
            );
        }
    })
    .await?;
    Ok(())
}

/// Spec §9 Open Question (b): once the missed-run walk hits
/// [`super::schedule::MISSED_RUN_CAP`], report it as a `Scheduled` condition
/// with reason `MissedSchedule` rather than trying to back-fill every run.
pub async fn report_missed_schedule_crontask(client: Client, instance: &CronTask) -> Result<(), Error> {
    patch_status::<CronStatus, CronTask>(client, instance, |status: &mut CronStatus| {
        util::conditions::set_condition(
            &mut status.conditions,
            "Scheduled",
            true,
            "MissedSchedule",
            "schedule has missed more runs than can be tracked; resuming from now",
        );
    })
    .await?;
    Ok(())
}

pub async fn report_missed_schedule_cronworkflow(client: Client, instance: &CronWorkflow) -> Result<(), Error> {
    patch_status::<CronStatus, CronWorkflow>(client, instance, |status: &mut CronStatus| {
        util::conditions::set_condition(
            &mut status.conditions,
            "Scheduled",
            true,
            "MissedSchedule",
            "schedule has missed more runs than can be tracked; resuming from now",
        );
    })
    .await?;
    Ok(())
}

pub async fn report_invalid_crontask_schedule(client: Client, instance: &CronTask, message: String) -> Result<(), Error> {
    patch_status::<CronStatus, CronTask>(client, instance, |status: &mut CronStatus| {
        util::conditions::set_condition(&mut status.conditions, "Scheduled", false, "InvalidSchedule", &message);
    })
    .await?;
    Ok(())
}

pub async fn report_invalid_cronworkflow_schedule(
    client: Client,
    instance: &CronWorkflow,
    message: String,
) -> Result<(), Error> {
    patch_status::<CronStatus, CronWorkflow>(client, instance, |status: &mut CronStatus| {
        util::conditions::set_condition(&mut status.conditions, "Scheduled", false, "InvalidSchedule", &message);
    })
    .await?;
    Ok(())
}

fn to_jiff(t: chrono::DateTime<chrono::Utc>) -> k8s_openapi::jiff::Timestamp {
    k8s_openapi::jiff::Timestamp::from_second(t.timestamp())
        .unwrap_or_else(|_| k8s_openapi::jiff::Timestamp::now())
}
