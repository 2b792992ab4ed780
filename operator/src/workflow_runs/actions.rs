use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{ObjectMeta, Resource};
use kube::{Api, Client, ResourceExt};

use kubetask_common::annotations;
use kubetask_types::{
    NamedTaskSpec, StagePhase, StageSpec, StageStatus, Task, TaskPhase, Workflow, WorkflowRun, WorkflowRunPhase,
    WorkflowRunStatus,
};

use crate::util::{self, Error, patch::patch_status};

fn instance_name(instance: &WorkflowRun) -> Result<&str, Error> {
    instance
        .meta()
        .name
        .as_deref()
        .ok_or_else(|| Error::UserInput("WorkflowRun is missing metadata.name".to_string()))
}

fn instance_namespace(instance: &WorkflowRun) -> Result<&str, Error> {
    instance
        .meta()
        .namespace
        .as_deref()
        .ok_or_else(|| Error::UserInput("WorkflowRun is missing metadata.namespace".to_string()))
}

pub async fn fetch_workflow(client: Client, namespace: &str, name: &str) -> Result<Option<Workflow>, Error> {
    let api: Api<Workflow> = Api::namespaced(client, namespace);
    match api.get(name).await {
        Ok(w) => Ok(Some(w)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Phases of the Tasks belonging to stage `index`, in the order listed by the cluster.
pub async fn list_stage_task_phases(
    client: Client,
    namespace: &str,
    workflow_run_name: &str,
    stage_index: usize,
) -> Result<Vec<TaskPhase>, Error> {
    let api: Api<Task> = Api::namespaced(client, namespace);
    let selector = format!(
        "{}={},{}={}",
        annotations::WORKFLOW_RUN,
        workflow_run_name,
        annotations::STAGE_INDEX,
        stage_index
    );
    let list = api.list(&kube::api::ListParams::default().labels(&selector)).await?;
    Ok(list
        .items
        .iter()
        .map(|t| t.status.as_ref().map(|s| s.phase).unwrap_or_default())
        .collect())
}

pub async fn start_stage_tasks(
    client: Client,
    instance: &WorkflowRun,
    workflow_name: Option<&str>,
    stages: &[StageSpec],
    index: usize,
) -> Result<(), Error> {
    let run_name = instance_name(instance)?;
    let stage = &stages[index];
    let depends_on = super::planner::depends_on_for(stages, run_name, index);

    for named_task in &stage.tasks {
        create_stage_task(
            client.clone(),
            instance,
            workflow_name,
            index,
            stage,
            named_task,
            depends_on.as_deref(),
        )
        .await?;
    }

    patch_status::<WorkflowRunStatus, WorkflowRun>(client, instance, |status: &mut WorkflowRunStatus| {
        status.current_stage = index as i32;
        ensure_stage_slots(status, stages.len());
        status.stages[index] = StageStatus {
            name: stage.name.clone(),
            phase: StagePhase::Running,
            task_names: stage
                .tasks
                .iter()
                .map(|t| super::planner::task_name_for(run_name, t))
                .collect(),
            start_time: Some(Time(k8s_openapi::jiff::Timestamp::now())),
            completion_time: None,
        };
        util::conditions::set_condition(
            &mut status.conditions,
            "Ready",
            false,
            "Running",
            &format!("stage {index} in progress"),
        );
    })
    .await?;
    Ok(())
}

async fn create_stage_task(
    client: Client,
    parent: &WorkflowRun,
    workflow_name: Option<&str>,
    stage_index: usize,
    stage: &StageSpec,
    named_task: &NamedTaskSpec,
    depends_on: Option<&str>,
) -> Result<(), Error> {
    let namespace = instance_namespace(parent)?;
    let run_name = instance_name(parent)?;
    let task_name = super::planner::task_name_for(run_name, named_task);

    let mut labels = BTreeMap::new();
    labels.insert(annotations::WORKFLOW_RUN.to_string(), run_name.to_string());
    labels.insert(annotations::STAGE_INDEX.to_string(), stage_index.to_string());
    if let Some(stage_name) = &stage.name {
        labels.insert(annotations::STAGE.to_string(), stage_name.clone());
    }
    if let Some(workflow_name) = workflow_name {
        labels.insert(annotations::WORKFLOW.to_string(), workflow_name.to_string());
    }

    let anns = depends_on.map(|d| {
        let mut m = BTreeMap::new();
        m.insert(annotations::DEPENDS_ON.to_string(), d.to_string());
        m
    });

    let task = Task {
        metadata: ObjectMeta {
            name: Some(task_name),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            annotations: anns,
            owner_references: Some(vec![parent.controller_owner_ref(&()).unwrap()]),
            ..Default::default()
        },
        spec: named_task.task.clone(),
        status: None,
    };

    let api: Api<Task> = Api::namespaced(client, namespace);
    match api.create(&Default::default(), &task).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn ensure_stage_slots(status: &mut WorkflowRunStatus, len: usize) {
    if status.stages.len() < len {
        status.stages.resize(len, StageStatus::default());
    }
}

pub async fn init(client: Client, instance: &WorkflowRun, total_tasks: u32, stage_count: usize) -> Result<(), Error> {
    patch_status::<WorkflowRunStatus, WorkflowRun>(client, instance, |status: &mut WorkflowRunStatus| {
        status.phase = WorkflowRunPhase::Running;
        status.current_stage = -1;
        status.total_tasks = total_tasks;
        status.completed_tasks = 0;
        status.failed_tasks = 0;
        status.stages = vec![StageStatus::default(); stage_count];
        util::conditions::set_condition(&mut status.conditions, "Ready", false, "Initialized", "WorkflowRun initialized");
    })
    .await?;
    Ok(())
}

pub async fn advance_or_finish(
    client: Client,
    instance: &WorkflowRun,
    completed_stage: usize,
    total_stages: usize,
    completed_tasks: u32,
    failed_tasks: u32,
) -> Result<(), Error> {
    patch_status::<WorkflowRunStatus, WorkflowRun>(client, instance, |status: &mut WorkflowRunStatus| {
        status.completed_tasks = completed_tasks;
        status.failed_tasks = failed_tasks;
        if let Some(s) = status.stages.get_mut(completed_stage) {
            s.phase = StagePhase::Completed;
            s.completion_time = Some(Time(k8s_openapi::jiff::Timestamp::now()));
        }
        if completed_stage + 1 < total_stages {
            status.current_stage = (completed_stage + 1) as i32;
        } else {
            status.phase = WorkflowRunPhase::Completed;
            util::conditions::set_condition(
                &mut status.conditions,
                "Ready",
                true,
                "Completed",
                "all stages completed",
            );
        }
    })
    .await?;
    Ok(())
}

pub async fn fail(
    client: Client,
    instance: &WorkflowRun,
    failed_stage: usize,
    completed_tasks: u32,
    failed_tasks: u32,
) -> Result<(), Error> {
    patch_status::<WorkflowRunStatus, WorkflowRun>(client, instance, |status: &mut WorkflowRunStatus| {
        status.phase = WorkflowRunPhase::Failed;
        status.completed_tasks = completed_tasks;
        status.failed_tasks = failed_tasks;
        if let Some(s) = status.stages.get_mut(failed_stage) {
            s.phase = StagePhase::Failed;
            s.completion_time = Some(Time(k8s_openapi::jiff::Timestamp::now()));
        }
        util::conditions::set_condition(
            &mut status.conditions,
            "Ready",
            false,
            "StageFailed",
            &format!("stage {failed_stage} had a failed Task"),
        );
    })
    .await?;
    Ok(())
}

pub async fn missing_workflow(client: Client, instance: &WorkflowRun) -> Result<(), Error> {
    patch_status::<WorkflowRunStatus, WorkflowRun>(client, instance, |status: &mut WorkflowRunStatus| {
        status.phase = WorkflowRunPhase::Failed;
        util::conditions::set_condition(
            &mut status.conditions,
            "Ready",
            false,
            "MissingWorkflow",
            "neither inline nor workflowRef resolved to a Workflow",
        );
    })
    .await?;
    Ok(())
}
