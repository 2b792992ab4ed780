use std::sync::Arc;

use futures::stream::StreamExt;
use kube::{
    Api, ResourceExt,
    client::Client,
    runtime::{Controller, controller::Action},
};
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use owo_colors::OwoColorize;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use kubetask_types::{Task, WorkflowRun};

use super::{actions, planner};
use crate::util::{
    Error, PROBE_INTERVAL,
    colors::{FG1, FG2},
};

pub async fn run(client: Client) -> Result<(), Error> {
    println!("{}", "⚙️ Starting WorkflowRun controller...".green());

    let lease_namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string());
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("kubetask-workflowrun-controller-{}", uuid::Uuid::new_v4()));
    let leadership = LeaseLock::new(
        client.clone(),
        &lease_namespace,
        LeaseLockParams {
            holder_id,
            lease_name: "kubetask-workflowrun-controller-lock".to_string(),
            lease_ttl: Duration::from_secs(15),
        },
    );

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        kubetask_common::shutdown::shutdown_signal().await;
        shutdown_signal.cancel();
    });

    let mut controller_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut tick = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(task) = controller_task.take() {
                    task.abort();
                    task.await.ok();
                }
                break Ok(())
            },
            _ = tick.tick() => {}
        }
        let lease = match leadership.try_acquire_or_renew().await {
            Ok(l) => l,
            Err(e) => {
                eprintln!("leader election renew/acquire failed: {e}");
                if let Some(task) = controller_task.take() {
                    task.abort();
                }
                continue;
            }
        };
        if matches!(lease, LeaseLockResult::Acquired(_)) {
            if controller_task.is_none() {
                println!("{}", "👑 Acquired leadership; starting WorkflowRun controller".green());
                let client_for_controller = client.clone();
                let crd_api: Api<WorkflowRun> = Api::all(client_for_controller.clone());
                controller_task = Some(tokio::spawn(async move {
                    Controller::new(crd_api, Default::default())
                        .owns(Api::<Task>::all(client_for_controller.clone()), Default::default())
                        .run(reconcile, on_error, Arc::new(client_for_controller))
                        .for_each(|_res| async move {})
                        .await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            eprintln!("lost leadership; stopping WorkflowRun controller");
            task.abort();
        }
    }
}

async fn reconcile(instance: Arc<WorkflowRun>, client: Arc<Client>) -> Result<Action, Error> {
    let client = (*client).clone();
    let namespace = instance
        .namespace()
        .ok_or_else(|| Error::UserInput("WorkflowRun resource must be namespaced".to_string()))?;
    let name = instance.name_any();

    if instance.status.as_ref().map(|s| s.phase.is_terminal()).unwrap_or(false) {
        return Ok(Action::requeue(PROBE_INTERVAL));
    }

    let referenced = match &instance.spec.workflow_ref {
        Some(r) => actions::fetch_workflow(client.clone(), &namespace, &r.name).await?,
        None => None,
    };
    let workflow_name = instance.spec.workflow_ref.as_ref().map(|r| r.name.as_str());
    let workflow = planner::resolve_workflow_spec(instance.spec.inline.as_ref(), referenced.as_ref().map(|w| &w.spec));

    let status = instance.status.clone().unwrap_or_default();
    let current_stage_phases = if status.current_stage >= 0 {
        actions::list_stage_task_phases(client.clone(), &namespace, &name, status.current_stage as usize).await?
    } else {
        Vec::new()
    };

    let action = planner::determine_run_action(workflow, &status, &current_stage_phases);

    println!(
        "🧩 {}{}{}{}{}",
        namespace.color(FG2),
        "/".color(FG1),
        name.color(FG2),
        " STAGE-ACTION: ".color(FG1),
        format!("{action:?}").color(FG2),
    );

    let result = match action {
        planner::RunAction::MissingWorkflow => {
            actions::missing_workflow(client, &instance).await?;
            Action::requeue(Duration::from_secs(60))
        }
        planner::RunAction::Init { total_tasks } => {
            let stage_count = workflow.map(|w| w.stages.len()).unwrap_or(0);
            actions::init(client, &instance, total_tasks, stage_count).await?;
            Action::requeue(Duration::from_secs(1))
        }
        planner::RunAction::StartStage { index } => {
            let workflow = workflow.expect("StartStage implies a resolved workflow");
            actions::start_stage_tasks(client, &instance, workflow_name, &workflow.stages, index).await?;
            Action::await_change()
        }
        planner::RunAction::Wait => Action::requeue(Duration::from_secs(5)),
        planner::RunAction::AdvanceOrFinish { completed_stage } => {
            let workflow = workflow.expect("AdvanceOrFinish implies a resolved workflow");
            let per_stage = collect_all_stage_classifications(client.clone(), &namespace, &name, workflow).await?;
            let (completed_tasks, failed_tasks) = planner::recount_totals(&per_stage);
            actions::advance_or_finish(client, &instance, completed_stage, workflow.stages.len(), completed_tasks, failed_tasks)
                .await?;
            Action::await_change()
        }
        planner::RunAction::Fail { failed_stage } => {
            let workflow = workflow.expect("Fail implies a resolved workflow");
            let per_stage = collect_all_stage_classifications(client.clone(), &namespace, &name, workflow).await?;
            let (completed_tasks, failed_tasks) = planner::recount_totals(&per_stage);
            actions::fail(client, &instance, failed_stage, completed_tasks, failed_tasks).await?;
            Action::await_change()
        }
        planner::RunAction::NoOp => Action::requeue(PROBE_INTERVAL),
    };

    Ok(result)
}

/// Recounts every completed/known stage's Tasks from the live cluster state,
/// used once a stage finishes to refresh the run-wide totals (spec §4.5).
async fn collect_all_stage_classifications(
    client: Client,
    namespace: &str,
    run_name: &str,
    workflow: &kubetask_types::WorkflowSpec,
) -> Result<Vec<planner::StageClassification>, Error> {
    let mut out = Vec::with_capacity(workflow.stages.len());
    for (i, stage) in workflow.stages.iter().enumerate() {
        let phases = actions::list_stage_task_phases(client.clone(), namespace, run_name, i).await?;
        out.push(planner::classify_stage_tasks(stage, &phases));
    }
    Ok(out)
}

fn on_error(instance: Arc<WorkflowRun>, error: &Error, _client: Arc<Client>) -> Action {
    eprintln!(
        "{}",
        format!("WorkflowRun reconciliation error: {:?} {:?}", error, instance.name_any()).red()
    );
    Action::requeue(Duration::from_secs(5))
}
