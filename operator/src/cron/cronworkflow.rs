use std::sync::Arc;

use chrono::Utc;
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

use kubetask_types::{CronWorkflow, WorkflowRunSpec};

use super::{actions, planner, schedule};
use crate::util::{
    Error,
    colors::{FG1, FG2},
};

pub async fn run(client: Client) -> Result<(), Error> {
    println!("{}", "⚙️ Starting CronWorkflow controller...".green());

    let lease_namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string());
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("kubetask-cronworkflow-controller-{}", uuid::Uuid::new_v4()));
    let leadership = LeaseLock::new(
        client.clone(),
        &lease_namespace,
        LeaseLockParams {
            holder_id,
            lease_name: "kubetask-cronworkflow-controller-lock".to_string(),
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
                println!("{}", "👑 Acquired leadership; starting CronWorkflow controller".green());
                let client_for_controller = client.clone();
                let crd_api: Api<CronWorkflow> = Api::all(client_for_controller.clone());
                controller_task = Some(tokio::spawn(async move {
                    Controller::new(crd_api, Default::default())
                        .run(reconcile, on_error, Arc::new(client_for_controller))
                        .for_each(|_res| async move {})
                        .await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            eprintln!("lost leadership; stopping CronWorkflow controller");
            task.abort();
        }
    }
}

async fn reconcile(instance: Arc<CronWorkflow>, client: Arc<Client>) -> Result<Action, Error> {
    let client = (*client).clone();
    let namespace = instance
        .namespace()
        .ok_or_else(|| Error::UserInput("CronWorkflow resource must be namespaced".to_string()))?;
    let name = instance.name_any();

    let children = actions::list_workflow_run_children(client.clone(), &namespace, &name).await?;
    let status = instance.status.clone().unwrap_or_default();
    let creation_time = instance
        .meta()
        .creation_timestamp
        .as_ref()
        .and_then(|t| chrono::DateTime::from_timestamp(t.0.as_second(), 0))
        .unwrap_or_else(Utc::now);
    let last_schedule_time = status
        .last_schedule_time
        .as_ref()
        .and_then(|t| chrono::DateTime::from_timestamp(t.0.as_second(), 0));

    let cron_plan = planner::plan(
        &instance.spec.schedule,
        instance.spec.suspend,
        instance.spec.concurrency_policy(),
        instance.spec.successful_history_limit(),
        instance.spec.failed_history_limit(),
        &children,
        last_schedule_time,
        creation_time,
        Utc::now(),
    );

    if !cron_plan.trim_deletes.is_empty() {
        actions::delete_workflow_run_children(client.clone(), &namespace, &cron_plan.trim_deletes).await?;
    }

    if cron_plan.missed_run_capped {
        actions::report_missed_schedule_cronworkflow(client.clone(), &instance).await?;
    }

    let result = match cron_plan.outcome {
        planner::CronOutcome::Suspended => Action::requeue(Duration::from_secs(60)),
        planner::CronOutcome::InvalidSchedule(message) => {
            actions::report_invalid_cronworkflow_schedule(client, &instance, message).await?;
            Action::requeue(Duration::from_secs(60))
        }
        planner::CronOutcome::Skip { requeue_after } => {
            actions::patch_cronworkflow_status(client, &instance, cron_plan.active_names, None).await?;
            Action::requeue(requeue_after)
        }
        planner::CronOutcome::Idle { requeue_after } => {
            actions::patch_cronworkflow_status(client, &instance, cron_plan.active_names, None).await?;
            Action::requeue(requeue_after)
        }
        planner::CronOutcome::Create {
            scheduled_at,
            pre_delete,
            requeue_after,
        } => {
            if !pre_delete.is_empty() {
                actions::delete_workflow_run_children(client.clone(), &namespace, &pre_delete).await?;
            }
            println!(
                "⏰ {}{}{}{}",
                namespace.color(FG2),
                "/".color(FG1),
                name.color(FG2),
                " scheduling WorkflowRun".color(FG1),
            );
            let child_name = schedule::child_name(&name, scheduled_at);
            let run_spec = WorkflowRunSpec {
                workflow_ref: instance.spec.workflow_ref.clone(),
                inline: instance.spec.inline.clone(),
            };
            actions::create_workflow_run_child(client.clone(), &instance, child_name.clone(), scheduled_at, run_spec)
                .await?;
            let mut active = cron_plan
                .active_names
                .into_iter()
                .filter(|n| !pre_delete.contains(n))
                .collect::<Vec<_>>();
            active.push(child_name);
            actions::patch_cronworkflow_status(client, &instance, active, Some(scheduled_at)).await?;
            Action::requeue(requeue_after)
        }
    };

    Ok(result)
}

fn on_error(instance: Arc<CronWorkflow>, error: &Error, _client: Arc<Client>) -> Action {
    eprintln!(
        "{}",
        format!("CronWorkflow reconciliation error: {:?} {:?}", error, instance.name_any()).red()
    );
    Action::requeue(Duration::from_secs(15))
}
