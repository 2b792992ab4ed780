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

use k8s_openapi::api::{apps::v1::Deployment, core::v1::Service};
use kubetask_types::Agent;

use super::{actions, planner};
use crate::util::{
    Error, PROBE_INTERVAL,
    colors::{FG1, FG2},
};

pub async fn run(client: Client) -> Result<(), Error> {
    println!("{}", "⚙️ Starting Agent server controller...".green());

    let lease_namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string());
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("kubetask-agent-controller-{}", uuid::Uuid::new_v4()));
    let leadership = LeaseLock::new(
        client.clone(),
        &lease_namespace,
        LeaseLockParams {
            holder_id,
            lease_name: "kubetask-agent-controller-lock".to_string(),
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
                println!("{}", "👑 Acquired leadership; starting Agent server controller".green());
                let client_for_controller = client.clone();
                let crd_api: Api<Agent> = Api::all(client_for_controller.clone());
                controller_task = Some(tokio::spawn(async move {
                    Controller::new(crd_api, Default::default())
                        .owns(Api::<Deployment>::all(client_for_controller.clone()), Default::default())
                        .owns(Api::<Service>::all(client_for_controller.clone()), Default::default())
                        .run(reconcile, on_error, Arc::new(client_for_controller))
                        .for_each(|_res| async move {})
                        .await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            eprintln!("lost leadership; stopping Agent server controller");
            task.abort();
        }
    }
}

async fn reconcile(instance: Arc<Agent>, client: Arc<Client>) -> Result<Action, Error> {
    let client = (*client).clone();
    let namespace = instance
        .namespace()
        .ok_or_else(|| Error::UserInput("Agent resource must be namespaced".to_string()))?;
    let name = instance.name_any();

    let desired_port = instance.spec.server_config.map(|c| c.port);
    let resources_exist = instance.status.as_ref().and_then(|s| s.server.as_ref()).is_some()
        || actions::fetch_deployment(client.clone(), &namespace, &super::server_builder::server_deployment_name(&name))
            .await?
            .is_some();

    let action = planner::determine_server_action(desired_port, resources_exist);

    let result = match action {
        planner::ServerAction::Converge { port } => {
            println!(
                "🛰️ {}{}{}{}",
                namespace.color(FG2),
                "/".color(FG1),
                name.color(FG2),
                " converging server deployment".color(FG1),
            );
            actions::converge(client, &instance, port).await?;
            Action::requeue(Duration::from_secs(30))
        }
        planner::ServerAction::Teardown => {
            println!(
                "🧹 {}{}{}{}",
                namespace.color(FG2),
                "/".color(FG1),
                name.color(FG2),
                " tearing down server deployment".color(FG1),
            );
            actions::teardown(client, &instance).await?;
            Action::await_change()
        }
        planner::ServerAction::NoOp => Action::requeue(PROBE_INTERVAL),
    };

    Ok(result)
}

fn on_error(instance: Arc<Agent>, error: &Error, _client: Arc<Client>) -> Action {
    eprintln!("{}", format!("Agent reconciliation error: {:?} {:?}", error, instance.name_any()).red());
    Action::requeue(Duration::from_secs(10))
}
