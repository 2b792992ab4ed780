use std::{collections::HashMap, sync::Arc, time::Instant};

use futures::stream::StreamExt;
use kube::{
    Api, ResourceExt,
    client::Client,
    runtime::{Controller, controller::Action},
};
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use owo_colors::OwoColorize;
use tokio::{sync::Mutex, time::Duration};
use tokio_util::sync::CancellationToken;

use k8s_openapi::api::core::v1::Pod;
use kubetask_types::{Task, TaskPhase};

use super::{actions, planner};
use crate::util::{
    Error, PROBE_INTERVAL,
    colors::{FG1, FG2},
};

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

pub async fn run(client: Client) -> Result<(), Error> {
    println!("{}", "⚙️ Starting Task controller...".green());

    let context: Arc<ContextData> = Arc::new(ContextData::new(client.clone()));

    let lease_namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string());
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("kubetask-task-controller-{}", uuid::Uuid::new_v4()));
    let lease_name = "kubetask-task-controller-lock".to_string();
    let lease_ttl = Duration::from_secs(15);
    let renew_every = Duration::from_secs(5);
    let leadership = LeaseLock::new(
        client.clone(),
        &lease_namespace,
        LeaseLockParams {
            holder_id,
            lease_name,
            lease_ttl,
        },
    );

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        kubetask_common::shutdown::shutdown_signal().await;
        shutdown_signal.cancel();
    });
    kubetask_common::signal_ready();
    println!("{}", "🌱 Starting Task controller...".green());

    let mut controller_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut tick = tokio::time::interval(renew_every);
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
                    eprintln!("aborted controller due to leader election error");
                }
                continue;
            }
        };
        if matches!(lease, LeaseLockResult::Acquired(_)) {
            if controller_task.is_none() {
                println!("{}", "👑 Acquired leadership; starting Task controller".green());
                let client_for_controller = client.clone();
                let context_for_controller = context.clone();
                let crd_api_for_controller: Api<Task> = Api::all(client_for_controller.clone());
                controller_task = Some(tokio::spawn(async move {
                    println!("{}", "🚀 Task controller started.".green());
                    Controller::new(crd_api_for_controller, Default::default())
                        .owns(Api::<Pod>::all(client_for_controller), Default::default())
                        .run(reconcile, on_error, context_for_controller)
                        .for_each(|_res| async move {})
                        .await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            eprintln!("lost leadership; stopping Task controller");
            task.abort();
        }
    }
}

struct ContextData {
    client: Client,

    #[cfg(feature = "metrics")]
    metrics: ControllerMetrics,

    last_action: Mutex<HashMap<(String, String), (TaskAction, Instant)>>,
}

impl ContextData {
    fn new(client: Client) -> Self {
        #[cfg(feature = "metrics")]
        {
            ContextData {
                client,
                metrics: ControllerMetrics::new("tasks"),
                last_action: Mutex::new(HashMap::new()),
            }
        }
        #[cfg(not(feature = "metrics"))]
        {
            ContextData {
                client,
                last_action: Mutex::new(HashMap::new()),
            }
        }
    }
}

/// Action to be taken upon a `Task` resource during reconciliation, per the
/// phase machine in spec §4.4.
#[derive(Debug, PartialEq, Clone)]
enum TaskAction {
    /// Admission was granted; resolve contexts, build and create the Pod.
    Admit {
        effective_spec: Box<kubetask_types::TaskSpec>,
        agent: Box<kubetask_types::Agent>,
        agent_namespace: String,
    },
    /// Admission denied; park in `Queued` with a reason and requeue shortly.
    Queued { reason: &'static str },
    /// Pod finished; derive the terminal phase and parse outputs.
    Complete {
        outcome: planner::PodOutcome,
        outputs: std::collections::BTreeMap<String, serde_json::Value>,
    },
    /// User requested a stop; delete the Pod and mark Completed/Stopped.
    Stop,
    /// Deletion in progress with the cleanup finalizer present.
    CleanupFinalizer,
    Error(String),
    NoOp,
    Requeue(Duration),
}

impl TaskAction {
    fn to_str(&self) -> &str {
        match self {
            TaskAction::Admit { .. } => "Admit",
            TaskAction::Queued { .. } => "Queued",
            TaskAction::Complete { .. } => "Complete",
            TaskAction::Stop => "Stop",
            TaskAction::CleanupFinalizer => "CleanupFinalizer",
            TaskAction::Error(_) => "Error",
            TaskAction::NoOp => "NoOp",
            TaskAction::Requeue(_) => "Requeue",
        }
    }
}

async fn reconcile(instance: Arc<Task>, context: Arc<ContextData>) -> Result<Action, Error> {
    let client: Client = context.client.clone();

    let namespace = match instance.namespace() {
        None => {
            return Err(Error::UserInput(
                "Expected Task resource to be namespaced.".to_owned(),
            ));
        }
        Some(namespace) => namespace,
    };
    let name = instance.name_any();

    #[cfg(feature = "metrics")]
    context
        .metrics
        .reconcile_counter
        .with_label_values(&[&name, &namespace])
        .inc();

    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    let action = determine_action(client.clone(), &namespace, &instance).await?;

    if action != TaskAction::NoOp {
        let value = {
            let mut la = context.last_action.lock().await;
            la.insert(
                (namespace.clone(), name.clone()),
                (action.clone(), Instant::now()),
            )
        };
        if let Some((last_action, last_instant)) = value
            && (Some(&action) != Some(&last_action) || last_instant.elapsed() > Duration::from_secs(300))
        {
            println!(
                "🔧 {}{}{}{}{}",
                namespace.color(FG2),
                "/".color(FG1),
                name.color(FG2),
                " ACTION: ".color(FG1),
                action.to_str().color(FG2),
            );
        }
    }

    #[cfg(feature = "metrics")]
    context
        .metrics
        .read_histogram
        .with_label_values(&[&name, &namespace, action.to_str()])
        .observe(start.elapsed().as_secs_f64());

    #[cfg(feature = "metrics")]
    context
        .metrics
        .action_counter
        .with_label_values(&[&name, &namespace, action.to_str()])
        .inc();

    #[cfg(feature = "metrics")]
    let timer = match action {
        TaskAction::NoOp => None,
        _ => Some(
            context
                .metrics
                .write_histogram
                .with_label_values(&[&name, &namespace, action.to_str()])
                .start_timer(),
        ),
    };

    let result = match action {
        TaskAction::Requeue(duration) => Action::requeue(duration),
        TaskAction::Queued { reason } => {
            actions::transition_queued(client, &instance, reason).await?;
            Action::requeue(Duration::from_secs(10))
        }
        TaskAction::Admit {
            effective_spec,
            agent,
            agent_namespace,
        } => {
            match actions::admit_and_run(client.clone(), &instance, &effective_spec, &agent, &agent_namespace)
                .await
            {
                Ok(()) => Action::await_change(),
                // Context resolution failures (mount conflicts, missing ConfigMaps,
                // git contexts without a mountPath) are user-caused and terminal
                // per spec §7's ConfigError row: fail the Task, don't loop on it.
                Err(e) if e.is_config() => {
                    actions::error(client, &instance, e.to_string()).await?;
                    Action::requeue(Duration::from_secs(30))
                }
                Err(e) => return Err(e),
            }
        }
        TaskAction::Complete { outcome, outputs } => {
            actions::complete_from_pod(client, &instance, outcome, outputs).await?;
            Action::await_change()
        }
        TaskAction::Stop => {
            actions::stop_task(client, &instance).await?;
            Action::await_change()
        }
        TaskAction::CleanupFinalizer => {
            actions::cleanup_cross_namespace(client, &instance).await?;
            Action::await_change()
        }
        TaskAction::Error(message) => {
            actions::error(client, &instance, message).await?;
            Action::requeue(Duration::from_secs(30))
        }
        TaskAction::NoOp => Action::requeue(PROBE_INTERVAL),
    };

    #[cfg(feature = "metrics")]
    if let Some(timer) = timer {
        timer.observe_duration();
    }

    Ok(result)
}

async fn determine_action(client: Client, namespace: &str, instance: &Task) -> Result<TaskAction, Error> {
    if instance.metadata.deletion_timestamp.is_some() {
        return Ok(if instance.finalizers().contains(&kubetask_common::annotations::TASK_CLEANUP_FINALIZER.to_string()) {
            TaskAction::CleanupFinalizer
        } else {
            TaskAction::NoOp
        });
    }

    let phase = instance.status.as_ref().map(|s| s.phase).unwrap_or_default();

    if phase.is_terminal() {
        return Ok(TaskAction::NoOp);
    }

    if phase == TaskPhase::Running && planner::stop_requested(instance.annotations()) {
        return Ok(TaskAction::Stop);
    }

    match phase {
        TaskPhase::Pending | TaskPhase::Queued => determine_admission_action(client, namespace, instance).await,
        TaskPhase::Running => determine_running_action(client, instance).await,
        TaskPhase::Completed | TaskPhase::Failed => Ok(TaskAction::NoOp),
    }
}

async fn determine_admission_action(
    client: Client,
    namespace: &str,
    instance: &Task,
) -> Result<TaskAction, Error> {
    let template = match &instance.spec.task_template_ref {
        Some(r) => match actions::fetch_task_template(client.clone(), namespace, &r.name).await? {
            Some(t) => Some(t.spec),
            None => {
                return Ok(TaskAction::Error(format!(
                    "referenced TaskTemplate '{}' not found",
                    r.name
                )));
            }
        },
        None => None,
    };
    let effective_spec = planner::merge_task_template(&instance.spec, template.as_ref());

    let (agent_name, agent_namespace) =
        planner::resolve_agent_ref(effective_spec.agent_ref.as_ref(), namespace);
    let agent_ref = kubetask_types::AgentRef {
        name: agent_name.clone(),
        namespace: Some(agent_namespace.clone()),
    };
    let agent = match actions::fetch_agent(client.clone(), &agent_ref, namespace).await? {
        Some(a) => a,
        None => {
            return Ok(TaskAction::Error(format!(
                "Agent '{agent_name}' not found in namespace '{agent_namespace}'"
            )));
        }
    };

    let cross_namespace = planner::is_cross_namespace(namespace, &agent_namespace);
    if cross_namespace && !planner::namespace_allowed(&agent.spec.allowed_namespaces, namespace) {
        return Ok(TaskAction::Error(format!(
            "namespace '{namespace}' is not permitted to reference Agent '{agent_name}' in '{agent_namespace}'"
        )));
    }

    actions::label_for_agent(client.clone(), instance, &agent_name).await?;

    let running_count =
        actions::count_running_for_agent(client.clone(), &agent_namespace, &agent_name).await?;
    let retained = planner::retained_start_count(
        &agent.status.as_ref().map(|s| s.start_history.clone()).unwrap_or_default(),
        agent.spec.quota.map(|q| q.window_seconds).unwrap_or(0),
        k8s_openapi::jiff::Timestamp::now(),
    );

    match planner::check_admission(agent.spec.max_concurrent, running_count, agent.spec.quota, retained) {
        planner::Admission::Admit => Ok(TaskAction::Admit {
            effective_spec: Box::new(effective_spec),
            agent: Box::new(agent),
            agent_namespace,
        }),
        planner::Admission::Queued { reason } => Ok(TaskAction::Queued { reason }),
    }
}

async fn determine_running_action(client: Client, instance: &Task) -> Result<TaskAction, Error> {
    let Some(status) = &instance.status else {
        return Ok(TaskAction::Error("Task is Running with no status".to_string()));
    };
    let (Some(pod_name), Some(pod_namespace)) = (&status.pod_name, &status.pod_namespace) else {
        return Ok(TaskAction::Error(
            "Task is Running but has no recorded Pod identity".to_string(),
        ));
    };

    let pods: Api<Pod> = Api::namespaced(client, pod_namespace);
    let pod = match pods.get(pod_name).await {
        Ok(pod) => pod,
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            return Ok(TaskAction::Error(format!("Pod '{pod_name}' disappeared while Running")));
        }
        Err(e) => return Err(e.into()),
    };

    match planner::derive_pod_outcome(&pod) {
        planner::PodOutcome::StillRunning => Ok(TaskAction::NoOp),
        outcome => Ok(TaskAction::Complete {
            outcome,
            outputs: planner::parse_output_parameters(&pod),
        }),
    }
}

fn on_error(instance: Arc<Task>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!("{}", format!("Task reconciliation error: {:?} {:?}", error, instance.name_any()).red());
    Action::requeue(Duration::from_secs(5))
}
