use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{ObjectMeta, Resource};
use kube::{Api, Client, ResourceExt};

use kubetask_common::annotations;
use kubetask_types::{Agent, AgentRef, Task, TaskPhase, TaskStatus, TaskTemplate};

use crate::context_resolver;
use crate::pod_builder::{self, PodAgentConfig, PodBuildInput};
use crate::util::{self, Error, patch::patch_status};

use super::planner;

fn instance_name(instance: &Task) -> Result<&str, Error> {
    instance
        .meta()
        .name
        .as_deref()
        .ok_or_else(|| Error::UserInput("Task is missing metadata.name".to_string()))
}

fn instance_namespace(instance: &Task) -> Result<&str, Error> {
    instance
        .meta()
        .namespace
        .as_deref()
        .ok_or_else(|| Error::UserInput("Task is missing metadata.namespace".to_string()))
}

pub async fn fetch_task_template(
    client: Client,
    namespace: &str,
    name: &str,
) -> Result<Option<TaskTemplate>, Error> {
    let api: Api<TaskTemplate> = Api::namespaced(client, namespace);
    match api.get(name).await {
        Ok(t) => Ok(Some(t)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub async fn fetch_agent(
    client: Client,
    agent_ref: &AgentRef,
    task_namespace: &str,
) -> Result<Option<Agent>, Error> {
    let (_, agent_namespace) = planner::resolve_agent_ref(Some(agent_ref), task_namespace);
    let api: Api<Agent> = Api::namespaced(client, &agent_namespace);
    match api.get(&agent_ref.name).await {
        Ok(a) => Ok(Some(a)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Counts `Running` Tasks in the Pod namespace (the Agent's own namespace)
/// carrying the `kubetask.io/agent` label for this Agent. Capacity
/// bookkeeping is authoritative only at the Agent's namespace per spec §4.4;
/// Tasks targeting a cross-namespace Agent from elsewhere are a tolerated
/// approximation since the reconcile loop converges on repeated listing.
pub async fn count_running_for_agent(
    client: Client,
    agent_namespace: &str,
    agent_label_value: &str,
) -> Result<u32, Error> {
    let api: Api<Task> = Api::namespaced(client, agent_namespace);
    let list = api
        .list(&kube::api::ListParams::default().labels(&format!(
            "{}={}",
            annotations::AGENT,
            agent_label_value
        )))
        .await?;
    Ok(list
        .items
        .iter()
        .filter(|t| {
            t.status
                .as_ref()
                .map(|s| s.phase == TaskPhase::Running)
                .unwrap_or(false)
        })
        .count() as u32)
}

/// Sets the `kubetask.io/agent` label used to scope sibling-Task counts for
/// `maxConcurrent`/quota admission, performed once at `∅ → ·` before the
/// admission check per spec §4.4. A no-op if already set to this value.
pub async fn label_for_agent(client: Client, instance: &Task, agent_label_value: &str) -> Result<(), Error> {
    if instance.labels().get(annotations::AGENT).map(String::as_str) == Some(agent_label_value) {
        return Ok(());
    }
    let api: Api<Task> = Api::namespaced(client, instance_namespace(instance)?);
    let patch = serde_json::json!({
        "metadata": { "labels": { annotations::AGENT: agent_label_value } }
    });
    api.patch(
        instance_name(instance)?,
        &kube::api::PatchParams::default(),
        &kube::api::Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

pub async fn transition_queued(client: Client, instance: &Task, reason: &str) -> Result<(), Error> {
    patch_status::<TaskStatus, Task>(client, instance, |status: &mut TaskStatus| {
        status.phase = TaskPhase::Queued;
        util::conditions::set_condition(
            &mut status.conditions,
            "Admitted",
            false,
            reason,
            "Task is waiting for capacity or quota to free up",
        );
    })
    .await?;
    Ok(())
}

pub async fn admit_and_run(
    client: Client,
    instance: &Task,
    effective_spec: &kubetask_types::TaskSpec,
    agent: &Agent,
    agent_namespace: &str,
) -> Result<(), Error> {
    let name = instance_name(instance)?.to_string();
    let task_namespace = instance_namespace(instance)?.to_string();
    let cross_namespace = planner::is_cross_namespace(&task_namespace, agent_namespace);
    // The Pod runs under the Agent's serviceAccountName, which only resolves in the
    // Agent's own namespace, so cross-namespace Tasks place their Pod and context
    // ConfigMap there instead of in the Task's namespace.
    let pod_namespace = agent_namespace.to_string();

    let mut contexts = agent.spec.contexts.clone();
    contexts.extend(effective_spec.contexts.clone());

    let data =
        context_resolver::fetch_context_data(client.clone(), &task_namespace, &contexts).await?;
    let resolved = context_resolver::resolve(
        effective_spec.description.as_deref().unwrap_or(""),
        &task_namespace,
        &agent.spec.workspace_dir,
        &contexts,
        &data,
    )?;

    let cm_name = planner::context_configmap_name_for(&name);
    create_context_configmap(
        client.clone(),
        &pod_namespace,
        &cm_name,
        if cross_namespace { None } else { Some(instance) },
        &resolved,
    )
    .await?;

    let pod_name = planner::pod_name_for(&name);
    let agent_config = PodAgentConfig {
        worker_image: agent.spec.worker_image.clone(),
        init_image: agent.spec.init_image.clone(),
        attach_image: agent.spec.attach_image.clone(),
        command: agent.spec.command.clone(),
        workspace_dir: agent.spec.workspace_dir.clone(),
        service_account: agent.spec.service_account.clone(),
        node_selector: agent.spec.node_selector.clone(),
        tolerations: agent.spec.tolerations.clone(),
        affinity: agent.spec.affinity.clone(),
        runtime_class_name: agent.spec.runtime_class_name.clone(),
        resources: agent.spec.resources.clone(),
        pod_labels: agent.spec.pod_labels.clone().unwrap_or_default(),
        credentials: agent.spec.credentials.clone(),
        agent_config_mount_path: None,
    };

    let owner_ref = if cross_namespace {
        None
    } else {
        Some(instance.controller_owner_ref(&()).unwrap())
    };

    if cross_namespace {
        add_cleanup_finalizer(client.clone(), instance).await?;
    }

    let server_url = agent
        .status
        .as_ref()
        .and_then(|s| s.server.as_ref())
        .and_then(|s| s.url.clone());

    let pod = pod_builder::build_pod(PodBuildInput {
        pod_name: pod_name.clone(),
        pod_namespace: pod_namespace.clone(),
        agent_config: &agent_config,
        context_config_map_name: Some(cm_name),
        files: &resolved.files,
        dirs: &resolved.dirs,
        gits: &resolved.gits,
        server_url,
        owner_ref,
        spec_hash: util::hash_spec(&instance.spec),
    })?;

    let pods: Api<Pod> = Api::namespaced(client.clone(), &pod_namespace);
    match pods.create(&Default::default(), &pod).await {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 409 => {}
        Err(e) => return Err(e.into()),
    }

    append_agent_start_history(client.clone(), agent).await?;

    patch_status::<TaskStatus, Task>(client, instance, |status: &mut TaskStatus| {
        status.phase = TaskPhase::Running;
        status.pod_name = Some(pod_name.clone());
        status.pod_namespace = Some(pod_namespace.clone());
        status.start_time = Some(Time(k8s_openapi::jiff::Timestamp::now()));
        util::conditions::set_condition(
            &mut status.conditions,
            "Admitted",
            true,
            "Running",
            "Task's Pod has been created",
        );
    })
    .await?;
    Ok(())
}

async fn create_context_configmap(
    client: Client,
    namespace: &str,
    name: &str,
    owner: Option<&Task>,
    resolved: &context_resolver::ResolvedContext,
) -> Result<(), Error> {
    let mut data = BTreeMap::new();
    for file in &resolved.files {
        data.insert(context_resolver::sanitize_key(&file.path), file.content.clone());
    }
    let cm = ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references: owner.map(|o| vec![o.controller_owner_ref(&()).unwrap()]),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    };
    let api: Api<ConfigMap> = Api::namespaced(client, namespace);
    match api.create(&Default::default(), &cm).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn append_agent_start_history(client: Client, agent: &Agent) -> Result<(), Error> {
    patch_status::<kubetask_types::AgentStatus, Agent>(client, agent, |status| {
        status.start_history.push(Time(k8s_openapi::jiff::Timestamp::now()));
    })
    .await?;
    Ok(())
}

pub async fn complete_from_pod(
    client: Client,
    instance: &Task,
    outcome: planner::PodOutcome,
    outputs: BTreeMap<String, serde_json::Value>,
) -> Result<(), Error> {
    patch_status::<TaskStatus, Task>(client, instance, |status: &mut TaskStatus| {
        status.phase = match outcome {
            planner::PodOutcome::Completed => TaskPhase::Completed,
            planner::PodOutcome::Failed => TaskPhase::Failed,
            planner::PodOutcome::StillRunning => return,
        };
        status.completion_time = Some(Time(k8s_openapi::jiff::Timestamp::now()));
        status.outputs = outputs.clone();
        let ready = matches!(status.phase, TaskPhase::Completed);
        util::conditions::set_condition(
            &mut status.conditions,
            "Ready",
            ready,
            if ready { "Completed" } else { "Failed" },
            if ready {
                "Task completed successfully"
            } else {
                "Task's Pod failed"
            },
        );
    })
    .await?;
    Ok(())
}

pub async fn stop_task(client: Client, instance: &Task) -> Result<(), Error> {
    if let Some(pod_name) = instance.status.as_ref().and_then(|s| s.pod_name.clone()) {
        let namespace = instance
            .status
            .as_ref()
            .and_then(|s| s.pod_namespace.clone())
            .unwrap_or_else(|| instance_namespace(instance).unwrap_or_default().to_string());
        let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
        match pods.delete(&pod_name, &Default::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    }
    patch_status::<TaskStatus, Task>(client, instance, |status: &mut TaskStatus| {
        status.phase = TaskPhase::Completed;
        status.completion_time = Some(Time(k8s_openapi::jiff::Timestamp::now()));
        util::conditions::set_condition(
            &mut status.conditions,
            "Stopped",
            true,
            "UserRequested",
            "Task was stopped by user annotation",
        );
    })
    .await?;
    Ok(())
}

async fn add_cleanup_finalizer(client: Client, instance: &Task) -> Result<(), Error> {
    let namespace = instance_namespace(instance)?;
    let name = instance_name(instance)?;
    let api: Api<Task> = Api::namespaced(client, namespace);
    let has_finalizer = instance
        .finalizers()
        .iter()
        .any(|f| f == annotations::TASK_CLEANUP_FINALIZER);
    if has_finalizer {
        return Ok(());
    }
    let mut finalizers = instance.finalizers().to_vec();
    finalizers.push(annotations::TASK_CLEANUP_FINALIZER.to_string());
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(
        name,
        &kube::api::PatchParams::default(),
        &kube::api::Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

pub async fn cleanup_cross_namespace(client: Client, instance: &Task) -> Result<(), Error> {
    let namespace = instance.status.as_ref().and_then(|s| s.pod_namespace.clone());

    if let Some(namespace) = namespace {
        if let Some(pod_name) = instance.status.as_ref().and_then(|s| s.pod_name.clone()) {
            let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
            match pods.delete(&pod_name, &Default::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }
        let name = instance_name(instance)?;
        let cms: Api<ConfigMap> = Api::namespaced(client.clone(), &namespace);
        let cm_name = planner::context_configmap_name_for(name);
        match cms.delete(&cm_name, &Default::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    }

    let api: Api<Task> = Api::namespaced(client, instance_namespace(instance)?);
    let mut finalizers = instance.finalizers().to_vec();
    finalizers.retain(|f| f != annotations::TASK_CLEANUP_FINALIZER);
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(
        instance_name(instance)?,
        &kube::api::PatchParams::default(),
        &kube::api::Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

pub async fn error(client: Client, instance: &Task, message: String) -> Result<(), Error> {
    patch_status::<TaskStatus, Task>(client, instance, |status: &mut TaskStatus| {
        status.phase = TaskPhase::Failed;
        status.completion_time = Some(Time(k8s_openapi::jiff::Timestamp::now()));
        util::conditions::set_condition(&mut status.conditions, "Ready", false, "Error", &message);
    })
    .await?;
    Ok(())
}
