//! Pure decision logic for the Task phase machine (spec §4.4). No I/O: every
//! function here takes already-fetched cluster state and returns a decision.
//! Mirrors the pure/impure split of `clusters/planner.rs` + `shards/reconcile.rs`
//! in the teacher, generalized from a single-phase Cluster to the five-phase
//! Task state machine.

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use std::time::Duration;

use kubetask_types::{AgentRef, OutputsSpec, Quota, TaskSpec, TaskTemplateSpec};

/// Name used when a Task has no `agentRef` at all (E2E scenario 1).
pub const DEFAULT_AGENT_NAME: &str = "default";

/// Merges a `TaskTemplate` donor into a Task's effective spec per spec §3:
/// scalars prefer the Task, `contexts` concatenates template-first then Task,
/// output parameters overlay by name with the Task winning.
pub fn merge_task_template(task: &TaskSpec, template: Option<&TaskTemplateSpec>) -> TaskSpec {
    let Some(template) = template else {
        return task.clone();
    };

    let mut contexts = template.contexts.clone();
    contexts.extend(task.contexts.clone());

    let outputs = merge_outputs(template.outputs.as_ref(), task.outputs.as_ref());

    TaskSpec {
        description: task.description.clone().or_else(|| template.description.clone()),
        agent_ref: task.agent_ref.clone().or_else(|| template.agent_ref.clone()),
        task_template_ref: task.task_template_ref.clone(),
        contexts,
        outputs,
    }
}

fn merge_outputs(template: Option<&OutputsSpec>, task: Option<&OutputsSpec>) -> Option<OutputsSpec> {
    match (template, task) {
        (None, None) => None,
        (Some(t), None) => Some(t.clone()),
        (None, Some(t)) => Some(t.clone()),
        (Some(template), Some(task)) => {
            let mut parameters = template.parameters.clone();
            for task_param in &task.parameters {
                if let Some(existing) = parameters.iter_mut().find(|p| p.name == task_param.name) {
                    *existing = task_param.clone();
                } else {
                    parameters.push(task_param.clone());
                }
            }
            Some(OutputsSpec { parameters })
        }
    }
}

/// Resolves the effective `(agent name, agent namespace)` a Task targets,
/// defaulting to [`DEFAULT_AGENT_NAME`] in the Task's own namespace.
pub fn resolve_agent_ref(agent_ref: Option<&AgentRef>, task_namespace: &str) -> (String, String) {
    match agent_ref {
        Some(r) => (
            r.name.clone(),
            r.namespace.clone().unwrap_or_else(|| task_namespace.to_string()),
        ),
        None => (DEFAULT_AGENT_NAME.to_string(), task_namespace.to_string()),
    }
}

/// `true` if `namespace` is allowed to reference an Agent guarded by
/// `allowed_namespaces` glob patterns. An empty list means "all namespaces".
pub fn namespace_allowed(allowed_namespaces: &[String], namespace: &str) -> bool {
    if allowed_namespaces.is_empty() {
        return true;
    }
    allowed_namespaces
        .iter()
        .any(|pattern| glob_match::glob_match(pattern, namespace))
}

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Admit,
    Queued { reason: &'static str },
}

/// Admission check per spec §4.4: `maxConcurrent` first, then quota.
pub fn check_admission(
    max_concurrent: Option<u32>,
    running_count: u32,
    quota: Option<Quota>,
    retained_start_count: u32,
) -> Admission {
    if let Some(max) = max_concurrent
        && max > 0
        && running_count >= max
    {
        return Admission::Queued {
            reason: "AgentAtCapacity",
        };
    }
    if let Some(quota) = quota
        && quota.max_starts > 0
        && retained_start_count >= quota.max_starts
    {
        return Admission::Queued {
            reason: "QuotaExceeded",
        };
    }
    Admission::Admit
}

/// Trims `start_history` to entries within `window_seconds` of `now`,
/// returning the retained count (the quantity `check_admission` compares
/// against `quota.maxStarts`).
pub fn retained_start_count(start_history: &[Time], window_seconds: u64, now: k8s_openapi::jiff::Timestamp) -> u32 {
    let window = std::time::Duration::from_secs(window_seconds);
    start_history
        .iter()
        .filter(|t| {
            now.duration_since(t.0)
                .try_into()
                .map(|d: Duration| d <= window)
                .unwrap_or(false)
        })
        .count() as u32
}

#[derive(Debug, Clone, PartialEq)]
pub enum PodOutcome {
    StillRunning,
    Completed,
    Failed,
}

/// Derives the Task outcome from the Pod's observed phase (spec §4.4).
pub fn derive_pod_outcome(pod: &Pod) -> PodOutcome {
    match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
        Some("Succeeded") => PodOutcome::Completed,
        Some("Failed") => PodOutcome::Failed,
        _ => PodOutcome::StillRunning,
    }
}

/// Parses the sidecar termination message (JSON `{"parameters": {...}}`) from
/// the worker container's terminated state, if present.
pub fn parse_output_parameters(pod: &Pod) -> std::collections::BTreeMap<String, serde_json::Value> {
    let Some(statuses) = pod.status.as_ref().and_then(|s| s.container_statuses.as_ref()) else {
        return Default::default();
    };
    let Some(message) = statuses
        .iter()
        .find(|c| c.name == "agent")
        .and_then(|c| c.state.as_ref())
        .and_then(|s| s.terminated.as_ref())
        .and_then(|t| t.message.as_deref())
    else {
        return Default::default();
    };
    #[derive(serde::Deserialize)]
    struct Envelope {
        parameters: std::collections::BTreeMap<String, serde_json::Value>,
    }
    serde_json::from_str::<Envelope>(message)
        .map(|e| e.parameters)
        .unwrap_or_default()
}

/// `true` if the Task carries the user stop annotation.
pub fn stop_requested(annotations: &std::collections::BTreeMap<String, String>) -> bool {
    annotations
        .get(kubetask_common::annotations::STOP)
        .is_some_and(|v| v == "true")
}

pub fn pod_name_for(task_name: &str) -> String {
    format!("{task_name}-pod")
}

pub fn context_configmap_name_for(task_name: &str) -> String {
    format!("{task_name}-context")
}

/// Whether a Task's Agent lives in a different namespace than the Task
/// itself, the condition under which cross-namespace cleanup finalizers
/// apply (spec's Ownership and lifecycle rules).
pub fn is_cross_namespace(task_namespace: &str, agent_namespace: &str) -> bool {
    task_namespace != agent_namespace
}

pub fn pod_ready_name(pod: &Pod) -> String {
    pod.name_any()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubetask_types::{AgentRef, OutputParameter};

    #[test]
    fn merge_with_no_template_returns_task_unchanged() {
        let task = TaskSpec {
            description: Some("d".to_string()),
            agent_ref: None,
            task_template_ref: None,
            contexts: Vec::new(),
            outputs: None,
        };
        assert_eq!(merge_task_template(&task, None), task);
    }

    #[test]
    fn merge_prefers_task_description_over_template() {
        let template = TaskTemplateSpec {
            description: Some("template desc".to_string()),
            agent_ref: None,
            contexts: Vec::new(),
            outputs: None,
        };
        let task = TaskSpec {
            description: Some("task desc".to_string()),
            agent_ref: None,
            task_template_ref: None,
            contexts: Vec::new(),
            outputs: None,
        };
        let merged = merge_task_template(&task, Some(&template));
        assert_eq!(merged.description.as_deref(), Some("task desc"));
    }

    #[test]
    fn merge_falls_back_to_template_description_when_task_is_empty() {
        let template = TaskTemplateSpec {
            description: Some("template desc".to_string()),
            agent_ref: None,
            contexts: Vec::new(),
            outputs: None,
        };
        let task = TaskSpec {
            description: None,
            agent_ref: None,
            task_template_ref: None,
            contexts: Vec::new(),
            outputs: None,
        };
        let merged = merge_task_template(&task, Some(&template));
        assert_eq!(merged.description.as_deref(), Some("template desc"));
    }

    #[test]
    fn merge_overlays_output_parameters_by_name_with_task_winning() {
        let template = TaskTemplateSpec {
            description: None,
            agent_ref: None,
            contexts: Vec::new(),
            outputs: Some(OutputsSpec {
                parameters: vec![
                    OutputParameter {
                        name: "a".to_string(),
                        value: Some("template-a".to_string()),
                    },
                    OutputParameter {
                        name: "b".to_string(),
                        value: Some("template-b".to_string()),
                    },
                ],
            }),
        };
        let task = TaskSpec {
            description: None,
            agent_ref: None,
            task_template_ref: None,
            contexts: Vec::new(),
            outputs: Some(OutputsSpec {
                parameters: vec![OutputParameter {
                    name: "a".to_string(),
                    value: Some("task-a".to_string()),
                }],
            }),
        };
        let merged = merge_task_template(&task, Some(&template));
        let outputs = merged.outputs.unwrap();
        assert_eq!(outputs.parameters.len(), 2);
        assert_eq!(
            outputs.parameters.iter().find(|p| p.name == "a").unwrap().value.as_deref(),
            Some("task-a")
        );
        assert_eq!(
            outputs.parameters.iter().find(|p| p.name == "b").unwrap().value.as_deref(),
            Some("template-b")
        );
    }

    #[test]
    fn resolve_agent_ref_defaults_to_default_agent_in_task_namespace() {
        assert_eq!(
            resolve_agent_ref(None, "default"),
            (DEFAULT_AGENT_NAME.to_string(), "default".to_string())
        );
    }

    #[test]
    fn resolve_agent_ref_honors_explicit_namespace() {
        let agent_ref = AgentRef {
            name: "gpu-agent".to_string(),
            namespace: Some("agents-ns".to_string()),
        };
        assert_eq!(
            resolve_agent_ref(Some(&agent_ref), "default"),
            ("gpu-agent".to_string(), "agents-ns".to_string())
        );
    }

    #[test]
    fn namespace_allowed_is_permissive_when_empty() {
        assert!(namespace_allowed(&[], "anything"));
    }

    #[test]
    fn namespace_allowed_matches_glob_pattern() {
        let patterns = vec!["team-*".to_string()];
        assert!(namespace_allowed(&patterns, "team-a"));
        assert!(!namespace_allowed(&patterns, "other"));
    }

    #[test]
    fn admission_allows_when_under_capacity_and_quota() {
        assert_eq!(check_admission(Some(3), 2, None, 0), Admission::Admit);
    }

    #[test]
    fn admission_queues_at_capacity() {
        assert_eq!(
            check_admission(Some(3), 3, None, 0),
            Admission::Queued { reason: "AgentAtCapacity" }
        );
    }

    #[test]
    fn admission_queues_on_quota_exhaustion() {
        let quota = Quota { max_starts: 5, window_seconds: 60 };
        assert_eq!(
            check_admission(None, 0, Some(quota), 5),
            Admission::Queued { reason: "QuotaExceeded" }
        );
    }

    #[test]
    fn zero_max_concurrent_is_unbounded() {
        assert_eq!(check_admission(Some(0), 1000, None, 0), Admission::Admit);
    }

    #[test]
    fn derive_pod_outcome_maps_succeeded_and_failed() {
        let mut pod = Pod::default();
        pod.status = Some(k8s_openapi::api::core::v1::PodStatus {
            phase: Some("Succeeded".to_string()),
            ..Default::default()
        });
        assert_eq!(derive_pod_outcome(&pod), PodOutcome::Completed);

        pod.status.as_mut().unwrap().phase = Some("Failed".to_string());
        assert_eq!(derive_pod_outcome(&pod), PodOutcome::Failed);

        pod.status.as_mut().unwrap().phase = Some("Running".to_string());
        assert_eq!(derive_pod_outcome(&pod), PodOutcome::StillRunning);
    }

    #[test]
    fn cross_namespace_detection() {
        assert!(is_cross_namespace("ns-a", "ns-b"));
        assert!(!is_cross_namespace("ns-a", "ns-a"));
    }

    #[test]
    fn stop_requested_reads_annotation() {
        let mut annotations = std::collections::BTreeMap::new();
        assert!(!stop_requested(&annotations));
        annotations.insert(kubetask_common::annotations::STOP.to_string(), "true".to_string());
        assert!(stop_requested(&annotations));
    }
}
