use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::{fmt, str::FromStr};

use crate::context::ContextItem;

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentRef {
    pub name: String,
    pub namespace: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskTemplateRef {
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OutputParameter {
    pub name: String,
    pub value: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OutputsSpec {
    #[serde(default)]
    pub parameters: Vec<OutputParameter>,
}

#[derive(
    CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema,
)]
#[kube(
    group = "kubetask.io",
    version = "v1",
    kind = "Task",
    plural = "tasks",
    derive = "PartialEq",
    status = "TaskStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(printcolumn = "{\"jsonPath\": \".status.phase\", \"name\": \"PHASE\", \"type\": \"string\" }")]
#[kube(printcolumn = "{\"jsonPath\": \".status.podName\", \"name\": \"POD\", \"type\": \"string\" }")]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    pub description: Option<String>,
    pub agent_ref: Option<AgentRef>,
    pub task_template_ref: Option<TaskTemplateRef>,
    #[serde(default)]
    pub contexts: Vec<ContextItem>,
    pub outputs: Option<OutputsSpec>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum TaskPhase {
    #[default]
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
}

impl TaskPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskPhase::Completed | TaskPhase::Failed)
    }
}

impl FromStr for TaskPhase {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(TaskPhase::Pending),
            "Queued" => Ok(TaskPhase::Queued),
            "Running" => Ok(TaskPhase::Running),
            "Completed" => Ok(TaskPhase::Completed),
            "Failed" => Ok(TaskPhase::Failed),
            _ => Err(()),
        }
    }
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskPhase::Pending => write!(f, "Pending"),
            TaskPhase::Queued => write!(f, "Queued"),
            TaskPhase::Running => write!(f, "Running"),
            TaskPhase::Completed => write!(f, "Completed"),
            TaskPhase::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub phase: TaskPhase,
    pub observed_generation: Option<i64>,
    pub pod_name: Option<String>,
    pub pod_namespace: Option<String>,
    pub start_time: Option<Time>,
    pub completion_time: Option<Time>,
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(rename = "lastUpdated")]
    pub last_updated: Option<Time>,
}

/// Default-value donor referenced by a Task. Merge rules (applied by the Task
/// reconciler, not here): scalars prefer the Task, lists concatenate
/// template-first then Task, keyed lists overlay by name with the Task winning.
#[derive(
    CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema,
)]
#[kube(
    group = "kubetask.io",
    version = "v1",
    kind = "TaskTemplate",
    plural = "tasktemplates",
    derive = "PartialEq",
    namespaced
)]
#[kube(derive = "Default")]
#[serde(rename_all = "camelCase")]
pub struct TaskTemplateSpec {
    pub description: Option<String>,
    pub agent_ref: Option<AgentRef>,
    #[serde(default)]
    pub contexts: Vec<ContextItem>,
    pub outputs: Option<OutputsSpec>,
}
