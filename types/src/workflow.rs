use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::task::TaskSpec;

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NamedTaskSpec {
    pub name: String,
    pub task: TaskSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StageSpec {
    pub name: Option<String>,
    pub tasks: Vec<NamedTaskSpec>,
}

#[derive(
    CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema,
)]
#[kube(
    group = "kubetask.io",
    version = "v1",
    kind = "Workflow",
    plural = "workflows",
    derive = "PartialEq",
    namespaced
)]
#[kube(derive = "Default")]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
    #[serde(default)]
    pub stages: Vec<StageSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRef {
    pub name: String,
}

#[derive(
    CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema,
)]
#[kube(
    group = "kubetask.io",
    version = "v1",
    kind = "WorkflowRun",
    plural = "workflowruns",
    derive = "PartialEq",
    status = "WorkflowRunStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(printcolumn = "{\"jsonPath\": \".status.phase\", \"name\": \"PHASE\", \"type\": \"string\" }")]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.currentStage\", \"name\": \"STAGE\", \"type\": \"integer\" }"
)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunSpec {
    /// Inline wins over `workflowRef` when both are set.
    pub workflow_ref: Option<WorkflowRef>,
    pub inline: Option<WorkflowSpec>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum StagePhase {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StageStatus {
    pub name: Option<String>,
    pub phase: StagePhase,
    #[serde(default)]
    pub task_names: Vec<String>,
    pub start_time: Option<Time>,
    pub completion_time: Option<Time>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum WorkflowRunPhase {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl WorkflowRunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowRunPhase::Completed | WorkflowRunPhase::Failed)
    }
}

impl fmt::Display for WorkflowRunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunStatus {
    pub phase: WorkflowRunPhase,
    pub observed_generation: Option<i64>,
    /// Index into `stages`; `-1` before the first stage has started.
    #[serde(default = "default_current_stage")]
    pub current_stage: i32,
    #[serde(default)]
    pub total_tasks: u32,
    #[serde(default)]
    pub completed_tasks: u32,
    #[serde(default)]
    pub failed_tasks: u32,
    #[serde(default)]
    pub stages: Vec<StageStatus>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

fn default_current_stage() -> i32 {
    -1
}
