use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::task::TaskSpec;
use crate::workflow::{WorkflowRef, WorkflowSpec};

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConcurrencyPolicy {
    Allow,
    Forbid,
    Replace,
}

impl Default for ConcurrencyPolicy {
    fn default() -> Self {
        ConcurrencyPolicy::Allow
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CronStatus {
    pub last_schedule_time: Option<Time>,
    #[serde(default)]
    pub active: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(
    CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema,
)]
#[kube(
    group = "kubetask.io",
    version = "v1",
    kind = "CronTask",
    plural = "crontasks",
    derive = "PartialEq",
    status = "CronStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".spec.schedule\", \"name\": \"SCHEDULE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.lastScheduleTime\", \"name\": \"LAST-SCHEDULE\", \"type\": \"date\" }"
)]
#[serde(rename_all = "camelCase")]
pub struct CronTaskSpec {
    pub schedule: String,
    #[serde(default)]
    pub suspend: bool,
    #[serde(default)]
    pub concurrency_policy: ConcurrencyPolicy,
    pub successful_history_limit: Option<u32>,
    pub failed_history_limit: Option<u32>,
    pub task_template: TaskSpec,
}

#[derive(
    CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema,
)]
#[kube(
    group = "kubetask.io",
    version = "v1",
    kind = "CronWorkflow",
    plural = "cronworkflows",
    derive = "PartialEq",
    status = "CronStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".spec.schedule\", \"name\": \"SCHEDULE\", \"type\": \"string\" }"
)]
#[serde(rename_all = "camelCase")]
pub struct CronWorkflowSpec {
    pub schedule: String,
    #[serde(default)]
    pub suspend: bool,
    pub successful_history_limit: Option<u32>,
    pub failed_history_limit: Option<u32>,
    /// Inline wins over `workflowRef` when both are set.
    pub workflow_ref: Option<WorkflowRef>,
    pub inline: Option<WorkflowSpec>,
}

impl CronWorkflowSpec {
    /// CronWorkflow has no `concurrencyPolicy` field; it is always Forbid.
    pub fn concurrency_policy(&self) -> ConcurrencyPolicy {
        ConcurrencyPolicy::Forbid
    }

    pub fn successful_history_limit(&self) -> u32 {
        self.successful_history_limit.unwrap_or(3)
    }

    pub fn failed_history_limit(&self) -> u32 {
        self.failed_history_limit.unwrap_or(1)
    }
}

impl CronTaskSpec {
    pub fn successful_history_limit(&self) -> u32 {
        self.successful_history_limit.unwrap_or(3)
    }

    pub fn failed_history_limit(&self) -> u32 {
        self.failed_history_limit.unwrap_or(1)
    }
}
