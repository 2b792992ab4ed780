use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::cron::ConcurrencyPolicy;
use crate::task::TaskSpec;
use crate::workflow::{WorkflowRef, WorkflowRunSpec};

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum WebhookAuth {
    Hmac {
        secret_name: String,
        /// Header carrying the signature, e.g. `X-Hub-Signature-256`.
        #[serde(default = "default_signature_header")]
        header: String,
    },
    Token {
        secret_name: String,
        #[serde(default = "default_token_header")]
        header: String,
    },
}

fn default_signature_header() -> String {
    "X-Hub-Signature-256".to_string()
}

fn default_token_header() -> String {
    "X-Webhook-Token".to_string()
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum ResourceTemplate {
    Task { task: TaskSpec },
    WorkflowRef { workflow_ref: WorkflowRef },
    WorkflowRun { workflow_run: WorkflowRunSpec },
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum MatchPolicy {
    First,
    All,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        MatchPolicy::First
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRule {
    pub name: String,
    pub filter: String,
    pub concurrency_policy: Option<ConcurrencyPolicy>,
    pub resource_template: ResourceTemplate,
}

#[derive(
    CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema,
)]
#[kube(
    group = "kubetask.io",
    version = "v1",
    kind = "WebhookTrigger",
    plural = "webhooktriggers",
    derive = "PartialEq",
    status = "WebhookTriggerStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.totalTriggered\", \"name\": \"TRIGGERED\", \"type\": \"integer\" }"
)]
#[serde(rename_all = "camelCase")]
pub struct WebhookTriggerSpec {
    pub auth: Option<WebhookAuth>,
    /// Legacy mode: a single top-level filter/template pair. Ignored when `rules` is non-empty.
    pub filter: Option<String>,
    pub resource_template: Option<ResourceTemplate>,
    /// Default applied to legacy mode and to any rule that omits its own.
    pub concurrency_policy: Option<ConcurrencyPolicy>,
    #[serde(default)]
    pub rules: Vec<TriggerRule>,
    #[serde(default)]
    pub match_policy: MatchPolicy,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RuleStatus {
    pub name: String,
    pub last_triggered_time: Option<Time>,
    #[serde(default)]
    pub total_triggered: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebhookTriggerStatus {
    pub last_triggered_time: Option<Time>,
    #[serde(default)]
    pub total_triggered: u64,
    #[serde(default)]
    pub active_resources: Vec<String>,
    /// Kept for compatibility with consumers that only look at Tasks.
    #[serde(default)]
    pub active_tasks: Vec<String>,
    #[serde(default)]
    pub rules: Vec<RuleStatus>,
}
