use k8s_openapi::api::core::v1::{Affinity, ResourceRequirements, Toleration};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::context::ContextItem;

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub secret_name: String,
    /// Key within the secret. Absent means "whole secret" (envFrom or dir mount).
    pub key: Option<String>,
    /// Mount path for a file or directory target. Absent + key present means env var.
    pub mount_path: Option<String>,
    /// Env var name when `key` is set and `mount_path` is absent. Defaults to `key`.
    pub env_name: Option<String>,
    pub file_mode: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, JsonSchema)]
pub struct Quota {
    pub max_starts: u32,
    pub window_seconds: u64,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(
    CustomResource, Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema, Default,
)]
#[kube(
    group = "kubetask.io",
    version = "v1",
    kind = "Agent",
    plural = "agents",
    derive = "PartialEq",
    status = "AgentStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(printcolumn = "{\"jsonPath\": \".spec.workerImage\", \"name\": \"IMAGE\", \"type\": \"string\" }")]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.server.readyReplicas\", \"name\": \"READY\", \"type\": \"integer\" }"
)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    pub worker_image: String,
    pub init_image: String,
    /// Lighter image used by workers started in attach mode against a Server-mode Agent.
    pub attach_image: Option<String>,
    pub command: Option<Vec<String>>,
    pub workspace_dir: String,
    pub service_account: String,
    pub node_selector: Option<BTreeMap<String, String>>,
    pub tolerations: Option<Vec<Toleration>>,
    pub affinity: Option<Affinity>,
    pub runtime_class_name: Option<String>,
    pub resources: Option<ResourceRequirements>,
    pub pod_labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub credentials: Vec<Credential>,
    #[serde(default)]
    pub contexts: Vec<ContextItem>,
    /// Cap on simultaneously-`Running` Tasks targeting this Agent. Unset or 0 = unbounded.
    pub max_concurrent: Option<u32>,
    pub quota: Option<Quota>,
    /// Glob patterns; empty means all namespaces may reference this Agent.
    #[serde(default)]
    pub allowed_namespaces: Vec<String>,
    pub server_config: Option<ServerConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentServerStatus {
    pub url: Option<String>,
    #[serde(default)]
    pub ready_replicas: i32,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Sliding-window quota bookkeeping: one timestamp per Task start admitted under this Agent.
    #[serde(default)]
    pub start_history: Vec<Time>,
    pub server: Option<AgentServerStatus>,
    #[serde(rename = "lastUpdated")]
    pub last_updated: Option<Time>,
}
