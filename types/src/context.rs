use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One logical piece of context surfaced into a worker's workspace.
///
/// Dispatched on `type` in the context resolver; one variant per shape.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ContextItem {
    Text {
        text: String,
        mount_path: Option<String>,
        file_mode: Option<u32>,
    },
    ConfigMap {
        config_map: ConfigMapContext,
        mount_path: Option<String>,
        file_mode: Option<u32>,
    },
    Git {
        git: GitContext,
        mount_path: Option<String>,
        file_mode: Option<u32>,
    },
    Runtime {
        mount_path: Option<String>,
        file_mode: Option<u32>,
    },
}

impl ContextItem {
    pub fn mount_path(&self) -> Option<&str> {
        match self {
            ContextItem::Text { mount_path, .. }
            | ContextItem::ConfigMap { mount_path, .. }
            | ContextItem::Git { mount_path, .. }
            | ContextItem::Runtime { mount_path, .. } => mount_path.as_deref(),
        }
    }

    pub fn file_mode(&self) -> Option<u32> {
        match self {
            ContextItem::Text { file_mode, .. }
            | ContextItem::ConfigMap { file_mode, .. }
            | ContextItem::Git { file_mode, .. }
            | ContextItem::Runtime { file_mode, .. } => *file_mode,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapContext {
    pub name: String,
    pub key: Option<String>,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitContext {
    pub repository: String,
    #[serde(rename = "ref")]
    pub git_ref: Option<String>,
    pub path: Option<String>,
    pub depth: Option<u32>,
    pub auth_secret: Option<String>,
}

impl GitContext {
    pub fn git_ref_or_default(&self) -> &str {
        self.git_ref.as_deref().unwrap_or("HEAD")
    }

    pub fn depth_or_default(&self) -> u32 {
        self.depth.unwrap_or(1)
    }
}
