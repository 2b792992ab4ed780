//! Resolves an ordered `ContextItem` list into the three mount streams the
//! Pod Builder consumes, plus the `task.md` content. Pure except for the one
//! I/O seam noted in spec §4.2: reading the data of a referenced ConfigMap.
//!
//! Callers fetch the ConfigMaps first (`fetch_context_data`) and pass the
//! result into [`resolve`], which does no I/O and is exhaustively unit
//! tested below.

use kube::{Api, Client};
use k8s_openapi::api::core::v1::ConfigMap;
use std::collections::{BTreeMap, HashMap, HashSet};

use kubetask_types::ContextItem;

use crate::util::Error;

/// Fixed system prompt injected by a `runtime` context item.
pub const RUNTIME_SYSTEM_PROMPT: &str = "You are running non-interactively inside a \
provisioned task workspace. There is no human available to answer questions: make \
the best reasonable decision and proceed. Write all deliverables under the workspace \
directory and report outputs per the task's declared output parameters.";

#[derive(Debug, Clone, PartialEq)]
pub struct FileMount {
    pub path: String,
    pub content: String,
    pub file_mode: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirMount {
    pub path: String,
    pub config_map_name: String,
    pub optional: bool,
    pub file_mode: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GitMount {
    pub path: String,
    pub repository: String,
    pub git_ref: String,
    pub path_in_repo: Option<String>,
    pub depth: u32,
    pub auth_secret: Option<String>,
    pub file_mode: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedContext {
    pub task_md: String,
    pub files: Vec<FileMount>,
    pub dirs: Vec<DirMount>,
    pub gits: Vec<GitMount>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ContextError {
    #[error("mount path conflict: '{0}' is targeted by more than one context")]
    MountConflict(String),
    #[error("configMap '{0}' referenced by a context does not exist")]
    ConfigMapNotFound(String),
    #[error("configMap '{0}' has no key '{1}'")]
    ConfigMapKeyNotFound(String, String),
    #[error("git context at index {0} has no mountPath (git contexts must declare one)")]
    GitRequiresMountPath(usize),
}

impl From<ContextError> for Error {
    fn from(e: ContextError) -> Self {
        Error::Config(e.to_string())
    }
}

fn resolve_mount_path(workspace_dir: &str, mount_path: &str) -> String {
    if mount_path.starts_with('/') {
        mount_path.to_string()
    } else {
        format!("{}/{}", workspace_dir.trim_end_matches('/'), mount_path)
    }
}

/// Sanitizes an absolute mount path into a legal ConfigMap/Secret data key
/// (`/workspace/task.md` -> `workspace-task.md`).
pub fn sanitize_key(path: &str) -> String {
    path.trim_start_matches('/').replace('/', "-")
}

/// Reads the ConfigMaps referenced by `contexts` that actually need their
/// contents now (inline `key` lookups, or whole-ConfigMap key aggregation).
/// Directory-mount ConfigMaps are mounted natively by the Pod Builder and are
/// not fetched here.
pub async fn fetch_context_data(
    client: Client,
    namespace: &str,
    contexts: &[ContextItem],
) -> Result<HashMap<String, BTreeMap<String, String>>, Error> {
    let api: Api<ConfigMap> = Api::namespaced(client, namespace);
    let mut data = HashMap::new();
    for item in contexts {
        let ContextItem::ConfigMap {
            config_map,
            mount_path,
            ..
        } = item
        else {
            continue;
        };
        let needs_fetch = config_map.key.is_some() || mount_path.is_none();
        if !needs_fetch || data.contains_key(&config_map.name) {
            continue;
        }
        match api.get(&config_map.name).await {
            Ok(cm) => {
                data.insert(config_map.name.clone(), cm.data.unwrap_or_default());
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                if !config_map.optional {
                    return Err(ContextError::ConfigMapNotFound(config_map.name.clone()).into());
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(data)
}

/// Pure resolution step. `configmap_data` must already contain every
/// ConfigMap referenced by a `key`-bearing or key-aggregating context item
/// (see [`fetch_context_data`]); a missing, non-optional entry is an error.
pub fn resolve(
    description: &str,
    namespace: &str,
    workspace_dir: &str,
    contexts: &[ContextItem],
    configmap_data: &HashMap<String, BTreeMap<String, String>>,
) -> Result<ResolvedContext, ContextError> {
    let mut files = Vec::new();
    let mut dirs = Vec::new();
    let mut gits = Vec::new();
    let mut blocks = Vec::new();

    for (idx, item) in contexts.iter().enumerate() {
        match item {
            ContextItem::Text {
                text,
                mount_path,
                file_mode,
            } => match mount_path {
                Some(mp) => files.push(FileMount {
                    path: resolve_mount_path(workspace_dir, mp),
                    content: text.clone(),
                    file_mode: *file_mode,
                }),
                None => blocks.push(wrap_context("text", None, namespace, text)),
            },
            ContextItem::ConfigMap {
                config_map,
                mount_path,
                file_mode,
            } => match (&config_map.key, mount_path) {
                (Some(key), mount_path) => {
                    let Some(value) = lookup_key(configmap_data, &config_map.name, key) else {
                        if config_map.optional {
                            continue;
                        }
                        return Err(ContextError::ConfigMapKeyNotFound(
                            config_map.name.clone(),
                            key.clone(),
                        ));
                    };
                    match mount_path {
                        Some(mp) => files.push(FileMount {
                            path: resolve_mount_path(workspace_dir, mp),
                            content: value,
                            file_mode: *file_mode,
                        }),
                        None => blocks.push(wrap_context(
                            "configMap",
                            Some(&config_map.name),
                            namespace,
                            &value,
                        )),
                    }
                }
                (None, Some(mp)) => dirs.push(DirMount {
                    path: resolve_mount_path(workspace_dir, mp),
                    config_map_name: config_map.name.clone(),
                    optional: config_map.optional,
                    file_mode: *file_mode,
                }),
                (None, None) => {
                    let Some(keys) = configmap_data.get(&config_map.name) else {
                        if config_map.optional {
                            continue;
                        }
                        return Err(ContextError::ConfigMapNotFound(config_map.name.clone()));
                    };
                    let aggregate = keys
                        .iter()
                        .map(|(k, v)| format!("<file name=\"{k}\">{v}</file>"))
                        .collect::<Vec<_>>()
                        .join("\n");
                    blocks.push(wrap_context(
                        "configMap",
                        Some(&config_map.name),
                        namespace,
                        &aggregate,
                    ));
                }
            },
            ContextItem::Git {
                git,
                mount_path,
                file_mode,
            } => {
                let Some(mp) = mount_path else {
                    return Err(ContextError::GitRequiresMountPath(idx));
                };
                gits.push(GitMount {
                    path: resolve_mount_path(workspace_dir, mp),
                    repository: git.repository.clone(),
                    git_ref: git.git_ref_or_default().to_string(),
                    path_in_repo: git.path.clone(),
                    depth: git.depth_or_default(),
                    auth_secret: git.auth_secret.clone(),
                    file_mode: *file_mode,
                });
            }
            ContextItem::Runtime { .. } => {
                blocks.push(wrap_context("runtime", None, namespace, RUNTIME_SYSTEM_PROMPT));
            }
        }
    }

    let task_md_path = resolve_mount_path(workspace_dir, "task.md");
    let task_md = if blocks.is_empty() {
        description.to_string()
    } else {
        format!("{description}\n\n{}", blocks.join("\n"))
    };
    files.push(FileMount {
        path: task_md_path,
        content: task_md.clone(),
        file_mode: None,
    });

    check_conflicts(&files, &dirs, &gits)?;

    Ok(ResolvedContext {
        task_md,
        files,
        dirs,
        gits,
    })
}

fn wrap_context(kind: &str, name: Option<&str>, namespace: &str, content: &str) -> String {
    match name {
        Some(name) => format!(
            "<context name=\"{name}\" namespace=\"{namespace}\" type=\"{kind}\">{content}</context>"
        ),
        None => format!("<context namespace=\"{namespace}\" type=\"{kind}\">{content}</context>"),
    }
}

fn lookup_key(
    data: &HashMap<String, BTreeMap<String, String>>,
    config_map_name: &str,
    key: &str,
) -> Option<String> {
    data.get(config_map_name)?.get(key).cloned()
}

fn check_conflicts(
    files: &[FileMount],
    dirs: &[DirMount],
    gits: &[GitMount],
) -> Result<(), ContextError> {
    let mut seen = HashSet::new();
    for path in files
        .iter()
        .map(|f| &f.path)
        .chain(dirs.iter().map(|d| &d.path))
        .chain(gits.iter().map(|g| &g.path))
    {
        if !seen.insert(path.clone()) {
            return Err(ContextError::MountConflict(path.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubetask_types::{ConfigMapContext, GitContext};

    fn cm_data() -> HashMap<String, BTreeMap<String, String>> {
        let mut m = HashMap::new();
        m.insert(
            "cfg".to_string(),
            BTreeMap::from([("a".to_string(), "A-VALUE".to_string())]),
        );
        m
    }

    #[test]
    fn no_contexts_task_md_is_bare_description() {
        let resolved = resolve("hello", "ns", "/workspace", &[], &HashMap::new()).unwrap();
        assert_eq!(resolved.task_md, "hello");
        assert_eq!(resolved.files.len(), 1);
        assert_eq!(resolved.files[0].path, "/workspace/task.md");
        assert_eq!(resolved.files[0].content, "hello");
    }

    #[test]
    fn text_with_mount_path_becomes_its_own_file() {
        let contexts = vec![ContextItem::Text {
            text: "hi".to_string(),
            mount_path: Some("notes.txt".to_string()),
            file_mode: None,
        }];
        let resolved = resolve("desc", "ns", "/workspace", &contexts, &HashMap::new()).unwrap();
        assert_eq!(resolved.task_md, "desc");
        assert_eq!(resolved.files.len(), 2);
        assert!(
            resolved
                .files
                .iter()
                .any(|f| f.path == "/workspace/notes.txt" && f.content == "hi")
        );
    }

    #[test]
    fn text_without_mount_path_wraps_into_task_md() {
        let contexts = vec![ContextItem::Text {
            text: "hi".to_string(),
            mount_path: None,
            file_mode: None,
        }];
        let resolved = resolve("desc", "ns", "/workspace", &contexts, &HashMap::new()).unwrap();
        assert_eq!(
            resolved.task_md,
            "desc\n\n<context namespace=\"ns\" type=\"text\">hi</context>"
        );
    }

    #[test]
    fn configmap_with_key_is_inline_content() {
        let contexts = vec![ContextItem::ConfigMap {
            config_map: ConfigMapContext {
                name: "cfg".to_string(),
                key: Some("a".to_string()),
                optional: false,
            },
            mount_path: None,
            file_mode: None,
        }];
        let resolved = resolve("desc", "ns", "/workspace", &contexts, &cm_data()).unwrap();
        assert!(resolved.task_md.contains("A-VALUE"));
    }

    #[test]
    fn configmap_without_key_or_mount_path_aggregates_as_files() {
        let contexts = vec![ContextItem::ConfigMap {
            config_map: ConfigMapContext {
                name: "cfg".to_string(),
                key: None,
                optional: false,
            },
            mount_path: None,
            file_mode: None,
        }];
        let resolved = resolve("desc", "ns", "/workspace", &contexts, &cm_data()).unwrap();
        assert!(resolved.task_md.contains("<file name=\"a\">A-VALUE</file>"));
    }

    #[test]
    fn configmap_without_key_but_with_mount_path_is_a_dir_mount() {
        let contexts = vec![ContextItem::ConfigMap {
            config_map: ConfigMapContext {
                name: "cfg".to_string(),
                key: None,
                optional: false,
            },
            mount_path: Some("cfgdir".to_string()),
            file_mode: None,
        }];
        let resolved = resolve("desc", "ns", "/workspace", &contexts, &HashMap::new()).unwrap();
        assert_eq!(resolved.dirs.len(), 1);
        assert_eq!(resolved.dirs[0].path, "/workspace/cfgdir");
        assert_eq!(resolved.dirs[0].config_map_name, "cfg");
    }

    #[test]
    fn git_without_mount_path_is_an_error() {
        let contexts = vec![ContextItem::Git {
            git: GitContext {
                repository: "https://example.com/r.git".to_string(),
                git_ref: None,
                path: None,
                depth: None,
                auth_secret: None,
            },
            mount_path: None,
            file_mode: None,
        }];
        let err = resolve("desc", "ns", "/workspace", &contexts, &HashMap::new()).unwrap_err();
        assert!(matches!(err, ContextError::GitRequiresMountPath(0)));
    }

    #[test]
    fn git_defaults_ref_and_depth() {
        let contexts = vec![ContextItem::Git {
            git: GitContext {
                repository: "https://example.com/r.git".to_string(),
                git_ref: None,
                path: None,
                depth: None,
                auth_secret: None,
            },
            mount_path: Some("repo".to_string()),
            file_mode: None,
        }];
        let resolved = resolve("desc", "ns", "/workspace", &contexts, &HashMap::new()).unwrap();
        assert_eq!(resolved.gits.len(), 1);
        assert_eq!(resolved.gits[0].git_ref, "HEAD");
        assert_eq!(resolved.gits[0].depth, 1);
        assert_eq!(resolved.gits[0].path, "/workspace/repo");
    }

    #[test]
    fn runtime_always_appends_to_task_md_ignoring_mount_path() {
        let contexts = vec![ContextItem::Runtime {
            mount_path: Some("ignored".to_string()),
            file_mode: None,
        }];
        let resolved = resolve("desc", "ns", "/workspace", &contexts, &HashMap::new()).unwrap();
        assert!(resolved.task_md.contains(RUNTIME_SYSTEM_PROMPT));
        assert_eq!(resolved.files.len(), 1); // only task.md itself
    }

    #[test]
    fn duplicate_mount_paths_are_a_conflict() {
        let contexts = vec![
            ContextItem::Text {
                text: "a".to_string(),
                mount_path: Some("/x".to_string()),
                file_mode: None,
            },
            ContextItem::Text {
                text: "b".to_string(),
                mount_path: Some("/x".to_string()),
                file_mode: None,
            },
        ];
        let err = resolve("desc", "ns", "/workspace", &contexts, &HashMap::new()).unwrap_err();
        assert_eq!(err, ContextError::MountConflict("/x".to_string()));
    }

    #[test]
    fn absolute_mount_path_is_not_rebased_on_workspace() {
        let contexts = vec![ContextItem::Text {
            text: "a".to_string(),
            mount_path: Some("/etc/config".to_string()),
            file_mode: None,
        }];
        let resolved = resolve("desc", "ns", "/workspace", &contexts, &HashMap::new()).unwrap();
        assert!(resolved.files.iter().any(|f| f.path == "/etc/config"));
    }

    #[test]
    fn sanitize_key_turns_path_into_configmap_key() {
        assert_eq!(sanitize_key("/workspace/task.md"), "workspace-task.md");
    }
}
