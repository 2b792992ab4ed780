//! Deterministic, I/O-free construction of a Task's worker Pod.
//!
//! Mirrors the assembly order the teacher's `shards/actions.rs::pod_resource`
//! used for its single-container peggy Pod, generalized to the multi-container
//! (agent-init, context-init, one git-init per Git context, worker) shape this
//! platform needs. Resource indices (container/volume order) are fixed so that
//! repeated calls with the same inputs produce byte-identical specs.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, EnvFromSource, EnvVar, EnvVarSource, Pod, PodSpec, ResourceRequirements,
    SecretEnvSource, SecretKeySelector, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;

use kubetask_types::Credential;

use crate::context_resolver::{DirMount, FileMount, GitMount};
use crate::util::Error;

const TOOLS_VOLUME: &str = "tools";
const WORKSPACE_VOLUME: &str = "workspace";
const CONTEXT_VOLUME: &str = "context";
const CONTEXT_MOUNT_PATH: &str = "/var/run/kubetask/context";
const GITCONFIG_VOLUME: &str = "gitconfig";
const GITCONFIG_PATH: &str = "/var/run/kubetask/gitconfig";
const PERMISSION_ENV: &str = "AGENT_PERMISSION_MODE";
const PERMISSION_ALLOW_ALL: &str = "allow-all";

/// Precomputed agent execution contract, flattened out of `AgentSpec` so the
/// builder itself never touches a CRD type directly.
#[derive(Debug, Clone)]
pub struct PodAgentConfig {
    pub worker_image: String,
    pub init_image: String,
    pub attach_image: Option<String>,
    pub command: Option<Vec<String>>,
    pub workspace_dir: String,
    pub service_account: String,
    pub node_selector: Option<BTreeMap<String, String>>,
    pub tolerations: Option<Vec<k8s_openapi::api::core::v1::Toleration>>,
    pub affinity: Option<k8s_openapi::api::core::v1::Affinity>,
    pub runtime_class_name: Option<String>,
    pub resources: Option<ResourceRequirements>,
    pub pod_labels: BTreeMap<String, String>,
    pub credentials: Vec<Credential>,
    pub agent_config_mount_path: Option<String>,
}

pub struct PodBuildInput<'a> {
    pub pod_name: String,
    pub pod_namespace: String,
    pub agent_config: &'a PodAgentConfig,
    pub context_config_map_name: Option<String>,
    pub files: &'a [FileMount],
    pub dirs: &'a [DirMount],
    pub gits: &'a [GitMount],
    pub server_url: Option<String>,
    pub owner_ref: Option<OwnerReference>,
    pub spec_hash: String,
}

pub fn build_pod(input: PodBuildInput) -> Result<Pod, Error> {
    let cfg = input.agent_config;
    let workspace_dir = cfg.workspace_dir.trim_end_matches('/');

    let mut volumes = Vec::new();
    let mut init_containers = Vec::new();

    // 1. tools
    volumes.push(Volume {
        name: TOOLS_VOLUME.to_string(),
        empty_dir: Some(Default::default()),
        ..Default::default()
    });
    // 2. workspace
    volumes.push(Volume {
        name: WORKSPACE_VOLUME.to_string(),
        empty_dir: Some(Default::default()),
        ..Default::default()
    });

    let tools_mount = VolumeMount {
        name: TOOLS_VOLUME.to_string(),
        mount_path: "/tools".to_string(),
        ..Default::default()
    };
    let workspace_mount = VolumeMount {
        name: WORKSPACE_VOLUME.to_string(),
        mount_path: workspace_dir.to_string(),
        ..Default::default()
    };

    // 3. agent-init
    init_containers.push(Container {
        name: "agent-init".to_string(),
        image: Some(cfg.init_image.clone()),
        command: Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            "cp /usr/local/bin/agent /tools/agent && chmod +x /tools/agent".to_string(),
        ]),
        volume_mounts: Some(vec![tools_mount.clone()]),
        ..Default::default()
    });

    // 4. base environment
    let mut env = vec![
        EnvVar {
            name: "HOME".to_string(),
            value: Some(workspace_dir.to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "SHELL".to_string(),
            value: Some("/bin/sh".to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "TASK_NAME".to_string(),
            value: Some(input.pod_name.clone()),
            ..Default::default()
        },
        EnvVar {
            name: "TASK_NAMESPACE".to_string(),
            value: Some(input.pod_namespace.clone()),
            ..Default::default()
        },
        EnvVar {
            name: "WORKSPACE_DIR".to_string(),
            value: Some(workspace_dir.to_string()),
            ..Default::default()
        },
        EnvVar {
            name: PERMISSION_ENV.to_string(),
            value: Some(PERMISSION_ALLOW_ALL.to_string()),
            ..Default::default()
        },
    ];
    if let Some(path) = &cfg.agent_config_mount_path {
        env.push(EnvVar {
            name: "OPENCODE_CONFIG".to_string(),
            value: Some(path.clone()),
            ..Default::default()
        });
    }

    // 5. credentials
    let mut worker_mounts = vec![tools_mount.clone(), workspace_mount.clone()];
    let mut env_from = Vec::new();
    for (idx, cred) in cfg.credentials.iter().enumerate() {
        match (&cred.key, &cred.mount_path) {
            (Some(key), None) => {
                let env_name = cred.env_name.clone().unwrap_or_else(|| key.clone());
                env.push(EnvVar {
                    name: env_name,
                    value_from: Some(EnvVarSource {
                        secret_key_ref: Some(SecretKeySelector {
                            name: Some(cred.secret_name.clone()),
                            key: key.clone(),
                            optional: None,
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                });
            }
            (Some(key), Some(mount_path)) => {
                let vol_name = format!("cred-{idx}");
                volumes.push(Volume {
                    name: vol_name.clone(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some(cred.secret_name.clone()),
                        items: Some(vec![k8s_openapi::api::core::v1::KeyToPath {
                            key: key.clone(),
                            path: file_name(mount_path),
                            mode: cred.file_mode,
                        }]),
                        ..Default::default()
                    }),
                    ..Default::default()
                });
                worker_mounts.push(VolumeMount {
                    name: vol_name,
                    mount_path: mount_path.clone(),
                    sub_path: Some(file_name(mount_path)),
                    ..Default::default()
                });
            }
            (None, Some(mount_path)) => {
                let vol_name = format!("cred-{idx}");
                volumes.push(Volume {
                    name: vol_name.clone(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some(cred.secret_name.clone()),
                        default_mode: cred.file_mode,
                        ..Default::default()
                    }),
                    ..Default::default()
                });
                worker_mounts.push(VolumeMount {
                    name: vol_name,
                    mount_path: mount_path.clone(),
                    ..Default::default()
                });
            }
            (None, None) => {
                env_from.push(EnvFromSource {
                    secret_ref: Some(SecretEnvSource {
                        name: Some(cred.secret_name.clone()),
                        optional: None,
                    }),
                    ..Default::default()
                });
            }
        }
    }

    // 6. context ConfigMap / synthetic per-parent-dir volumes for out-of-workspace files
    if let Some(cm_name) = &input.context_config_map_name {
        volumes.push(Volume {
            name: CONTEXT_VOLUME.to_string(),
            config_map: Some(k8s_openapi::api::core::v1::ConfigMapVolumeSource {
                name: Some(cm_name.clone()),
                ..Default::default()
            }),
            ..Default::default()
        });

        let mut extra_volumes: BTreeMap<String, String> = BTreeMap::new();
        let mut copy_cmds = Vec::new();
        for file in input.files {
            let key = crate::context_resolver::sanitize_key(&file.path);
            let src = format!("{CONTEXT_MOUNT_PATH}/{key}");
            copy_cmds.push(format!("mkdir -p \"$(dirname '{0}')\"", file.path));
            copy_cmds.push(format!("cp '{src}' '{0}'", file.path));
            if let Some(mode) = file.file_mode {
                copy_cmds.push(format!("chmod {mode:o} '{0}'", file.path));
            }
            if !file.path.starts_with(workspace_dir) {
                let parent = parent_dir(&file.path);
                extra_volumes
                    .entry(parent.clone())
                    .or_insert_with(|| format!("context-out-{}", extra_volumes.len()));
            }
        }

        let mut context_init_mounts = vec![VolumeMount {
            name: CONTEXT_VOLUME.to_string(),
            mount_path: CONTEXT_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        }];
        context_init_mounts.push(workspace_mount.clone());

        for (parent, vol_name) in &extra_volumes {
            volumes.push(Volume {
                name: vol_name.clone(),
                empty_dir: Some(Default::default()),
                ..Default::default()
            });
            context_init_mounts.push(VolumeMount {
                name: vol_name.clone(),
                mount_path: parent.clone(),
                ..Default::default()
            });
            worker_mounts.push(VolumeMount {
                name: vol_name.clone(),
                mount_path: parent.clone(),
                ..Default::default()
            });
        }

        init_containers.push(Container {
            name: "context-init".to_string(),
            image: Some(cfg.init_image.clone()),
            command: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                copy_cmds.join(" && "),
            ]),
            volume_mounts: Some(context_init_mounts),
            ..Default::default()
        });

        for dir in input.dirs {
            volumes.push(Volume {
                name: format!("dir-{}", dir.config_map_name),
                config_map: Some(k8s_openapi::api::core::v1::ConfigMapVolumeSource {
                    name: Some(dir.config_map_name.clone()),
                    optional: Some(dir.optional),
                    default_mode: dir.file_mode.map(|m| m as i32),
                    ..Default::default()
                }),
                ..Default::default()
            });
            worker_mounts.push(VolumeMount {
                name: format!("dir-{}", dir.config_map_name),
                mount_path: dir.path.clone(),
                ..Default::default()
            });
        }
    }

    // 7. git contexts
    if !input.gits.is_empty() {
        volumes.push(Volume {
            name: GITCONFIG_VOLUME.to_string(),
            empty_dir: Some(Default::default()),
            ..Default::default()
        });
        env.push(EnvVar {
            name: "GIT_CONFIG_GLOBAL".to_string(),
            value: Some(format!("{GITCONFIG_PATH}/.gitconfig")),
            ..Default::default()
        });
        worker_mounts.push(VolumeMount {
            name: GITCONFIG_VOLUME.to_string(),
            mount_path: GITCONFIG_PATH.to_string(),
            ..Default::default()
        });

        for (idx, git) in input.gits.iter().enumerate() {
            let vol_name = format!("git-{idx}");
            volumes.push(Volume {
                name: vol_name.clone(),
                empty_dir: Some(Default::default()),
                ..Default::default()
            });
            let mut git_env = vec![
                EnvVar {
                    name: "GIT_REPO".to_string(),
                    value: Some(git.repository.clone()),
                    ..Default::default()
                },
                EnvVar {
                    name: "GIT_REF".to_string(),
                    value: Some(git.git_ref.clone()),
                    ..Default::default()
                },
                EnvVar {
                    name: "GIT_DEPTH".to_string(),
                    value: Some(git.depth.to_string()),
                    ..Default::default()
                },
                EnvVar {
                    name: "GIT_ROOT".to_string(),
                    value: Some("/git-root".to_string()),
                    ..Default::default()
                },
                EnvVar {
                    name: "GIT_LINK".to_string(),
                    value: Some(git.path.clone()),
                    ..Default::default()
                },
            ];
            if let Some(secret) = &git.auth_secret {
                git_env.push(EnvVar {
                    name: "GIT_USERNAME".to_string(),
                    value_from: Some(EnvVarSource {
                        secret_key_ref: Some(SecretKeySelector {
                            name: Some(secret.clone()),
                            key: "username".to_string(),
                            optional: None,
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                });
                git_env.push(EnvVar {
                    name: "GIT_PASSWORD".to_string(),
                    value_from: Some(EnvVarSource {
                        secret_key_ref: Some(SecretKeySelector {
                            name: Some(secret.clone()),
                            key: "password".to_string(),
                            optional: None,
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                });
            }
            init_containers.push(Container {
                name: format!("git-init-{idx}"),
                image: Some(cfg.init_image.clone()),
                command: Some(vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    "git-checkout".to_string(),
                ]),
                env: Some(git_env),
                volume_mounts: Some(vec![
                    VolumeMount {
                        name: vol_name.clone(),
                        mount_path: "/git-root".to_string(),
                        ..Default::default()
                    },
                    VolumeMount {
                        name: GITCONFIG_VOLUME.to_string(),
                        mount_path: GITCONFIG_PATH.to_string(),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            });
            let sub_path = git.path_in_repo.clone();
            worker_mounts.push(VolumeMount {
                name: vol_name,
                mount_path: git.path.clone(),
                sub_path,
                ..Default::default()
            });
        }
    }

    // 8. worker container
    let (image, command) = match (&input.server_url, &cfg.attach_image) {
        (Some(server_url), Some(attach_image)) => (
            attach_image.clone(),
            cfg.command.clone().unwrap_or_else(|| {
                default_command(&format!(
                    "agent run --attach {server_url} \"$(cat {workspace_dir}/task.md)\""
                ))
            }),
        ),
        _ => (
            cfg.worker_image.clone(),
            cfg.command.clone().unwrap_or_else(|| {
                default_command(&format!("agent run \"$(cat {workspace_dir}/task.md)\""))
            }),
        ),
    };

    let worker = Container {
        name: "agent".to_string(),
        image: Some(image),
        command: Some(command),
        env: Some(env),
        env_from: if env_from.is_empty() {
            None
        } else {
            Some(env_from)
        },
        volume_mounts: Some(worker_mounts),
        resources: cfg.resources.clone(),
        ..Default::default()
    };

    // 9. pod spec
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), "kubetask-worker".to_string());
    labels.insert("kubetask.io/task".to_string(), input.pod_name.clone());
    for (k, v) in &cfg.pod_labels {
        labels.insert(k.clone(), v.clone());
    }

    let mut annotations = BTreeMap::new();
    annotations.insert(
        kubetask_common::annotations::SPEC_HASH.to_string(),
        input.spec_hash,
    );

    let spec = PodSpec {
        init_containers: Some(init_containers),
        containers: vec![worker],
        volumes: Some(volumes),
        restart_policy: Some("Never".to_string()),
        service_account_name: Some(cfg.service_account.clone()),
        node_selector: cfg.node_selector.clone(),
        tolerations: cfg.tolerations.clone(),
        affinity: cfg.affinity.clone(),
        runtime_class_name: cfg.runtime_class_name.clone(),
        ..Default::default()
    };

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(input.pod_name),
            namespace: Some(input.pod_namespace),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: input.owner_ref.map(|r| vec![r]),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    })
}

fn default_command(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

fn file_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

fn parent_dir(path: &str) -> String {
    match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
        None => "/".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent_config() -> PodAgentConfig {
        PodAgentConfig {
            worker_image: "worker:latest".to_string(),
            init_image: "init:latest".to_string(),
            attach_image: None,
            command: None,
            workspace_dir: "/workspace".to_string(),
            service_account: "default".to_string(),
            node_selector: None,
            tolerations: None,
            affinity: None,
            runtime_class_name: None,
            resources: None,
            pod_labels: BTreeMap::new(),
            credentials: Vec::new(),
            agent_config_mount_path: None,
        }
    }

    #[test]
    fn minimal_pod_has_expected_containers_and_volumes() {
        let cfg = agent_config();
        let pod = build_pod(PodBuildInput {
            pod_name: "t1-pod".to_string(),
            pod_namespace: "default".to_string(),
            agent_config: &cfg,
            context_config_map_name: None,
            files: &[],
            dirs: &[],
            gits: &[],
            server_url: None,
            owner_ref: None,
            spec_hash: "abc".to_string(),
        })
        .unwrap();

        let spec = pod.spec.unwrap();
        let init_names: Vec<_> = spec
            .init_containers
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(init_names, vec!["agent-init".to_string()]);
        assert_eq!(spec.containers.len(), 1);
        assert_eq!(spec.containers[0].name, "agent");
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        let volume_names: Vec<_> = spec.volumes.unwrap().into_iter().map(|v| v.name).collect();
        assert_eq!(volume_names, vec!["tools".to_string(), "workspace".to_string()]);
    }

    #[test]
    fn context_configmap_adds_context_init_container() {
        let cfg = agent_config();
        let files = vec![FileMount {
            path: "/workspace/task.md".to_string(),
            content: "hello".to_string(),
            file_mode: None,
        }];
        let pod = build_pod(PodBuildInput {
            pod_name: "t1-pod".to_string(),
            pod_namespace: "default".to_string(),
            agent_config: &cfg,
            context_config_map_name: Some("t1-context".to_string()),
            files: &files,
            dirs: &[],
            gits: &[],
            server_url: None,
            owner_ref: None,
            spec_hash: "abc".to_string(),
        })
        .unwrap();
        let spec = pod.spec.unwrap();
        let init_names: Vec<_> = spec
            .init_containers
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(init_names, vec!["agent-init".to_string(), "context-init".to_string()]);
    }

    #[test]
    fn attach_mode_uses_attach_image_and_server_url() {
        let mut cfg = agent_config();
        cfg.attach_image = Some("attach:latest".to_string());
        let pod = build_pod(PodBuildInput {
            pod_name: "t1-pod".to_string(),
            pod_namespace: "default".to_string(),
            agent_config: &cfg,
            context_config_map_name: None,
            files: &[],
            dirs: &[],
            gits: &[],
            server_url: Some("http://agent-server:9000".to_string()),
            owner_ref: None,
            spec_hash: "abc".to_string(),
        })
        .unwrap();
        let spec = pod.spec.unwrap();
        assert_eq!(spec.containers[0].image.as_deref(), Some("attach:latest"));
        let cmd = spec.containers[0].command.clone().unwrap();
        assert!(cmd.iter().any(|s| s.contains("--attach http://agent-server:9000")));
    }

    #[test]
    fn git_context_adds_one_init_container_and_gitconfig_env() {
        let cfg = agent_config();
        let gits = vec![GitMount {
            path: "/workspace/repo".to_string(),
            repository: "https://example.com/r.git".to_string(),
            git_ref: "HEAD".to_string(),
            path_in_repo: None,
            depth: 1,
            auth_secret: None,
            file_mode: None,
        }];
        let pod = build_pod(PodBuildInput {
            pod_name: "t1-pod".to_string(),
            pod_namespace: "default".to_string(),
            agent_config: &cfg,
            context_config_map_name: None,
            files: &[],
            dirs: &[],
            gits: &gits,
            server_url: None,
            owner_ref: None,
            spec_hash: "abc".to_string(),
        })
        .unwrap();
        let spec = pod.spec.unwrap();
        let init_names: Vec<_> = spec
            .init_containers
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert!(init_names.contains(&"git-init-0".to_string()));
        let env = spec.containers[0].env.clone().unwrap();
        assert!(env.iter().any(|e| e.name == "GIT_CONFIG_GLOBAL"));
    }

    #[test]
    fn credential_key_and_env_becomes_env_var() {
        let mut cfg = agent_config();
        cfg.credentials.push(Credential {
            secret_name: "creds".to_string(),
            key: Some("token".to_string()),
            mount_path: None,
            env_name: Some("API_TOKEN".to_string()),
            file_mode: None,
        });
        let pod = build_pod(PodBuildInput {
            pod_name: "t1-pod".to_string(),
            pod_namespace: "default".to_string(),
            agent_config: &cfg,
            context_config_map_name: None,
            files: &[],
            dirs: &[],
            gits: &[],
            server_url: None,
            owner_ref: None,
            spec_hash: "abc".to_string(),
        })
        .unwrap();
        let env = pod.spec.unwrap().containers[0].env.clone().unwrap();
        assert!(env.iter().any(|e| e.name == "API_TOKEN"));
    }

    #[test]
    fn credential_whole_secret_no_key_no_mount_uses_env_from() {
        let mut cfg = agent_config();
        cfg.credentials.push(Credential {
            secret_name: "creds".to_string(),
            key: None,
            mount_path: None,
            env_name: None,
            file_mode: None,
        });
        let pod = build_pod(PodBuildInput {
            pod_name: "t1-pod".to_string(),
            pod_namespace: "default".to_string(),
            agent_config: &cfg,
            context_config_map_name: None,
            files: &[],
            dirs: &[],
            gits: &[],
            server_url: None,
            owner_ref: None,
            spec_hash: "abc".to_string(),
        })
        .unwrap();
        let env_from = pod.spec.unwrap().containers[0].env_from.clone().unwrap();
        assert_eq!(env_from.len(), 1);
        assert_eq!(
            env_from[0].secret_ref.as_ref().unwrap().name.as_deref(),
            Some("creds")
        );
    }
}
