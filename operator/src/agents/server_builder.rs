//! Deterministic, I/O-free construction of the long-lived server Deployment
//! and Service for an Agent running in server mode (spec §4.8).

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, HTTPGetAction, PodSpec, PodTemplateSpec, Probe, Service, ServiceSpec, ServicePort,
    TCPSocketAction,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use kube::api::ObjectMeta;

const READINESS_PATH: &str = "/session/status";

pub fn server_deployment_name(agent_name: &str) -> String {
    format!("{agent_name}-server")
}

pub struct ServerDeploymentInput<'a> {
    pub agent_name: &'a str,
    pub namespace: &'a str,
    pub worker_image: &'a str,
    pub service_account: &'a str,
    pub port: u16,
    pub owner_ref: OwnerReference,
}

pub fn build_server_deployment(input: ServerDeploymentInput) -> Deployment {
    let name = server_deployment_name(input.agent_name);
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), name.clone());
    labels.insert("kubetask.io/agent".to_string(), input.agent_name.to_string());

    let container = Container {
        name: "server".to_string(),
        image: Some(input.worker_image.to_string()),
        command: Some(vec!["agent".to_string()]),
        args: Some(vec![
            "serve".to_string(),
            "--port".to_string(),
            input.port.to_string(),
            "--hostname".to_string(),
            "0.0.0.0".to_string(),
        ]),
        ports: Some(vec![ContainerPort {
            container_port: input.port as i32,
            name: Some("http".to_string()),
            ..Default::default()
        }]),
        liveness_probe: Some(Probe {
            tcp_socket: Some(TCPSocketAction {
                port: k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(input.port as i32),
                ..Default::default()
            }),
            initial_delay_seconds: Some(5),
            period_seconds: Some(10),
            ..Default::default()
        }),
        readiness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some(READINESS_PATH.to_string()),
                port: k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(input.port as i32),
                ..Default::default()
            }),
            initial_delay_seconds: Some(5),
            period_seconds: Some(10),
            ..Default::default()
        }),
        ..Default::default()
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(input.namespace.to_string()),
            labels: Some(labels.clone()),
            owner_references: Some(vec![input.owner_ref]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(input.service_account.to_string()),
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub struct ServerServiceInput<'a> {
    pub agent_name: &'a str,
    pub namespace: &'a str,
    pub port: u16,
    pub owner_ref: OwnerReference,
    pub existing_cluster_ip: Option<String>,
}

pub fn build_server_service(input: ServerServiceInput) -> Service {
    let mut selector = BTreeMap::new();
    selector.insert("app".to_string(), server_deployment_name(input.agent_name));

    Service {
        metadata: ObjectMeta {
            name: Some(input.agent_name.to_string()),
            namespace: Some(input.namespace.to_string()),
            owner_references: Some(vec![input.owner_ref]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector),
            cluster_ip: input.existing_cluster_ip,
            ports: Some(vec![ServicePort {
                port: input.port as i32,
                target_port: Some(k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(
                    input.port as i32,
                )),
                name: Some("http".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn in_cluster_url(agent_name: &str, namespace: &str, port: u16) -> String {
    format!("http://{agent_name}.{namespace}.svc.cluster.local:{port}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn owner_ref() -> OwnerReference {
        OwnerReference {
            api_version: "kubetask.io/v1".to_string(),
            kind: "Agent".to_string(),
            name: "my-agent".to_string(),
            uid: "uid".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn deployment_name_is_suffixed() {
        assert_eq!(server_deployment_name("my-agent"), "my-agent-server");
    }

    #[test]
    fn deployment_has_single_replica_and_matching_selector() {
        let d = build_server_deployment(ServerDeploymentInput {
            agent_name: "my-agent",
            namespace: "ns",
            worker_image: "img:latest",
            service_account: "default",
            port: 8080,
            owner_ref: owner_ref(),
        });
        let spec = d.spec.unwrap();
        assert_eq!(spec.replicas, Some(1));
        assert_eq!(spec.selector.match_labels, spec.template.metadata.unwrap().labels);
    }

    #[test]
    fn service_preserves_existing_cluster_ip() {
        let svc = build_server_service(ServerServiceInput {
            agent_name: "my-agent",
            namespace: "ns",
            port: 8080,
            owner_ref: owner_ref(),
            existing_cluster_ip: Some("10.0.0.5".to_string()),
        });
        assert_eq!(svc.spec.unwrap().cluster_ip, Some("10.0.0.5".to_string()));
    }

    #[test]
    fn url_is_the_in_cluster_dns_form() {
        assert_eq!(in_cluster_url("my-agent", "ns", 8080), "http://my-agent.ns.svc.cluster.local:8080");
    }
}
