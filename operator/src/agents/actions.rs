use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::api::Resource;
use kube::{Api, Client, ResourceExt};

use kubetask_types::{Agent, AgentServerStatus, AgentStatus};

use super::server_builder::{
    self, ServerDeploymentInput, ServerServiceInput,
};
use crate::util::{Error, patch::patch_status};

fn instance_name(instance: &Agent) -> Result<&str, Error> {
    instance
        .meta()
        .name
        .as_deref()
        .ok_or_else(|| Error::UserInput("Agent is missing metadata.name".to_string()))
}

fn instance_namespace(instance: &Agent) -> Result<&str, Error> {
    instance
        .meta()
        .namespace
        .as_deref()
        .ok_or_else(|| Error::UserInput("Agent is missing metadata.namespace".to_string()))
}

pub async fn fetch_deployment(client: Client, namespace: &str, name: &str) -> Result<Option<Deployment>, Error> {
    let api: Api<Deployment> = Api::namespaced(client, namespace);
    match api.get(name).await {
        Ok(d) => Ok(Some(d)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub async fn fetch_service(client: Client, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
    let api: Api<Service> = Api::namespaced(client, namespace);
    match api.get(name).await {
        Ok(s) => Ok(Some(s)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub async fn converge(client: Client, instance: &Agent, port: u16) -> Result<(), Error> {
    let namespace = instance_namespace(instance)?;
    let name = instance_name(instance)?;
    let owner_ref = instance.controller_owner_ref(&()).unwrap();

    let deployment_name = server_builder::server_deployment_name(name);
    let desired_deployment = server_builder::build_server_deployment(ServerDeploymentInput {
        agent_name: name,
        namespace,
        worker_image: &instance.spec.worker_image,
        service_account: &instance.spec.service_account,
        port,
        owner_ref: owner_ref.clone(),
    });
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    match deployments.get(&deployment_name).await {
        Ok(_) => {
            deployments
                .replace(&deployment_name, &Default::default(), &desired_deployment)
                .await?;
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            deployments.create(&Default::default(), &desired_deployment).await?;
        }
        Err(e) => return Err(e.into()),
    }

    let existing_cluster_ip = fetch_service(client.clone(), namespace, name)
        .await?
        .and_then(|s| s.spec.and_then(|sp| sp.cluster_ip))
        .filter(|ip| ip != "None");
    let desired_service = server_builder::build_server_service(ServerServiceInput {
        agent_name: name,
        namespace,
        port,
        owner_ref,
        existing_cluster_ip,
    });
    let services: Api<Service> = Api::namespaced(client.clone(), namespace);
    match services.get(name).await {
        Ok(_) => {
            services.replace(name, &Default::default(), &desired_service).await?;
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            services.create(&Default::default(), &desired_service).await?;
        }
        Err(e) => return Err(e.into()),
    }

    let ready_replicas = deployments
        .get(&deployment_name)
        .await?
        .status
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);

    patch_status::<AgentStatus, Agent>(client, instance, |status: &mut AgentStatus| {
        status.server = Some(AgentServerStatus {
            url: Some(server_builder::in_cluster_url(name, namespace, port)),
            ready_replicas,
        });
    })
    .await?;

    Ok(())
}

pub async fn teardown(client: Client, instance: &Agent) -> Result<(), Error> {
    let namespace = instance_namespace(instance)?;
    let name = instance_name(instance)?;
    let deployment_name = server_builder::server_deployment_name(name);

    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    match deployments.delete(&deployment_name, &Default::default()).await {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
        Err(e) => return Err(e.into()),
    }

    let services: Api<Service> = Api::namespaced(client.clone(), namespace);
    match services.delete(name, &Default::default()).await {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
        Err(e) => return Err(e.into()),
    }

    patch_status::<AgentStatus, Agent>(client, instance, |status: &mut AgentStatus| {
        status.server = None;
    })
    .await?;

    Ok(())
}
