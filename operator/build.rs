use kube::CustomResourceExt;
use kubetask_types::*;
use std::fs;

fn main() {
    let _ = fs::create_dir("../crds");
    let crds: &[(&str, serde_yaml::Value)] = &[
        (
            "kubetask.io_agents",
            serde_yaml::to_value(Agent::crd()).unwrap(),
        ),
        (
            "kubetask.io_tasks",
            serde_yaml::to_value(Task::crd()).unwrap(),
        ),
        (
            "kubetask.io_tasktemplates",
            serde_yaml::to_value(TaskTemplate::crd()).unwrap(),
        ),
        (
            "kubetask.io_workflows",
            serde_yaml::to_value(Workflow::crd()).unwrap(),
        ),
        (
            "kubetask.io_workflowruns",
            serde_yaml::to_value(WorkflowRun::crd()).unwrap(),
        ),
        (
            "kubetask.io_crontasks",
            serde_yaml::to_value(CronTask::crd()).unwrap(),
        ),
        (
            "kubetask.io_cronworkflows",
            serde_yaml::to_value(CronWorkflow::crd()).unwrap(),
        ),
        (
            "kubetask.io_webhooktriggers",
            serde_yaml::to_value(WebhookTrigger::crd()).unwrap(),
        ),
    ];
    for (name, value) in crds {
        fs::write(
            format!("../crds/{name}_crd.yaml"),
            serde_yaml::to_string(value).unwrap(),
        )
        .unwrap();
    }
}
