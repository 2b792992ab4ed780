//! Safe string-substitution rendering of `description` fields against the
//! payload+headers data map. `handlebars` with helpers disabled gives
//! `{{field}}` interpolation without arbitrary code execution.

use handlebars::Handlebars;
use serde_json::Value;

use kubetask_types::{ResourceTemplate, TaskSpec, WorkflowSpec};

use crate::error::Error;

fn engine() -> Handlebars<'static> {
    let mut hb = Handlebars::new();
    hb.set_strict_mode(false);
    hb
}

fn render_string(hb: &Handlebars, template: &str, data: &Value) -> Result<String, Error> {
    hb.render_template(template, data)
        .map_err(|e| Error::Template(e.to_string()))
}

fn render_task(hb: &Handlebars, task: &mut TaskSpec, data: &Value) -> Result<(), Error> {
    if let Some(description) = &task.description {
        task.description = Some(render_string(hb, description, data)?);
    }
    Ok(())
}

fn render_workflow(hb: &Handlebars, workflow: &mut WorkflowSpec, data: &Value) -> Result<(), Error> {
    for stage in &mut workflow.stages {
        for named_task in &mut stage.tasks {
            render_task(hb, &mut named_task.task, data)?;
        }
    }
    Ok(())
}

pub fn render(template: &ResourceTemplate, data: &Value) -> Result<ResourceTemplate, Error> {
    let hb = engine();
    let mut rendered = template.clone();
    match &mut rendered {
        ResourceTemplate::Task { task } => render_task(&hb, task, data)?,
        ResourceTemplate::WorkflowRef { .. } => {}
        ResourceTemplate::WorkflowRun { workflow_run } => {
            if let Some(inline) = &mut workflow_run.inline {
                render_workflow(&hb, inline, data)?;
            }
        }
    }
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubetask_types::{NamedTaskSpec, StageSpec, WorkflowRunSpec};
    use serde_json::json;

    #[test]
    fn renders_task_description() {
        let template = ResourceTemplate::Task {
            task: TaskSpec {
                description: Some("build {{commit}}".to_string()),
                agent_ref: None,
                task_template_ref: None,
                contexts: vec![],
                outputs: None,
            },
        };
        let data = json!({"commit": "abc"});
        let rendered = render(&template, &data).unwrap();
        match rendered {
            ResourceTemplate::Task { task } => {
                assert_eq!(task.description.as_deref(), Some("build abc"));
            }
            _ => panic!("expected Task variant"),
        }
    }

    #[test]
    fn renders_every_stage_task_in_inline_workflow() {
        let template = ResourceTemplate::WorkflowRun {
            workflow_run: WorkflowRunSpec {
                workflow_ref: None,
                inline: Some(WorkflowSpec {
                    stages: vec![StageSpec {
                        name: Some("lint".to_string()),
                        tasks: vec![NamedTaskSpec {
                            name: "lint".to_string(),
                            task: TaskSpec {
                                description: Some("lint {{repo}}".to_string()),
                                agent_ref: None,
                                task_template_ref: None,
                                contexts: vec![],
                                outputs: None,
                            },
                        }],
                    }],
                }),
            },
        };
        let data = json!({"repo": "kubetask"});
        let rendered = render(&template, &data).unwrap();
        match rendered {
            ResourceTemplate::WorkflowRun { workflow_run } => {
                let task = &workflow_run.inline.unwrap().stages[0].tasks[0].task;
                assert_eq!(task.description.as_deref(), Some("lint kubetask"));
            }
            _ => panic!("expected WorkflowRun variant"),
        }
    }

    #[test]
    fn missing_field_renders_empty_in_non_strict_mode() {
        let template = ResourceTemplate::Task {
            task: TaskSpec {
                description: Some("build {{missing}}".to_string()),
                agent_ref: None,
                task_template_ref: None,
                contexts: vec![],
                outputs: None,
            },
        };
        let rendered = render(&template, &json!({})).unwrap();
        match rendered {
            ResourceTemplate::Task { task } => {
                assert_eq!(task.description.as_deref(), Some("build "));
            }
            _ => panic!("expected Task variant"),
        }
    }
}
