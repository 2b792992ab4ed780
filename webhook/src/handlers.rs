use std::collections::HashMap;

use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Api, Client, api::PostParams};
use serde_json::{Value, json};

use kubetask_common::annotations;
use kubetask_types::{
    ConcurrencyPolicy, MatchPolicy, ResourceTemplate, Task, TriggerRule, WebhookAuth,
    WebhookTrigger, WebhookTriggerSpec, WorkflowRun,
};

use crate::concurrency::{self, Decision};
use crate::error::Error;
use crate::filter;
use crate::registry::Registry;
use crate::status;
use crate::template;

#[derive(Clone)]
pub struct AppState {
    pub client: Client,
    pub registry: Registry,
}

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn readyz() -> &'static str {
    "ok"
}

struct Selected<'a> {
    rule_name: Option<&'a str>,
    concurrency: ConcurrencyPolicy,
    template: &'a ResourceTemplate,
}

pub async fn webhook_handler(
    Path((namespace, name)): Path<(String, String)>,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<(StatusCode, Json<Value>), Error> {
    let spec = state
        .registry
        .get(&namespace, &name)
        .await
        .ok_or_else(|| Error::UnknownTrigger(namespace.clone(), name.clone()))?;

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| Error::BadBody(format!("request body is not valid JSON: {e}")))?;

    authenticate(&state.client, &namespace, spec.auth.as_ref(), &headers, &body).await?;

    let lowered_headers = lowered_headers(&headers);
    let template_data = merge_headers_into_payload(&payload, &lowered_headers);

    let selections = select(&spec, &payload, &lowered_headers)?;
    if selections.is_empty() {
        return Ok((StatusCode::OK, Json(json!({ "status": "filtered" }))));
    }

    let mut created = Vec::new();
    let mut skipped_rules = Vec::new();

    for selected in &selections {
        let decision = concurrency::apply(
            state.client.clone(),
            &namespace,
            &name,
            selected.rule_name,
            selected.concurrency,
        )
        .await?;

        match decision {
            Decision::Skip => {
                if let Some(rule) = selected.rule_name {
                    skipped_rules.push(rule.to_string());
                }
                continue;
            }
            Decision::Proceed => {
                let rendered = template::render(selected.template, &template_data)?;
                let resource_name = materialize(
                    state.client.clone(),
                    &namespace,
                    &name,
                    selected.rule_name,
                    &rendered,
                )
                .await?;
                created.push(resource_name);
            }
        }
    }

    record_status(&state, &namespace, &name, &selections, &created).await?;

    let (status_code, response) = if created.is_empty() {
        (
            StatusCode::OK,
            json!({ "status": "skipped", "skippedRules": skipped_rules }),
        )
    } else if skipped_rules.is_empty() {
        (
            StatusCode::CREATED,
            json!({ "status": "created", "resources": created, "namespace": namespace }),
        )
    } else {
        (
            StatusCode::OK,
            json!({
                "status": "partial",
                "resources": created,
                "skippedRules": skipped_rules,
                "namespace": namespace,
            }),
        )
    };

    Ok((status_code, Json(response)))
}

fn lowered_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for name in headers.keys() {
        let key = name.as_str().to_lowercase();
        if out.contains_key(&key) {
            continue;
        }
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            out.insert(key, value.to_string());
        }
    }
    out
}

/// Template rendering wants the payload's own fields addressable at the top
/// level (`{{commit}}`), with `headers` merged in alongside them.
fn merge_headers_into_payload(payload: &Value, headers: &HashMap<String, String>) -> Value {
    let mut merged = match payload {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    merged.insert(
        "headers".to_string(),
        serde_json::to_value(headers).unwrap_or(Value::Null),
    );
    Value::Object(merged)
}

async fn authenticate(
    client: &Client,
    namespace: &str,
    auth: Option<&WebhookAuth>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), Error> {
    let Some(auth) = auth else {
        return Ok(());
    };
    match auth {
        WebhookAuth::Hmac { secret_name, header } => {
            let secret_value = fetch_secret_key(client, namespace, secret_name, "secret").await?;
            let header_value = crate::auth::header_value(headers, header)?;
            crate::auth::verify_hmac(&secret_value, header_value, body)
        }
        WebhookAuth::Token { secret_name, header } => {
            let secret_value = fetch_secret_key(client, namespace, secret_name, "token").await?;
            let expected = String::from_utf8(secret_value)
                .map_err(|_| Error::Auth("token secret is not valid UTF-8".to_string()))?;
            let header_value = crate::auth::header_value(headers, header)?;
            crate::auth::verify_token(&expected, header_value)
        }
    }
}

async fn fetch_secret_key(
    client: &Client,
    namespace: &str,
    secret_name: &str,
    key: &str,
) -> Result<Vec<u8>, Error> {
    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secret = api.get(secret_name).await?;
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|b| b.0.clone())
        .ok_or_else(|| Error::Auth(format!("secret {secret_name} has no key {key}")))
}

fn select<'a>(
    spec: &'a WebhookTriggerSpec,
    payload: &Value,
    headers: &HashMap<String, String>,
) -> Result<Vec<Selected<'a>>, Error> {
    if !spec.rules.is_empty() {
        return Ok(select_rules(&spec.rules, spec.match_policy, payload, headers));
    }

    let Some(filter_expr) = spec.filter.as_deref() else {
        return Ok(Vec::new());
    };
    // A genuine filter-evaluation failure is logged and treated as no-match
    // for this trigger, per spec §7's FilterError row — not surfaced as a 400.
    match filter::evaluate(filter_expr, payload, headers) {
        Ok(true) => {}
        Ok(false) => return Ok(Vec::new()),
        Err(e) => {
            eprintln!("webhook filter evaluation failed, treating as no-match: {e}");
            return Ok(Vec::new());
        }
    }
    let template = spec
        .resource_template
        .as_ref()
        .ok_or_else(|| Error::Template("trigger has a filter but no resourceTemplate".to_string()))?;
    Ok(vec![Selected {
        rule_name: None,
        concurrency: spec.concurrency_policy.unwrap_or_default(),
        template,
    }])
}

fn select_rules<'a>(
    rules: &'a [TriggerRule],
    policy: MatchPolicy,
    payload: &Value,
    headers: &HashMap<String, String>,
) -> Vec<Selected<'a>> {
    let mut selected = Vec::new();
    for rule in rules {
        // Per spec §7's FilterError row: log and treat this rule as a
        // non-match rather than failing the whole request.
        match filter::evaluate(&rule.filter, payload, headers) {
            Ok(true) => {
                selected.push(Selected {
                    rule_name: Some(rule.name.as_str()),
                    concurrency: rule.concurrency_policy.unwrap_or_default(),
                    template: &rule.resource_template,
                });
                if policy == MatchPolicy::First {
                    break;
                }
            }
            Ok(false) => {}
            Err(e) => {
                eprintln!(
                    "webhook filter evaluation failed for rule '{}', treating as no-match: {e}",
                    rule.name
                );
            }
        }
    }
    selected
}

async fn materialize(
    client: Client,
    namespace: &str,
    trigger_name: &str,
    rule_name: Option<&str>,
    template: &ResourceTemplate,
) -> Result<String, Error> {
    let mut labels = std::collections::BTreeMap::new();
    labels.insert(annotations::WEBHOOK_TRIGGER.to_string(), trigger_name.to_string());
    if let Some(rule) = rule_name {
        labels.insert(annotations::WEBHOOK_RULE.to_string(), rule.to_string());
    }

    let generate_name = match rule_name {
        Some(rule) => format!("{trigger_name}-{rule}-"),
        None => format!("{trigger_name}-"),
    };

    match template {
        ResourceTemplate::Task { task } => {
            labels.insert(annotations::RESOURCE_KIND.to_string(), "Task".to_string());
            let resource = Task {
                metadata: ObjectMeta {
                    generate_name: Some(generate_name),
                    namespace: Some(namespace.to_string()),
                    labels: Some(labels),
                    ..Default::default()
                },
                spec: task.clone(),
                status: None,
            };
            let api: Api<Task> = Api::namespaced(client, namespace);
            let created = api.create(&PostParams::default(), &resource).await?;
            Ok(created.metadata.name.unwrap_or_default())
        }
        ResourceTemplate::WorkflowRef { workflow_ref } => {
            labels.insert(annotations::RESOURCE_KIND.to_string(), "WorkflowRun".to_string());
            let resource = WorkflowRun {
                metadata: ObjectMeta {
                    generate_name: Some(generate_name),
                    namespace: Some(namespace.to_string()),
                    labels: Some(labels),
                    ..Default::default()
                },
                spec: kubetask_types::WorkflowRunSpec {
                    workflow_ref: Some(workflow_ref.clone()),
                    inline: None,
                },
                status: None,
            };
            let api: Api<WorkflowRun> = Api::namespaced(client, namespace);
            let created = api.create(&PostParams::default(), &resource).await?;
            Ok(created.metadata.name.unwrap_or_default())
        }
        ResourceTemplate::WorkflowRun { workflow_run } => {
            labels.insert(annotations::RESOURCE_KIND.to_string(), "WorkflowRun".to_string());
            let resource = WorkflowRun {
                metadata: ObjectMeta {
                    generate_name: Some(generate_name),
                    namespace: Some(namespace.to_string()),
                    labels: Some(labels),
                    ..Default::default()
                },
                spec: workflow_run.clone(),
                status: None,
            };
            let api: Api<WorkflowRun> = Api::namespaced(client, namespace);
            let created = api.create(&PostParams::default(), &resource).await?;
            Ok(created.metadata.name.unwrap_or_default())
        }
    }
}

async fn record_status(
    state: &AppState,
    namespace: &str,
    name: &str,
    selections: &[Selected<'_>],
    created: &[String],
) -> Result<(), Error> {
    let api: Api<WebhookTrigger> = Api::namespaced(state.client.clone(), namespace);
    let instance = api.get(name).await?;

    let rule_names: Vec<&str> = selections.iter().filter_map(|s| s.rule_name).collect();

    status::patch_status(state.client.clone(), &instance, |status| {
        let now = status::rfc3339_now();
        status.last_triggered_time = Some(now.clone());
        status.total_triggered += created.len() as u64;
        status.active_resources.extend(created.iter().cloned());
        status.active_tasks.extend(created.iter().cloned());

        for rule in rule_names {
            if let Some(rule_status) = status.rules.iter_mut().find(|r| r.name == rule) {
                rule_status.last_triggered_time = Some(now.clone());
                rule_status.total_triggered += 1;
            } else {
                status.rules.push(kubetask_types::RuleStatus {
                    name: rule.to_string(),
                    last_triggered_time: Some(now.clone()),
                    total_triggered: 1,
                });
            }
        }
    })
    .await?;
    Ok(())
}
