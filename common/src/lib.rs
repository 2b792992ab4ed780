use axum::http::HeaderMap;
use owo_colors::OwoColorize;
use std::net::IpAddr;

pub mod args;
pub mod metrics;
pub mod shutdown;

pub fn signal_ready() {
    std::fs::write("/etc/ready", "ready").expect("Failed to write readiness file");
}

/// Domain-prefixed label/annotation keys shared by the operator and webhook
/// server. See the data model's ownership and binding rules for who writes
/// which key.
pub mod annotations {
    pub const SPEC_HASH: &str = "kubetask.io/spec-hash";

    /// Set on a Pod by the Task reconciler, pointing back at the Agent it ran under.
    pub const AGENT: &str = "kubetask.io/agent";

    /// Set on a Task created by a CronTask.
    pub const CRONTASK: &str = "kubetask.io/crontask";

    /// Set on a WorkflowRun created by a CronWorkflow.
    pub const CRONWORKFLOW: &str = "kubetask.io/cronworkflow";

    /// Set on a Task created as part of a WorkflowRun stage.
    pub const WORKFLOW_RUN: &str = "kubetask.io/workflow-run";
    pub const WORKFLOW: &str = "kubetask.io/workflow";
    pub const STAGE: &str = "kubetask.io/stage";
    pub const STAGE_INDEX: &str = "kubetask.io/stage-index";

    /// Set on a resource created by a WebhookTrigger.
    pub const WEBHOOK_TRIGGER: &str = "kubetask.io/webhook-trigger";
    pub const WEBHOOK_RULE: &str = "kubetask.io/webhook-rule";
    pub const RESOURCE_KIND: &str = "kubetask.io/resource-kind";

    /// User-set annotation requesting a running Task be cancelled.
    pub const STOP: &str = "kubetask.io/stop";

    /// Comma-separated list of task names a WorkflowRun stage task depends on.
    pub const DEPENDS_ON: &str = "kubetask.io/depends-on";

    /// RFC3339 timestamp of when a cron-created resource was scheduled to run.
    pub const SCHEDULED_AT: &str = "kubetask.io/scheduled-at";

    /// Namespace a Task's Pod lives in, when the Agent serves a namespace
    /// other than the Task's own.
    pub const TASK_NAMESPACE: &str = "kubetask.io/task-namespace";

    /// Finalizer protecting cross-namespace Pod cleanup.
    pub const TASK_CLEANUP_FINALIZER: &str = "kubetask.io/task-cleanup";
}

pub fn init() {
    let disable_colors = ["1", "true"].contains(
        &std::env::var("DISABLE_COLORS")
            .unwrap_or_else(|_| String::new())
            .to_lowercase()
            .as_str(),
    );
    owo_colors::set_override(!disable_colors);
}

pub mod response {
    use std::fmt::{Debug, Display};

    use anyhow::Error;
    use axum::response::Response;
    use axum::{Json, http::StatusCode};

    use super::*;

    pub fn print_error<T>(e: T)
    where
        T: Into<Error> + Display + Debug,
    {
        eprintln!(
            "{}",
            format!("{:?}", e.into())
                .split("\n")
                .map(|s| s.red().to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        );
    }

    pub fn print_warning<T>(e: T)
    where
        T: Into<Error> + Display + Debug,
    {
        eprintln!(
            "{}",
            format!("{:?}", e.into())
                .split("\n")
                .map(|s| s.yellow().to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        );
    }

    pub fn err_resp<T>(e: T, code: StatusCode) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        let reason = format!("{}", e);
        print_error(e);
        (code, Json(serde_json::json!({"reason": reason}))).into_response()
    }

    pub fn not_found<T>(e: T) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        err_resp(e, StatusCode::NOT_FOUND)
    }

    pub fn conflict<T>(e: T) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        err_resp(e, StatusCode::CONFLICT)
    }

    pub fn error<T>(e: T) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        internal_server_error(e)
    }

    pub fn internal_server_error<T>(e: T) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        err_resp(e, StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn bad_request<T>(e: T) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        err_resp(e, StatusCode::BAD_REQUEST)
    }

    pub fn forbidden<T>(e: T) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        err_resp(e, StatusCode::FORBIDDEN)
    }

    pub fn unauthorized<T>(e: T) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        err_resp(e, StatusCode::UNAUTHORIZED)
    }

    pub fn service_unavailable<T>(e: T) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        err_resp(e, StatusCode::SERVICE_UNAVAILABLE)
    }
}

pub mod access_log {
    use super::*;

    pub async fn public(
        req: axum::extract::Request,
        next: axum::middleware::Next,
    ) -> axum::response::Response {
        request("WEBHOOK", req, next, false).await
    }

    pub async fn public_error_only(
        req: axum::extract::Request,
        next: axum::middleware::Next,
    ) -> axum::response::Response {
        request("WEBHOOK", req, next, true).await
    }

    pub async fn request(
        prefix: &str,
        req: axum::extract::Request,
        next: axum::middleware::Next,
        errors_only: bool,
    ) -> axum::response::Response {
        let ip = get_source_ip(req.headers())
            .map(|ip| ip.to_string())
            .unwrap_or("unknown".into());
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let start = std::time::Instant::now();
        let response = next.run(req).await;
        let duration = start.elapsed();
        let is_success = response.status().is_success();
        if is_success && errors_only {
            return response;
        }
        let (a, b) = if is_success {
            ((20, 163, 73), (25, 163, 118))
        } else {
            ((230, 126, 16), (171, 85, 17))
        };
        println!(
            "{} {} {} {} {} {}{}{} {}{}",
            format!("[{}]", prefix).truecolor(a.0, a.1, a.2),
            method.truecolor(b.0, b.1, b.2),
            path.truecolor(b.0, b.1, b.2),
            "->".truecolor(a.0, a.1, a.2),
            response.status().truecolor(b.0, b.1, b.2),
            "(".truecolor(a.0, a.1, a.2),
            format!("{:?}", duration).truecolor(b.0, b.1, b.2),
            ")".truecolor(a.0, a.1, a.2),
            "src=".magenta(),
            ip.magenta().dimmed(),
        );
        response
    }
}

pub fn get_source_ip(headers: &HeaderMap) -> Option<IpAddr> {
    if let Some(forwarded_for) = headers.get("x-forwarded-for")
        && let Ok(forwarded_for) = forwarded_for.to_str()
        && let Some(ip_str) = forwarded_for.split(',').next()
        && let Ok(ip) = ip_str.trim().parse()
    {
        return Some(ip);
    }

    if let Some(real_ip) = headers.get("x-real-ip")
        && let Ok(ip_str) = real_ip.to_str()
        && let Ok(ip) = ip_str.trim().parse()
    {
        return Some(ip);
    }

    None
}
