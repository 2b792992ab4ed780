//! Merge-by-`type_` helper shared by every reconciler that maintains a
//! `Vec<Condition>` status field (Agent, Task, WorkflowRun, CronTask,
//! CronWorkflow, WebhookTrigger). Follows the conventional Kubernetes
//! merge rule: a condition's `lastTransitionTime` only advances when its
//! `status` actually flips; `reason`/`message` update unconditionally so a
//! stale message doesn't linger once the underlying cause changes wording.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use k8s_openapi::jiff::Timestamp;

pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: bool,
    reason: &str,
    message: &str,
) {
    let status_str = if status { "True" } else { "False" };
    let now = Time(Timestamp::now());

    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status != status_str {
            existing.last_transition_time = now;
        }
        existing.status = status_str.to_string();
        existing.reason = reason.to_string();
        existing.message = message.to_string();
        return;
    }

    conditions.push(Condition {
        type_: type_.to_string(),
        status: status_str.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: now,
        observed_generation: None,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_condition_is_appended() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, "Ready", true, "AllGood", "everything is fine");
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, "True");
    }

    #[test]
    fn unchanged_status_keeps_transition_time_but_updates_message() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, "Ready", false, "Waiting", "first message");
        let first_time = conditions[0].last_transition_time.clone();
        set_condition(&mut conditions, "Ready", false, "Waiting", "second message");
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].message, "second message");
        assert_eq!(conditions[0].last_transition_time.0, first_time.0);
    }

    #[test]
    fn status_flip_bumps_transition_time() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, "Ready", false, "Waiting", "not yet");
        let first_time = conditions[0].last_transition_time.clone();
        std::thread::sleep(std::time::Duration::from_millis(2));
        set_condition(&mut conditions, "Ready", true, "Done", "ready now");
        assert_ne!(conditions[0].last_transition_time.0, first_time.0);
        assert_eq!(conditions[0].status, "True");
    }
}
