//! Pure stage-machine decisions for the `WorkflowRun` reconciler (spec §4.5).
//! Progress is always recounted from the live Task list; nothing here trusts
//! cached status beyond `currentStage`.

use kubetask_types::{NamedTaskSpec, StageSpec, TaskPhase, WorkflowRunStatus, WorkflowSpec};

/// Name of the Task materialized for `task` within a given WorkflowRun.
pub fn task_name_for(workflow_run_name: &str, task: &NamedTaskSpec) -> String {
    format!("{workflow_run_name}-{}", task.name)
}

/// Resolves the effective `WorkflowSpec` for a run: `inline` wins over `workflowRef`.
pub fn resolve_workflow_spec<'a>(
    inline: Option<&'a WorkflowSpec>,
    referenced: Option<&'a WorkflowSpec>,
) -> Option<&'a WorkflowSpec> {
    inline.or(referenced)
}

pub fn total_tasks(workflow: &WorkflowSpec) -> u32 {
    workflow.stages.iter().map(|s| s.tasks.len() as u32).sum()
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageClassification {
    pub completed: u32,
    pub failed: u32,
    pub total: u32,
}

pub fn classify_stage_tasks(stage: &StageSpec, phases: &[TaskPhase]) -> StageClassification {
    StageClassification {
        completed: phases.iter().filter(|p| **p == TaskPhase::Completed).count() as u32,
        failed: phases.iter().filter(|p| **p == TaskPhase::Failed).count() as u32,
        total: stage.tasks.len() as u32,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// Not every Task for the stage has reported in yet, or some are still running.
    Pending,
    /// At least one Task in the stage failed; fail the whole run.
    Failed,
    /// Every Task in the stage completed.
    Completed,
}

pub fn classify_outcome(c: &StageClassification) -> StageOutcome {
    if c.failed > 0 {
        StageOutcome::Failed
    } else if c.completed == c.total && c.total > 0 {
        StageOutcome::Completed
    } else {
        StageOutcome::Pending
    }
}

/// Recomputes `completedTasks`/`failedTasks` across the whole run from the
/// live per-stage classifications (spec §4.5: "cluster state is truth").
pub fn recount_totals(per_stage: &[StageClassification]) -> (u32, u32) {
    let completed = per_stage.iter().map(|c| c.completed).sum();
    let failed = per_stage.iter().map(|c| c.failed).sum();
    (completed, failed)
}

/// `depends-on` annotation value for stage `i`: comma-joined Task names of
/// stage `i - 1`. `None` for the first stage.
pub fn depends_on_for(stages: &[StageSpec], workflow_run_name: &str, stage_index: usize) -> Option<String> {
    if stage_index == 0 {
        return None;
    }
    let previous = &stages[stage_index - 1];
    Some(
        previous
            .tasks
            .iter()
            .map(|t| task_name_for(workflow_run_name, t))
            .collect::<Vec<_>>()
            .join(","),
    )
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunAction {
    /// Workflow spec missing or both refs unset: terminal config error.
    MissingWorkflow,
    /// Initialize status on first sight: `currentStage = -1`, totals, per-stage `Pending`.
    Init { total_tasks: u32 },
    /// Start materializing stage `i`'s Tasks.
    StartStage { index: usize },
    /// Current stage still has Tasks in flight.
    Wait,
    /// Current stage finished cleanly; either start the next stage or finish the run.
    AdvanceOrFinish { completed_stage: usize },
    /// A Task in the current stage failed.
    Fail { failed_stage: usize },
    /// Run already terminal; nothing to do.
    NoOp,
}

pub fn determine_run_action(
    workflow: Option<&WorkflowSpec>,
    status: &WorkflowRunStatus,
    current_stage_task_phases: &[TaskPhase],
) -> RunAction {
    let Some(workflow) = workflow else {
        return RunAction::MissingWorkflow;
    };

    if status.phase.is_terminal() {
        return RunAction::NoOp;
    }

    if status.current_stage < 0 {
        return RunAction::Init {
            total_tasks: total_tasks(workflow),
        };
    }

    let index = status.current_stage as usize;
    if index >= workflow.stages.len() {
        return RunAction::NoOp;
    }

    if status
        .stages
        .get(index)
        .map(|s| s.phase == kubetask_types::StagePhase::Pending)
        .unwrap_or(true)
    {
        return RunAction::StartStage { index };
    }

    let classification = classify_stage_tasks(&workflow.stages[index], current_stage_task_phases);
    match classify_outcome(&classification) {
        StageOutcome::Pending => RunAction::Wait,
        StageOutcome::Failed => RunAction::Fail { failed_stage: index },
        StageOutcome::Completed => RunAction::AdvanceOrFinish { completed_stage: index },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubetask_types::TaskSpec;

    fn stage(names: &[&str]) -> StageSpec {
        StageSpec {
            name: None,
            tasks: names
                .iter()
                .map(|n| NamedTaskSpec {
                    name: n.to_string(),
                    task: TaskSpec::default(),
                })
                .collect(),
        }
    }

    #[test]
    fn total_tasks_sums_across_stages() {
        let workflow = WorkflowSpec {
            stages: vec![stage(&["a", "b"]), stage(&["c"])],
        };
        assert_eq!(total_tasks(&workflow), 3);
    }

    #[test]
    fn depends_on_is_none_for_first_stage() {
        let stages = vec![stage(&["a"]), stage(&["b"])];
        assert_eq!(depends_on_for(&stages, "run", 0), None);
    }

    #[test]
    fn depends_on_joins_previous_stage_task_names() {
        let stages = vec![stage(&["a", "b"]), stage(&["c"])];
        assert_eq!(depends_on_for(&stages, "run", 1), Some("run-a,run-b".to_string()));
    }

    #[test]
    fn classify_outcome_is_pending_while_tasks_in_flight() {
        let s = stage(&["a", "b"]);
        let c = classify_stage_tasks(&s, &[TaskPhase::Completed, TaskPhase::Running]);
        assert_eq!(classify_outcome(&c), StageOutcome::Pending);
    }

    #[test]
    fn classify_outcome_fails_fast_on_any_failure() {
        let s = stage(&["a", "b"]);
        let c = classify_stage_tasks(&s, &[TaskPhase::Completed, TaskPhase::Failed]);
        assert_eq!(classify_outcome(&c), StageOutcome::Failed);
    }

    #[test]
    fn classify_outcome_completes_when_all_tasks_complete() {
        let s = stage(&["a", "b"]);
        let c = classify_stage_tasks(&s, &[TaskPhase::Completed, TaskPhase::Completed]);
        assert_eq!(classify_outcome(&c), StageOutcome::Completed);
    }

    #[test]
    fn determine_run_action_inits_on_first_sight() {
        let workflow = WorkflowSpec {
            stages: vec![stage(&["a"])],
        };
        let status = WorkflowRunStatus {
            current_stage: -1,
            ..Default::default()
        };
        assert_eq!(
            determine_run_action(Some(&workflow), &status, &[]),
            RunAction::Init { total_tasks: 1 }
        );
    }

    #[test]
    fn determine_run_action_reports_missing_workflow() {
        let status = WorkflowRunStatus::default();
        assert_eq!(determine_run_action(None, &status, &[]), RunAction::MissingWorkflow);
    }

    #[test]
    fn determine_run_action_is_noop_once_terminal() {
        let workflow = WorkflowSpec {
            stages: vec![stage(&["a"])],
        };
        let status = WorkflowRunStatus {
            phase: kubetask_types::WorkflowRunPhase::Completed,
            ..Default::default()
        };
        assert_eq!(determine_run_action(Some(&workflow), &status, &[]), RunAction::NoOp);
    }
}
