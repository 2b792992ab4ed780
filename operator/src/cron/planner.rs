//! Pure decision logic shared by the `CronTask` and `CronWorkflow`
//! reconcilers: history trimming and concurrency-policy application over an
//! already-classified list of children (spec §4.6 steps 1-4, 7).

use std::time::Duration;

use chrono::{DateTime, Utc};
use kubetask_types::ConcurrencyPolicy;

use super::schedule;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildOutcome {
    Active,
    Successful,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChildSummary {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub outcome: ChildOutcome,
}

/// Names of children to delete so `successful`/`failed` history stays within
/// `limit`, oldest first (spec §4.6 step 3). `None` limit disables trimming.
pub fn trim_history(children: &[ChildSummary], outcome: ChildOutcome, limit: u32) -> Vec<String> {
    let mut matching: Vec<&ChildSummary> = children.iter().filter(|c| c.outcome == outcome).collect();
    matching.sort_by_key(|c| c.created_at);
    let limit = limit as usize;
    if matching.len() <= limit {
        return Vec::new();
    }
    matching[..matching.len() - limit]
        .iter()
        .map(|c| c.name.clone())
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConcurrencyDecision {
    /// Proceed to create the child unconditionally.
    Proceed,
    /// An active child already exists; skip this tick.
    Skip,
    /// Delete these active children first, then create.
    ReplaceThenCreate(Vec<String>),
}

/// Applies `policy` over the currently-active children (spec §4.6 step 7).
pub fn apply_concurrency(policy: ConcurrencyPolicy, active: &[ChildSummary]) -> ConcurrencyDecision {
    match policy {
        ConcurrencyPolicy::Allow => ConcurrencyDecision::Proceed,
        ConcurrencyPolicy::Forbid => {
            if active.is_empty() {
                ConcurrencyDecision::Proceed
            } else {
                ConcurrencyDecision::Skip
            }
        }
        ConcurrencyPolicy::Replace => {
            if active.is_empty() {
                ConcurrencyDecision::Proceed
            } else {
                ConcurrencyDecision::ReplaceThenCreate(active.iter().map(|c| c.name.clone()).collect())
            }
        }
    }
}

const MIN_REQUEUE: Duration = Duration::from_secs(1);

/// The full per-tick decision for a `CronTask`/`CronWorkflow` reconcile,
/// combining schedule parsing, history trimming, and concurrency policy
/// (spec §4.6 steps 1-9). Pure: callers do the listing/classification first.
#[derive(Debug, Clone, PartialEq)]
pub struct CronPlan {
    pub trim_deletes: Vec<String>,
    pub active_names: Vec<String>,
    pub outcome: CronOutcome,
    /// The missed-run walk hit [`schedule::MISSED_RUN_CAP`] (spec §4.6 step 6,
    /// §9 Open Question (b)): the schedule has been overdue longer than the
    /// walk can account for exactly.
    pub missed_run_capped: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CronOutcome {
    Suspended,
    InvalidSchedule(String),
    /// `Forbid` skipped this tick because an active child already exists.
    Skip { requeue_after: Duration },
    Create {
        scheduled_at: DateTime<Utc>,
        /// Populated under `Replace` — delete these active children first.
        pre_delete: Vec<String>,
        requeue_after: Duration,
    },
    /// Nothing due yet; just wait for the next tick.
    Idle { requeue_after: Duration },
}

#[allow(clippy::too_many_arguments)]
pub fn plan(
    schedule_expr: &str,
    suspend: bool,
    concurrency_policy: ConcurrencyPolicy,
    successful_limit: u32,
    failed_limit: u32,
    children: &[ChildSummary],
    last_schedule_time: Option<DateTime<Utc>>,
    creation_time: DateTime<Utc>,
    now: DateTime<Utc>,
) -> CronPlan {
    let mut trim_deletes = trim_history(children, ChildOutcome::Successful, successful_limit);
    trim_deletes.extend(trim_history(children, ChildOutcome::Failed, failed_limit));

    let active: Vec<ChildSummary> = children
        .iter()
        .filter(|c| c.outcome == ChildOutcome::Active)
        .cloned()
        .collect();
    let active_names = active.iter().map(|c| c.name.clone()).collect();

    if suspend {
        return CronPlan {
            trim_deletes,
            active_names,
            outcome: CronOutcome::Suspended,
            missed_run_capped: false,
        };
    }

    let schedule = match schedule::parse(schedule_expr) {
        Ok(s) => s,
        Err(e) => {
            return CronPlan {
                trim_deletes,
                active_names,
                outcome: CronOutcome::InvalidSchedule(e.to_string()),
                missed_run_capped: false,
            };
        }
    };

    let last = schedule::effective_last(last_schedule_time, creation_time, now);
    let fire = schedule::next_fire(&schedule, last, now);
    let requeue_after = fire
        .next_after
        .map(|t| (t - now).to_std().unwrap_or(MIN_REQUEUE).max(MIN_REQUEUE))
        .unwrap_or(MIN_REQUEUE);
    let missed_run_capped = fire.capped;

    let Some(scheduled_at) = fire.due else {
        return CronPlan {
            trim_deletes,
            active_names,
            outcome: CronOutcome::Idle { requeue_after },
            missed_run_capped,
        };
    };

    let outcome = match apply_concurrency(concurrency_policy, &active) {
        ConcurrencyDecision::Proceed => CronOutcome::Create {
            scheduled_at,
            pre_delete: Vec::new(),
            requeue_after,
        },
        ConcurrencyDecision::Skip => CronOutcome::Skip { requeue_after },
        ConcurrencyDecision::ReplaceThenCreate(names) => CronOutcome::Create {
            scheduled_at,
            pre_delete: names,
            requeue_after,
        },
    };

    CronPlan {
        trim_deletes,
        active_names,
        outcome,
        missed_run_capped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn child(name: &str, hour: u32, outcome: ChildOutcome) -> ChildSummary {
        ChildSummary {
            name: name.to_string(),
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, hour, 0, 0).unwrap(),
            outcome,
        }
    }

    #[test]
    fn trim_history_keeps_newest_n_and_deletes_the_rest() {
        let children = vec![
            child("a", 0, ChildOutcome::Successful),
            child("b", 1, ChildOutcome::Successful),
            child("c", 2, ChildOutcome::Successful),
            child("active", 3, ChildOutcome::Active),
        ];
        let to_delete = trim_history(&children, ChildOutcome::Successful, 2);
        assert_eq!(to_delete, vec!["a".to_string()]);
    }

    #[test]
    fn trim_history_is_noop_under_the_limit() {
        let children = vec![child("a", 0, ChildOutcome::Failed)];
        assert!(trim_history(&children, ChildOutcome::Failed, 1).is_empty());
    }

    #[test]
    fn forbid_skips_when_active_child_exists() {
        let active = vec![child("running", 0, ChildOutcome::Active)];
        assert_eq!(
            apply_concurrency(ConcurrencyPolicy::Forbid, &active),
            ConcurrencyDecision::Skip
        );
    }

    #[test]
    fn forbid_proceeds_when_no_active_child() {
        assert_eq!(
            apply_concurrency(ConcurrencyPolicy::Forbid, &[]),
            ConcurrencyDecision::Proceed
        );
    }

    #[test]
    fn replace_deletes_active_children_then_creates() {
        let active = vec![child("running", 0, ChildOutcome::Active)];
        assert_eq!(
            apply_concurrency(ConcurrencyPolicy::Replace, &active),
            ConcurrencyDecision::ReplaceThenCreate(vec!["running".to_string()])
        );
    }

    #[test]
    fn allow_always_proceeds() {
        let active = vec![child("running", 0, ChildOutcome::Active)];
        assert_eq!(apply_concurrency(ConcurrencyPolicy::Allow, &active), ConcurrencyDecision::Proceed);
    }

    #[test]
    fn plan_surfaces_missed_run_capped_after_a_long_outage() {
        let creation = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let now = creation + chrono::Duration::minutes(200);
        let result = plan(
            "* * * * *",
            false,
            ConcurrencyPolicy::Allow,
            3,
            1,
            &[],
            None,
            creation,
            now,
        );
        assert!(result.missed_run_capped);
        assert!(matches!(result.outcome, CronOutcome::Create { .. }));
    }

    #[test]
    fn plan_does_not_report_missed_run_capped_for_a_single_due_tick() {
        let creation = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let now = creation + chrono::Duration::minutes(1);
        let result = plan(
            "* * * * *",
            false,
            ConcurrencyPolicy::Allow,
            3,
            1,
            &[],
            None,
            creation,
            now,
        );
        assert!(!result.missed_run_capped);
    }
}
