//! Reconciliation: push a goal's locally measured value to the remote day.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use goalsync_config::UpdatePolicy;
use goalsync_core::{DayStamp, Goal, extract};
use goalsync_documents::DocumentError;
use goalsync_remote::{ErrorClass, GoalService, RemoteDatapoint, RemoteError};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Document(#[from] DocumentError),
}

impl ReconcileError {
    /// Unreadable documents are retried by the next trigger like any other
    /// transient failure.
    pub fn class(&self) -> ErrorClass {
        match self {
            ReconcileError::Remote(err) => err.class(),
            ReconcileError::Document(_) => ErrorClass::Transient,
        }
    }
}

/// What a reconciliation did on the remote side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Action {
    Created(RemoteDatapoint),
    Updated(RemoteDatapoint),
    /// Today's datapoint already held the value and the policy allows
    /// skipping.  Carries the untouched datapoint.
    NoOpSameValue(RemoteDatapoint),
}

impl Action {
    pub fn datapoint(&self) -> &RemoteDatapoint {
        match self {
            Action::Created(dp) | Action::Updated(dp) | Action::NoOpSameValue(dp) => dp,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Action::Created(_) => "created",
            Action::Updated(_) => "updated",
            Action::NoOpSameValue(_) => "unchanged",
        }
    }
}

#[derive(Clone)]
pub struct Reconciler {
    service: Arc<dyn GoalService>,
    policy: UpdatePolicy,
}

impl Reconciler {
    pub fn new(service: Arc<dyn GoalService>, policy: UpdatePolicy) -> Self {
        Self { service, policy }
    }

    pub fn policy(&self) -> UpdatePolicy {
        self.policy
    }

    /// Measure `text`, stamp `now` with the goal's day rule and make the
    /// remote datapoint for that day match.
    ///
    /// The last datapoint is fetched on every call; remote state may have
    /// been edited elsewhere since the previous run.
    pub async fn reconcile(
        &self,
        goal: &Goal,
        source: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<Action, ReconcileError> {
        let value = extract(text, goal.metric) as f64;
        let today = goal.day.stamp(now);
        let last = self.service.fetch_last(&goal.slug).await?;
        let comment = provenance_comment(goal, source, now);

        if last.is_on(&today) {
            if self.policy == UpdatePolicy::SkipUnchanged && same_value(last.value, value) {
                debug!(slug = %goal.slug, value, daystamp = %today, "remote value unchanged; skipping");
                return Ok(Action::NoOpSameValue(last));
            }
            let updated = self
                .service
                .update(&goal.slug, &last.id, value, &comment)
                .await?;
            return Ok(Action::Updated(updated));
        }

        let created = self
            .service
            .create(&goal.slug, value, &today, &comment)
            .await?;
        Ok(Action::Created(created))
    }
}

fn same_value(a: f64, b: f64) -> bool {
    (a - b).abs() < f64::EPSILON
}

/// Remote comment naming the source document and the local submission time.
fn provenance_comment(goal: &Goal, source: &str, now: DateTime<Utc>) -> String {
    let local = now.with_timezone(&goal.day.timezone);
    format!(
        "goalsync: {} from {source} at {}",
        goal.metric,
        local.format("%Y-%m-%d %H:%M:%S %Z")
    )
}

/// Day-stamp a reconciliation at `now` would target.
pub fn target_day(goal: &Goal, now: DateTime<Utc>) -> DayStamp {
    goal.day.stamp(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use goalsync_core::{DayCutoff, DayRule, DocumentRef, MetricKind};
    use goalsync_remote::{InMemoryGoalService, RemoteCall};

    fn utc(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn day(raw: &str) -> DayStamp {
        raw.parse().unwrap()
    }

    fn tasks_goal() -> Goal {
        Goal::new("chores", MetricKind::CompletedTasks, DocumentRef::DailyNote)
            .unwrap()
            .with_day_rule(DayRule::new(chrono_tz::UTC, "06:00".parse::<DayCutoff>().unwrap()))
    }

    fn setup(policy: UpdatePolicy) -> (Arc<InMemoryGoalService>, Reconciler) {
        let service = Arc::new(InMemoryGoalService::new());
        let reconciler = Reconciler::new(service.clone(), policy);
        (service, reconciler)
    }

    const FIVE_DONE: &str = "- [x] a\n- [x] b\n- [x] c\n- [x] d\n- [x] e\n";
    const THREE_DONE: &str = "- [x] a\n- [ ] b\n- [x] c\n- [ ] d\n- [x] e\n";

    #[tokio::test]
    async fn first_run_creates_then_lower_value_updates_same_id() {
        let (service, reconciler) = setup(UpdatePolicy::AlwaysOverwrite);
        let goal = tasks_goal();
        let now = utc(2024, 3, 1, 12);

        let first = reconciler.reconcile(&goal, "daily.md", FIVE_DONE, now).await.unwrap();
        let Action::Created(created) = first else {
            panic!("expected create, got {first:?}");
        };
        assert_eq!(created.value, 5.0);
        assert_eq!(created.daystamp, Some(day("2024-03-01")));

        let second = reconciler.reconcile(&goal, "daily.md", THREE_DONE, now).await.unwrap();
        assert_eq!(second.label(), "updated");
        assert_eq!(second.datapoint().id, created.id);
        assert_eq!(second.datapoint().value, 3.0);

        assert_eq!(
            service.calls(),
            vec![
                RemoteCall::FetchLast { slug: "chores".into() },
                RemoteCall::Create { slug: "chores".into(), value: 5.0, daystamp: day("2024-03-01") },
                RemoteCall::FetchLast { slug: "chores".into() },
                RemoteCall::Update { slug: "chores".into(), id: created.id.clone(), value: 3.0 },
            ]
        );
    }

    #[tokio::test]
    async fn unchanged_content_still_overwrites_by_default() {
        let (service, reconciler) = setup(UpdatePolicy::AlwaysOverwrite);
        let goal = tasks_goal();
        let now = utc(2024, 3, 1, 12);

        reconciler.reconcile(&goal, "daily.md", FIVE_DONE, now).await.unwrap();
        let again = reconciler.reconcile(&goal, "daily.md", FIVE_DONE, now).await.unwrap();

        assert_eq!(again.label(), "updated");
        let writes: Vec<_> = service
            .calls()
            .into_iter()
            .filter(|c| !matches!(c, RemoteCall::FetchLast { .. }))
            .collect();
        assert_eq!(writes.len(), 2);
        assert!(matches!(writes[0], RemoteCall::Create { value, .. } if value == 5.0));
        assert!(matches!(writes[1], RemoteCall::Update { value, .. } if value == 5.0));
    }

    #[tokio::test]
    async fn skip_unchanged_policy_avoids_the_write() {
        let (service, reconciler) = setup(UpdatePolicy::SkipUnchanged);
        let goal = tasks_goal();
        let now = utc(2024, 3, 1, 12);

        reconciler.reconcile(&goal, "daily.md", FIVE_DONE, now).await.unwrap();
        let again = reconciler.reconcile(&goal, "daily.md", FIVE_DONE, now).await.unwrap();
        assert_eq!(again.label(), "unchanged");
        assert_eq!(service.calls().len(), 3);

        // A changed value is still written under this policy.
        let lower = reconciler.reconcile(&goal, "daily.md", THREE_DONE, now).await.unwrap();
        assert_eq!(lower.label(), "updated");
    }

    #[tokio::test]
    async fn night_owl_hours_update_yesterdays_datapoint() {
        let (service, reconciler) = setup(UpdatePolicy::AlwaysOverwrite);
        let goal = tasks_goal();

        let evening = reconciler
            .reconcile(&goal, "daily.md", THREE_DONE, utc(2024, 2, 29, 22))
            .await
            .unwrap();
        assert_eq!(evening.datapoint().daystamp, Some(day("2024-02-29")));

        // 02:00 on March 1st is still February 29th with a 06:00 cutoff.
        let late = reconciler
            .reconcile(&goal, "daily.md", FIVE_DONE, utc(2024, 3, 1, 2))
            .await
            .unwrap();
        assert_eq!(late.label(), "updated");
        assert_eq!(late.datapoint().id, evening.datapoint().id);

        // 07:00 is a new day.
        let morning = reconciler
            .reconcile(&goal, "daily.md", FIVE_DONE, utc(2024, 3, 1, 7))
            .await
            .unwrap();
        assert_eq!(morning.label(), "created");
        assert_eq!(morning.datapoint().daystamp, Some(day("2024-03-01")));
        assert_eq!(service.datapoints("chores").len(), 2);
    }

    #[tokio::test]
    async fn previous_days_datapoint_is_never_overwritten() {
        let (service, reconciler) = setup(UpdatePolicy::AlwaysOverwrite);
        service.seed(
            "chores",
            RemoteDatapoint {
                id: "old".to_string(),
                value: 9.0,
                daystamp: Some(day("2024-02-28")),
                comment: String::new(),
            },
        );
        let action = reconciler
            .reconcile(&tasks_goal(), "daily.md", FIVE_DONE, utc(2024, 3, 1, 12))
            .await
            .unwrap();
        assert_eq!(action.label(), "created");
        assert_eq!(service.datapoints("chores")[0].value, 9.0);
    }

    #[tokio::test]
    async fn remote_errors_abort_without_writes() {
        let (service, reconciler) = setup(UpdatePolicy::AlwaysOverwrite);
        service.fail_with("chores", RemoteError::Network("timeout".into()));
        let err = reconciler
            .reconcile(&tasks_goal(), "daily.md", FIVE_DONE, utc(2024, 3, 1, 12))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Remote(RemoteError::Network(_))));
        assert_eq!(err.class(), ErrorClass::Transient);
        assert_eq!(service.calls().len(), 1);
        assert!(service.datapoints("chores").is_empty());
    }

    #[test]
    fn unreadable_documents_are_transient() {
        let err = ReconcileError::from(DocumentError::Io {
            path: "x.md".into(),
            source: std::io::Error::other("denied"),
        });
        assert_eq!(err.class(), ErrorClass::Transient);
        let auth = ReconcileError::from(RemoteError::Auth("401".into()));
        assert_eq!(auth.class(), ErrorClass::Auth);
    }

    #[test]
    fn comment_records_source_and_local_time() {
        let goal = tasks_goal().with_day_rule(DayRule::new(
            chrono_tz::Europe::Berlin,
            DayCutoff::MIDNIGHT,
        ));
        let comment = provenance_comment(&goal, "Daily/2024-03-01.md", utc(2024, 3, 1, 12));
        assert_eq!(
            comment,
            "goalsync: completed-task-count from Daily/2024-03-01.md at 2024-03-01 13:00:00 CET"
        );
    }

    #[test]
    fn target_day_follows_goal_rule() {
        assert_eq!(target_day(&tasks_goal(), utc(2024, 3, 1, 2)), day("2024-02-29"));
    }
}
