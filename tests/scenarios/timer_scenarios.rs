//! Step timeouts, waits, the workflow deadline, and pause/resume/cancel

use chrono::{Duration, Utc};
use serde_json::json;

use herdflow_core::{
    CoreError, FinalDecision, StartOptions, TargetModule, TimerKind, TriggerKind, WorkflowStatus,
};
use herdflow_state_inmemory::InMemoryStore;
use herdflow_tests::{
    donor, exam_completed, init_test_tracing, step, template_id, TestEngine, FOLLICLE_TEMPLATE,
    REST_TEMPLATE,
};

async fn engine() -> anyhow::Result<TestEngine> {
    init_test_tracing();
    let engine = TestEngine::new()?;
    engine.register_fixtures().await?;
    Ok(engine)
}

#[tokio::test]
async fn test_workflow_fails_after_max_duration() -> anyhow::Result<()> {
    let engine = engine().await?;
    let id = engine
        .runtime
        .start_workflow(
            &template_id(FOLLICLE_TEMPLATE),
            &donor("D-400"),
            StartOptions::default(),
        )
        .await?;

    let (timers, _) = engine.runtime.tick(Utc::now() + Duration::days(31)).await?;
    assert_eq!(timers.fired, 1);
    assert_eq!(timers.stale, 1);

    let instance = engine.runtime.get_workflow(&id).await?;
    assert_eq!(instance.status, WorkflowStatus::Failed);
    assert!(instance.actual_completion_at.is_some());
    assert!(instance
        .end_reason
        .as_deref()
        .map(|r| r.contains("maximum duration"))
        .unwrap_or(false));
    assert!(engine.runtime.timers(&id).await?.is_empty());

    let decisions = engine.runtime.decisions(&id).await?;
    let last = decisions.last().expect("expiry decision");
    assert_eq!(last.trigger, TriggerKind::DurationExceeded);
    assert_eq!(last.final_decision, FinalDecision::Failure);
    assert_eq!(
        decisions
            .iter()
            .filter(|d| d.trigger == TriggerKind::DurationExceeded)
            .count(),
        1
    );
    Ok(())
}

#[tokio::test]
async fn test_overdue_sweep_expires_without_timers() -> anyhow::Result<()> {
    let engine = engine().await?;
    let id = engine
        .runtime
        .start_workflow(
            &template_id(FOLLICLE_TEMPLATE),
            &donor("D-401"),
            StartOptions::default(),
        )
        .await?;
    let manager = engine.runtime.manager();

    assert!(manager
        .expire_overdue_workflows(Utc::now() + Duration::days(29))
        .await?
        .is_empty());
    let expired = manager
        .expire_overdue_workflows(Utc::now() + Duration::days(31))
        .await?;
    assert_eq!(expired, vec![id.clone()]);
    assert_eq!(
        engine.runtime.get_workflow(&id).await?.status,
        WorkflowStatus::Failed
    );

    // A late trigger cannot resurrect it
    let late = engine.runtime.submit_event(exam_completed(&id, "s1")).await;
    assert!(matches!(late, Err(CoreError::InvalidTransition(_))));
    Ok(())
}

#[tokio::test]
async fn test_step_timeout_follows_failure_path() -> anyhow::Result<()> {
    let engine = engine().await?;
    let id = engine
        .runtime
        .start_workflow(
            &template_id(FOLLICLE_TEMPLATE),
            &donor("D-402"),
            StartOptions::default(),
        )
        .await?;
    let before = engine.runtime.get_workflow(&id).await?;

    let now = Utc::now() + Duration::days(6);
    let (timers, _) = engine.runtime.tick(now).await?;
    assert_eq!(timers.fired, 1);

    let after = engine.runtime.get_workflow(&id).await?;
    assert_eq!(after.status, WorkflowStatus::Active);
    assert_eq!(after.current_step_id, step("s1"));
    assert_eq!(after.step_epoch, before.step_epoch + 1);

    let decisions = engine.runtime.decisions(&id).await?;
    let timeout = decisions.last().expect("timeout decision");
    assert_eq!(timeout.trigger, TriggerKind::Timeout);
    assert_eq!(timeout.final_decision, FinalDecision::Failure);

    let rescheduled = engine
        .runtime
        .timers(&id)
        .await?
        .into_iter()
        .find(|t| t.kind == TimerKind::StepTimeout)
        .expect("new timeout");
    assert_eq!(rescheduled.step_epoch, after.step_epoch);
    assert!(rescheduled.fires_at > now + Duration::days(4));
    Ok(())
}

#[tokio::test]
async fn test_timer_from_old_step_is_dropped() -> anyhow::Result<()> {
    let engine = engine().await?;
    let cow = donor("D-403");
    engine.set_clinical(&cow, "follicle_count", json!(6));
    let id = engine
        .runtime
        .start_workflow(&template_id(FOLLICLE_TEMPLATE), &cow, StartOptions::default())
        .await?;
    let old_timeout = engine
        .runtime
        .timers(&id)
        .await?
        .into_iter()
        .find(|t| t.kind == TimerKind::StepTimeout)
        .expect("exam timeout");

    engine.runtime.submit_event(exam_completed(&id, "s1")).await?;

    // Put the exam timeout back as if its cancellation had been lost
    let mut state = engine.store().dump().await;
    state.timers.insert(old_timeout.id.0.clone(), old_timeout);
    let restored = TestEngine::builder()
        .store(InMemoryStore::from_state(state))
        .build()?;
    let decisions_before = restored.runtime.decisions(&id).await?.len();

    let (timers, _) = restored.runtime.tick(Utc::now() + Duration::days(6)).await?;
    assert_eq!(timers.fired, 0);
    assert_eq!(timers.stale, 1);

    let instance = restored.runtime.get_workflow(&id).await?;
    assert_eq!(instance.current_step_id, step("s2"));
    assert_eq!(restored.runtime.decisions(&id).await?.len(), decisions_before);
    assert!(restored
        .runtime
        .timers(&id)
        .await?
        .iter()
        .all(|t| t.kind == TimerKind::WorkflowDeadline));
    Ok(())
}

#[tokio::test]
async fn test_wait_days_holds_the_step() -> anyhow::Result<()> {
    let engine = engine().await?;
    let id = engine
        .runtime
        .start_workflow(&template_id(REST_TEMPLATE), &donor("D-404"), StartOptions::default())
        .await?;

    let wait = engine
        .runtime
        .timers(&id)
        .await?
        .into_iter()
        .find(|t| t.kind == TimerKind::WaitElapsed)
        .expect("wait timer");
    assert_eq!(wait.step_id, step("s1"));

    let (early, _) = engine.runtime.tick(Utc::now() + Duration::days(1)).await?;
    assert_eq!(early.fired, 0);
    assert_eq!(
        engine.runtime.get_workflow(&id).await?.current_step_id,
        step("s1")
    );

    let (timers, dispatch) = engine
        .runtime
        .tick(Utc::now() + Duration::days(2) + Duration::minutes(1))
        .await?;
    assert_eq!(timers.fired, 1);
    assert_eq!(dispatch.delivered, 1);

    let instance = engine.runtime.get_workflow(&id).await?;
    assert_eq!(instance.current_step_id, step("s2"));
    let decisions = engine.runtime.decisions(&id).await?;
    assert_eq!(
        decisions.last().map(|d| d.trigger),
        Some(TriggerKind::WaitElapsed)
    );
    let notices = engine.received(TargetModule::Internal);
    assert_eq!(notices.len(), 1);
    assert_eq!(
        notices[0]["parameters"]["message"],
        json!("Animal ready for breeding")
    );
    Ok(())
}

#[tokio::test]
async fn test_pause_suspends_and_resume_restores_timers() -> anyhow::Result<()> {
    let engine = engine().await?;
    let id = engine
        .runtime
        .start_workflow(
            &template_id(FOLLICLE_TEMPLATE),
            &donor("D-405"),
            StartOptions::default(),
        )
        .await?;
    let deadline = engine.runtime.get_workflow(&id).await?.expected_completion_at;

    let paused = engine
        .runtime
        .pause(&id, Some("vet-7"), Some("Lameness"))
        .await?;
    assert_eq!(paused.status, WorkflowStatus::Paused);
    assert!(engine.runtime.timers(&id).await?.is_empty());
    let instance = engine.runtime.get_workflow(&id).await?;
    assert_eq!(instance.suspended_timers.len(), 2);

    let rejected = engine.runtime.submit_event(exam_completed(&id, "s1")).await;
    assert!(matches!(rejected, Err(CoreError::InvalidTransition(_))));
    let twice = engine.runtime.pause(&id, None, None).await;
    assert!(matches!(twice, Err(CoreError::InvalidTransition(_))));

    // Neither timers nor the deadline sweep touch a paused workflow
    let (timers, _) = engine.runtime.tick(Utc::now() + Duration::days(40)).await?;
    assert_eq!(timers.fired, 0);
    assert_eq!(
        engine.runtime.get_workflow(&id).await?.status,
        WorkflowStatus::Paused
    );

    let resumed = engine.runtime.resume(&id, Some("vet-7"), None).await?;
    assert_eq!(resumed.status, WorkflowStatus::Active);
    let timers = engine.runtime.timers(&id).await?;
    assert_eq!(timers.len(), 2);
    let timeout = timers
        .iter()
        .find(|t| t.kind == TimerKind::StepTimeout)
        .expect("timeout restored");
    assert!(timeout.fires_at > Utc::now() + Duration::days(4));

    let instance = engine.runtime.get_workflow(&id).await?;
    assert!(instance.suspended_timers.is_empty());
    assert!(instance.expected_completion_at >= deadline);
    assert!(instance.notes.iter().any(|n| n.contains("Lameness")));

    let again = engine.runtime.resume(&id, None, None).await;
    assert!(matches!(again, Err(CoreError::InvalidTransition(_))));

    let triggers: Vec<_> = engine
        .runtime
        .decisions(&id)
        .await?
        .iter()
        .map(|d| d.trigger)
        .collect();
    assert_eq!(
        triggers,
        vec![TriggerKind::Started, TriggerKind::Paused, TriggerKind::Resumed]
    );
    Ok(())
}

#[tokio::test]
async fn test_cancel_stops_everything() -> anyhow::Result<()> {
    let engine = engine().await?;
    let id = engine
        .runtime
        .start_workflow(
            &template_id(FOLLICLE_TEMPLATE),
            &donor("D-406"),
            StartOptions::default(),
        )
        .await?;
    engine.runtime.pause(&id, None, None).await?;

    let report = engine
        .runtime
        .cancel(&id, Some("vet-7"), Some("Animal sold"))
        .await?;
    assert_eq!(report.status, WorkflowStatus::Cancelled);

    let instance = engine.runtime.get_workflow(&id).await?;
    assert_eq!(instance.end_reason.as_deref(), Some("Animal sold"));
    assert!(instance.suspended_timers.is_empty());
    assert!(engine.runtime.timers(&id).await?.is_empty());

    let decisions = engine.runtime.decisions(&id).await?;
    let last = decisions.last().expect("cancel decision");
    assert_eq!(last.trigger, TriggerKind::Cancelled);
    assert_eq!(last.decided_by, "vet-7");

    let again = engine.runtime.cancel(&id, None, None).await;
    assert!(matches!(again, Err(CoreError::InvalidTransition(_))));

    // The slot is free again
    let restarted = engine
        .runtime
        .start_workflow(
            &template_id(FOLLICLE_TEMPLATE),
            &donor("D-406"),
            StartOptions::default(),
        )
        .await;
    assert!(restarted.is_ok());
    Ok(())
}
