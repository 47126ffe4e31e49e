//! Serialization of transitions, compare-and-swap, cancel priority and
//! commit atomicity

use futures::future::join_all;
use serde_json::json;

use herdflow_core::{
    CoreError, StartOptions, TriggerKind, WorkflowFilter, WorkflowId, WorkflowStatus,
};
use herdflow_tests::{
    donor, exam_completed, init_test_tracing, step, template_id, TestEngine, FOLLICLE_TEMPLATE,
};

#[tokio::test]
async fn test_concurrent_events_for_same_step_commit_once() -> anyhow::Result<()> {
    init_test_tracing();
    let engine = TestEngine::new()?;
    engine.register_fixtures().await?;
    let cow = donor("D-500");
    engine.set_clinical(&cow, "follicle_count", json!(4));
    let id = engine
        .runtime
        .start_workflow(&template_id(FOLLICLE_TEMPLATE), &cow, StartOptions::default())
        .await?;

    let (a, b) = tokio::join!(
        engine.runtime.submit_event(exam_completed(&id, "s1")),
        engine.runtime.submit_event(exam_completed(&id, "s1")),
    );

    let outcomes = [a, b];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(outcomes
        .iter()
        .any(|r| matches!(r, Err(CoreError::ConcurrencyConflict(_)))));

    let instance = engine.runtime.get_workflow(&id).await?;
    assert_eq!(instance.current_step_id, step("s2"));
    assert_eq!(engine.runtime.decisions(&id).await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_two_engines_on_one_store_commit_once() -> anyhow::Result<()> {
    init_test_tracing();
    let first = TestEngine::new()?;
    first.register_fixtures().await?;
    let second = TestEngine::builder()
        .store(first.store().clone())
        .snapshots(first.snapshots.clone())
        .build()?;

    let cow = donor("D-501");
    first.set_clinical(&cow, "follicle_count", json!(4));
    let id = first
        .runtime
        .start_workflow(&template_id(FOLLICLE_TEMPLATE), &cow, StartOptions::default())
        .await?;
    let before = first.runtime.get_workflow(&id).await?;

    // The engines do not share locks; only the store sequence protects the instance
    let (a, b) = tokio::join!(
        first.runtime.submit_event(exam_completed(&id, "s1")),
        second.runtime.submit_event(exam_completed(&id, "s1")),
    );
    assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);

    let after = second.runtime.get_workflow(&id).await?;
    assert_eq!(after.current_step_id, step("s2"));
    assert_eq!(after.sequence, before.sequence + 1);
    assert_eq!(first.runtime.decisions(&id).await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_unbound_events_are_applied_in_turn() -> anyhow::Result<()> {
    init_test_tracing();
    let engine = TestEngine::new()?;
    engine.register_fixtures().await?;
    let cow = donor("D-502");
    engine.set_clinical(&cow, "follicle_count", json!(4));
    let id = engine
        .runtime
        .start_workflow(&template_id(FOLLICLE_TEMPLATE), &cow, StartOptions::default())
        .await?;

    let events = (0..2).map(|_| {
        let mut event = exam_completed(&id, "s1");
        event.step_id = None;
        engine.runtime.submit_event(event)
    });
    let results = join_all(events).await;
    assert!(results.iter().all(|r| r.is_ok()));

    // First event s1 -> s2, second event s2 -> s3
    let instance = engine.runtime.get_workflow(&id).await?;
    assert_eq!(instance.current_step_id, step("s3"));
    assert_eq!(engine.runtime.decisions(&id).await?.len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_cancel_wins_over_queued_events() -> anyhow::Result<()> {
    init_test_tracing();
    let engine = TestEngine::new()?;
    engine.register_fixtures().await?;
    let cow = donor("D-503");
    engine.set_clinical(&cow, "follicle_count", json!(0));
    let id = engine
        .runtime
        .start_workflow(&template_id(FOLLICLE_TEMPLATE), &cow, StartOptions::default())
        .await?;

    let triggers = join_all((0..5).map(|_| {
        let mut event = exam_completed(&id, "s1");
        event.step_id = None;
        engine.runtime.submit_event(event)
    }));
    let cancel = engine.runtime.cancel(&id, Some("vet-7"), Some("Owner request"));
    let (results, cancelled) = tokio::join!(triggers, cancel);

    assert_eq!(cancelled?.status, WorkflowStatus::Cancelled);
    for result in results.iter().filter_map(|r| r.as_ref().err()) {
        assert!(matches!(result, CoreError::InvalidTransition(_)), "{}", result);
    }

    let decisions = engine.runtime.decisions(&id).await?;
    assert_eq!(
        decisions.last().map(|d| d.trigger),
        Some(TriggerKind::Cancelled)
    );
    assert_eq!(
        decisions.len(),
        2 + results.iter().filter(|r| r.is_ok()).count()
    );
    Ok(())
}

#[tokio::test]
async fn test_failed_commit_leaves_no_trace() -> anyhow::Result<()> {
    init_test_tracing();
    let engine = TestEngine::new()?;
    engine.register_fixtures().await?;
    let cow = donor("D-504");
    engine.set_clinical(&cow, "follicle_count", json!(4));
    let id = engine
        .runtime
        .start_workflow(&template_id(FOLLICLE_TEMPLATE), &cow, StartOptions::default())
        .await?;

    let instance_before = engine.runtime.get_workflow(&id).await?;
    let updates_before = engine.runtime.module_updates(&id).await?;
    let timers_before = engine.runtime.timers(&id).await?;

    engine.store().fail_next_commits(1);
    let failed = engine.runtime.submit_event(exam_completed(&id, "s1")).await;
    assert!(matches!(failed, Err(CoreError::StateStoreError(_))));

    let instance_after = engine.runtime.get_workflow(&id).await?;
    assert_eq!(instance_after.current_step_id, instance_before.current_step_id);
    assert_eq!(instance_after.sequence, instance_before.sequence);
    assert_eq!(instance_after.step_epoch, instance_before.step_epoch);
    assert_eq!(engine.runtime.decisions(&id).await?.len(), 1);
    assert_eq!(engine.runtime.module_updates(&id).await?, updates_before);
    assert_eq!(engine.runtime.timers(&id).await?, timers_before);

    // The same event succeeds once the store recovers
    let report = engine.runtime.submit_event(exam_completed(&id, "s1")).await?;
    assert_eq!(report.next_step, Some(step("s2")));
    Ok(())
}

#[tokio::test]
async fn test_start_during_outage_creates_nothing() -> anyhow::Result<()> {
    init_test_tracing();
    let engine = TestEngine::new()?;
    engine.register_fixtures().await?;

    engine.store().set_unavailable(true);
    let started = engine
        .runtime
        .start_workflow(
            &template_id(FOLLICLE_TEMPLATE),
            &donor("D-505"),
            StartOptions::default(),
        )
        .await;
    assert!(matches!(started, Err(CoreError::StateStoreError(_))));

    engine.store().set_unavailable(false);
    let listed = engine
        .runtime
        .list_workflows(&WorkflowFilter::default())
        .await?;
    assert!(listed.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_lock_entries_do_not_outlive_transitions() -> anyhow::Result<()> {
    init_test_tracing();
    let engine = TestEngine::new()?;
    engine.register_fixtures().await?;
    let manager = engine.runtime.manager();

    let unknown = join_all((0..20).map(|n| {
        let id = WorkflowId(format!("missing-{}", n));
        engine.runtime.submit_event(exam_completed(&id, "s1"))
    }))
    .await;
    assert!(unknown
        .iter()
        .all(|r| matches!(r, Err(CoreError::WorkflowNotFound(_)))));
    assert_eq!(manager.tracked_locks(), 0);

    let cow = donor("D-506");
    engine.set_clinical(&cow, "follicle_count", json!(0));
    let id = engine
        .runtime
        .start_workflow(&template_id(FOLLICLE_TEMPLATE), &cow, StartOptions::default())
        .await?;
    engine.runtime.submit_event(exam_completed(&id, "s1")).await?;
    assert_eq!(manager.tracked_locks(), 0);

    let triggers = join_all((0..5).map(|_| {
        let mut event = exam_completed(&id, "s1");
        event.step_id = None;
        engine.runtime.submit_event(event)
    }));
    let cancel = engine.runtime.cancel(&id, None, Some("Sold"));
    let (_, cancelled) = tokio::join!(triggers, cancel);
    assert_eq!(cancelled?.status, WorkflowStatus::Cancelled);
    assert_eq!(manager.tracked_locks(), 0);
    Ok(())
}
