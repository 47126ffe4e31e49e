//! Module delivery, retries and escalation to manual review

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use mockall::mock;
use serde_json::{json, Value};

use herdflow_core::{
    CoreError, EngineConfig, FinalDecision, ModuleClient, ModuleResponse, StartOptions,
    TargetModule, TriggerKind, UpdateOrigin, UpdateStatus, UpdateType, WorkflowEvent,
    WorkflowStatus,
};
use herdflow_tests::{
    donor, drain_events, exam_completed, init_test_tracing, template_id, TestEngine,
    FOLLICLE_TEMPLATE,
};

mock! {
    pub Module {}

    #[async_trait]
    impl ModuleClient for Module {
        async fn apply(
            &self,
            update_type: UpdateType,
            payload: &Value,
        ) -> Result<ModuleResponse, CoreError>;
    }
}

fn unreachable_ultrasound() -> Arc<dyn ModuleClient> {
    let mut module = MockModule::new();
    module
        .expect_apply()
        .times(3)
        .returning(|_, _| Err(CoreError::DeliveryError("ultrasound service down".to_string())));
    Arc::new(module)
}

#[tokio::test]
async fn test_delivered_updates_are_completed() -> anyhow::Result<()> {
    init_test_tracing();
    let engine = TestEngine::new()?;
    engine.register_fixtures().await?;
    let cow = donor("D-300");

    let id = engine
        .runtime
        .start_workflow(&template_id(FOLLICLE_TEMPLATE), &cow, StartOptions::default())
        .await?;
    let report = engine.runtime.manager().process_due_updates(Utc::now()).await?;
    assert_eq!(report.delivered, 1);
    assert_eq!(report.failed, 0);

    let updates = engine.runtime.module_updates(&id).await?;
    assert_eq!(updates[0].status, UpdateStatus::Completed);
    assert_eq!(updates[0].attempts, 1);
    let result = updates[0].result.clone().expect("result recorded");
    assert!(result.success);
    assert_eq!(result.created_record_id.as_deref(), Some("record-1"));

    let received = engine.received(TargetModule::Ultrasound);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0]["workflowId"], json!(id.0));
    assert_eq!(received[0]["parameters"]["examType"], json!("FOLLICLE_SCAN"));

    // Completed updates are not delivered twice
    let again = engine.runtime.manager().process_due_updates(Utc::now()).await?;
    assert_eq!(again.delivered, 0);
    Ok(())
}

#[tokio::test]
async fn test_failed_delivery_is_retried_with_backoff() -> anyhow::Result<()> {
    init_test_tracing();
    let mut flaky = MockModule::new();
    let mut seq = mockall::Sequence::new();
    flaky
        .expect_apply()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _| Ok(ModuleResponse::rejected("calendar full")));
    flaky
        .expect_apply()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _| Ok(ModuleResponse::ok(Some("exam-77".to_string()))));

    let engine = TestEngine::builder()
        .module(TargetModule::Ultrasound, Arc::new(flaky))
        .build()?;
    engine.register_fixtures().await?;
    let id = engine
        .runtime
        .start_workflow(
            &template_id(FOLLICLE_TEMPLATE),
            &donor("D-301"),
            StartOptions::default(),
        )
        .await?;

    let now = Utc::now();
    let first = engine.runtime.manager().process_due_updates(now).await?;
    assert_eq!(first.retrying, 1);

    let update = &engine.runtime.module_updates(&id).await?[0];
    assert_eq!(update.status, UpdateStatus::Retry);
    assert_eq!(update.last_error(), Some("calendar full"));
    assert_eq!(update.next_retry_at, Some(now + Duration::seconds(30)));

    // Not due before the backoff elapsed
    let early = engine
        .runtime
        .manager()
        .process_due_updates(now + Duration::seconds(10))
        .await?;
    assert_eq!(early, Default::default());

    let second = engine
        .runtime
        .manager()
        .process_due_updates(now + Duration::seconds(31))
        .await?;
    assert_eq!(second.delivered, 1);
    let update = &engine.runtime.module_updates(&id).await?[0];
    assert_eq!(update.status, UpdateStatus::Completed);
    assert_eq!(update.attempts, 2);
    Ok(())
}

#[tokio::test]
async fn test_exhausted_delivery_escalates_exactly_once() -> anyhow::Result<()> {
    init_test_tracing();
    let engine = TestEngine::builder()
        .module(TargetModule::Ultrasound, unreachable_ultrasound())
        .build()?;
    engine.register_fixtures().await?;
    let mut events = engine.publisher.subscribe();

    let id = engine
        .runtime
        .start_workflow(
            &template_id(FOLLICLE_TEMPLATE),
            &donor("D-302"),
            StartOptions::default(),
        )
        .await?;

    let start = Utc::now();
    let mut escalated = 0;
    for hours in 0..5 {
        let report = engine
            .runtime
            .manager()
            .process_due_updates(start + Duration::hours(hours))
            .await?;
        escalated += report.escalated;
    }
    assert_eq!(escalated, 1);

    let updates = engine.runtime.module_updates(&id).await?;
    let exam = updates
        .iter()
        .find(|u| u.target_module == TargetModule::Ultrasound)
        .expect("exam update");
    assert_eq!(exam.status, UpdateStatus::Failed);
    assert_eq!(exam.attempts, 3);

    let notifications: Vec<_> = updates
        .iter()
        .filter(|u| u.origin == UpdateOrigin::Escalation)
        .collect();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].target_module, TargetModule::Internal);
    assert_eq!(notifications[0].status, UpdateStatus::Completed);
    assert_eq!(engine.received(TargetModule::Internal).len(), 1);

    let decisions = engine.runtime.decisions(&id).await?;
    let reviews: Vec<_> = decisions
        .iter()
        .filter(|d| d.final_decision == FinalDecision::ManualReview)
        .collect();
    assert_eq!(reviews.len(), 1);
    assert_eq!(reviews[0].trigger, TriggerKind::DeliveryFailed);
    assert_eq!(reviews[0].trigger_payload["attempts"], json!(3));

    let alerts: Vec<_> = drain_events(&mut events)
        .into_iter()
        .filter(WorkflowEvent::is_alert)
        .collect();
    assert_eq!(alerts.len(), 1);

    // The workflow keeps running with a review flag
    let instance = engine.runtime.get_workflow(&id).await?;
    assert_eq!(instance.status, WorkflowStatus::Active);
    assert!(instance.manual_review_pending);
    Ok(())
}

#[tokio::test]
async fn test_uncommitted_escalation_is_retried_without_redelivery() -> anyhow::Result<()> {
    init_test_tracing();
    // The mock panics on a fourth call
    let engine = TestEngine::builder()
        .module(TargetModule::Ultrasound, unreachable_ultrasound())
        .build()?;
    engine.register_fixtures().await?;

    let id = engine
        .runtime
        .start_workflow(
            &template_id(FOLLICLE_TEMPLATE),
            &donor("D-303"),
            StartOptions::default(),
        )
        .await?;
    let manager = engine.runtime.manager();
    let start = Utc::now();

    manager.process_due_updates(start).await?;
    manager.process_due_updates(start + Duration::hours(1)).await?;

    engine.store().fail_next_commits(1);
    let exhausted = manager
        .process_due_updates(start + Duration::hours(2))
        .await?;
    assert_eq!(exhausted.failed, 1);
    assert_eq!(exhausted.escalated, 0);

    let exam = engine
        .runtime
        .module_updates(&id)
        .await?
        .into_iter()
        .find(|u| u.target_module == TargetModule::Ultrasound)
        .expect("exam update");
    assert_eq!(exam.status, UpdateStatus::Failed);
    assert_eq!(exam.attempts, 3);
    assert!(exam.escalation_pending);
    assert!(!engine.runtime.get_workflow(&id).await?.manual_review_pending);

    let mut escalated = 0;
    for hours in 3..6 {
        let report = manager
            .process_due_updates(start + Duration::hours(hours))
            .await?;
        assert_eq!(report.failed, 0);
        escalated += report.escalated;
    }
    assert_eq!(escalated, 1);

    let updates = engine.runtime.module_updates(&id).await?;
    let exam = updates
        .iter()
        .find(|u| u.target_module == TargetModule::Ultrasound)
        .expect("exam update");
    assert_eq!(exam.attempts, 3);
    assert!(!exam.escalation_pending);
    assert_eq!(
        updates
            .iter()
            .filter(|u| u.origin == UpdateOrigin::Escalation)
            .count(),
        1
    );
    assert_eq!(engine.received(TargetModule::Internal).len(), 1);

    let reviews = engine
        .runtime
        .decisions(&id)
        .await?
        .into_iter()
        .filter(|d| d.final_decision == FinalDecision::ManualReview)
        .count();
    assert_eq!(reviews, 1);
    assert!(engine.runtime.get_workflow(&id).await?.manual_review_pending);
    Ok(())
}

#[tokio::test]
async fn test_manual_override_clears_review_flag() -> anyhow::Result<()> {
    init_test_tracing();
    let engine = TestEngine::builder()
        .module(TargetModule::Ultrasound, unreachable_ultrasound())
        .build()?;
    engine.register_fixtures().await?;
    let id = engine
        .runtime
        .start_workflow(
            &template_id(FOLLICLE_TEMPLATE),
            &donor("D-303"),
            StartOptions::default(),
        )
        .await?;

    let start = Utc::now();
    for hours in 0..3 {
        engine
            .runtime
            .manager()
            .process_due_updates(start + Duration::hours(hours))
            .await?;
    }
    assert!(engine.runtime.get_workflow(&id).await?.manual_review_pending);

    engine
        .runtime
        .submit_event(herdflow_tests::override_event(
            &id,
            Some("s2"),
            None,
            "Exam done by hand",
        ))
        .await?;
    assert!(!engine.runtime.get_workflow(&id).await?.manual_review_pending);
    Ok(())
}

#[tokio::test]
async fn test_failure_after_cancel_is_not_escalated() -> anyhow::Result<()> {
    init_test_tracing();
    let engine = TestEngine::builder()
        .module(TargetModule::Ultrasound, unreachable_ultrasound())
        .build()?;
    engine.register_fixtures().await?;
    let id = engine
        .runtime
        .start_workflow(
            &template_id(FOLLICLE_TEMPLATE),
            &donor("D-304"),
            StartOptions::default(),
        )
        .await?;
    engine
        .runtime
        .cancel(&id, Some("vet-7"), Some("Animal sold"))
        .await?;

    let start = Utc::now();
    let mut failed = 0;
    let mut escalated = 0;
    for hours in 0..3 {
        let report = engine
            .runtime
            .manager()
            .process_due_updates(start + Duration::hours(hours))
            .await?;
        failed += report.failed;
        escalated += report.escalated;
    }
    assert_eq!(failed, 1);
    assert_eq!(escalated, 0);

    let updates = engine.runtime.module_updates(&id).await?;
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].status, UpdateStatus::Failed);
    assert!(engine
        .runtime
        .decisions(&id)
        .await?
        .iter()
        .all(|d| d.final_decision != FinalDecision::ManualReview));
    Ok(())
}

#[tokio::test]
async fn test_slow_module_times_out() -> anyhow::Result<()> {
    init_test_tracing();

    struct Stalled;

    #[async_trait]
    impl ModuleClient for Stalled {
        async fn apply(
            &self,
            _update_type: UpdateType,
            _payload: &Value,
        ) -> Result<ModuleResponse, CoreError> {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Ok(ModuleResponse::ok(None))
        }
    }

    let config = EngineConfig {
        dispatch_timeout_ms: 20,
        ..EngineConfig::default()
    };
    let engine = TestEngine::builder()
        .module(TargetModule::Ultrasound, Arc::new(Stalled))
        .config(config)
        .build()?;
    engine.register_fixtures().await?;
    let id = engine
        .runtime
        .start_workflow(
            &template_id(FOLLICLE_TEMPLATE),
            &donor("D-305"),
            StartOptions::default(),
        )
        .await?;

    let report = engine.runtime.manager().process_due_updates(Utc::now()).await?;
    assert_eq!(report.retrying, 1);
    let update = &engine.runtime.module_updates(&id).await?[0];
    assert!(update
        .last_error()
        .map(|e| e.contains("did not answer"))
        .unwrap_or(false));

    // The workflow lock is not held during delivery
    let trigger = engine.runtime.submit_event(exam_completed(&id, "s1")).await;
    assert!(trigger.is_ok());
    Ok(())
}
