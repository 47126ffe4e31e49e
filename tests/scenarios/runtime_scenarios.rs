//! Runtime surface: ingress, auto start, bulk assignment, listings,
//! progress events and the background worker

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use herdflow_core::{
    BulkAssignment, StartOptions, TargetModule, TriggerEvent, TriggerKind, UpdateStatus,
    WorkflowEvent, WorkflowFilter, WorkflowId, WorkflowStatus,
};
use herdflow_state_inmemory::{ChannelTriggerSource, WorkflowWorker};
use herdflow_tests::{
    donor, drain_events, exam_completed, init_test_tracing, recipient, step, template_id,
    TestEngine, FOLLICLE_TEMPLATE, RECIPIENT_TEMPLATE,
};

async fn engine() -> anyhow::Result<TestEngine> {
    init_test_tracing();
    let engine = TestEngine::new()?;
    engine.register_fixtures().await?;
    Ok(engine)
}

#[tokio::test]
async fn test_ingress_keeps_per_workflow_order() -> anyhow::Result<()> {
    let engine = engine().await?;
    let first = donor("D-700");
    let second = donor("D-701");
    engine.set_clinical(&first, "follicle_count", json!(4));
    engine.set_clinical(&second, "follicle_count", json!(4));

    let a = engine
        .runtime
        .start_workflow(&template_id(FOLLICLE_TEMPLATE), &first, StartOptions::default())
        .await?;
    let b = engine
        .runtime
        .start_workflow(&template_id(FOLLICLE_TEMPLATE), &second, StartOptions::default())
        .await?;

    let (tx, source) = ChannelTriggerSource::channel(16);
    tx.send(exam_completed(&a, "s1")).await?;
    tx.send(exam_completed(&b, "s1")).await?;
    tx.send(
        TriggerEvent::new(TriggerKind::InjectionGiven, a.clone(), Utc::now()).for_step(step("s2")),
    )
    .await?;
    // Stale: b already left s1 by the time this is handled
    tx.send(exam_completed(&b, "s1")).await?;
    drop(tx);

    let report = engine.runtime.run_ingress(Arc::new(source)).await;
    assert_eq!(report.received, 4);
    assert_eq!(report.handled, 3);
    assert_eq!(report.rejected, 1);

    assert_eq!(
        engine.runtime.get_workflow(&a).await?.current_step_id,
        step("s3")
    );
    assert_eq!(
        engine.runtime.get_workflow(&b).await?.current_step_id,
        step("s2")
    );
    Ok(())
}

#[tokio::test]
async fn test_ingress_reopens_queues_after_idle_gaps() -> anyhow::Result<()> {
    let engine = engine().await?;
    let cow = donor("D-702");
    engine.set_clinical(&cow, "follicle_count", json!(5));
    let id = engine
        .runtime
        .start_workflow(&template_id(FOLLICLE_TEMPLATE), &cow, StartOptions::default())
        .await?;

    let (tx, source) = ChannelTriggerSource::channel(16);
    let runtime = engine.runtime.clone();
    let ingress = tokio::spawn(async move { runtime.run_ingress(Arc::new(source)).await });

    async fn wait_for_step(engine: &TestEngine, id: &WorkflowId, target: &str) -> bool {
        for _ in 0..100 {
            match engine.runtime.get_workflow(id).await {
                Ok(instance) if instance.current_step_id == step(target) => return true,
                _ => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }
        false
    }

    // Each event lands after the previous one drained, on a fresh queue
    tx.send(exam_completed(&id, "s1")).await?;
    assert!(wait_for_step(&engine, &id, "s2").await);
    tx.send(
        TriggerEvent::new(TriggerKind::InjectionGiven, id.clone(), Utc::now()).for_step(step("s2")),
    )
    .await?;
    assert!(wait_for_step(&engine, &id, "s3").await);
    tx.send(exam_completed(&WorkflowId("unknown".to_string()), "s1"))
        .await?;
    drop(tx);

    let report = ingress.await?;
    assert_eq!(report.received, 3);
    assert_eq!(report.handled, 2);
    assert_eq!(report.rejected, 1);
    assert_eq!(engine.runtime.manager().tracked_locks(), 0);
    Ok(())
}

#[tokio::test]
async fn test_auto_start_once_per_animal() -> anyhow::Result<()> {
    let engine = engine().await?;
    let heifer = recipient("R-710");

    let started = engine.runtime.auto_start(&heifer).await?;
    assert_eq!(started.len(), 1);
    let instance = engine.runtime.get_workflow(&started[0]).await?;
    assert_eq!(instance.template_id, template_id(RECIPIENT_TEMPLATE));
    assert_eq!(engine.runtime.decisions(&started[0]).await?[0].decided_by, "SYSTEM");

    assert!(engine.runtime.auto_start(&heifer).await?.is_empty());
    assert!(engine.runtime.auto_start(&donor("D-711")).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_bulk_assignment_reports_per_animal() -> anyhow::Result<()> {
    let engine = engine().await?;
    let request = BulkAssignment {
        template_id: template_id(FOLLICLE_TEMPLATE),
        animals: vec![
            donor("D-720"),
            donor("D-721"),
            recipient("R-722"),
            donor("D-720"),
        ],
        assigned_vet: Some("vet-7".to_string()),
        priority: None,
        notes: Some("Spring flush group".to_string()),
        requested_by: Some("manager-1".to_string()),
    };

    let results = engine.runtime.assign_bulk(request).await;
    assert_eq!(results.len(), 4);

    let started: HashSet<_> = results
        .iter()
        .filter(|r| r.workflow_id.is_some())
        .map(|r| r.animal_id.0.clone())
        .collect();
    assert_eq!(
        started,
        HashSet::from(["D-720".to_string(), "D-721".to_string()])
    );
    assert_eq!(results.iter().filter(|r| r.error.is_some()).count(), 2);
    assert!(results[2].error.is_some());

    let listed = engine
        .runtime
        .list_workflows(&WorkflowFilter {
            template_id: Some(template_id(FOLLICLE_TEMPLATE)),
            status: Some(WorkflowStatus::Active),
            ..WorkflowFilter::default()
        })
        .await?;
    assert_eq!(listed.len(), 2);
    for summary in &listed {
        assert_eq!(summary.step_position, "1 / 3");
        assert_eq!(summary.progress_percentage, 0);
    }
    Ok(())
}

#[tokio::test]
async fn test_progress_events_follow_commits() -> anyhow::Result<()> {
    let engine = engine().await?;
    let mut events = engine.publisher.subscribe();
    let cow = donor("D-730");
    engine.set_clinical(&cow, "follicle_count", json!(3));

    let id = engine
        .runtime
        .start_workflow(&template_id(FOLLICLE_TEMPLATE), &cow, StartOptions::default())
        .await?;
    engine.runtime.submit_event(exam_completed(&id, "s1")).await?;

    let progress: Vec<(String, u8)> = drain_events(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            WorkflowEvent::Progress {
                workflow_id,
                step_id,
                progress,
                ..
            } if workflow_id == id => Some((step_id.0, progress)),
            _ => None,
        })
        .collect();
    assert_eq!(
        progress,
        vec![("s1".to_string(), 0), ("s2".to_string(), 33)]
    );

    // Rejected events publish nothing
    let _ = engine.runtime.submit_event(exam_completed(&id, "s1")).await;
    assert!(drain_events(&mut events).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_worker_delivers_pending_updates() -> anyhow::Result<()> {
    let engine = engine().await?;
    let id = engine
        .runtime
        .start_workflow(
            &template_id(FOLLICLE_TEMPLATE),
            &donor("D-740"),
            StartOptions::default(),
        )
        .await?;

    let worker = WorkflowWorker::new(engine.runtime.clone())
        .with_interval(Duration::from_millis(10))
        .start();

    let mut delivered = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let updates = engine.runtime.module_updates(&id).await?;
        if updates.iter().all(|u| u.status == UpdateStatus::Completed) {
            delivered = true;
            break;
        }
    }
    worker.shutdown().await;

    assert!(delivered);
    assert_eq!(engine.received(TargetModule::Ultrasound).len(), 1);
    Ok(())
}
