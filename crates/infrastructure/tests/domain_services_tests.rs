use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use discovery_domain::entities::*;
use discovery_domain::{CatalogStore, JobDefinitionRegistry, RunStateTracker};
use discovery_errors::DiscoveryError;
use discovery_infrastructure::{
    DatabaseManager, DatabaseOptions, InMemoryDataSourceRepository, InMemoryDatasetRepository,
    InMemoryJobDefinitionRepository, InMemoryRunRepository,
};
use serde_json::json;

fn source_spec(id: &str) -> DataSourceSpec {
    DataSourceSpec {
        id: Some(id.to_string()),
        name: format!("{id} share"),
        connector_type: "static".into(),
        connection_params: json!({"snapshot": {"tables": []}}),
        enabled: true,
    }
}

fn job_spec(id: &str, source_id: &str, schedule: &str) -> JobDefinitionSpec {
    JobDefinitionSpec {
        id: Some(id.to_string()),
        name: format!("scan {id}"),
        data_source_id: source_id.to_string(),
        schedule: schedule.to_string(),
        parameters: json!({}),
        enabled: true,
        timeout_seconds: Some(60),
    }
}

fn memory_catalog() -> CatalogStore {
    CatalogStore::new(
        Arc::new(InMemoryDataSourceRepository::new()),
        Arc::new(InMemoryDatasetRepository::new(Arc::new(InMemoryRunRepository::new()))),
    )
}

#[tokio::test]
async fn test_catalog_same_fingerprint_creates_single_version() -> Result<()> {
    let catalog = memory_catalog();
    catalog.register_source(source_spec("orders")).await?;

    let snapshot = json!({"columns": ["id", "amount"]});
    let first = catalog.put_version("orders", snapshot.clone(), "fp-1", Some(1)).await?;
    let second = catalog.put_version("orders", snapshot, "fp-1", Some(2)).await?;

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.version.id, second.version.id);
    assert_eq!(catalog.history("orders").await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_catalog_versions_strictly_increase() -> Result<()> {
    let catalog = memory_catalog();
    catalog.register_source(source_spec("orders")).await?;

    let now = Utc::now();
    let v1 = catalog
        .put_version_at("orders", json!({"v": 1}), "fp-1", None, now)
        .await?;
    // 时钟回拨
    let v2 = catalog
        .put_version_at("orders", json!({"v": 2}), "fp-2", None, now - Duration::seconds(10))
        .await?;

    assert_eq!(v1.version.version, 1);
    assert_eq!(v2.version.version, 2);
    assert!(v2.version.discovered_at > v1.version.discovered_at);

    let latest = catalog.latest_version("orders").await?.unwrap();
    assert_eq!(latest.fingerprint, "fp-2");
    assert_eq!(catalog.get_version(v1.version.id).await?.schema_snapshot, json!({"v": 1}));
    Ok(())
}

#[tokio::test]
async fn test_catalog_rejects_bad_input() -> Result<()> {
    let catalog = memory_catalog();
    catalog.register_source(source_spec("orders")).await?;

    assert!(catalog.register_source(source_spec("orders")).await.unwrap_err().is_validation());
    assert!(catalog.put_version("orders", json!({}), "", None).await.unwrap_err().is_validation());
    assert!(catalog.put_version("ghost", json!({}), "fp", None).await.unwrap_err().is_not_found());
    assert!(catalog.history("ghost").await.unwrap_err().is_not_found());

    let mut bad = source_spec("other");
    bad.connection_params = json!([1, 2]);
    assert!(catalog.register_source(bad).await.unwrap_err().is_validation());
    Ok(())
}

#[tokio::test]
async fn test_catalog_referenced_source_gets_new_version() -> Result<()> {
    let catalog = memory_catalog();
    catalog.register_source(source_spec("orders")).await?;

    let mut edit = source_spec("orders");
    edit.name = "renamed".into();
    let in_place = catalog.update_source("orders", edit.clone()).await?;
    assert_eq!(in_place.version, 1);
    assert_eq!(in_place.name, "renamed");

    let produced = catalog.put_version("orders", json!({}), "fp-1", None).await?;
    assert_eq!(produced.version.data_source_version, 1);

    edit.connection_params = json!({"snapshot": {"tables": ["t"]}});
    let bumped = catalog.update_source("orders", edit).await?;
    assert_eq!(bumped.version, 2);

    let versions = catalog.source_versions("orders").await?;
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].name, "renamed");
    assert_eq!(versions[0].connection_params, json!({"snapshot": {"tables": []}}));
    Ok(())
}

#[tokio::test]
async fn test_registry_validation() -> Result<()> {
    let sources = Arc::new(InMemoryDataSourceRepository::new());
    let datasets = InMemoryDatasetRepository::new(Arc::new(InMemoryRunRepository::new()));
    let catalog = CatalogStore::new(sources.clone(), Arc::new(datasets));
    let registry =
        JobDefinitionRegistry::new(Arc::new(InMemoryJobDefinitionRepository::new()), sources);
    catalog.register_source(source_spec("orders")).await?;

    let err = registry
        .create(job_spec("bad-cron", "orders", "not a cron"))
        .await
        .unwrap_err();
    assert!(err.is_validation());

    let err = registry
        .create(job_spec("no-source", "ghost", "*/5 * * * *"))
        .await
        .unwrap_err();
    assert!(err.is_validation());

    let mut zero_timeout = job_spec("zero", "orders", "@hourly");
    zero_timeout.timeout_seconds = Some(0);
    assert!(registry.create(zero_timeout).await.unwrap_err().is_validation());

    let created = registry.create(job_spec("hourly", "orders", "0 * * * *")).await?;
    assert!(registry
        .create(job_spec("hourly", "orders", "0 * * * *"))
        .await
        .unwrap_err()
        .is_validation());

    let mut changed = job_spec("hourly", "orders", "*/10 * * * *");
    changed.enabled = false;
    let updated = registry.update("hourly", changed).await?;
    assert_eq!(updated.created_at, created.created_at);
    assert_eq!(updated.schedule, "*/10 * * * *");
    assert!(!updated.enabled);

    let renamed = job_spec("other-id", "orders", "@daily");
    assert!(registry.update("hourly", renamed).await.unwrap_err().is_validation());
    assert!(registry
        .update("ghost", job_spec("ghost", "orders", "@daily"))
        .await
        .unwrap_err()
        .is_not_found());
    assert!(registry.get("ghost").await.unwrap_err().is_not_found());
    Ok(())
}

fn sample_job(id: &str) -> JobDefinition {
    JobDefinition::from_spec(job_spec(id, "orders", "@hourly"), Utc::now())
}

#[tokio::test]
async fn test_tracker_cancel_paths() -> Result<()> {
    let tracker = RunStateTracker::new(Arc::new(InMemoryRunRepository::new()));
    let job = sample_job("cancel");
    let now = Utc::now();

    let queued = tracker.enqueue(&job, now, now).await?;
    let cancelled = tracker.cancel(queued.id, Utc::now()).await?;
    assert_eq!(cancelled.state, RunState::Cancelled);
    assert!(cancelled.ended_at.is_some());

    let err = tracker.cancel(queued.id, Utc::now()).await.unwrap_err();
    assert!(err.is_invalid_transition());

    let running = tracker.enqueue(&job, now, now).await?;
    tracker
        .transition(running.id, RunState::Queued, RunState::Running, TransitionDetail::default())
        .await?;
    let flagged = tracker.cancel(running.id, Utc::now()).await?;
    assert_eq!(flagged.state, RunState::Running);
    assert!(flagged.cancel_requested);

    assert!(tracker.cancel(9999, Utc::now()).await.unwrap_err().is_not_found());
    Ok(())
}

#[tokio::test]
async fn test_tracker_rejects_stale_and_illegal_transitions() -> Result<()> {
    let tracker = RunStateTracker::new(Arc::new(InMemoryRunRepository::new()));
    let job = sample_job("transitions");
    let now = Utc::now();
    let run = tracker.enqueue(&job, now, now).await?;

    let err = tracker
        .transition(run.id, RunState::Queued, RunState::Succeeded, TransitionDetail::default())
        .await
        .unwrap_err();
    assert!(err.is_validation());

    let err = tracker
        .transition(run.id, RunState::Running, RunState::Succeeded, TransitionDetail::default())
        .await
        .unwrap_err();
    match err {
        DiscoveryError::InvalidTransition { run_id, actual, .. } => {
            assert_eq!(run_id, run.id);
            assert_eq!(actual, "QUEUED");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let err = tracker.enqueue(&job, now, now).await.unwrap_err();
    assert!(matches!(err, DiscoveryError::ActiveRunExists { .. }));
    assert!(tracker.get_run(4242).await.unwrap_err().is_not_found());
    Ok(())
}

#[tokio::test]
async fn test_concurrent_claims_only_one_wins() -> Result<()> {
    let dir = tempfile::TempDir::new()?;
    let url = format!("sqlite:{}", dir.path().join("claims.db").display());
    let manager = DatabaseManager::new(&DatabaseOptions::new(url)).await?;

    let sources = manager.data_source_repository();
    let catalog = CatalogStore::new(sources.clone(), manager.dataset_repository());
    let registry = JobDefinitionRegistry::new(manager.job_definition_repository(), sources);
    catalog.register_source(source_spec("orders")).await?;
    let job = registry.create(job_spec("claims", "orders", "@hourly")).await?;

    let tracker = Arc::new(RunStateTracker::new(manager.run_repository()));
    let now = Utc::now();
    let run = tracker.enqueue(&job, now, now).await?;

    let mut handles = Vec::new();
    for _ in 0..4 {
        let tracker = tracker.clone();
        handles.push(tokio::spawn(async move {
            tracker
                .transition(run.id, RunState::Queued, RunState::Running, TransitionDetail::default())
                .await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await? {
            Ok(_) => winners += 1,
            Err(err) => assert!(err.is_invalid_transition(), "unexpected error: {err}"),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(tracker.get_run(run.id).await?.state, RunState::Running);

    manager.close().await;
    Ok(())
}
