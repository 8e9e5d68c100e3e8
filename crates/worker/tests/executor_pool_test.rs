use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use discovery_domain::connector::CancellationNotifier;
use discovery_domain::entities::{
    DatasetVersion, JobDefinition, NewDatasetVersion, Run, RunErrorDetail, RunErrorKind, RunState,
};
use discovery_domain::queue::{QueuedRun, RunQueue};
use discovery_domain::repositories::DatasetRepository;
use discovery_domain::{DiscoveryResult, RunStateTracker, TransitionDetail};
use discovery_testing_utils::{
    DataSourceBuilder, JobDefinitionBuilder, ScriptStep, ScriptedConnector, TestEnv, TestHarness,
};
use discovery_worker::{ExecutorPool, ExecutorPoolConfig, FileSystemConnector};
use serde_json::json;

const WAIT: Duration = Duration::from_secs(5);

fn fast_config() -> ExecutorPoolConfig {
    ExecutorPoolConfig {
        max_concurrency: 2,
        default_run_timeout: Duration::from_secs(30),
        cancel_grace: Duration::from_millis(200),
        heartbeat_interval: Duration::from_millis(20),
        claim_retry_delay: Duration::from_millis(10),
    }
}

fn pool_for(harness: &TestHarness, config: ExecutorPoolConfig) -> Arc<ExecutorPool> {
    Arc::new(ExecutorPool::new(
        harness.tracker.clone(),
        harness.catalog.clone(),
        harness.registry.clone(),
        harness.connectors.clone(),
        harness.run_queue(),
        harness.metrics.clone(),
        config,
    ))
}

async fn scripted_setup(harness: &TestHarness, connector: ScriptedConnector) -> Result<Arc<ScriptedConnector>> {
    let connector = Arc::new(connector);
    harness.register_connector(connector.clone()).await?;
    harness
        .insert_source(
            DataSourceBuilder::new()
                .with_id("src")
                .with_connector_type("scripted")
                .build(),
        )
        .await?;
    Ok(connector)
}

async fn job(harness: &TestHarness, id: &str) -> Result<JobDefinition> {
    Ok(harness
        .insert_job(JobDefinitionBuilder::new().with_id(id).with_data_source("src").build())
        .await?)
}

async fn enqueue(harness: &TestHarness, job: &JobDefinition) -> Result<(Run, QueuedRun)> {
    let now = Utc::now();
    let run = harness.tracker.enqueue(job, now, now).await?;
    let item = QueuedRun {
        run_id: run.id,
        job_id: run.job_id.clone(),
        scheduled_for: run.scheduled_for,
    };
    Ok((run, item))
}

async fn wait_for_state(harness: &TestHarness, run_id: i64, state: RunState) -> bool {
    let tracker = harness.tracker.clone();
    TestEnv::wait_for(
        || {
            let tracker = tracker.clone();
            async move {
                tracker
                    .get_run(run_id)
                    .await
                    .map(|run| run.state == state)
                    .unwrap_or(false)
            }
        },
        WAIT,
    )
    .await
}

#[tokio::test]
async fn test_successful_run_creates_dataset_version() -> Result<()> {
    let harness = TestHarness::in_memory();
    scripted_setup(
        &harness,
        ScriptedConnector::new("scripted").with_fallback(ScriptStep::Snapshot(json!({"tables": ["orders"]}))),
    )
    .await?;
    let job = job(&harness, "nightly").await?;
    let (_, item) = enqueue(&harness, &job).await?;

    let pool = pool_for(&harness, fast_config());
    let run = pool.process(item).await?.expect("run should be claimed");

    assert_eq!(run.state, RunState::Succeeded);
    assert!(run.error.is_none());
    assert_eq!(run.dataset_version_ids.len(), 1);

    let latest = harness.catalog.latest_version("src").await?.unwrap();
    assert_eq!(latest.version, 1);
    assert_eq!(latest.id, run.dataset_version_ids[0]);
    assert_eq!(latest.run_id, Some(run.id));
    assert_eq!(latest.schema_snapshot, json!({"tables": ["orders"]}));
    Ok(())
}

#[tokio::test]
async fn test_unchanged_fingerprint_produces_no_version() -> Result<()> {
    let harness = TestHarness::sqlite().await?;
    scripted_setup(
        &harness,
        ScriptedConnector::new("scripted").with_fallback(ScriptStep::Snapshot(json!({"tables": ["orders"]}))),
    )
    .await?;
    let job = job(&harness, "nightly").await?;
    let pool = pool_for(&harness, fast_config());

    let (_, first) = enqueue(&harness, &job).await?;
    let first = pool.process(first).await?.unwrap();
    let (_, second) = enqueue(&harness, &job).await?;
    let second = pool.process(second).await?.unwrap();

    assert_eq!(first.dataset_version_ids.len(), 1);
    assert_eq!(second.state, RunState::Succeeded);
    assert!(second.dataset_version_ids.is_empty());
    assert_eq!(harness.catalog.history("src").await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_connector_failure_is_recorded_on_run() -> Result<()> {
    let harness = TestHarness::in_memory();
    scripted_setup(
        &harness,
        ScriptedConnector::new("scripted").with_steps(vec![ScriptStep::Fail("connection refused".to_string())]),
    )
    .await?;
    let job = job(&harness, "nightly").await?;
    let (_, item) = enqueue(&harness, &job).await?;

    let run = pool_for(&harness, fast_config()).process(item).await?.unwrap();
    assert_eq!(run.state, RunState::Failed);
    let error = run.error.unwrap();
    assert_eq!(error.kind, RunErrorKind::Connector);
    assert!(error.message.contains("connection refused"));
    assert!(harness.catalog.latest_version("src").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_unregistered_connector_fails_with_configuration_error() -> Result<()> {
    let harness = TestHarness::in_memory();
    harness
        .insert_source(DataSourceBuilder::new().with_id("src").with_connector_type("ftp").build())
        .await?;
    let job = job(&harness, "nightly").await?;
    let (_, item) = enqueue(&harness, &job).await?;

    let run = pool_for(&harness, fast_config()).process(item).await?.unwrap();
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.error.unwrap().kind, RunErrorKind::Configuration);
    Ok(())
}

#[tokio::test]
async fn test_disabled_source_fails_with_configuration_error() -> Result<()> {
    let harness = TestHarness::in_memory();
    let connector = Arc::new(ScriptedConnector::new("scripted"));
    harness.register_connector(connector.clone()).await?;
    harness
        .insert_source(
            DataSourceBuilder::new()
                .with_id("src")
                .with_connector_type("scripted")
                .disabled()
                .build(),
        )
        .await?;
    let job = job(&harness, "nightly").await?;
    let (_, item) = enqueue(&harness, &job).await?;

    let run = pool_for(&harness, fast_config()).process(item).await?.unwrap();
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.error.unwrap().kind, RunErrorKind::Configuration);
    assert_eq!(connector.call_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_cancelled_queued_item_is_skipped() -> Result<()> {
    let harness = TestHarness::in_memory();
    let connector = scripted_setup(&harness, ScriptedConnector::new("scripted")).await?;
    let job = job(&harness, "nightly").await?;
    let (run, item) = enqueue(&harness, &job).await?;
    harness.tracker.cancel(run.id, Utc::now()).await?;

    assert!(pool_for(&harness, fast_config()).process(item).await?.is_none());
    assert_eq!(connector.call_count(), 0);
    assert_eq!(harness.run_state(run.id).await?, RunState::Cancelled);
    Ok(())
}

#[tokio::test]
async fn test_duplicate_delivery_is_claimed_once() -> Result<()> {
    let harness = TestHarness::sqlite().await?;
    let connector = scripted_setup(
        &harness,
        ScriptedConnector::new("scripted")
            .with_fallback(ScriptStep::Delay(Duration::from_millis(50), json!({"tables": []}))),
    )
    .await?;
    let job = job(&harness, "nightly").await?;
    let (_, item) = enqueue(&harness, &job).await?;

    let pool = pool_for(&harness, fast_config());
    let (a, b) = tokio::join!(pool.process(item.clone()), pool.process(item));
    let claimed = [a?, b?].into_iter().flatten().count();

    assert_eq!(claimed, 1);
    assert_eq!(connector.call_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_cancel_running_run_via_notifier() -> Result<()> {
    let harness = TestHarness::in_memory();
    scripted_setup(
        &harness,
        ScriptedConnector::new("scripted").with_steps(vec![ScriptStep::WaitForCancel]),
    )
    .await?;
    let job = job(&harness, "nightly").await?;
    let (run, item) = enqueue(&harness, &job).await?;

    // 心跳间隔足够长，取消只能经由通知到达
    let pool = pool_for(
        &harness,
        ExecutorPoolConfig {
            heartbeat_interval: Duration::from_secs(60),
            ..fast_config()
        },
    );
    pool.start().await;
    harness.queue.push(item).await?;
    assert!(wait_for_state(&harness, run.id, RunState::Running).await);

    let requested = harness.tracker.cancel(run.id, Utc::now()).await?;
    assert_eq!(requested.state, RunState::Running);
    assert!(requested.cancel_requested);

    let pool_ref = pool.clone();
    assert!(
        TestEnv::wait_for(
            || {
                let pool = pool_ref.clone();
                async move { pool.is_running(run.id).await }
            },
            WAIT,
        )
        .await
    );
    assert!(pool.notify_cancel(run.id).await);

    let finished = harness.wait_for_terminal(run.id, WAIT).await.unwrap();
    assert_eq!(finished.state, RunState::Cancelled);
    assert!(finished.dataset_version_ids.is_empty());
    assert!(harness.catalog.latest_version("src").await?.is_none());
    assert!(!pool.notify_cancel(run.id).await);

    pool.shutdown(Duration::from_secs(1)).await;
    Ok(())
}

#[tokio::test]
async fn test_cancel_flag_is_picked_up_by_heartbeat() -> Result<()> {
    let harness = TestHarness::in_memory();
    scripted_setup(
        &harness,
        ScriptedConnector::new("scripted").with_steps(vec![ScriptStep::Delay(
            Duration::from_secs(30),
            json!({"tables": []}),
        )]),
    )
    .await?;
    let job = job(&harness, "nightly").await?;
    let (run, item) = enqueue(&harness, &job).await?;

    let pool = pool_for(&harness, fast_config());
    pool.start().await;
    harness.queue.push(item).await?;
    assert!(wait_for_state(&harness, run.id, RunState::Running).await);

    // 只设置取消标记，不直接通知执行器
    harness.tracker.cancel(run.id, Utc::now()).await?;

    let finished = harness.wait_for_terminal(run.id, WAIT).await.unwrap();
    assert_eq!(finished.state, RunState::Cancelled);
    pool.shutdown(Duration::from_secs(1)).await;
    Ok(())
}

#[tokio::test]
async fn test_unacknowledged_cancel_fails_after_grace() -> Result<()> {
    let harness = TestHarness::in_memory();
    scripted_setup(
        &harness,
        ScriptedConnector::new("scripted").with_steps(vec![ScriptStep::IgnoreCancel]),
    )
    .await?;
    let job = job(&harness, "nightly").await?;
    let (run, item) = enqueue(&harness, &job).await?;

    let pool = pool_for(
        &harness,
        ExecutorPoolConfig {
            cancel_grace: Duration::from_millis(50),
            ..fast_config()
        },
    );
    let worker = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.process(item).await })
    };
    assert!(wait_for_state(&harness, run.id, RunState::Running).await);
    harness.tracker.cancel(run.id, Utc::now()).await?;

    let finished = tokio::time::timeout(WAIT, worker).await???.unwrap();
    assert_eq!(finished.state, RunState::Failed);
    assert_eq!(finished.error.unwrap().kind, RunErrorKind::CancelUnacknowledged);
    Ok(())
}

#[tokio::test]
async fn test_run_exceeding_timeout_fails() -> Result<()> {
    let harness = TestHarness::in_memory();
    scripted_setup(
        &harness,
        ScriptedConnector::new("scripted").with_steps(vec![ScriptStep::IgnoreCancel]),
    )
    .await?;
    let job = harness
        .insert_job(
            JobDefinitionBuilder::new()
                .with_id("slow")
                .with_data_source("src")
                .with_timeout(1)
                .build(),
        )
        .await?;
    let (_, item) = enqueue(&harness, &job).await?;

    let run = tokio::time::timeout(WAIT, pool_for(&harness, fast_config()).process(item))
        .await??
        .unwrap();
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.error.unwrap().kind, RunErrorKind::Timeout);
    Ok(())
}

#[tokio::test]
async fn test_run_reclaimed_during_execution_is_not_overwritten() -> Result<()> {
    let harness = TestHarness::in_memory();
    scripted_setup(
        &harness,
        ScriptedConnector::new("scripted").with_steps(vec![ScriptStep::Delay(
            Duration::from_millis(300),
            json!({"tables": ["late"]}),
        )]),
    )
    .await?;
    let job = job(&harness, "nightly").await?;
    let (run, item) = enqueue(&harness, &job).await?;

    let pool = pool_for(
        &harness,
        ExecutorPoolConfig {
            heartbeat_interval: Duration::from_secs(60),
            ..fast_config()
        },
    );
    let worker = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.process(item).await })
    };
    assert!(wait_for_state(&harness, run.id, RunState::Running).await);
    harness
        .tracker
        .transition(
            run.id,
            RunState::Running,
            RunState::Failed,
            TransitionDetail::error(RunErrorDetail::stale_orphaned()),
        )
        .await?;

    let finished = tokio::time::timeout(WAIT, worker).await???.unwrap();
    assert_eq!(finished.state, RunState::Failed);
    assert_eq!(finished.error.unwrap().kind, RunErrorKind::StaleOrphaned);
    assert!(harness.catalog.latest_version("src").await?.is_none());
    Ok(())
}

/// 读取最新版本时把实例标记为过期，模拟回收器恰好在连接器返回与目录写入之间运行
struct ReclaimOnRead {
    inner: Arc<dyn DatasetRepository>,
    tracker: Arc<RunStateTracker>,
    run_id: AtomicI64,
}

#[async_trait]
impl DatasetRepository for ReclaimOnRead {
    async fn append(&self, version: &NewDatasetVersion) -> DiscoveryResult<DatasetVersion> {
        self.inner.append(version).await
    }

    async fn append_completing_run(
        &self,
        version: &NewDatasetVersion,
        completed_at: DateTime<Utc>,
    ) -> DiscoveryResult<Option<DatasetVersion>> {
        self.inner.append_completing_run(version, completed_at).await
    }

    async fn get_by_id(&self, id: i64) -> DiscoveryResult<Option<DatasetVersion>> {
        self.inner.get_by_id(id).await
    }

    async fn get_latest(&self, data_source_id: &str) -> DiscoveryResult<Option<DatasetVersion>> {
        let run_id = self.run_id.swap(0, Ordering::SeqCst);
        if run_id != 0 {
            self.tracker
                .transition(
                    run_id,
                    RunState::Running,
                    RunState::Failed,
                    TransitionDetail::error(RunErrorDetail::stale_orphaned()),
                )
                .await?;
        }
        self.inner.get_latest(data_source_id).await
    }

    async fn get_history(&self, data_source_id: &str) -> DiscoveryResult<Vec<DatasetVersion>> {
        self.inner.get_history(data_source_id).await
    }

    async fn references_source_version(
        &self,
        data_source_id: &str,
        data_source_version: i32,
    ) -> DiscoveryResult<bool> {
        self.inner
            .references_source_version(data_source_id, data_source_version)
            .await
    }
}

async fn assert_reclaim_before_catalog_write_leaves_no_version(harness: TestHarness) -> Result<()> {
    let reclaimer = Arc::new(ReclaimOnRead {
        inner: harness.datasets.clone(),
        tracker: harness.tracker.clone(),
        run_id: AtomicI64::new(0),
    });
    let harness = harness.with_dataset_repository(reclaimer.clone());
    scripted_setup(
        &harness,
        ScriptedConnector::new("scripted").with_steps(vec![ScriptStep::Snapshot(json!({"tables": ["t"]}))]),
    )
    .await?;
    let job = job(&harness, "nightly").await?;
    let (run, item) = enqueue(&harness, &job).await?;
    reclaimer.run_id.store(run.id, Ordering::SeqCst);

    let pool = pool_for(&harness, fast_config());
    let finished = pool.process(item).await?.unwrap();

    assert_eq!(finished.state, RunState::Failed);
    assert_eq!(finished.error.unwrap().kind, RunErrorKind::StaleOrphaned);
    assert!(finished.dataset_version_ids.is_empty());
    assert!(harness.catalog.history("src").await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_reclaim_before_catalog_write_leaves_no_version() -> Result<()> {
    assert_reclaim_before_catalog_write_leaves_no_version(TestHarness::in_memory()).await
}

#[tokio::test]
async fn test_reclaim_before_catalog_write_leaves_no_version_sqlite() -> Result<()> {
    assert_reclaim_before_catalog_write_leaves_no_version(TestHarness::sqlite().await?).await
}

#[tokio::test]
async fn test_pool_respects_max_concurrency() -> Result<()> {
    let harness = TestHarness::in_memory();
    let connector = scripted_setup(
        &harness,
        ScriptedConnector::new("scripted")
            .with_fallback(ScriptStep::Delay(Duration::from_millis(60), json!({"tables": []}))),
    )
    .await?;

    let pool = pool_for(&harness, fast_config());
    pool.start().await;

    let mut run_ids = Vec::new();
    for i in 0..5 {
        let job = job(&harness, &format!("job-{i}")).await?;
        let (run, item) = enqueue(&harness, &job).await?;
        harness.queue.push(item).await?;
        run_ids.push(run.id);
    }

    for run_id in run_ids {
        let run = harness.wait_for_terminal(run_id, WAIT).await.unwrap();
        assert_eq!(run.state, RunState::Succeeded);
    }
    assert_eq!(connector.call_count(), 5);
    assert!(connector.max_concurrency() <= 2);

    pool.shutdown(Duration::from_secs(1)).await;
    Ok(())
}

#[tokio::test]
async fn test_shutdown_stops_claiming() -> Result<()> {
    let harness = TestHarness::in_memory();
    let connector = scripted_setup(&harness, ScriptedConnector::new("scripted")).await?;
    let job = job(&harness, "nightly").await?;

    let pool = pool_for(&harness, fast_config());
    pool.start().await;
    pool.shutdown(Duration::from_secs(1)).await;

    let (run, item) = enqueue(&harness, &job).await?;
    harness.queue.push(item).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(harness.run_state(run.id).await?, RunState::Queued);
    assert_eq!(connector.call_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_filesystem_discovery_end_to_end() -> Result<()> {
    let dir = tempfile::TempDir::new()?;
    std::fs::write(dir.path().join("customers.csv"), "id,email\n1,a@example.com\n")?;

    let harness = TestHarness::sqlite().await?;
    harness.register_connector(Arc::new(FileSystemConnector::new())).await?;
    harness
        .insert_source(
            DataSourceBuilder::new()
                .with_id("src")
                .with_connector_type("filesystem")
                .with_params(json!({"path": dir.path()}))
                .build(),
        )
        .await?;
    let job = job(&harness, "scan").await?;
    let (_, item) = enqueue(&harness, &job).await?;

    let run = pool_for(&harness, fast_config()).process(item).await?.unwrap();
    assert_eq!(run.state, RunState::Succeeded);

    let latest = harness.catalog.latest_version("src").await?.unwrap();
    assert_eq!(latest.schema_snapshot["file_count"], 1);
    assert_eq!(
        latest.schema_snapshot["files"][0]["columns"],
        json!(["id", "email"])
    );
    Ok(())
}
