//! SQLite schema
//!
//! Statements are idempotent and applied in order on every start.

pub const SCHEMA_STATEMENTS: &[(&str, &str)] = &[
    (
        "创建数据源表",
        r#"
        CREATE TABLE IF NOT EXISTS data_sources (
            id TEXT NOT NULL,
            version INTEGER NOT NULL,
            name TEXT NOT NULL,
            connector_type TEXT NOT NULL,
            connection_params TEXT NOT NULL DEFAULT '{}',
            enabled INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            PRIMARY KEY (id, version)
        )
        "#,
    ),
    (
        "创建作业定义表",
        r#"
        CREATE TABLE IF NOT EXISTS job_definitions (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            data_source_id TEXT NOT NULL,
            schedule TEXT NOT NULL,
            parameters TEXT NOT NULL DEFAULT 'null',
            enabled INTEGER NOT NULL DEFAULT 1,
            timeout_seconds INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    ),
    (
        "创建运行实例表",
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT NOT NULL REFERENCES job_definitions (id),
            data_source_id TEXT NOT NULL,
            state TEXT NOT NULL
                CHECK (state IN ('QUEUED', 'RUNNING', 'SUCCEEDED', 'FAILED', 'CANCELLED')),
            scheduled_for TEXT NOT NULL,
            queued_at TEXT NOT NULL,
            started_at TEXT,
            ended_at TEXT,
            heartbeat_at TEXT,
            cancel_requested INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            dataset_version_ids TEXT NOT NULL DEFAULT '[]'
        )
        "#,
    ),
    (
        "创建单作业活动实例唯一索引",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_one_active_per_job \
         ON runs (job_id) WHERE state IN ('QUEUED', 'RUNNING')",
    ),
    (
        "创建运行实例作业索引",
        "CREATE INDEX IF NOT EXISTS idx_runs_job_queued_at ON runs (job_id, queued_at)",
    ),
    (
        "创建运行实例状态索引",
        "CREATE INDEX IF NOT EXISTS idx_runs_state ON runs (state)",
    ),
    (
        "创建数据集版本表",
        r#"
        CREATE TABLE IF NOT EXISTS dataset_versions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            data_source_id TEXT NOT NULL,
            data_source_version INTEGER NOT NULL,
            version INTEGER NOT NULL,
            schema_snapshot TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            run_id INTEGER,
            discovered_at TEXT NOT NULL,
            UNIQUE (data_source_id, version)
        )
        "#,
    ),
    (
        "创建数据集版本禁止修改触发器",
        r#"
        CREATE TRIGGER IF NOT EXISTS trg_dataset_versions_no_update
        BEFORE UPDATE ON dataset_versions
        BEGIN
            SELECT RAISE(ABORT, 'dataset_versions is append-only');
        END
        "#,
    ),
    (
        "创建数据集版本禁止删除触发器",
        r#"
        CREATE TRIGGER IF NOT EXISTS trg_dataset_versions_no_delete
        BEFORE DELETE ON dataset_versions
        BEGIN
            SELECT RAISE(ABORT, 'dataset_versions is append-only');
        END
        "#,
    ),
];
