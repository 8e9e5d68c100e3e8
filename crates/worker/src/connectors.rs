use std::path::{Path, PathBuf};

use async_trait::async_trait;
use discovery_domain::connector::{Connector, DiscoveryOutcome, DiscoveryRequest};
use discovery_errors::{DiscoveryError, DiscoveryResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use csv::ReaderBuilder;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 合并数据源连接参数与作业参数，作业参数中的同名键优先
pub fn merged_params(request: &DiscoveryRequest) -> Value {
    let mut merged = match &request.data_source.connection_params {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    if let Value::Object(overrides) = &request.parameters {
        for (key, value) in overrides {
            merged.insert(key.clone(), value.clone());
        }
    }
    Value::Object(merged)
}

/// 静态连接器
///
/// 返回参数中内嵌的 `snapshot`，用于演示环境和测试。
pub struct StaticConnector;

impl StaticConnector {
    pub const CONNECTOR_TYPE: &'static str = "static";

    pub fn new() -> Self {
        Self
    }
}

impl Default for StaticConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for StaticConnector {
    fn connector_type(&self) -> &str {
        Self::CONNECTOR_TYPE
    }

    async fn discover(&self, request: &DiscoveryRequest) -> DiscoveryResult<DiscoveryOutcome> {
        let params = merged_params(request);
        let snapshot = params.get("snapshot").cloned().ok_or_else(|| {
            DiscoveryError::connector_error(format!(
                "数据源 {} 缺少 snapshot 参数",
                request.data_source.id
            ))
        })?;
        debug!("静态连接器返回运行实例 {} 的快照", request.run_id);
        Ok(DiscoveryOutcome::from_snapshot(snapshot))
    }
}

/// 文件系统连接器参数
#[derive(Debug, Clone, Deserialize)]
pub struct FileSystemParams {
    /// 扫描根目录
    pub path: PathBuf,
    #[serde(default = "default_recursive")]
    pub recursive: bool,
    /// 只收录这些扩展名（小写，不带点）；为空时收录全部文件
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

fn default_recursive() -> bool {
    true
}

fn default_max_files() -> usize {
    10_000
}

/// 快照中的单个文件条目
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    /// CSV 文件的表头列名
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
}

/// 文件系统连接器
///
/// 扫描目录，记录每个文件的相对路径、大小、扩展名和 CSV 表头。快照不包含修改时间，
/// 因此只有结构变化才会产生新的数据集版本。
pub struct FileSystemConnector;

impl FileSystemConnector {
    pub const CONNECTOR_TYPE: &'static str = "filesystem";

    pub fn new() -> Self {
        Self
    }

    /// 在阻塞线程池中遍历目录；按文件名排序遍历，截断结果可重现
    fn scan(params: &FileSystemParams, request: &DiscoveryRequest) -> DiscoveryResult<(Vec<FileEntry>, bool)> {
        let mut walker = WalkDir::new(&params.path).sort_by_file_name();
        if !params.recursive {
            walker = walker.max_depth(1);
        }

        let mut files = Vec::new();
        let mut truncated = false;

        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(&params.path).to_path_buf();
                DiscoveryError::connector_error(format!("读取 {} 失败: {}", path.display(), e))
            })?;
            if entry.file_type().is_dir() {
                if request.is_cancelled() {
                    return Err(DiscoveryError::connector_error("目录扫描已取消"));
                }
                continue;
            }
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let extension = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.to_ascii_lowercase());
            if !params.extensions.is_empty()
                && !extension
                    .as_ref()
                    .is_some_and(|ext| params.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
            {
                continue;
            }

            if files.len() >= params.max_files {
                warn!(
                    "目录 {} 的文件数超过上限 {}，快照被截断",
                    params.path.display(),
                    params.max_files
                );
                truncated = true;
                break;
            }

            let size = entry.metadata().map_err(|e| {
                DiscoveryError::connector_error(format!("读取 {} 失败: {}", path.display(), e))
            })?;
            let columns = if extension.as_deref() == Some("csv") {
                read_csv_header(path)
            } else {
                None
            };

            files.push(FileEntry {
                path: relative_path(&params.path, path),
                size: size.len(),
                extension,
                columns,
            });
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok((files, truncated))
    }
}

impl Default for FileSystemConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for FileSystemConnector {
    fn connector_type(&self) -> &str {
        Self::CONNECTOR_TYPE
    }

    async fn discover(&self, request: &DiscoveryRequest) -> DiscoveryResult<DiscoveryOutcome> {
        let params: FileSystemParams = serde_json::from_value(merged_params(request))
            .map_err(|e| DiscoveryError::connector_error(format!("解析文件系统连接参数失败: {e}")))?;

        let root = tokio::fs::metadata(&params.path)
            .await
            .map_err(|e| io_error(&params.path, e))?;
        if !root.is_dir() {
            return Err(DiscoveryError::connector_error(format!(
                "{} 不是目录",
                params.path.display()
            )));
        }

        let (files, truncated) = {
            let params = params.clone();
            let request = request.clone();
            tokio::task::spawn_blocking(move || Self::scan(&params, &request))
                .await
                .map_err(|e| DiscoveryError::connector_error(format!("目录扫描任务异常退出: {e}")))??
        };
        let total_bytes: u64 = files.iter().map(|f| f.size).sum();
        info!(
            "扫描目录 {} 完成: {} 个文件, {} 字节",
            params.path.display(),
            files.len(),
            total_bytes
        );

        Ok(DiscoveryOutcome::from_snapshot(json!({
            "root": params.path.to_string_lossy(),
            "file_count": files.len(),
            "total_bytes": total_bytes,
            "truncated": truncated,
            "files": files,
        })))
    }
}

fn io_error(path: &Path, error: std::io::Error) -> DiscoveryError {
    DiscoveryError::connector_error(format!("读取 {} 失败: {}", path.display(), error))
}

fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

/// 读取 CSV 表头作为列名；无法读取时返回 None
fn read_csv_header(path: &Path) -> Option<Vec<String>> {
    let mut reader = match ReaderBuilder::new().flexible(true).from_path(path) {
        Ok(reader) => reader,
        Err(e) => {
            warn!("无法打开 CSV 文件 {}: {}", path.display(), e);
            return None;
        }
    };
    let headers = match reader.headers() {
        Ok(headers) => headers,
        Err(e) => {
            warn!("无法读取 CSV 表头 {}: {}", path.display(), e);
            return None;
        }
    };

    Some(
        headers
            .iter()
            .map(|column| column.trim_start_matches('\u{feff}').trim().to_string())
            .filter(|column| !column.is_empty())
            .collect(),
    )
}
