//! OpenList client: offline downloads and library storage
//!
//! Every response is wrapped as `{code, message, data}`; anything but
//! `code == 200` is an error. Each dispatch downloads into its own staging
//! directory so the finished file can be found by listing that directory.

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use reqwest::RequestBuilder;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use sha2::{Digest, Sha256};

use super::http_client;
use crate::config::{OfflineDownloadTool, OpenListConfig};
use crate::pipeline::planner::{join_path, split_path};
use crate::pipeline::traits::{DownloadBackend, DownloadStatus, StorageBackend, TaskHandle};

/// OpenList task state for a finished, successful task
const TASK_SUCCEEDED: i64 = 2;

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenListTask {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: i64,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Deserialize)]
struct AddTasksData {
    #[serde(default)]
    tasks: Vec<OpenListTask>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FsObject {
    pub name: String,
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Deserialize)]
struct ListData {
    #[serde(default)]
    content: Option<Vec<FsObject>>,
}

/// Where a task currently is, as seen in the undone/done lists
#[derive(Debug, PartialEq, Eq)]
enum TaskPhase {
    Running,
    Succeeded,
    Failed(String),
    Missing,
}

pub struct OpenListClient {
    base_url: String,
    token: String,
    download_path: String,
    tool: OfflineDownloadTool,
}

impl OpenListClient {
    pub fn new(config: &OpenListConfig) -> Self {
        Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            download_path: config.download_path.clone(),
            tool: config.offline_download_tool,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        what: &str,
    ) -> Result<ApiResponse<T>> {
        let response = request
            .header("Authorization", &self.token)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("OpenList request failed: {}", what))?;

        response
            .json::<ApiResponse<T>>()
            .await
            .with_context(|| format!("Failed to parse OpenList response: {}", what))
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        payload: serde_json::Value,
        what: &str,
    ) -> Result<Option<T>> {
        let body: ApiResponse<T> = self
            .send(http_client().post(self.url(path)).json(&payload), what)
            .await?;
        if body.code != 200 {
            bail!("OpenList {} failed ({}): {}", what, body.code, body.message);
        }
        Ok(body.data)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, what: &str) -> Result<Option<T>> {
        let body: ApiResponse<T> = self.send(http_client().get(self.url(path)), what).await?;
        if body.code != 200 {
            bail!("OpenList {} failed ({}): {}", what, body.code, body.message);
        }
        Ok(body.data)
    }

    /// Public settings endpoint, reachable without a valid token
    pub async fn check_health(&self) -> Result<()> {
        self.get::<serde_json::Value>("/api/public/settings", "health check")
            .await
            .with_context(|| format!("Cannot reach OpenList server at {}", self.base_url))?;
        Ok(())
    }

    /// Make sure the configured offline download tool is offered by the server
    pub async fn check_tool(&self) -> Result<()> {
        let tools: Vec<serde_json::Value> = self
            .get("/api/public/offline_download_tools", "list offline download tools")
            .await?
            .unwrap_or_default();

        let wanted = self.tool.as_str();
        let available = tools.iter().any(|tool| {
            tool.as_str() == Some(wanted) || tool.get("name").and_then(|n| n.as_str()) == Some(wanted)
        });
        if !available {
            bail!("Offline download tool '{}' is not available on the OpenList server", wanted);
        }
        Ok(())
    }

    pub async fn mkdir(&self, path: &str) -> Result<()> {
        self.post::<serde_json::Value>("/api/fs/mkdir", json!({ "path": path }), "mkdir")
            .await?;
        Ok(())
    }

    pub async fn add_offline_download(&self, link: &str, path: &str) -> Result<Vec<OpenListTask>> {
        let data: Option<AddTasksData> = self
            .post(
                "/api/fs/add_offline_download",
                json!({ "urls": [link], "path": path, "tool": self.tool.as_str() }),
                "add offline download",
            )
            .await?;
        Ok(data.map(|d| d.tasks).unwrap_or_default())
    }

    pub async fn offline_tasks(&self, done: bool) -> Result<Vec<OpenListTask>> {
        let path = if done {
            "/api/task/offline_download/done"
        } else {
            "/api/task/offline_download/undone"
        };
        let tasks: Option<Vec<OpenListTask>> = self.get(path, "list offline tasks").await?;
        Ok(tasks.unwrap_or_default())
    }

    /// Directory listing; `None` when the directory doesn't exist
    pub async fn list_dir(&self, path: &str) -> Result<Option<Vec<FsObject>>> {
        let payload = json!({
            "path": path,
            "password": "",
            "page": 1,
            "per_page": 0,
            "refresh": true,
        });
        let body: ApiResponse<ListData> = self
            .send(http_client().post(self.url("/api/fs/list")).json(&payload), "list")
            .await?;

        if body.code == 200 {
            return Ok(Some(body.data.and_then(|d| d.content).unwrap_or_default()));
        }
        if body.message.to_lowercase().contains("not found") {
            return Ok(None);
        }
        Err(anyhow!("OpenList list {} failed ({}): {}", path, body.code, body.message))
    }

    pub async fn rename(&self, path: &str, new_name: &str) -> Result<()> {
        self.post::<serde_json::Value>(
            "/api/fs/rename",
            json!({ "path": path, "name": new_name }),
            "rename",
        )
        .await?;
        Ok(())
    }

    pub async fn move_names(&self, src_dir: &str, dst_dir: &str, names: &[&str]) -> Result<()> {
        self.post::<serde_json::Value>(
            "/api/fs/move",
            json!({ "src_dir": src_dir, "dst_dir": dst_dir, "names": names }),
            "move",
        )
        .await?;
        Ok(())
    }

    pub async fn remove(&self, dir: &str, names: &[&str]) -> Result<()> {
        self.post::<serde_json::Value>(
            "/api/fs/remove",
            json!({ "dir": dir, "names": names }),
            "remove",
        )
        .await?;
        Ok(())
    }

    async fn names_in(&self, dir: &str) -> Result<Vec<String>> {
        Ok(self
            .list_dir(dir)
            .await?
            .unwrap_or_default()
            .into_iter()
            .map(|o| o.name)
            .collect())
    }
}

/// Stable per-entry staging directory name
pub fn staging_dir_name(entry_id: &str) -> String {
    let hash = Sha256::digest(entry_id.as_bytes());
    format!("{:x}", hash)[..16].to_string()
}

/// The finished download in a staging directory, skipping partial-download markers
fn pick_downloaded_file(objects: &[FsObject]) -> Option<&FsObject> {
    objects
        .iter()
        .filter(|o| !o.is_dir)
        .filter(|o| !(o.name.ends_with(".aria2") || o.name.ends_with(".downloading")))
        .max_by_key(|o| o.size)
}

fn task_phase(task_id: &str, undone: &[OpenListTask], done: &[OpenListTask]) -> TaskPhase {
    if undone.iter().any(|t| t.id == task_id) {
        return TaskPhase::Running;
    }
    match done.iter().find(|t| t.id == task_id) {
        Some(task) if task.state == TASK_SUCCEEDED => TaskPhase::Succeeded,
        Some(task) => TaskPhase::Failed(if task.error.is_empty() {
            format!("task ended in state {}", task.state)
        } else {
            task.error.clone()
        }),
        None => TaskPhase::Missing,
    }
}

#[async_trait]
impl DownloadBackend for OpenListClient {
    async fn dispatch(&self, entry_id: &str, link: &str) -> Result<TaskHandle> {
        let staging_dir = join_path(&self.download_path, &staging_dir_name(entry_id));
        self.mkdir(&staging_dir).await?;

        let tasks = self.add_offline_download(link, &staging_dir).await?;
        let task = tasks
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("OpenList created no task for {}", link))?;

        tracing::debug!("Offline download task {} -> {}", task.id, staging_dir);
        Ok(TaskHandle {
            task_id: task.id,
            staging_dir,
        })
    }

    async fn status(&self, handle: &TaskHandle) -> Result<DownloadStatus> {
        let undone = self.offline_tasks(false).await?;
        let done = if undone.iter().any(|t| t.id == handle.task_id) {
            Vec::new()
        } else {
            self.offline_tasks(true).await?
        };

        match task_phase(&handle.task_id, &undone, &done) {
            TaskPhase::Running => {
                if let Some(task) = undone.iter().find(|t| t.id == handle.task_id) {
                    tracing::debug!("Task {} '{}' at {:.0}%", task.id, task.name, task.progress);
                }
                Ok(DownloadStatus::Pending)
            }
            TaskPhase::Failed(reason) => Ok(DownloadStatus::Failed { reason }),
            TaskPhase::Missing => Ok(DownloadStatus::Failed {
                reason: format!("task {} not found", handle.task_id),
            }),
            TaskPhase::Succeeded => {
                let objects = self.list_dir(&handle.staging_dir).await?.unwrap_or_default();
                match pick_downloaded_file(&objects) {
                    Some(file) => Ok(DownloadStatus::Complete {
                        path: join_path(&handle.staging_dir, &file.name),
                    }),
                    None => Ok(DownloadStatus::Failed {
                        reason: "download finished but no file found".to_string(),
                    }),
                }
            }
        }
    }

    async fn cleanup(&self, handle: &TaskHandle) -> Result<()> {
        let (parent, name) = split_path(&handle.staging_dir);
        self.remove(parent, &[name]).await
    }
}

#[async_trait]
impl StorageBackend for OpenListClient {
    async fn exists(&self, path: &str) -> Result<bool> {
        let (dir, name) = split_path(path);
        Ok(self.names_in(dir).await?.iter().any(|n| n == name))
    }

    async fn create_dir_all(&self, dir: &str) -> Result<()> {
        self.mkdir(dir).await
    }

    /// Rename inside the source directory, then move into place
    ///
    /// A retry after the rename already happened finds the renamed file and
    /// only repeats the move.
    async fn move_file(&self, source: &str, destination: &str) -> Result<()> {
        let (src_dir, src_name) = split_path(source);
        let (dst_dir, dst_name) = split_path(destination);

        if src_name != dst_name {
            let names = self.names_in(src_dir).await?;
            if names.iter().any(|n| n == src_name) {
                self.rename(source, dst_name).await?;
            } else if !names.iter().any(|n| n == dst_name) {
                bail!("Source file {} is missing", source);
            }
        }

        self.move_names(src_dir, dst_dir, &[dst_name]).await
    }
}
