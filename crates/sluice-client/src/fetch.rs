//! Fetch delivered resources into a directory, several at a time.
//!
//! Each resource gets its own task. The shared slot tracker bounds how many
//! transfers are in flight, so a pool never exceeds `download.capacity`.
//! A failed fetch is reported for that resource only.

use std::path::{Path, PathBuf};

use serde::Serialize;
use sluice_flow::Resource;
use tokio::task::JoinSet;

use crate::download::{DownloadError, Downloader};

/// One resource written to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Fetched {
    pub seq: u64,
    pub leaf_resource_id: String,
    pub path: PathBuf,
    pub bytes: u64,
}

#[derive(Debug, thiserror::Error)]
#[error("fetch of {leaf_resource_id} (seq {seq}) failed: {source}")]
pub struct FetchError {
    pub seq: u64,
    pub leaf_resource_id: String,
    #[source]
    pub source: DownloadError,
}

/// Download `resource` into `out`, named after its leaf id.
pub async fn fetch_to_dir(
    downloader: &Downloader,
    resource: &Resource,
    out: &Path,
) -> Result<Fetched, FetchError> {
    let path = out.join(file_name_for(&resource.leaf_resource_id));
    let written = async {
        let download = downloader.download(resource).await?;
        download.write_to(&path).await
    }
    .await;

    match written {
        Ok(bytes) => Ok(Fetched {
            seq: resource.seq,
            leaf_resource_id: resource.leaf_resource_id.clone(),
            path,
            bytes,
        }),
        Err(source) => Err(FetchError {
            seq: resource.seq,
            leaf_resource_id: resource.leaf_resource_id.clone(),
            source,
        }),
    }
}

/// Flatten a leaf resource id into a single safe file name.
pub fn file_name_for(leaf_resource_id: &str) -> String {
    let name: String = leaf_resource_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    let name = name.trim_start_matches('.');
    if name.is_empty() {
        "resource".into()
    } else {
        name.to_string()
    }
}

/// Fetch tasks writing into one directory.
pub struct FetchPool {
    downloader: Downloader,
    out: PathBuf,
    tasks: JoinSet<Result<Fetched, FetchError>>,
}

impl FetchPool {
    pub fn new(downloader: Downloader, out: impl Into<PathBuf>) -> Self {
        Self {
            downloader,
            out: out.into(),
            tasks: JoinSet::new(),
        }
    }

    /// Start fetching `resource`. It waits for a slot on its own task.
    pub fn spawn(&mut self, resource: Resource) {
        let downloader = self.downloader.clone();
        let out = self.out.clone();
        tracing::debug!(leaf = %resource.leaf_resource_id, seq = resource.seq, "fetch: queued");
        self.tasks
            .spawn(async move { fetch_to_dir(&downloader, &resource, &out).await });
    }

    /// Fetches not yet collected.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Next finished fetch, in completion order. `None` once the pool is empty.
    pub async fn join_next(&mut self) -> Option<Result<Fetched, FetchError>> {
        loop {
            match self.tasks.join_next().await? {
                Ok(result) => return Some(result),
                Err(e) => tracing::error!("fetch task aborted: {e}"),
            }
        }
    }

    /// Wait for every outstanding fetch.
    pub async fn finish(mut self) -> Vec<Result<Fetched, FetchError>> {
        let mut results = Vec::with_capacity(self.tasks.len());
        while let Some(result) = self.join_next().await {
            results.push(result);
        }
        results
    }
}

impl std::fmt::Debug for FetchPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchPool")
            .field("out", &self.out)
            .field("pending", &self.tasks.len())
            .finish()
    }
}
