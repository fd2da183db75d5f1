//! Model file downloads into the local cache.
//!
//! Hugging Face repository files go through `hf-hub` and its cache layout;
//! other files are streamed from a plain URL.

use futures::StreamExt;
use hf_hub::api::tokio::ApiBuilder;
use reqwest::Client;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};

/// Log progress every this many bytes
const PROGRESS_STEP: u64 = 256 * 1024 * 1024;

/// Base URL of the tesseract "fast" language models
pub const TESSDATA_URL: &str = "https://github.com/tesseract-ocr/tessdata_fast/raw/main";

/// Downloads model files unless they are already cached
pub struct ModelHub {
    http: Client,
    endpoint: String,
    token: Option<String>,
}

impl ModelHub {
    pub fn new(endpoint: &str, token: Option<String>) -> Result<Self> {
        let http = Client::builder().build()?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Path of `file` from the Hugging Face repository `repo_id`, fetched
    /// into the hub cache under `cache_dir` when it is not there yet
    pub async fn ensure_repo_file(
        &self,
        repo_id: &str,
        file: &str,
        cache_dir: &Path,
    ) -> Result<PathBuf> {
        let mut builder = ApiBuilder::new()
            .with_endpoint(self.endpoint.clone())
            .with_cache_dir(cache_dir.to_path_buf())
            .with_progress(false);
        match &self.token {
            Some(token) => builder = builder.with_token(Some(token.clone())),
            None => tracing::debug!(
                "No HF_TOKEN is set; {} of {} is fetched anonymously if missing",
                file,
                repo_id
            ),
        }

        let repo_error = |reason: String| Error::Download {
            url: format!("{}/{}/{}", self.endpoint, repo_id, file),
            reason,
        };

        let api = builder.build().map_err(|e| repo_error(e.to_string()))?;
        let path = api
            .model(repo_id.to_string())
            .get(file)
            .await
            .map_err(|e| repo_error(e.to_string()))?;

        tracing::debug!("Model file {} ready at {}", file, path.display());
        Ok(path)
    }

    /// Make sure `target` exists, downloading it from a plain URL
    pub async fn ensure_url(&self, url: &str, target: &Path) -> Result<PathBuf> {
        if target.exists() {
            tracing::debug!("{} already cached", target.display());
            return Ok(target.to_path_buf());
        }
        self.download(url, target).await?;
        Ok(target.to_path_buf())
    }

    /// Stream `url` into `<target>.part`, then move it into place
    async fn download(&self, url: &str, target: &Path) -> Result<()> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tracing::info!("Downloading {} -> {}", url, target.display());

        let response = self.http.get(url).send().await?;

        if !response.status().is_success() {
            return Err(Error::Download {
                url: url.to_string(),
                reason: format!("status {}", response.status()),
            });
        }

        let partial = partial_path(target);
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        let mut next_report = PROGRESS_STEP;

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    drop(file);
                    tokio::fs::remove_file(&partial).await.ok();
                    return Err(Error::Download {
                        url: url.to_string(),
                        reason: e.to_string(),
                    });
                }
            };
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;

            if written >= next_report {
                tracing::info!("  {} MiB downloaded", written / (1024 * 1024));
                next_report += PROGRESS_STEP;
            }
        }

        file.flush().await?;
        drop(file);
        tokio::fs::rename(&partial, target).await?;

        tracing::info!("Downloaded {} ({} bytes)", target.display(), written);
        Ok(())
    }
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    target.with_file_name(name)
}
