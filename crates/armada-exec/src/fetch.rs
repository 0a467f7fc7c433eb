use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::header;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use armada_core::Repository;

/// Produces a local snapshot archive for a repository. The engine only needs
/// a file path; where it comes from (code host, mirror, test fixture) is the
/// implementation's business. The caller owns and removes the returned file.
#[async_trait]
pub trait ArchiveFetcher: Send + Sync {
    async fn fetch(
        &self,
        repo: &Repository,
        dest_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf>;
}

/// Fetches ZIP snapshots over HTTP from the code host's raw-archive
/// endpoint.
pub struct HttpArchiveFetcher {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpArchiveFetcher {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, token)
    }

    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        token: Option<String>,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            token,
            client,
        }
    }

    /// `<base>/<name>@<default-branch>/-/raw`
    pub fn archive_url(&self, repo: &Repository) -> String {
        format!(
            "{}/{}@{}/-/raw",
            self.base_url, repo.name, repo.default_branch
        )
    }

    async fn download(&self, repo: &Repository, dest_dir: &Path) -> Result<PathBuf> {
        let url = self.archive_url(repo);
        let mut req = self
            .client
            .get(&url)
            .header(header::ACCEPT, "application/zip");
        if let Some(token) = &self.token {
            req = req.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }

        let mut resp = req.send().await.with_context(|| format!("GET {url}"))?;
        if resp.status() != reqwest::StatusCode::OK {
            bail!(
                "unable to fetch archive (HTTP {} from {})",
                resp.status().as_u16(),
                url
            );
        }

        let mut tmp = tempfile::Builder::new()
            .prefix(&format!("{}.", repo.slug()))
            .suffix(".zip")
            .tempfile_in(dest_dir)
            .context("create archive scratch file")?;
        let mut written = 0usize;
        while let Some(chunk) = resp.chunk().await.context("read archive body")? {
            tmp.write_all(&chunk).context("write archive chunk")?;
            written += chunk.len();
        }
        let (_file, path) = tmp.keep().context("persist archive")?;
        debug!(repo = %repo.name, bytes = written, path = %path.display(), "archive fetched");
        Ok(path)
    }
}

#[async_trait]
impl ArchiveFetcher for HttpArchiveFetcher {
    async fn fetch(
        &self,
        repo: &Repository,
        dest_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        tokio::select! {
            _ = cancel.cancelled() => bail!("archive fetch cancelled"),
            res = self.download(repo, dest_dir) => res,
        }
    }
}
